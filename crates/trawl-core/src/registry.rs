use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::AppError;
use crate::traits::Parser;

/// Builds a parser from its job settings.
pub type ParserFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Parser>, AppError> + Send + Sync>;

/// Listing entry for a registered parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParserInfo {
    pub id: String,
    pub description: String,
    pub required_settings: Vec<String>,
}

struct Registration {
    info: ParserInfo,
    factory: ParserFactory,
}

/// Parser ids mapped to factories. Populated explicitly at startup.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: BTreeMap<String, Registration>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parser under `id`. Ids are unique.
    pub fn register<F>(
        &mut self,
        id: impl Into<String>,
        description: impl Into<String>,
        required_settings: &[&str],
        factory: F,
    ) -> Result<(), AppError>
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Parser>, AppError> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.parsers.contains_key(&id) {
            return Err(AppError::DuplicateParser(id));
        }
        let info = ParserInfo {
            id: id.clone(),
            description: description.into(),
            required_settings: required_settings.iter().map(|s| s.to_string()).collect(),
        };
        self.parsers.insert(
            id,
            Registration {
                info,
                factory: Box::new(factory),
            },
        );
        Ok(())
    }

    /// Instantiate parser `id` after checking its required settings are present.
    pub fn build(&self, id: &str, settings: &serde_json::Value) -> Result<Arc<dyn Parser>, AppError> {
        let registration = self.parsers.get(id).ok_or_else(|| AppError::UnknownParser {
            name: id.to_string(),
            available: self.ids(),
        })?;

        let missing: Vec<&str> = registration
            .info
            .required_settings
            .iter()
            .filter(|key| settings.get(key.as_str()).is_none_or(serde_json::Value::is_null))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::ConfigError(format!(
                "parser '{id}' requires settings: {}",
                missing.join(", ")
            )));
        }

        (registration.factory)(settings)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parsers.contains_key(id)
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        self.parsers.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<ParserInfo> {
        self.parsers.values().map(|r| r.info.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testutil::MockParser;

    fn registry() -> ParserRegistry {
        let mut registry = ParserRegistry::new();
        registry
            .register("mock", "Test parser", &[], |_| Ok(Arc::new(MockParser::new()) as Arc<dyn Parser>))
            .unwrap();
        registry
            .register("shop", "Needs a selector", &["item"], |_| {
                Ok(Arc::new(MockParser::new()) as Arc<dyn Parser>)
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = registry();
        let err = registry
            .register("mock", "again", &[], |_| Ok(Arc::new(MockParser::new()) as Arc<dyn Parser>))
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateParser(id) if id == "mock"));
    }

    #[test]
    fn test_unknown_parser_lists_available() {
        let err = registry().build("nope", &json!({})).err().unwrap();
        match err {
            AppError::UnknownParser { name, available } => {
                assert_eq!(name, "nope");
                assert_eq!(available, vec!["mock", "shop"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_required_settings_are_validated() {
        let registry = registry();
        assert!(matches!(
            registry.build("shop", &json!({})),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            registry.build("shop", &json!({"item": null})),
            Err(AppError::ConfigError(_))
        ));
        assert!(registry.build("shop", &json!({"item": ".product"})).is_ok());
    }

    #[test]
    fn test_list_is_sorted() {
        let list = registry().list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "mock");
        assert_eq!(list[1].required_settings, vec!["item"]);
    }
}
