use std::collections::BTreeMap;
use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use trawl_core::error::AppError;
use trawl_core::models::{Page, ParseOutput, ParsedRecord};
use trawl_core::registry::ParserRegistry;
use trawl_core::traits::Parser;

/// Settings accepted by the `selector` parser.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorSettings {
    /// Selector for record containers. Without it the whole page is one record.
    #[serde(default)]
    pub item: Option<String>,
    /// Field name to `selector`, `selector@attr` or `@attr` (attribute of the container).
    pub fields: BTreeMap<String, String>,
    /// Selector for links to follow; their `href` is queued.
    #[serde(default)]
    pub follow: Option<String>,
}

#[derive(Debug)]
enum FieldSource {
    Text(Selector),
    Attr(Option<Selector>, String),
}

/// CSS-selector-driven record extraction.
#[derive(Debug)]
pub struct SelectorParser {
    item: Option<Selector>,
    fields: Vec<(String, FieldSource)>,
    follow: Option<Selector>,
}

impl SelectorParser {
    pub fn new(settings: SelectorSettings) -> Result<Self, AppError> {
        if settings.fields.is_empty() {
            return Err(AppError::ConfigError(
                "selector parser needs at least one field".into(),
            ));
        }
        let item = settings.item.as_deref().map(compile).transpose()?;
        let follow = settings.follow.as_deref().map(compile).transpose()?;
        let fields = settings
            .fields
            .iter()
            .map(|(name, source)| parse_field(source).map(|source| (name.clone(), source)))
            .collect::<Result<Vec<_>, AppError>>()?;
        Ok(Self {
            item,
            fields,
            follow,
        })
    }

    pub fn from_settings(settings: &serde_json::Value) -> Result<Self, AppError> {
        let settings: SelectorSettings = serde_json::from_value(settings.clone())
            .map_err(|e| AppError::ConfigError(format!("invalid selector settings: {e}")))?;
        Self::new(settings)
    }

    fn extract(&self, scope: ElementRef<'_>, source_url: &str) -> ParsedRecord {
        let mut record = ParsedRecord::new(source_url);
        for (name, source) in &self.fields {
            let value = match source {
                FieldSource::Text(selector) => scope
                    .select(selector)
                    .next()
                    .map(|el| collapse_whitespace(&el.text().collect::<String>())),
                FieldSource::Attr(selector, attr) => {
                    let element = match selector {
                        Some(selector) => scope.select(selector).next(),
                        None => Some(scope),
                    };
                    element.and_then(|el| el.value().attr(attr).map(|v| v.trim().to_string()))
                }
            };
            record = record.with_field(name.as_str(), value.map_or(serde_json::Value::Null, Into::into));
        }
        record
    }
}

impl Parser for SelectorParser {
    fn parse(&self, page: &Page<'_>) -> Result<ParseOutput, AppError> {
        let document = Html::parse_document(page.body);
        let root = document.root_element();

        let records = match &self.item {
            Some(item) => root
                .select(item)
                .map(|el| self.extract(el, page.url))
                .collect(),
            None => vec![self.extract(root, page.url)],
        };
        let discovered = match &self.follow {
            Some(follow) => hrefs(root, follow),
            None => Vec::new(),
        };

        tracing::trace!(url = %page.url, records = records.len(), links = discovered.len(), "Parsed page");
        Ok(ParseOutput::new(records, discovered))
    }
}

/// One record per page (`url`, `title`) and every `<a href>` as a link to follow.
#[derive(Debug)]
pub struct LinkParser {
    title: Selector,
    links: Selector,
}

impl LinkParser {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            title: compile("title")?,
            links: compile("a[href]")?,
        })
    }
}

impl Parser for LinkParser {
    fn parse(&self, page: &Page<'_>) -> Result<ParseOutput, AppError> {
        let document = Html::parse_document(page.body);
        let root = document.root_element();
        let title = root
            .select(&self.title)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()));

        let record = ParsedRecord::new(page.url)
            .with_field("url", page.url)
            .with_field("status", page.status)
            .with_field("title", title.map_or(serde_json::Value::Null, Into::into));
        Ok(ParseOutput::new(vec![record], hrefs(root, &self.links)))
    }
}

/// Register the parsers shipped with this crate.
pub fn register_builtin(registry: &mut ParserRegistry) -> Result<(), AppError> {
    registry.register(
        "selector",
        "CSS selector extraction (settings: item, fields, follow)",
        &["fields"],
        |settings| Ok(Arc::new(SelectorParser::from_settings(settings)?) as Arc<dyn Parser>),
    )?;
    registry.register(
        "links",
        "Page URL and title, follows every link",
        &[],
        |_| Ok(Arc::new(LinkParser::new()?) as Arc<dyn Parser>),
    )?;
    Ok(())
}

fn compile(selector: &str) -> Result<Selector, AppError> {
    Selector::parse(selector)
        .map_err(|e| AppError::ConfigError(format!("invalid CSS selector '{selector}': {e:?}")))
}

fn parse_field(source: &str) -> Result<FieldSource, AppError> {
    match source.rsplit_once('@') {
        Some((selector, attr)) if !attr.trim().is_empty() => {
            let selector = selector.trim();
            let selector = if selector.is_empty() {
                None
            } else {
                Some(compile(selector)?)
            };
            Ok(FieldSource::Attr(selector, attr.trim().to_string()))
        }
        _ => Ok(FieldSource::Text(compile(source)?)),
    }
}

fn hrefs(scope: ElementRef<'_>, selector: &Selector) -> Vec<String> {
    scope
        .select(selector)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty() && !href.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    const CATALOG: &str = r##"
        <html><head><title> Knives | Shop </title></head><body>
          <div class="product" data-sku="KN-1">
            <h2> Chef   knife </h2><span class="price">€45</span>
            <a href="/p/kn-1">details</a>
          </div>
          <div class="product" data-sku="KN-2">
            <h2>Paring knife</h2>
            <a href="/p/kn-2">details</a>
          </div>
          <a class="next" href="?page=2">next</a>
          <a href="#top">top</a>
        </body></html>
    "##;

    fn page(body: &str) -> (HashMap<String, String>, String) {
        (HashMap::new(), body.to_string())
    }

    fn parse(parser: &dyn Parser, body: &str) -> ParseOutput {
        let (headers, body) = page(body);
        parser
            .parse(&Page {
                url: "https://shop.test/knives",
                status: 200,
                headers: &headers,
                body: &body,
            })
            .unwrap()
    }

    #[test]
    fn test_items_fields_and_attributes() {
        let parser = SelectorParser::from_settings(&json!({
            "item": ".product",
            "fields": {"name": "h2", "price": ".price", "sku": "@data-sku", "link": "a@href"},
            "follow": "a.next"
        }))
        .unwrap();

        let output = parse(&parser, CATALOG);
        assert_eq!(output.records.len(), 2);
        let first = &output.records[0];
        assert_eq!(first.get("name"), Some(&json!("Chef knife")));
        assert_eq!(first.get("price"), Some(&json!("€45")));
        assert_eq!(first.get("sku"), Some(&json!("KN-1")));
        assert_eq!(first.get("link"), Some(&json!("/p/kn-1")));
        assert_eq!(first.source_url, "https://shop.test/knives");
        assert_eq!(output.records[1].get("price"), Some(&serde_json::Value::Null));
        assert_eq!(output.discovered, vec!["?page=2"]);
    }

    #[test]
    fn test_without_item_the_page_is_one_record() {
        let parser = SelectorParser::from_settings(&json!({"fields": {"title": "title"}})).unwrap();
        let output = parse(&parser, CATALOG);
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].get("title"), Some(&json!("Knives | Shop")));
        assert!(output.discovered.is_empty());
    }

    #[test]
    fn test_invalid_settings_are_config_errors() {
        assert!(matches!(
            SelectorParser::from_settings(&json!({"fields": {"x": "[[["}})),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            SelectorParser::from_settings(&json!({"fields": {}})),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            SelectorParser::from_settings(&json!({"fields": {"x": "h1"}, "extra": 1})),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn test_link_parser_skips_fragments() {
        let output = parse(&LinkParser::new().unwrap(), CATALOG);
        assert_eq!(output.records[0].get("title"), Some(&json!("Knives | Shop")));
        assert_eq!(output.records[0].get("status"), Some(&json!(200)));
        assert_eq!(output.discovered, vec!["/p/kn-1", "/p/kn-2", "?page=2"]);
    }

    #[test]
    fn test_register_builtin() {
        let mut registry = ParserRegistry::new();
        register_builtin(&mut registry).unwrap();
        assert_eq!(registry.ids(), vec!["links", "selector"]);
        assert!(matches!(
            registry.build("selector", &json!({})),
            Err(AppError::ConfigError(_))
        ));
        assert!(registry.build("links", &json!({})).is_ok());
        assert!(register_builtin(&mut registry).is_err());
    }
}
