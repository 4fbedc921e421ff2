use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use trawl_core::config::{OutputConfig, OutputFormat};
use trawl_core::error::AppError;
use trawl_core::models::{BatchReport, ParsedRecord, RecordFailure};
use trawl_core::traits::StorageSink;

type Output = Box<dyn Write + Send>;

const SOURCE_URL: &str = "source_url";
const SCRAPED_AT: &str = "scraped_at";

fn create(path: &Path) -> Result<Output, AppError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    let file = File::create(path).map_err(|e| {
        AppError::StorageError(format!("cannot create {}: {e}", path.display()))
    })?;
    Ok(Box::new(BufWriter::new(file)))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned sink mutex");
        poisoned.into_inner()
    })
}

fn storage_error(e: impl std::fmt::Display) -> AppError {
    AppError::StorageError(e.to_string())
}

/// Run file IO on the blocking pool so slow disks don't stall the runtime workers.
async fn blocking<T, F>(work: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::StorageError(format!("sink task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

struct CsvState {
    writer: csv::Writer<Output>,
    /// Fixed by the first record written.
    header: Option<Vec<String>>,
    dropped: HashSet<String>,
}

/// Writes records as CSV rows.
///
/// Columns are the first record's fields followed by `source_url` and `scraped_at`.
/// Fields first seen later are dropped with a warning.
#[derive(Clone)]
pub struct CsvSink {
    state: Arc<Mutex<CsvState>>,
}

impl CsvSink {
    pub fn create(path: &Path, delimiter: u8) -> Result<Self, AppError> {
        Ok(Self::from_writer(create(path)?, delimiter))
    }

    pub fn from_writer(output: Output, delimiter: u8) -> Self {
        let writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .from_writer(output);
        Self {
            state: Arc::new(Mutex::new(CsvState {
                writer,
                header: None,
                dropped: HashSet::new(),
            })),
        }
    }
}

fn header_for(record: &ParsedRecord) -> Vec<String> {
    let mut header: Vec<String> = record.fields.keys().cloned().collect();
    for extra in [SOURCE_URL, SCRAPED_AT] {
        if !record.fields.contains_key(extra) {
            header.push(extra.to_string());
        }
    }
    header
}

fn csv_cell(record: &ParsedRecord, column: &str) -> Option<String> {
    match record.fields.get(column) {
        Some(serde_json::Value::Null) => Some(String::new()),
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
        None if column == SOURCE_URL => Some(record.source_url.clone()),
        None if column == SCRAPED_AT => Some(record.scraped_at.to_rfc3339()),
        None => None,
    }
}

fn write_csv(state: &mut CsvState, records: &[ParsedRecord]) -> Result<BatchReport, AppError> {
    let mut report = BatchReport::default();

    for (index, record) in records.iter().enumerate() {
        let header = match &state.header {
            Some(header) => header.clone(),
            None => {
                let header = header_for(record);
                state.writer.write_record(&header).map_err(storage_error)?;
                state.header = Some(header.clone());
                header
            }
        };

        for field in record.fields.keys() {
            if !header.contains(field) && state.dropped.insert(field.clone()) {
                tracing::warn!(field = %field, "Field not in CSV header, dropping it");
            }
        }

        let cells: Vec<Option<String>> = header.iter().map(|c| csv_cell(record, c)).collect();
        let own_fields = header
            .iter()
            .zip(&cells)
            .filter(|(column, cell)| {
                cell.is_some() && column.as_str() != SOURCE_URL && column.as_str() != SCRAPED_AT
            })
            .count();
        if own_fields == 0 && !record.fields.is_empty() {
            report.failed.push(RecordFailure {
                index,
                reason: "no field matches the CSV header".to_string(),
            });
            continue;
        }

        state
            .writer
            .write_record(cells.iter().map(|c| c.as_deref().unwrap_or_default()))
            .map_err(storage_error)?;
        report.written += 1;
    }
    Ok(report)
}

impl StorageSink for CsvSink {
    async fn write(&self, records: &[ParsedRecord]) -> Result<BatchReport, AppError> {
        let state = Arc::clone(&self.state);
        let records = records.to_vec();
        blocking(move || write_csv(&mut lock(&state), &records)).await
    }

    async fn flush(&self) -> Result<(), AppError> {
        let state = Arc::clone(&self.state);
        blocking(move || lock(&state).writer.flush().map_err(storage_error)).await
    }
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

/// Writes one JSON object per record: its fields plus `source_url` and `scraped_at`.
#[derive(Clone)]
pub struct JsonLinesSink {
    output: Arc<Mutex<Output>>,
}

impl JsonLinesSink {
    pub fn create(path: &Path) -> Result<Self, AppError> {
        Ok(Self::from_writer(create(path)?))
    }

    pub fn stdout() -> Self {
        Self::from_writer(Box::new(std::io::stdout()))
    }

    pub fn from_writer(output: Output) -> Self {
        Self {
            output: Arc::new(Mutex::new(output)),
        }
    }
}

fn json_line(record: &ParsedRecord) -> Result<String, serde_json::Error> {
    let mut object = record.fields.clone();
    object
        .entry(SOURCE_URL)
        .or_insert_with(|| record.source_url.clone().into());
    object
        .entry(SCRAPED_AT)
        .or_insert_with(|| record.scraped_at.to_rfc3339().into());
    serde_json::to_string(&object)
}

fn write_json_lines(output: &mut Output, records: &[ParsedRecord]) -> Result<BatchReport, AppError> {
    let mut report = BatchReport::default();
    for (index, record) in records.iter().enumerate() {
        match json_line(record) {
            Ok(line) => {
                writeln!(output, "{line}").map_err(storage_error)?;
                report.written += 1;
            }
            Err(e) => report.failed.push(RecordFailure {
                index,
                reason: e.to_string(),
            }),
        }
    }
    Ok(report)
}

impl StorageSink for JsonLinesSink {
    async fn write(&self, records: &[ParsedRecord]) -> Result<BatchReport, AppError> {
        let output = Arc::clone(&self.output);
        let records = records.to_vec();
        blocking(move || write_json_lines(&mut lock(&output), &records)).await
    }

    async fn flush(&self) -> Result<(), AppError> {
        let output = Arc::clone(&self.output);
        blocking(move || lock(&output).flush().map_err(storage_error)).await
    }
}

// ---------------------------------------------------------------------------
// Output selection
// ---------------------------------------------------------------------------

/// The sink chosen by an [`OutputConfig`].
#[derive(Clone)]
pub enum FileSink {
    Csv(CsvSink),
    JsonLines(JsonLinesSink),
}

impl FileSink {
    /// Open the configured output. No path means JSON lines (or CSV) on stdout.
    pub fn open(config: &OutputConfig) -> Result<Self, AppError> {
        let delimiter = u8::try_from(config.csv_delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| {
                AppError::ConfigError("output.csv_delimiter must be an ASCII character".into())
            })?;
        let sink = match (&config.path, config.format) {
            (Some(path), OutputFormat::Csv) => FileSink::Csv(CsvSink::create(path, delimiter)?),
            (Some(path), OutputFormat::Jsonl) => FileSink::JsonLines(JsonLinesSink::create(path)?),
            (None, OutputFormat::Csv) => {
                FileSink::Csv(CsvSink::from_writer(Box::new(std::io::stdout()), delimiter))
            }
            (None, OutputFormat::Jsonl) => FileSink::JsonLines(JsonLinesSink::stdout()),
        };
        tracing::debug!(
            format = %config.format,
            path = %config.path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".into()),
            "Output opened"
        );
        Ok(sink)
    }
}

impl StorageSink for FileSink {
    async fn write(&self, records: &[ParsedRecord]) -> Result<BatchReport, AppError> {
        match self {
            FileSink::Csv(sink) => sink.write(records).await,
            FileSink::JsonLines(sink) => sink.write(records).await,
        }
    }

    async fn flush(&self) -> Result<(), AppError> {
        match self {
            FileSink::Csv(sink) => sink.flush().await,
            FileSink::JsonLines(sink) => sink.flush().await,
        }
    }
}
