pub mod fetcher;
pub mod parser;
pub mod sink;

pub use fetcher::{FetcherConfig, HttpSession, ReqwestFetcher};
pub use parser::{LinkParser, SelectorParser, register_builtin};
pub use sink::{CsvSink, FileSink, JsonLinesSink};
