use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use trawl_client::{FetcherConfig, FileSink, ReqwestFetcher, register_builtin};
use trawl_core::config::{JobConfig, OutputFormat};
use trawl_core::engine::ScrapeEngine;
use trawl_core::metrics::AtomicMetrics;
use trawl_core::proxy::{ProxyPool, ProxyPoolConfig, RotationStrategy};
use trawl_core::registry::ParserRegistry;
use trawl_core::retry::RetryPolicy;
use trawl_core::traits::NullSink;
use trawl_core::transport::HttpTransport;
use trawl_core::util::read_list_file;

#[derive(Parser)]
#[command(name = "trawl", version, about = "Concurrent web scraper with proxy rotation")]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true, env = "TRAWL_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scrape job and print its summary as JSON
    Run(Box<RunArgs>),

    /// Fetch one URL through the transport (retries, proxies) and report the outcome
    Fetch {
        url: String,

        /// Proxy list file, one `[scheme://][user:pass@]host:port` per line
        #[arg(long, env = "TRAWL_PROXIES_FILE")]
        proxies_file: Option<PathBuf>,

        #[arg(long, default_value_t = 3)]
        max_attempts: u32,

        #[arg(long, env = "TRAWL_USER_AGENT")]
        user_agent: Option<String>,

        /// Print the response body to stdout
        #[arg(long, default_value_t = false)]
        body: bool,
    },

    /// List registered parsers
    Parsers,
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON job file; flags below override its values
    #[arg(short, long, env = "TRAWL_CONFIG")]
    config: Option<PathBuf>,

    /// Parser id (see `trawl parsers`)
    #[arg(short, long, env = "TRAWL_PARSER")]
    parser: Option<String>,

    /// Parser settings as a JSON object
    #[arg(long, env = "TRAWL_PARSER_SETTINGS")]
    settings: Option<String>,

    /// Seed URL (repeatable)
    #[arg(short, long = "url")]
    urls: Vec<String>,

    /// File with one seed URL per line
    #[arg(long, env = "TRAWL_URLS_FILE")]
    urls_file: Option<PathBuf>,

    #[arg(short = 'n', long, env = "TRAWL_CONCURRENCY")]
    concurrency: Option<usize>,

    #[arg(long, env = "TRAWL_MAX_DEPTH")]
    max_depth: Option<u32>,

    #[arg(long, env = "TRAWL_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    #[arg(long, env = "TRAWL_PROXIES_FILE")]
    proxies_file: Option<PathBuf>,

    /// round_robin or health_weighted
    #[arg(long, env = "TRAWL_PROXY_STRATEGY")]
    strategy: Option<RotationStrategy>,

    /// Per-domain delay between requests, in milliseconds
    #[arg(long, env = "TRAWL_DELAY_MS")]
    delay_ms: Option<u64>,

    #[arg(long, env = "TRAWL_USER_AGENT")]
    user_agent: Option<String>,

    /// Output file (stdout when omitted)
    #[arg(short, long, env = "TRAWL_OUTPUT")]
    output: Option<PathBuf>,

    /// csv or jsonl
    #[arg(short, long, env = "TRAWL_FORMAT")]
    format: Option<OutputFormat>,

    /// Also print engine counters to stderr
    #[arg(long, default_value_t = false)]
    metrics: bool,

    /// Fetch and parse but discard records
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "trawl=debug" } else { "trawl=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => cmd_run(*args).await,
        Commands::Fetch {
            url,
            proxies_file,
            max_attempts,
            user_agent,
            body,
        } => cmd_fetch(&url, proxies_file, max_attempts, user_agent, body).await,
        Commands::Parsers => cmd_parsers(),
    }
}

fn registry() -> Result<Arc<ParserRegistry>> {
    let mut registry = ParserRegistry::new();
    register_builtin(&mut registry).context("Failed to register parsers")?;
    Ok(Arc::new(registry))
}

/// Job file values overridden by command-line flags.
fn job_config(args: RunArgs) -> Result<JobConfig> {
    let mut config = match &args.config {
        Some(path) => JobConfig::from_file(path)
            .with_context(|| format!("Failed to load job file {}", path.display()))?,
        None => JobConfig::default(),
    };

    if let Some(parser) = args.parser {
        config.parser = parser;
    }
    if let Some(settings) = args.settings {
        config.parser_settings =
            serde_json::from_str(&settings).context("--settings is not valid JSON")?;
    }
    if !args.urls.is_empty() {
        config.urls = args.urls;
    }
    if args.urls_file.is_some() {
        config.urls_file = args.urls_file;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(depth) = args.max_depth {
        config.max_depth = depth;
    }
    if let Some(attempts) = args.max_attempts {
        config.retry.max_attempts = attempts;
    }
    if args.proxies_file.is_some() {
        config.proxy.proxies_file = args.proxies_file;
    }
    if let Some(strategy) = args.strategy {
        config.proxy.strategy = strategy;
    }
    if let Some(delay) = args.delay_ms {
        config.politeness.delay_ms = delay;
    }
    if args.user_agent.is_some() {
        config.request.user_agent = args.user_agent;
    }
    if args.output.is_some() {
        config.output.path = args.output;
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }
    Ok(config)
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let print_metrics = args.metrics;
    let dry_run = args.dry_run;
    let config = job_config(args)?;
    let job = config.into_job().context("Invalid job configuration")?;
    let proxies = config.proxy_pool().context("Failed to load proxies")?;

    let fetcher = ReqwestFetcher::new(FetcherConfig::from_request(&config.request).allow_private_urls())
        .context("Failed to create HTTP client")?;
    let metrics = Arc::new(AtomicMetrics::new());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight requests");
            ctrl_c.cancel();
        }
    });

    tracing::info!(
        job_id = %job.id,
        parser = %job.parser_id,
        seeds = job.seeds.len(),
        concurrency = job.concurrency,
        proxies = proxies.len(),
        dry_run,
        "Starting job"
    );

    let outcome = if dry_run {
        ScrapeEngine::new(fetcher, proxies, registry()?, NullSink)
            .with_metrics(metrics.clone())
            .run(job, cancel)
            .await
    } else {
        let sink = FileSink::open(&config.output).context("Failed to open output")?;
        ScrapeEngine::new(fetcher, proxies, registry()?, sink)
            .with_metrics(metrics.clone())
            .run(job, cancel)
            .await
    };

    if print_metrics {
        eprintln!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    }

    match outcome {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(failure) if failure.error.is_systemic() => {
            println!("{}", serde_json::to_string_pretty(&failure.summary)?);
            Err(failure).context("Job aborted")
        }
        Err(failure) => Err(failure).context("Job could not start"),
    }
}

async fn cmd_fetch(
    url: &str,
    proxies_file: Option<PathBuf>,
    max_attempts: u32,
    user_agent: Option<String>,
    print_body: bool,
) -> Result<()> {
    let proxies = match proxies_file {
        Some(path) => {
            let lines = read_list_file(&path)
                .with_context(|| format!("Failed to read proxy file {}", path.display()))?;
            ProxyPool::from_lines(lines, ProxyPoolConfig::default())?
        }
        None => ProxyPool::empty(),
    };

    let mut config = FetcherConfig::default().allow_private_urls();
    if let Some(agent) = user_agent {
        config = config.with_user_agent(agent);
    }
    let fetcher = ReqwestFetcher::new(config).context("Failed to create HTTP client")?;
    let transport = HttpTransport::new(fetcher, proxies, RetryPolicy::new(max_attempts));

    tracing::info!("Fetching {}", url);
    let result = transport.fetch(url).await?;

    let status = result
        .status
        .map_or_else(|| "-".to_string(), |s| s.to_string());
    eprintln!(
        "{status} {} ({} bytes, {} ms{})",
        result.final_url,
        result.body.len(),
        result.elapsed.as_millis(),
        result
            .proxy
            .as_deref()
            .map(|p| format!(", via {p}"))
            .unwrap_or_default()
    );
    if print_body {
        println!("{}", result.body);
    }
    if let Some(error) = result.error() {
        return Err(error).context("Fetch failed");
    }
    Ok(())
}

fn cmd_parsers() -> Result<()> {
    let registry = registry()?;
    for info in registry.list() {
        if info.required_settings.is_empty() {
            println!("{:<12} {}", info.id, info.description);
        } else {
            println!(
                "{:<12} {} [requires: {}]",
                info.id,
                info.description,
                info.required_settings.join(", ")
            );
        }
    }
    Ok(())
}
