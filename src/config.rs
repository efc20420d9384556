use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const DEFAULT_ADDRESS_POINTER: &str =
    "/metadataAttributes/x-amz-bedrock-kb-source-uri/value/stringValue";

const DEFAULT_CONTAINER: &str = r#"section.pod[data-name="details"]"#;
const DEFAULT_ROW: &str = ".detail-row";
const DEFAULT_LABEL: &str = ".detail-label";
const DEFAULT_VALUE: &str = ".detail-text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
    Markdown,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Csv => "csv",
            OutputFormat::Markdown => "md",
        }
    }
}

/// How pages are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Headless Chromium; runs the portal's client-side rendering.
    Browser,
    /// Plain HTTP requests; only for pages rendered on the server.
    Http,
}

/// CSS selectors describing where the record lives in a page.
#[derive(Debug, Clone)]
pub struct Selectors {
    pub container: String,
    pub row: String,
    pub label: String,
    pub value: String,
    /// Element the fetcher waits for before handing the page over.
    pub marker: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Selectors {
            container: DEFAULT_CONTAINER.to_string(),
            row: DEFAULT_ROW.to_string(),
            label: DEFAULT_LABEL.to_string(),
            value: DEFAULT_VALUE.to_string(),
            marker: DEFAULT_CONTAINER.to_string(),
        }
    }
}

/// Run configuration. Built once at startup, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub session_timeout: Duration,
    pub page_timeout: Duration,
    pub element_timeout: Duration,
    pub settle_delay: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub output_dir: PathBuf,
    pub cookies_path: PathBuf,
    pub format: OutputFormat,
    pub backend: Backend,
    /// Chromium binary; auto-detected when unset.
    pub browser_path: Option<PathBuf>,
    pub headless: bool,
    pub user_agent: String,
    pub address_pointer: String,
    pub selectors: Selectors,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: 4,
            session_timeout: Duration::from_secs(30),
            page_timeout: Duration::from_secs(30),
            element_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(2),
            retries: 2,
            retry_delay: Duration::from_secs(2),
            output_dir: PathBuf::from("output"),
            cookies_path: PathBuf::from("cookies_playwright.json"),
            format: OutputFormat::Json,
            backend: Backend::Browser,
            browser_path: None,
            headless: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            address_pointer: DEFAULT_ADDRESS_POINTER.to_string(),
            selectors: Selectors::default(),
        }
    }
}

/// Options shared by every subcommand that touches the network or the output directory.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Parallel workers, each with its own session
    #[arg(short, long, env = "SCRAPER_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Output directory
    #[arg(short, long, env = "SCRAPER_OUTPUT", default_value = "output")]
    pub output: PathBuf,

    /// Cookie file holding the session credentials
    #[arg(short, long, env = "SCRAPER_COOKIES", default_value = "cookies_playwright.json")]
    pub cookies: PathBuf,

    /// Output file format
    #[arg(short, long, value_enum, default_value = "json")]
    pub format: OutputFormat,

    /// How pages are loaded
    #[arg(long, env = "SCRAPER_BACKEND", value_enum, default_value = "browser")]
    pub backend: Backend,

    /// Chromium executable for the browser backend
    #[arg(long, env = "CHROME_PATH")]
    pub browser_path: Option<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    /// Retries after the first attempt
    #[arg(long, env = "SCRAPER_RETRIES", default_value_t = 2)]
    pub retries: u32,

    /// Pause between attempts
    #[arg(long, default_value_t = 2)]
    pub retry_delay_secs: u64,

    #[arg(long, default_value_t = 30_000)]
    pub session_timeout_ms: u64,

    /// Per-navigation timeout
    #[arg(long, default_value_t = 30_000)]
    pub page_timeout_ms: u64,

    /// How long to wait for the structural marker
    #[arg(long, default_value_t = 10_000)]
    pub element_timeout_ms: u64,

    /// Extra delay after the page went idle, for late client-side rendering
    #[arg(long, default_value_t = 2_000)]
    pub settle_ms: u64,

    #[arg(long, env = "SCRAPER_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// JSON pointer to the address inside a descriptor file
    #[arg(long, default_value = DEFAULT_ADDRESS_POINTER)]
    pub address_pointer: String,

    #[arg(long, default_value = DEFAULT_CONTAINER)]
    pub container: String,

    #[arg(long, default_value = DEFAULT_ROW)]
    pub row: String,

    #[arg(long, default_value = DEFAULT_LABEL)]
    pub label: String,

    #[arg(long, default_value = DEFAULT_VALUE)]
    pub value: String,

    /// Element to wait for (defaults to the container selector)
    #[arg(long)]
    pub marker: Option<String>,
}

impl From<PipelineArgs> for Config {
    fn from(args: PipelineArgs) -> Self {
        let marker = args.marker.unwrap_or_else(|| args.container.clone());
        Config {
            workers: args.workers.max(1),
            session_timeout: Duration::from_millis(args.session_timeout_ms),
            page_timeout: Duration::from_millis(args.page_timeout_ms),
            element_timeout: Duration::from_millis(args.element_timeout_ms),
            settle_delay: Duration::from_millis(args.settle_ms),
            retries: args.retries,
            retry_delay: Duration::from_secs(args.retry_delay_secs),
            output_dir: args.output,
            cookies_path: args.cookies,
            format: args.format,
            backend: args.backend,
            browser_path: args.browser_path,
            headless: !args.headed,
            user_agent: args.user_agent,
            address_pointer: args.address_pointer,
            selectors: Selectors {
                container: args.container,
                row: args.row,
                label: args.label,
                value: args.value,
                marker,
            },
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: PipelineArgs,
    }

    #[test]
    fn cli_defaults_match_config_defaults() {
        let parsed = Harness::try_parse_from(["test"]).unwrap();
        let config = Config::from(parsed.args);
        let defaults = Config::default();
        assert_eq!(config.workers, defaults.workers);
        assert_eq!(config.retries, defaults.retries);
        assert_eq!(config.retry_delay, defaults.retry_delay);
        assert_eq!(config.page_timeout, defaults.page_timeout);
        assert_eq!(config.element_timeout, defaults.element_timeout);
        assert_eq!(config.settle_delay, defaults.settle_delay);
        assert_eq!(config.selectors.marker, defaults.selectors.container);
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.backend, defaults.backend);
        assert_eq!(config.headless, defaults.headless);
    }

    #[test]
    fn http_backend_and_headed_browser() {
        let parsed = Harness::try_parse_from(["test", "--backend", "http", "--headed"]).unwrap();
        let config = Config::from(parsed.args);
        assert_eq!(config.backend, Backend::Http);
        assert!(!config.headless);
    }

    #[test]
    fn marker_override_and_zero_workers() {
        let parsed = Harness::try_parse_from([
            "test",
            "--workers",
            "0",
            "--marker",
            "#reader-sidebar",
            "--format",
            "markdown",
        ])
        .unwrap();
        let config = Config::from(parsed.args);
        assert_eq!(config.workers, 1);
        assert_eq!(config.selectors.marker, "#reader-sidebar");
        assert_eq!(config.format.extension(), "md");
    }
}
