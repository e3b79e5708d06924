//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::authors::AuthorRule;
use crate::prerender::PrerenderConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "rassegna";
const ENV_PREFIX: &str = "RASSEGNA";

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080/";
const DEFAULT_READY_SELECTOR: &str = "#posts";
const DEFAULT_NAVIGATION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_READY_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_READY_POLL_MS: u64 = 100;
const DEFAULT_CACHE_CAPACITY: usize = 128;
const DEFAULT_STYLESHEET_SUFFIX: &str = "styles.css";
const DEFAULT_BLOCKED_URL_PATTERN: &str = "/gtag/js";
const DEFAULT_FEED_REFRESH_SECS: u64 = 60 * 60 * 24;
const DEFAULT_TWEET_REFRESH_SECS: u64 = 60 * 60;
const DEFAULT_TWITTER_API_BASE: &str = "https://api.twitter.com/1.1";

/// Command-line arguments for the rassegna binary.
#[derive(Debug, Parser)]
#[command(name = "rassegna", version, about = "Developer-content feed server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "RASSEGNA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Render a URL once with headless Chrome and print the HTML.
    Render(RenderArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listen address.
    #[arg(long = "listen-addr", value_name = "ADDR")]
    pub listen_addr: Option<SocketAddr>,

    /// Override the public site URL used for prerendering.
    #[arg(long = "public-url", value_name = "URL")]
    pub public_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit JSON logs instead of the compact format.
    #[arg(long = "log-json")]
    pub log_json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    /// URL to render; defaults to the configured public site URL.
    pub url: Option<String>,

    /// Skip the render cache.
    #[arg(long)]
    pub nocache: bool,

    /// Do not inline same-origin stylesheets and scripts.
    #[arg(long)]
    pub noinline: bool,

    /// Do not abort non-critical sub-resource requests.
    #[arg(long)]
    pub noreduce: bool,

    /// Launch a visible Chrome instead of a headless one.
    #[arg(long)]
    pub noheadless: bool,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .expect("default listen address parses"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedsSettings {
    /// RSS/Atom feed URLs merged into the dated feed.
    pub urls: Vec<String>,
    pub refresh_interval_secs: u64,
}

impl FeedsSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

impl Default for FeedsSettings {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            refresh_interval_secs: DEFAULT_FEED_REFRESH_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TwitterSettings {
    pub api_base: String,
    pub bearer_token: Option<String>,
    /// Account whose timeline is refreshed on a schedule.
    pub screen_name: Option<String>,
    pub refresh_interval_secs: u64,
}

impl TwitterSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

impl Default for TwitterSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_TWITTER_API_BASE.to_string(),
            bearer_token: None,
            screen_name: None,
            refresh_interval_secs: DEFAULT_TWEET_REFRESH_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrerenderSettings {
    /// Public site URL rendered for crawlers and warmed after store changes.
    pub public_url: String,
    pub ready_selector: String,
    pub navigation_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    pub ready_poll_ms: u64,
    pub cache_capacity: usize,
    pub blocked_url_patterns: Vec<String>,
    pub stylesheet_suffix: String,
    /// Local minified stylesheet served in place of the primary stylesheet
    /// request during renders.
    pub stylesheet_path: Option<PathBuf>,
    pub chrome_args: Vec<String>,
}

impl PrerenderSettings {
    pub fn to_config(&self, stylesheet_body: Option<String>) -> PrerenderConfig {
        PrerenderConfig {
            ready_selector: self.ready_selector.clone(),
            navigation_timeout: Duration::from_millis(self.navigation_timeout_ms),
            ready_timeout: Duration::from_millis(self.ready_timeout_ms),
            ready_poll_interval: Duration::from_millis(self.ready_poll_ms.max(10)),
            cache_capacity: self.cache_capacity,
            blocked_url_patterns: self.blocked_url_patterns.clone(),
            stylesheet_suffix: self.stylesheet_suffix.clone(),
            stylesheet_body,
            chrome_args: self.chrome_args.clone(),
        }
    }
}

impl Default for PrerenderSettings {
    fn default() -> Self {
        Self {
            public_url: DEFAULT_PUBLIC_URL.to_string(),
            ready_selector: DEFAULT_READY_SELECTOR.to_string(),
            navigation_timeout_ms: DEFAULT_NAVIGATION_TIMEOUT_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            ready_poll_ms: DEFAULT_READY_POLL_MS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            blocked_url_patterns: vec![DEFAULT_BLOCKED_URL_PATTERN.to_string()],
            stylesheet_suffix: DEFAULT_STYLESHEET_SUFFIX.to_string(),
            stylesheet_path: None,
            chrome_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub feeds: FeedsSettings,
    pub twitter: TwitterSettings,
    pub prerender: PrerenderSettings,
    pub authors: Vec<AuthorRule>,
}

impl Settings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) -> Result<(), ConfigLoadError> {
        if let Some(addr) = overrides.listen_addr {
            self.server.listen_addr = addr;
        }
        if let Some(url) = &overrides.public_url {
            self.prerender.public_url = url.clone();
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level
                .parse()
                .map_err(ConfigLoadError::Invalid)?;
        }
        if overrides.log_json {
            self.logging.format = LogFormat::Json;
        }
        Ok(())
    }
}

/// Parse the command line and load settings with it applied.
pub fn load_with_cli() -> Result<(CliArgs, Settings), ConfigLoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

pub fn load(cli: &CliArgs) -> Result<Settings, ConfigLoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));
    if let Some(path) = &cli.config_file {
        builder = builder.add_source(File::from(path.clone()));
    }
    let raw = builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?;

    let mut settings: Settings = raw.try_deserialize()?;
    if let Some(Command::Serve(args)) = &cli.command {
        settings.apply_serve_overrides(&args.overrides)?;
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.server.listen_addr.port(), 8080);
        assert_eq!(settings.prerender.ready_selector, "#posts");
        assert_eq!(settings.prerender.blocked_url_patterns, vec!["/gtag/js"]);
        assert_eq!(settings.logging.level, LogLevel::Info);
        assert!(settings.feeds.urls.is_empty());
    }

    #[test]
    fn serve_overrides_apply() {
        let mut settings = Settings::default();
        let overrides = ServeOverrides {
            listen_addr: Some("0.0.0.0:9000".parse().expect("addr")),
            public_url: Some("https://feed.example.dev/".to_string()),
            log_level: Some("debug".to_string()),
            log_json: true,
        };
        settings
            .apply_serve_overrides(&overrides)
            .expect("overrides apply");

        assert_eq!(settings.server.listen_addr.port(), 9000);
        assert_eq!(settings.prerender.public_url, "https://feed.example.dev/");
        assert_eq!(settings.logging.level, LogLevel::Debug);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn bad_log_level_is_rejected() {
        let mut settings = Settings::default();
        let overrides = ServeOverrides {
            log_level: Some("loud".to_string()),
            ..Default::default()
        };
        assert!(settings.apply_serve_overrides(&overrides).is_err());
    }

    #[test]
    fn prerender_settings_convert_to_config() {
        let settings = PrerenderSettings::default();
        let config = settings.to_config(Some("body{}".to_string()));
        assert_eq!(config.ready_selector, "#posts");
        assert_eq!(config.navigation_timeout, Duration::from_secs(30));
        assert_eq!(config.stylesheet_body.as_deref(), Some("body{}"));
    }
}
