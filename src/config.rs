// Configuration module - parses command-line flags into exporter settings
//
// This module is responsible for:
// 1. Parsing the listen address, metrics path, upstream URL and fetch timeout
// 2. Applying the defaults the exporter has always shipped with
// 3. Validating values before the server starts
//
// Flags follow the single-dash long-name convention (`-telemetry.address`),
// double-dash and `flag=value` spellings are accepted as well.

use std::time::Duration;
use thiserror::Error;

/// Default listen address, all interfaces on port 9552
pub const DEFAULT_LISTEN_ADDRESS: &str = ":9552";

/// Default path under which metrics are exposed
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Default Nightscout pebble endpoint
pub const DEFAULT_NIGHTSCOUT_URL: &str = "https://foo.azurewebsites.net/pebble?count=2&units=mgdl";

/// Default deadline for a single upstream fetch, in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

const FLAG_LISTEN_ADDRESS: &str = "telemetry.address";
const FLAG_METRICS_PATH: &str = "telemetry.endpoint";
const FLAG_NIGHTSCOUT_URL: &str = "nightscout_endpoint";
const FLAG_FETCH_TIMEOUT: &str = "nightscout.timeout";

/// Errors that can occur while parsing command-line flags
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing value for flag: -{0}")]
    MissingValue(String),

    #[error("Unknown flag: {0}")]
    UnknownFlag(String),

    #[error("Unexpected argument: {0}")]
    UnexpectedArgument(String),

    #[error("Invalid listen address: '{0}'")]
    InvalidListenAddress(String),

    #[error("Invalid metrics path '{0}': must start with '/', must not be '/' and must not contain ':', '*', '{{', '}}' or '\''")]
    InvalidMetricsPath(String),

    #[error("Invalid fetch timeout '{0}': expected a whole number of seconds greater than zero")]
    InvalidTimeout(String),
}

/// What the process was asked to do
#[derive(Debug, PartialEq, Eq)]
pub enum CliCommand {
    /// Start the exporter with the given configuration
    Run(ExporterConfig),

    /// Print usage and exit
    Help,

    /// Print the version and exit
    Version,
}

/// Exporter configuration, immutable once the process has started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterConfig {
    /// Address the HTTP server listens on (e.g. ":9552", "127.0.0.1:9552")
    pub listen_address: String,

    /// Path under which Prometheus metrics are served
    pub metrics_path: String,

    /// Nightscout pebble URL returning the JSON reading document
    pub nightscout_url: String,

    /// Deadline for one upstream fetch
    /// An expired deadline counts as a transport failure
    pub fetch_timeout: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        ExporterConfig {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            nightscout_url: DEFAULT_NIGHTSCOUT_URL.to_string(),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

impl ExporterConfig {
    /// Returns the listen address in a form the socket layer can bind
    ///
    /// A bare `:port` means every interface and becomes `0.0.0.0:port`.
    pub fn bind_address(&self) -> String {
        normalize_listen_address(&self.listen_address)
    }
}

/// Expands a bare `:port` into `0.0.0.0:port`, other addresses pass through
pub fn normalize_listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    }
}

/// Parses command-line arguments (without the program name)
///
/// # Accepted Forms
/// ```bash
/// nightscout-exporter -telemetry.address :9552
/// nightscout-exporter --telemetry.endpoint=/metrics
/// nightscout-exporter -nightscout_endpoint "https://example.org/pebble?units=mgdl"
/// nightscout-exporter --nightscout.timeout 5
/// ```
///
/// # Returns
/// * `Ok(CliCommand)` - What to do next (run, help or version)
/// * `Err(ConfigError)` - Unknown flag, missing value or invalid value
pub fn parse_args<I, S>(args: I) -> Result<CliCommand, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut args = args.into_iter().map(Into::into);
    let mut config = ExporterConfig::default();

    while let Some(arg) = args.next() {
        let Some(flag) = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')) else {
            return Err(ConfigError::UnexpectedArgument(arg));
        };

        // Support both "-flag value" and "-flag=value"
        let (name, inline_value) = match flag.split_once('=') {
            Some((name, value)) => (name.to_string(), Some(value.to_string())),
            None => (flag.to_string(), None),
        };

        match name.as_str() {
            "h" | "help" => return Ok(CliCommand::Help),
            "V" | "version" => return Ok(CliCommand::Version),
            FLAG_LISTEN_ADDRESS | FLAG_METRICS_PATH | FLAG_NIGHTSCOUT_URL | FLAG_FETCH_TIMEOUT => {}
            _ => return Err(ConfigError::UnknownFlag(arg)),
        }

        let value = inline_value
            .or_else(|| args.next())
            .ok_or_else(|| ConfigError::MissingValue(name.clone()))?;

        match name.as_str() {
            FLAG_LISTEN_ADDRESS => config.listen_address = parse_listen_address(value)?,
            FLAG_METRICS_PATH => config.metrics_path = parse_metrics_path(value)?,
            FLAG_NIGHTSCOUT_URL => config.nightscout_url = value,
            FLAG_FETCH_TIMEOUT => config.fetch_timeout = parse_timeout(&value)?,
            _ => unreachable!("flag names are checked above"),
        }
    }

    Ok(CliCommand::Run(config))
}

fn parse_listen_address(value: String) -> Result<String, ConfigError> {
    // Needs at least a port separator, e.g. ":9552" or "localhost:9552"
    if value.trim().is_empty() || !value.contains(':') {
        return Err(ConfigError::InvalidListenAddress(value));
    }
    Ok(value)
}

/// Characters the router treats as captures or wildcards, plus the quote
/// delimiting the index page link
const RESERVED_PATH_CHARS: [char; 5] = [':', '*', '{', '}', '\''];

fn parse_metrics_path(value: String) -> Result<String, ConfigError> {
    // "/" is reserved for the index page
    if !value.starts_with('/') || value == "/" || value.contains(RESERVED_PATH_CHARS) {
        return Err(ConfigError::InvalidMetricsPath(value));
    }
    Ok(value)
}

fn parse_timeout(value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidTimeout(value.to_string())),
    }
}

/// Returns the usage text printed for `-h` / `--help`
pub fn usage() -> String {
    format!(
        "nightscout-exporter - Prometheus exporter for Nightscout glucose readings\n\
         \n\
         USAGE:\n  \
         nightscout-exporter [flags]\n\
         \n\
         FLAGS:\n  \
         -{FLAG_LISTEN_ADDRESS} <addr>     Address on which to expose metrics (default: {DEFAULT_LISTEN_ADDRESS})\n  \
         -{FLAG_METRICS_PATH} <path>    Path under which to expose metrics (default: {DEFAULT_METRICS_PATH})\n  \
         -{FLAG_NIGHTSCOUT_URL} <url>    Nightscout url to json data, only mgdl is supported\n                                 \
         (default: {DEFAULT_NIGHTSCOUT_URL})\n  \
         -{FLAG_FETCH_TIMEOUT} <secs>    Deadline for one upstream fetch (default: {DEFAULT_FETCH_TIMEOUT_SECS})\n  \
         -h, --help                     Show this help\n  \
         -V, --version                  Show version\n"
    )
}
