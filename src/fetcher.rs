// Fetcher module - retrieves the Nightscout pebble document
//
// This module is responsible for:
// 1. Issuing a single blocking GET against the configured Nightscout URL
// 2. Decoding the response body into a `NightscoutPebble`
// 3. Failing soft: transport and decode errors yield an empty document
//
// There is no retry and no caching. Every call performs exactly one request.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while fetching the upstream document
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid pebble document: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    /// Failure category carried in diagnostic events
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport(_) => "transport",
            FetchError::Decode(_) => "decode",
        }
    }
}

/// Upstream pebble document
///
/// # Example Document
/// ```json
/// {
///   "status": [{ "now": 1700000000000 }],
///   "bgs": [{
///     "sgv": "120",
///     "trend": 4,
///     "direction": "Flat",
///     "datetime": 1699999990000,
///     "bgdelta": "-2"
///   }],
///   "cals": []
/// }
/// ```
///
/// Missing fields decode to their empty value and unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NightscoutPebble {
    pub status: Vec<PebbleStatus>,
    pub bgs: Vec<GlucoseEntry>,
    /// Calibration entries, not interpreted
    pub cals: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PebbleStatus {
    pub now: i64,
}

/// One blood glucose reading
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GlucoseEntry {
    /// Sensor glucose value, string encoded
    pub sgv: String,
    pub trend: i64,
    pub direction: String,
    /// Reading time in epoch milliseconds
    pub datetime: i64,
    pub bgdelta: String,
}

impl GlucoseEntry {
    /// Returns when the reading was taken, if the entry carries a timestamp
    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        if self.datetime <= 0 {
            return None;
        }
        DateTime::from_timestamp_millis(self.datetime)
    }
}

impl NightscoutPebble {
    /// Parses a pebble document from raw JSON bytes
    pub fn from_slice(body: &[u8]) -> Result<Self, FetchError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Returns the most recent reading, the first entry of `bgs`
    pub fn latest(&self) -> Option<&GlucoseEntry> {
        self.bgs.first()
    }
}

/// Anything the collector can pull a pebble document from
///
/// Implementations must not fail: an unreachable or broken source
/// yields an empty `NightscoutPebble`.
pub trait ReadingSource: Send + Sync {
    fn fetch(&self, url: &str) -> NightscoutPebble;
}

/// HTTP fetcher backed by a blocking reqwest client
///
/// The client must be built outside an async context and only used from
/// threads that are allowed to block.
pub struct PebbleFetcher {
    client: reqwest::blocking::Client,
}

impl PebbleFetcher {
    /// Creates a fetcher whose requests give up after `timeout`
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be initialized (TLS backend)
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nightscout-exporter/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(PebbleFetcher { client })
    }

    /// Performs one GET and decodes the body
    ///
    /// The status code is not checked: a non-JSON error page is reported
    /// as a decode failure. The response is consumed here and released
    /// on every path.
    pub fn try_fetch(&self, url: &str) -> Result<NightscoutPebble, FetchError> {
        debug!("Fetching pebble document from {}", url);

        let response = self.client.get(url).send()?;
        let status = response.status();
        let body = response.bytes()?;

        debug!("Received {} bytes from {} (status {})", body.len(), url, status);

        NightscoutPebble::from_slice(&body)
    }
}

impl ReadingSource for PebbleFetcher {
    fn fetch(&self, url: &str) -> NightscoutPebble {
        match self.try_fetch(url) {
            Ok(pebble) => pebble,
            Err(e) => {
                warn!(kind = e.kind(), url = %url, error = %e, "Nightscout fetch failed");
                NightscoutPebble::default()
            }
        }
    }
}
