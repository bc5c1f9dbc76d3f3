// Collector module - the on-demand scrape cycle
//
// `NightscoutCollector` implements the prometheus `Collector` contract.
// Every `collect` call runs one full cycle under a single mutex:
// reset the gauge, fetch the pebble document, convert the latest reading
// and publish it. Concurrent scrapes are serialized, so a reader never
// sees a half-updated gauge family.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::fetcher::ReadingSource;

pub const NAMESPACE: &str = "nightscout";
pub const METRIC_NAME: &str = "nightscout_pebble";
pub const METRIC_HELP: &str = "checks current blood sugar from url";

/// Only mg/dL readings are supported, no unit conversion is done
pub const GLUCOSE_TYPE: &str = "mgdl";

const LABEL_NAMES: [&str; 2] = ["glucosetype", "url"];

/// Exposes the latest Nightscout glucose reading as a gauge
///
/// One instance lives for the whole process. It is registered in the
/// server's registry at startup and scraped through it.
pub struct NightscoutCollector<S> {
    /// Guards the whole reset-fetch-publish sequence
    scrape_lock: Mutex<()>,

    glucose: GaugeVec,

    /// Upstream URL, also exported as the `url` label
    url: String,

    source: S,
}

impl<S: ReadingSource> NightscoutCollector<S> {
    /// Creates the collector and its gauge family
    ///
    /// # Errors
    /// Returns error if the metric descriptor is rejected by prometheus
    pub fn new(url: impl Into<String>, source: S) -> prometheus::Result<Self> {
        let glucose = GaugeVec::new(
            Opts::new(METRIC_NAME, METRIC_HELP).namespace(NAMESPACE),
            &LABEL_NAMES,
        )?;

        Ok(NightscoutCollector {
            scrape_lock: Mutex::new(()),
            glucose,
            url: url.into(),
            source,
        })
    }

    /// Runs one scrape cycle, the caller must hold `scrape_lock`
    fn scrape(&self) {
        self.glucose.reset();

        let pebble = self.source.fetch(&self.url);

        let Some(entry) = pebble.latest() else {
            debug!("No glucose readings returned from {}", self.url);
            return;
        };

        debug!(
            "Converting reading sgv={:?} direction={:?} taken_at={:?}",
            entry.sgv,
            entry.direction,
            entry.taken_at()
        );

        match entry.sgv.parse::<f64>() {
            Ok(glucose) => {
                self.glucose
                    .with_label_values(&[GLUCOSE_TYPE, self.url.as_str()])
                    .set(glucose);
            }
            Err(e) => {
                warn!(
                    url = %self.url,
                    sgv = %entry.sgv,
                    error = %e,
                    "Glucose reading is not a number, skipping"
                );
            }
        }
    }
}

impl<S: ReadingSource> Collector for NightscoutCollector<S> {
    fn desc(&self) -> Vec<&Desc> {
        self.glucose.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        // A panic in a previous scrape leaves nothing half-written that
        // the next reset would not clear
        let _guard = self
            .scrape_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.scrape();
        self.glucose.collect()
    }
}
