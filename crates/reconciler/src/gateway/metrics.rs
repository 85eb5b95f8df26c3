//! Gauge-style stats reporter.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::StatsReporter;
use crate::error::Result;
use crate::types::Tag;

/// Metric name under which rule totals are reported.
pub const CONSTRAINTS_METRIC: &str = "constraints";

/// Keeps the last value reported for every tag.
#[derive(Debug, Default)]
pub struct GaugeReporter {
    gauges: RwLock<BTreeMap<Tag, i64>>,
}

impl GaugeReporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value reported per tag.
    pub async fn snapshot(&self) -> BTreeMap<Tag, i64> {
        self.gauges.read().await.clone()
    }
}

#[async_trait]
impl StatsReporter for GaugeReporter {
    async fn report(&self, tag: Tag, count: i64) -> Result<()> {
        debug!(
            metric = CONSTRAINTS_METRIC,
            enforcement_action = %tag.enforcement_action,
            status = %tag.status,
            value = count,
            "Recording gauge"
        );
        self.gauges.write().await.insert(tag, count);
        Ok(())
    }
}
