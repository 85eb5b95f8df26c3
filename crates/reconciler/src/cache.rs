//! Shared tally of the rules the reconciler believes are loaded.

use std::collections::{BTreeMap, HashMap};

use itertools::iproduct;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};

use crate::gateway::StatsReporter;
use crate::types::{EnforcementAction, RuleKey, RuleStatus, Tag};

/// Concurrency-safe map from rule key to its current [`Tag`].
///
/// One reader/writer lock guards the whole table, so an aggregation always
/// sees a single consistent instant. Reports are serialized separately so a
/// slow export never lands after a newer one.
#[derive(Debug, Default)]
pub struct RuleCache {
    entries: RwLock<HashMap<RuleKey, Tag>>,
    report_lock: Mutex<()>,
}

impl RuleCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the tag for `key`.
    pub async fn put(&self, key: RuleKey, tag: Tag) {
        self.entries.write().await.insert(key, tag);
    }

    /// Drop `key` if present.
    pub async fn remove(&self, key: &RuleKey) {
        self.entries.write().await.remove(key);
    }

    /// Current tag for `key`.
    pub async fn get(&self, key: &RuleKey) -> Option<Tag> {
        self.entries.read().await.get(key).copied()
    }

    /// Number of tracked rules.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no rules are tracked.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Count entries per tag over every known action × status cell.
    ///
    /// Cells with no entries are present with a zero count.
    pub async fn aggregate(&self) -> BTreeMap<Tag, i64> {
        let mut totals: BTreeMap<Tag, i64> =
            iproduct!(EnforcementAction::KNOWN, RuleStatus::ALL)
                .map(|(action, status)| (Tag::new(action, status), 0))
                .collect();

        let entries = self.entries.read().await;
        for tag in entries.values() {
            let count = totals.entry(*tag).or_insert(0);
            *count = count.saturating_add(1);
        }
        totals
    }

    /// Aggregate and push every cell to `reporter`.
    ///
    /// Export failures are logged per cell and do not stop the remaining
    /// cells from being reported. Concurrent reports export one after the
    /// other, each with a snapshot taken after the previous one finished.
    pub async fn report(&self, reporter: &dyn StatsReporter) {
        let _ordered = self.report_lock.lock().await;
        let totals = self.aggregate().await;
        for (tag, count) in totals {
            match reporter.report(tag, count).await {
                Ok(()) => debug!(tag = %tag, count, "Reported constraint total"),
                Err(e) => error!(tag = %tag, error = %e, "failed to report total constraints"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::Result;
    use crate::gateway::GaugeReporter;

    /// Holds the first `deny/active` export until released.
    struct StallingReporter {
        gauges: GaugeReporter,
        stall_next: AtomicBool,
        stalled: Notify,
        release: Notify,
    }

    impl StallingReporter {
        fn new() -> Self {
            Self {
                gauges: GaugeReporter::new(),
                stall_next: AtomicBool::new(true),
                stalled: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl StatsReporter for StallingReporter {
        async fn report(&self, tag: Tag, count: i64) -> Result<()> {
            if tag == deny(RuleStatus::Active) && self.stall_next.swap(false, Ordering::SeqCst) {
                self.stalled.notify_one();
                self.release.notified().await;
            }
            self.gauges.report(tag, count).await
        }
    }

    fn deny(status: RuleStatus) -> Tag {
        Tag::new(EnforcementAction::Deny, status)
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let cache = RuleCache::new();
        let key = RuleKey::new("K", "a");
        cache.put(key.clone(), deny(RuleStatus::Error)).await;
        cache.put(key.clone(), deny(RuleStatus::Active)).await;

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(&key).await, Some(deny(RuleStatus::Active)));
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let cache = RuleCache::new();
        cache.remove(&RuleKey::new("K", "missing")).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_aggregate_reports_zero_cells() {
        let cache = RuleCache::new();
        cache.put(RuleKey::new("K", "a"), deny(RuleStatus::Active)).await;
        cache.put(RuleKey::new("K", "b"), deny(RuleStatus::Active)).await;
        cache
            .put(
                RuleKey::new("K", "c"),
                Tag::new(EnforcementAction::Warn, RuleStatus::Error),
            )
            .await;

        let totals = cache.aggregate().await;
        assert_eq!(totals.len(), 6);
        assert_eq!(totals.get(&deny(RuleStatus::Active)), Some(&2));
        assert_eq!(totals.get(&deny(RuleStatus::Error)), Some(&0));
        assert_eq!(
            totals.get(&Tag::new(EnforcementAction::Warn, RuleStatus::Error)),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn test_report_pushes_every_cell() {
        let cache = RuleCache::new();
        cache.put(RuleKey::new("K", "a"), deny(RuleStatus::Active)).await;
        let reporter = GaugeReporter::new();

        cache.report(&reporter).await;

        let gauges = reporter.snapshot().await;
        assert_eq!(gauges.len(), 6);
        assert_eq!(gauges.get(&deny(RuleStatus::Active)), Some(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers() {
        let cache = Arc::new(RuleCache::new());
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let key = RuleKey::new("K", format!("c{i}"));
                    cache.put(key.clone(), deny(RuleStatus::Active)).await;
                    if i % 2 == 0 {
                        cache.remove(&key).await;
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.is_ok());
        }

        let totals = cache.aggregate().await;
        assert_eq!(totals.get(&deny(RuleStatus::Active)), Some(&16));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_report_does_not_overwrite_newer_total() {
        let cache = Arc::new(RuleCache::new());
        let reporter = Arc::new(StallingReporter::new());
        cache.put(RuleKey::new("K", "a"), deny(RuleStatus::Active)).await;

        let first = {
            let (cache, reporter) = (cache.clone(), reporter.clone());
            tokio::spawn(async move { cache.report(reporter.as_ref()).await })
        };
        reporter.stalled.notified().await;

        cache.put(RuleKey::new("K", "b"), deny(RuleStatus::Active)).await;
        let second = {
            let (cache, reporter) = (cache.clone(), reporter.clone());
            tokio::spawn(async move { cache.report(reporter.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        reporter.release.notify_one();

        assert!(first.await.is_ok());
        assert!(second.await.is_ok());
        let gauges = reporter.gauges.snapshot().await;
        assert_eq!(gauges.get(&deny(RuleStatus::Active)), Some(&2));
    }
}
