//! Coalesced Notifications
//!
//! Many rapid flushes must collapse into one broadcast per project per
//! scheduling tick, not one per flush. Flushes merge their per-project
//! counts into a [`NotifyAccumulator`]; a single scheduled drain swaps the
//! accumulator out atomically (so a fresh one keeps receiving concurrent
//! merges) and hands the totals to the [`NotificationSink`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Aggregated counts for one project in one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyCounts {
    /// Items accepted for the project since the last broadcast.
    pub count: u64,
    /// Subset classified as auto-captured errors.
    pub critical_count: u64,
}

impl NotifyCounts {
    pub fn merge(&mut self, other: NotifyCounts) {
        self.count += other.count;
        self.critical_count += other.critical_count;
    }
}

/// Downstream consumer of coalesced notifications.
///
/// Sends are fire-and-forget: never awaited, never retried. The buffer's
/// drain tick may call this at arbitrary frequency, so implementations must
/// not block.
pub trait NotificationSink: Send + Sync {
    fn broadcast(&self, project_id: &str, kind: &str, counts: NotifyCounts);
}

/// Per-project counts awaiting the next drain.
#[derive(Default)]
pub(crate) struct NotifyAccumulator {
    pending: Mutex<HashMap<String, NotifyCounts>>,
}

impl NotifyAccumulator {
    pub(crate) fn merge(&self, counts: HashMap<String, NotifyCounts>) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (project_id, delta) in counts {
            pending.entry(project_id).or_default().merge(delta);
        }
    }

    /// Swap-and-clear: the returned map is exclusively the drainer's while
    /// concurrent flushes keep merging into the fresh one.
    pub(crate) fn drain(&self) -> HashMap<String, NotifyCounts> {
        std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_additive_per_project() {
        let acc = NotifyAccumulator::default();
        acc.merge(HashMap::from([(
            "p1".to_string(),
            NotifyCounts {
                count: 3,
                critical_count: 1,
            },
        )]));
        acc.merge(HashMap::from([
            (
                "p1".to_string(),
                NotifyCounts {
                    count: 2,
                    critical_count: 0,
                },
            ),
            (
                "p2".to_string(),
                NotifyCounts {
                    count: 1,
                    critical_count: 1,
                },
            ),
        ]));

        let drained = acc.drain();
        assert_eq!(
            drained["p1"],
            NotifyCounts {
                count: 5,
                critical_count: 1
            }
        );
        assert_eq!(
            drained["p2"],
            NotifyCounts {
                count: 1,
                critical_count: 1
            }
        );
    }

    #[test]
    fn drain_leaves_a_fresh_accumulator() {
        let acc = NotifyAccumulator::default();
        acc.merge(HashMap::from([("p1".to_string(), NotifyCounts::default())]));
        assert_eq!(acc.drain().len(), 1);
        assert!(acc.drain().is_empty());
    }

    #[test]
    fn counts_serialize_for_the_wire() {
        let json = serde_json::to_value(NotifyCounts {
            count: 4,
            critical_count: 2,
        })
        .unwrap();
        assert_eq!(json["count"], 4);
        assert_eq!(json["criticalCount"], 2);
    }
}
