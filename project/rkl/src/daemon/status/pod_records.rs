//! Per-pod (previous, current) snapshots diffed by PLEG on every relist.

use std::{collections::HashMap, sync::Arc};

use common::{Pod, PodUid};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct PodRecord {
    old: Option<Arc<Pod>>,
    current: Option<Arc<Pod>>,
}

/// Ledger of pod snapshots keyed by pod uid.
///
/// An entry exists for every pod seen in the previous or the current relist.
/// An entry whose `current` is `None` is a pod that disappeared.
#[derive(Debug, Default)]
pub struct PodRecords {
    records: HashMap<PodUid, PodRecord>,
}

impl PodRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every current snapshot with `pods`. Previous snapshots are
    /// left untouched; entries not in `pods` end up with no current snapshot.
    pub fn set_current(&mut self, pods: Vec<Pod>) {
        for record in self.records.values_mut() {
            record.current = None;
        }
        let incoming = pods.len();
        for pod in pods {
            let uid = pod.id.clone();
            self.records.entry(uid).or_default().current = Some(Arc::new(pod));
        }
        debug!(
            incoming_pod_count = incoming,
            cached_record_count = self.records.len(),
            "[pleg] Updated current pod snapshots"
        );
    }

    pub fn get_old(&self, uid: &str) -> Option<Arc<Pod>> {
        self.records.get(uid).and_then(|r| r.old.clone())
    }

    pub fn get_current(&self, uid: &str) -> Option<Arc<Pod>> {
        self.records.get(uid).and_then(|r| r.current.clone())
    }

    /// Commits a pod: drops the entry if the pod is gone, otherwise the
    /// current snapshot becomes the previous one.
    pub fn update(&mut self, uid: &str) {
        let Some(record) = self.records.get_mut(uid) else {
            return;
        };
        match record.current.take() {
            Some(current) => record.old = Some(current),
            None => {
                self.records.remove(uid);
            }
        }
    }

    /// Uids of every tracked pod, sorted.
    pub fn uids(&self) -> Vec<PodUid> {
        let mut uids: Vec<_> = self.records.keys().cloned().collect();
        uids.sort();
        uids
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.records.contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
