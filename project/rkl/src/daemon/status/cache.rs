//! Last known [`PodStatus`] per pod, as written by PLEG.
//!
//! Besides the per-pod entries the cache keeps a global high-water mark: once
//! [`Cache::timestamp`] reads `T`, every pod touched by a relist started at or
//! before `T` has its fresh status visible. [`Cache::get_newer_than`] lets a
//! pod worker wait for that point.

use chrono::{DateTime, Utc};
use common::{PodStatus, PodUid};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("no cached status for pod {0}")]
    NotFound(PodUid),

    #[error("failed to fetch pod status: {0}")]
    Fetch(String),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    status: PodStatus,
    error: Option<CacheError>,
    modified: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Cache {
    pods: DashMap<PodUid, CacheEntry>,
    // high-water mark; every write also bumps the channel to wake waiters
    mark: watch::Sender<Option<DateTime<Utc>>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        let (mark, _) = watch::channel(None);
        Self {
            pods: DashMap::new(),
            mark,
        }
    }

    pub fn set(
        &self,
        uid: &str,
        status: PodStatus,
        error: Option<CacheError>,
        timestamp: DateTime<Utc>,
    ) {
        debug!(pod_uid = %uid, has_error = error.is_some(), "[cache] Storing pod status");
        self.pods.insert(
            uid.to_string(),
            CacheEntry {
                status,
                error,
                modified: timestamp,
            },
        );
        self.mark.send_modify(|_| {});
    }

    /// Returns the cached status and the error of the fetch that produced it.
    /// A pod with no entry yields an empty status and [`CacheError::NotFound`].
    pub fn get(&self, uid: &str) -> (PodStatus, Option<CacheError>) {
        match self.pods.get(uid) {
            Some(entry) => (entry.status.clone(), entry.error.clone()),
            None => (
                PodStatus {
                    id: uid.to_string(),
                    ..Default::default()
                },
                Some(CacheError::NotFound(uid.to_string())),
            ),
        }
    }

    pub fn delete(&self, uid: &str) {
        if self.pods.remove(uid).is_some() {
            debug!(pod_uid = %uid, "[cache] Deleted pod status");
        }
        self.mark.send_modify(|_| {});
    }

    /// Advances the high-water mark. Earlier timestamps are ignored.
    pub fn update_time(&self, timestamp: DateTime<Utc>) {
        self.mark.send_modify(|mark| {
            if mark.is_none_or(|current| timestamp > current) {
                *mark = Some(timestamp);
            }
        });
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        *self.mark.borrow()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Waits until the entry for `uid` was written at or after `min_time`, or
    /// the high-water mark reaches `min_time`, then returns it as [`Cache::get`]
    /// would.
    pub async fn get_newer_than(
        &self,
        uid: &str,
        min_time: DateTime<Utc>,
    ) -> (PodStatus, Option<CacheError>) {
        let mut changes = self.mark.subscribe();
        loop {
            if self.is_newer_than(uid, min_time) {
                return self.get(uid);
            }
            if changes.changed().await.is_err() {
                return self.get(uid);
            }
        }
    }

    fn is_newer_than(&self, uid: &str, min_time: DateTime<Utc>) -> bool {
        if self.timestamp().is_some_and(|mark| mark >= min_time) {
            return true;
        }
        self.pods
            .get(uid)
            .is_some_and(|entry| entry.modified >= min_time)
    }
}
