//! Pod Lifecycle Event Generator (PLEG).
//!
//! PLEG detects container state transitions on the local node. It
//! periodically *relists* every pod through the [`Runtime`], compares the
//! new snapshot with the previous one held in [`PodRecords`], and turns every
//! state change into a [`PodLifecycleEvent`] sent on a bounded channel.
//!
//! When a [`Cache`] is configured, pods with events get their [`PodStatus`]
//! refreshed before the events are published. A pod whose status fetch fails
//! keeps its previous snapshot, so its events are derived again on the next
//! relist, and is retried on every cycle until it succeeds.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut pleg = PLEG::new(runtime, Some(cache), Arc::new(RealClock), PlegConfig::default());
//! let mut events = pleg.watch().unwrap();
//! pleg.start();
//! while let Some(event) = events.recv().await { /* sync pod */ }
//! ```
//!
//! [`PodStatus`]: common::PodStatus

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use common::{ContainerId, ContainerState, Pod, PodUid};
use tokio::{
    select,
    sync::{
        Mutex,
        mpsc::{self, Receiver, Sender, error::TrySendError},
    },
};
use tracing::{debug, error, info, warn};

use crate::daemon::status::{
    cache::{Cache, CacheError},
    clock::Clock,
    pod::Runtime,
    pod_records::PodRecords,
};

pub const DEFAULT_RELIST_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
/// Extra slack on top of the relist period before PLEG reports unhealthy.
pub const RELIST_THRESHOLD: Duration = Duration::from_secs(3 * 60);

const NEVER_RELISTED: i64 = i64::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlegConfig {
    pub relist_period: Duration,
    pub channel_capacity: usize,
}

impl Default for PlegConfig {
    fn default() -> Self {
        Self {
            relist_period: DEFAULT_RELIST_PERIOD,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Discriminant for the kind of state transition detected by PLEG.
#[allow(clippy::enum_variant_names)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodLifecycleEventType {
    /// Container transitioned to `Running`.
    ContainerStarted,
    /// Container exited, or vanished without being seen as exited.
    ContainerDied,
    /// Container was removed from the runtime entirely.
    ContainerRemoved,
    /// The whole pod should be resynced.
    PodSync,
    /// Container entered an unknown state. Never published.
    ContainerChanged,
}

/// A single pod lifecycle event emitted by PLEG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodLifecycleEvent {
    /// UID of the pod this event belongs to.
    pub id: PodUid,
    pub event_type: PodLifecycleEventType,
    /// Runtime id of the container the event is about, if any.
    pub data: Option<String>,
}

/// Container state as PLEG sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlegContainerState {
    Running,
    Exited,
    Unknown,
    NonExistent,
}

impl From<ContainerState> for PlegContainerState {
    fn from(state: ContainerState) -> Self {
        match state {
            ContainerState::Running => PlegContainerState::Running,
            ContainerState::Exited => PlegContainerState::Exited,
            // created-but-not-started has no PLEG state of its own
            ContainerState::Created | ContainerState::Unknown => PlegContainerState::Unknown,
        }
    }
}

/// Pod Lifecycle Event Generator.
///
/// # Lifecycle
///
/// 1. Create with [`PLEG::new`].
/// 2. Take the event receiver with [`PLEG::watch`].
/// 3. Call [`PLEG::start`] to spawn the relist loop, or drive cycles by hand
///    with [`PLEG::relist`].
/// 4. Drop or call [`PLEG::stop`] to cancel the background task.
#[allow(clippy::upper_case_acronyms)]
pub struct PLEG {
    config: PlegConfig,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
    last_relist: Arc<AtomicI64>,
    event_rx: Option<Receiver<PodLifecycleEvent>>,
    relist_task_handle: Option<tokio::task::JoinHandle<()>>,
    stop_signal_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

/// Everything the relist loop owns.
struct State {
    runtime: Arc<dyn Runtime>,
    cache: Option<Arc<Cache>>,
    clock: Arc<dyn Clock>,
    pod_records: PodRecords,
    pods_to_reinspect: HashMap<PodUid, Arc<Pod>>,
    event_tx: Sender<PodLifecycleEvent>,
    last_relist: Arc<AtomicI64>,
}

impl PLEG {
    /// Creates a new PLEG. Without a cache no pod status is ever fetched.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        cache: Option<Arc<Cache>>,
        clock: Arc<dyn Clock>,
        config: PlegConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity.max(1));
        let last_relist = Arc::new(AtomicI64::new(NEVER_RELISTED));
        let state = State {
            runtime,
            cache,
            clock: clock.clone(),
            pod_records: PodRecords::new(),
            pods_to_reinspect: HashMap::new(),
            event_tx,
            last_relist: last_relist.clone(),
        };
        Self {
            config,
            clock,
            state: Arc::new(Mutex::new(state)),
            last_relist,
            event_rx: Some(event_rx),
            relist_task_handle: None,
            stop_signal_tx: None,
        }
    }

    /// Hands out the receiving side of the event channel. There is a single
    /// subscriber, so only the first call returns `Some`.
    pub fn watch(&mut self) -> Option<Receiver<PodLifecycleEvent>> {
        let rx = self.event_rx.take();
        if rx.is_none() {
            warn!("[pleg] watch() called more than once; the event channel has a single subscriber");
        }
        rx
    }

    /// Spawns the relist loop: relist, then wait one period, until stopped.
    pub fn start(&mut self) {
        if let Some(handle) = &self.relist_task_handle {
            if !handle.is_finished() {
                warn!("[pleg] start() called while already running; ignoring");
                return;
            }
            self.relist_task_handle = None;
            self.stop_signal_tx = None;
        }

        let (stop_signal_tx, mut stop_signal_rx) = tokio::sync::oneshot::channel();
        self.stop_signal_tx = Some(stop_signal_tx);
        let state = self.state.clone();
        let relist_period = self.config.relist_period;
        debug!(relist_period = ?relist_period, "[pleg] Starting relist loop");

        self.relist_task_handle = Some(tokio::spawn(async move {
            loop {
                state.lock().await.relist().await;
                select! {
                    _ = &mut stop_signal_rx => {
                        debug!("[pleg] Received stop signal, exiting relist loop");
                        break;
                    }
                    _ = tokio::time::sleep(relist_period) => {}
                }
            }
        }));
    }

    /// Signals the background relist loop to stop.
    pub fn stop(&mut self) {
        if let Some(stop_signal_tx) = self.stop_signal_tx.take() {
            let _ = stop_signal_tx.send(());
        }
        if let Some(relist_task_handle) = self.relist_task_handle.take() {
            relist_task_handle.abort();
        }
    }

    /// Runs one relist cycle on the caller's task.
    pub async fn relist(&self) {
        self.state.lock().await.relist().await;
    }

    /// Start time of the last relist whose pod listing succeeded.
    pub fn last_relist_time(&self) -> Option<DateTime<Utc>> {
        match self.last_relist.load(Ordering::SeqCst) {
            NEVER_RELISTED => None,
            micros => DateTime::from_timestamp_micros(micros),
        }
    }

    /// False until the first successful relist, and whenever the last one is
    /// older than the relist period plus [`RELIST_THRESHOLD`].
    pub fn healthy(&self) -> bool {
        let Some(last) = self.last_relist_time() else {
            return false;
        };
        let elapsed = self.clock.now().signed_duration_since(last);
        let threshold = self.config.relist_period + RELIST_THRESHOLD;
        match elapsed.to_std() {
            Ok(elapsed) => elapsed <= threshold,
            // clock went backwards
            Err(_) => true,
        }
    }
}

impl Drop for PLEG {
    fn drop(&mut self) {
        self.stop();
    }
}

impl State {
    async fn relist(&mut self) {
        let timestamp = self.clock.now();
        debug!(%timestamp, "[pleg] Relisting pods for lifecycle event detection");

        let pods = match self.runtime.get_pods(true).await {
            Ok(pods) => pods,
            Err(e) => {
                error!(error = %format!("{e:#}"), "[pleg] Unable to list pods, skipping relist");
                return;
            }
        };
        self.last_relist
            .store(timestamp.timestamp_micros(), Ordering::SeqCst);
        self.pod_records.set_current(pods);

        let mut events_by_pod: Vec<(PodUid, Vec<PodLifecycleEvent>)> = Vec::new();
        for uid in self.pod_records.uids() {
            let old_pod = self.pod_records.get_old(&uid);
            let current_pod = self.pod_records.get_current(&uid);
            let mut events = Vec::new();
            for cid in all_container_ids(old_pod.as_deref(), current_pod.as_deref()) {
                events.extend(compute_events(
                    &uid,
                    &cid,
                    old_pod.as_deref(),
                    current_pod.as_deref(),
                ));
            }
            events_by_pod.push((uid, events));
        }

        let mut needs_reinspection: HashMap<PodUid, Arc<Pod>> = HashMap::new();
        let mut published = 0usize;
        let mut dropped = 0usize;
        for (uid, events) in events_by_pod {
            let current_pod = self.pod_records.get_current(&uid);
            if let Some(cache) = self.cache.clone() {
                if !events.is_empty() || current_pod.is_none() {
                    self.pods_to_reinspect.remove(&uid);
                    if let Err(e) = self
                        .update_cache(&cache, &uid, current_pod.as_ref(), timestamp)
                        .await
                    {
                        warn!(
                            pod_uid = %uid,
                            error = %format!("{e:#}"),
                            "[pleg] Failed to update pod status, will reinspect"
                        );
                        if let Some(pod) = current_pod {
                            needs_reinspection.insert(uid, pod);
                        }
                        continue;
                    }
                }
            }

            self.pod_records.update(&uid);
            for event in events {
                if event.event_type == PodLifecycleEventType::ContainerChanged {
                    continue;
                }
                debug!(
                    pod_uid = %event.id,
                    event_type = ?event.event_type,
                    container_id = ?event.data,
                    "[pleg] Emitting pod lifecycle event"
                );
                match self.event_tx.try_send(event) {
                    Ok(()) => published += 1,
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => dropped += 1,
                }
            }
        }
        if dropped > 0 {
            warn!(
                dropped,
                capacity = self.event_tx.max_capacity(),
                "[pleg] Event channel is full or closed, discarding events"
            );
        }

        if let Some(cache) = self.cache.clone() {
            let carried_over = std::mem::take(&mut self.pods_to_reinspect);
            for (uid, pod) in carried_over {
                if needs_reinspection.contains_key(&uid) {
                    continue;
                }
                if let Err(e) = self
                    .update_cache(&cache, &uid, Some(&pod), timestamp)
                    .await
                {
                    warn!(
                        pod_uid = %uid,
                        error = %format!("{e:#}"),
                        "[pleg] Reinspection failed, will retry"
                    );
                    needs_reinspection.insert(uid, pod);
                }
            }
            cache.update_time(timestamp);
        }
        self.pods_to_reinspect = needs_reinspection;

        if published > 0 {
            info!(event_count = published, "[pleg] Detected pod lifecycle events");
        }
        debug!(
            pod_record_count = self.pod_records.len(),
            reinspect_count = self.pods_to_reinspect.len(),
            "[pleg] Relist cycle completed"
        );
    }

    /// Refreshes the cached status of one pod. A pod that is gone is removed
    /// from the cache instead.
    async fn update_cache(
        &self,
        cache: &Cache,
        uid: &str,
        pod: Option<&Arc<Pod>>,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(pod) = pod else {
            cache.delete(uid);
            return Ok(());
        };

        let (cached, _) = cache.get(uid);
        match self
            .runtime
            .get_pod_status(&pod.id, &pod.name, &pod.namespace)
            .await
        {
            Ok(mut status) => {
                // a torn-down sandbox loses its IPs before the pod is gone
                if status.ips.is_empty() && !status.has_ready_sandbox() {
                    status.ips = cached.ips;
                }
                cache.set(uid, status, None, timestamp);
                Ok(())
            }
            Err(e) => {
                cache.set(
                    uid,
                    cached,
                    Some(CacheError::Fetch(format!("{e:#}"))),
                    timestamp,
                );
                Err(e)
            }
        }
    }
}

/// Union of container and sandbox ids across both snapshots, old first,
/// without duplicates.
fn all_container_ids(old: Option<&Pod>, current: Option<&Pod>) -> Vec<ContainerId> {
    let mut seen = HashSet::new();
    [old, current]
        .into_iter()
        .flatten()
        .flat_map(|pod| pod.container_ids())
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect()
}

fn container_state(pod: Option<&Pod>, cid: &ContainerId) -> PlegContainerState {
    pod.and_then(|p| p.find_container_by_id(cid))
        .map(|c| PlegContainerState::from(c.state))
        .unwrap_or(PlegContainerState::NonExistent)
}

fn compute_events(
    uid: &str,
    cid: &ContainerId,
    old: Option<&Pod>,
    current: Option<&Pod>,
) -> Vec<PodLifecycleEvent> {
    let old_state = container_state(old, cid);
    let new_state = container_state(current, cid);
    debug!(
        pod_uid = %uid,
        container_id = %cid,
        old_state = ?old_state,
        new_state = ?new_state,
        "[pleg] Computed container state transition"
    );
    if old_state == new_state {
        return Vec::new();
    }

    let event_types: &[PodLifecycleEventType] = match new_state {
        PlegContainerState::Running => &[PodLifecycleEventType::ContainerStarted],
        PlegContainerState::Exited => &[PodLifecycleEventType::ContainerDied],
        PlegContainerState::Unknown => &[PodLifecycleEventType::ContainerChanged],
        PlegContainerState::NonExistent => match old_state {
            PlegContainerState::Exited => &[PodLifecycleEventType::ContainerRemoved],
            _ => &[
                PodLifecycleEventType::ContainerDied,
                PodLifecycleEventType::ContainerRemoved,
            ],
        },
    };
    event_types
        .iter()
        .map(|&event_type| PodLifecycleEvent {
            id: uid.to_string(),
            event_type,
            data: Some(cid.id.clone()),
        })
        .collect()
}
