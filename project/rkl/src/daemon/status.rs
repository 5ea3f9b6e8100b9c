//! Pod status tracking for the rkl daemon.
//!
//! This module is the node-level pipeline that detects container state
//! changes on the local node and keeps the last known status of every pod.
//!
//! # Architecture
//!
//! ```text
//!                 get_pods / get_pod_status
//!  ┌──────────┐ ─────────────────────────▶ ┌────────────────┐   CRI gRPC   ┌─────────┐
//!  │   PLEG   │                            │ RuntimeManager │ ───────────▶ │ runtime │
//!  └────┬─────┘                            └────────────────┘              └─────────┘
//!       │ diff (PodRecords)
//!       ├──────────────▶ Cache (PodStatus per pod, high-water mark)
//!       ▼
//!  lifecycle events ──▶ pod workers
//! ```
//!
//! * [`pleg`]: Pod Lifecycle Event Generator. Periodically relists pods and
//!   compares container states to the previous snapshot, emitting
//!   [`pleg::PodLifecycleEvent`]s for every change.
//! * [`pod`]: the [`pod::Runtime`] seam and its CRI-backed
//!   [`pod::RuntimeManager`].
//! * [`pod_records`]: previous/current snapshot ledger diffed by PLEG.
//! * [`cache`]: last known [`common::PodStatus`] per pod.
//! * [`clock`]: injectable time source.

pub mod cache;
pub mod clock;
pub mod pleg;
pub mod pod;
pub mod pod_records;
