pub mod commands;
pub mod config;
pub mod daemon;

// re-export selected public API
pub use commands::{NodeCommand, node_execute};
pub use config::{Config, load_config};
pub use daemon::status::{
    cache::Cache,
    pleg::{PLEG, PlegConfig, PodLifecycleEvent, PodLifecycleEventType},
    pod::{Runtime, RuntimeManager},
};
