pub mod metrics;
pub mod tasks;

pub use tasks::{spawn_peer_sweeper, spawn_stats_poller, ShutdownSignal};
