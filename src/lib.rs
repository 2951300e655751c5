// src/lib.rs
//
// Traffic-state estimation from floating car data: a stateful kernel turns
// per-vehicle record streams into completed connection traversals, metric
// processors derive mean speeds and the relative traffic status metric, and
// a SQLite-backed store holds the durable results.

pub mod config;
pub mod interpolation;
pub mod kernel;
pub mod processors;
pub mod replay;
pub mod road_network;
pub mod stats;
pub mod storage;
pub mod types;

pub use config::ServerConfig;
pub use kernel::FcdKernel;
pub use road_network::RoadNetwork;
pub use storage::{MetricStore, StorageBackend};
