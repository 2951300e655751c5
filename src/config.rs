// src/config.rs
//
// Server configuration, loaded from YAML. Processor lists are explicit
// tagged unions: the set of processor kinds the server knows is enumerated
// here, and configuration parsing is a plain serde parse.

use crate::storage::StorageBackend;
use crate::types::SECOND_NS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Road network description (JSON), required at startup.
    pub road_network_path: PathBuf,
    /// FCD trace to replay (JSON lines), required at startup.
    pub fcd_trace_path: PathBuf,
    /// Directory for the metric database. Defaults to the working directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_database_file_name")]
    pub database_file_name: String,
    #[serde(default)]
    pub storage_backend: StorageBackend,
    /// Keep existing tables across runs instead of truncating at startup.
    #[serde(default)]
    pub is_persistent: bool,
    /// Persist every incoming record to the records table immediately.
    #[serde(default)]
    pub store_raw_fcd: bool,
    /// How often the kernel looks for inactive vehicles, in seconds.
    #[serde(default = "default_unit_removal_interval_s")]
    pub unit_removal_interval_s: i64,
    /// Silence after which a vehicle is treated as gone, in seconds.
    #[serde(default = "default_unit_expiration_time_s")]
    pub unit_expiration_time_s: i64,
    #[serde(default)]
    pub traversal_based_processors: Vec<TraversalProcessorConfig>,
    #[serde(default)]
    pub time_based_processors: Vec<TimeProcessorConfig>,
    #[serde(default)]
    pub message_based_processors: Vec<MessageProcessorConfig>,
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse configuration file {}", path.display()))?;
        config.ensure_required_processors();
        Ok(config)
    }

    /// The spatio-temporal and threshold processors are required for minimal
    /// function; append them with default options when missing.
    pub fn ensure_required_processors(&mut self) {
        if !self
            .traversal_based_processors
            .iter()
            .any(|p| matches!(p, TraversalProcessorConfig::SpatioTemporal { .. }))
        {
            self.traversal_based_processors
                .push(TraversalProcessorConfig::default_spatio_temporal());
        }
        if !self
            .time_based_processors
            .iter()
            .any(|p| matches!(p, TimeProcessorConfig::Threshold { .. }))
        {
            self.time_based_processors
                .push(TimeProcessorConfig::default_threshold());
        }
    }

    pub fn database_file(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(&self.database_file_name)
    }

    pub fn unit_removal_interval_ns(&self) -> i64 {
        self.unit_removal_interval_s * SECOND_NS
    }

    pub fn unit_expiration_time_ns(&self) -> i64 {
        self.unit_expiration_time_s * SECOND_NS
    }
}

// ============================================================================
// Processor configurations (tagged unions)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraversalProcessorConfig {
    SpatioTemporal {
        /// Sampling distance for the spatial mean speed, in meters.
        #[serde(default = "default_spatial_chunk_m")]
        spatial_mean_speed_chunk_m: f64,
    },
}

impl TraversalProcessorConfig {
    pub fn default_spatio_temporal() -> Self {
        TraversalProcessorConfig::SpatioTemporal {
            spatial_mean_speed_chunk_m: default_spatial_chunk_m(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeProcessorConfig {
    Threshold {
        #[serde(default = "default_trigger_interval_s")]
        trigger_interval_s: i64,
        /// Red phase estimate applied to connections with travel time spreads
        /// close to this duration, in seconds.
        #[serde(default = "default_red_light_duration_s")]
        default_red_light_duration_s: i64,
        /// Thresholds are only computed for connections with at least this
        /// many recorded traversals.
        #[serde(default = "default_min_traversals")]
        min_traversals_for_threshold: usize,
        /// Recompute the relative metric of every stored traversal whenever
        /// new thresholds are available. Can take long on large stores.
        #[serde(default)]
        recompute_all_rtsm_with_new_thresholds: bool,
    },
    FcdWriter {
        #[serde(default = "default_trigger_interval_s")]
        trigger_interval_s: i64,
    },
}

impl TimeProcessorConfig {
    pub fn default_threshold() -> Self {
        TimeProcessorConfig::Threshold {
            trigger_interval_s: default_trigger_interval_s(),
            default_red_light_duration_s: default_red_light_duration_s(),
            min_traversals_for_threshold: default_min_traversals(),
            recompute_all_rtsm_with_new_thresholds: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageProcessorConfig {
    TrafficStateQuery,
}

fn default_database_file_name() -> String {
    "fcd_metrics.sqlite".to_string()
}

fn default_unit_removal_interval_s() -> i64 {
    30 * 60
}

fn default_unit_expiration_time_s() -> i64 {
    60 * 60
}

fn default_spatial_chunk_m() -> f64 {
    15.0
}

fn default_trigger_interval_s() -> i64 {
    30 * 60
}

fn default_red_light_duration_s() -> i64 {
    45
}

fn default_min_traversals() -> usize {
    10
}
