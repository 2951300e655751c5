// src/processors/mod.rs
//
// Three processor capability sets, each a tagged enum over the known
// implementations. The kernel iterates three typed lists and dispatches by
// plain match; adding a processor kind means adding a variant here and a
// configuration variant in the config module.

pub mod fcd_writer;
pub mod query;
pub mod rtsm;
pub mod spatio_temporal;
pub mod threshold;

pub use fcd_writer::FcdWriterProcessor;
pub use query::TrafficStateQueryProcessor;
pub use spatio_temporal::SpatioTemporalProcessor;
pub use threshold::ThresholdProcessor;

use crate::config::{MessageProcessorConfig, TimeProcessorConfig, TraversalProcessorConfig};
use crate::road_network::RoadNetwork;
use crate::storage::MetricStore;
use crate::types::{FcdTraversal, FcdUpdate, ServerMessage, ServerResponse, SECOND_NS};

/// Shared resources handed to processors on every invocation. The road
/// network is read-only; the metric store is the single mutable shared
/// resource and is only ever accessed from the event thread.
pub struct ProcessorContext<'a> {
    pub network: &'a RoadNetwork,
    pub store: &'a mut MetricStore,
}

// ============================================================================
// Traversal-based processors
// ============================================================================

/// Fired once per completed connection traversal.
pub enum TraversalProcessor {
    SpatioTemporal(SpatioTemporalProcessor),
}

impl TraversalProcessor {
    pub fn from_config(config: &TraversalProcessorConfig) -> Self {
        match config {
            TraversalProcessorConfig::SpatioTemporal {
                spatial_mean_speed_chunk_m,
            } => TraversalProcessor::SpatioTemporal(SpatioTemporalProcessor::new(
                *spatial_mean_speed_chunk_m,
            )),
        }
    }

    pub fn on_traversal(
        &mut self,
        vehicle_id: &str,
        traversal: &FcdTraversal,
        ctx: &mut ProcessorContext<'_>,
    ) {
        match self {
            TraversalProcessor::SpatioTemporal(processor) => {
                processor.on_traversal(vehicle_id, traversal, ctx)
            }
        }
    }

    pub fn shutdown(&mut self, _shutdown_time: i64, _ctx: &mut ProcessorContext<'_>) {
        match self {
            TraversalProcessor::SpatioTemporal(_) => {}
        }
    }
}

// ============================================================================
// Time-based processors
// ============================================================================

/// Fired on a fixed simulated-time interval; additionally sees every update
/// for bookkeeping.
pub enum TimeProcessor {
    Threshold(ThresholdProcessor),
    FcdWriter(FcdWriterProcessor),
}

impl TimeProcessor {
    pub fn from_config(config: &TimeProcessorConfig) -> Self {
        match config {
            TimeProcessorConfig::Threshold {
                trigger_interval_s,
                default_red_light_duration_s,
                min_traversals_for_threshold,
                recompute_all_rtsm_with_new_thresholds,
            } => TimeProcessor::Threshold(ThresholdProcessor::new(
                trigger_interval_s * SECOND_NS,
                default_red_light_duration_s * SECOND_NS,
                *min_traversals_for_threshold,
                *recompute_all_rtsm_with_new_thresholds,
            )),
            TimeProcessorConfig::FcdWriter { trigger_interval_s } => {
                TimeProcessor::FcdWriter(FcdWriterProcessor::new(trigger_interval_s * SECOND_NS))
            }
        }
    }

    /// Registry key for event routing. At most one processor per identifier
    /// can be active in a kernel.
    pub fn identifier(&self) -> &'static str {
        match self {
            TimeProcessor::Threshold(_) => ThresholdProcessor::IDENTIFIER,
            TimeProcessor::FcdWriter(_) => FcdWriterProcessor::IDENTIFIER,
        }
    }

    /// Simulated nanoseconds between triggers. Processors with a
    /// non-positive interval are never scheduled.
    pub fn trigger_interval(&self) -> i64 {
        match self {
            TimeProcessor::Threshold(processor) => processor.trigger_interval,
            TimeProcessor::FcdWriter(processor) => processor.trigger_interval,
        }
    }

    pub fn handle_update(&mut self, vehicle_id: &str, update: &FcdUpdate) {
        match self {
            TimeProcessor::Threshold(processor) => processor.handle_update(vehicle_id, update),
            TimeProcessor::FcdWriter(processor) => processor.handle_update(vehicle_id, update),
        }
    }

    pub fn trigger(&mut self, event_time: i64, ctx: &mut ProcessorContext<'_>) {
        match self {
            TimeProcessor::Threshold(processor) => processor.trigger(event_time, ctx),
            TimeProcessor::FcdWriter(processor) => processor.trigger(event_time, ctx),
        }
    }

    pub fn shutdown(
        &mut self,
        shutdown_time: i64,
        previous_trigger_time: i64,
        ctx: &mut ProcessorContext<'_>,
    ) {
        match self {
            TimeProcessor::Threshold(processor) => {
                processor.shutdown(shutdown_time, previous_trigger_time, ctx)
            }
            TimeProcessor::FcdWriter(processor) => processor.shutdown(shutdown_time, ctx),
        }
    }
}

// ============================================================================
// Message-based processors
// ============================================================================

/// Fired for inbound messages that are not record updates.
pub enum MessageProcessor {
    TrafficStateQuery(TrafficStateQueryProcessor),
}

impl MessageProcessor {
    pub fn from_config(config: &MessageProcessorConfig) -> Self {
        match config {
            MessageProcessorConfig::TrafficStateQuery => {
                MessageProcessor::TrafficStateQuery(TrafficStateQueryProcessor::new())
            }
        }
    }

    pub fn handles(&self, message: &ServerMessage) -> bool {
        match self {
            MessageProcessor::TrafficStateQuery(_) => {
                matches!(message, ServerMessage::TrafficStateQuery { .. })
            }
        }
    }

    pub fn handle_message(
        &mut self,
        message: &ServerMessage,
        ctx: &mut ProcessorContext<'_>,
    ) -> Option<ServerResponse> {
        match self {
            MessageProcessor::TrafficStateQuery(processor) => {
                processor.handle_message(message, ctx)
            }
        }
    }
}
