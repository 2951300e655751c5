// src/kernel.rs
//
// The server kernel: owns the per-vehicle record buffers, recognizes
// completed connection traversals, routes updates and messages to the
// configured processors, and fires time-based jobs from a simulated-time
// event queue. Single-threaded and cooperative; every handler runs to
// completion.

use crate::config::ServerConfig;
use crate::processors::{
    MessageProcessor, ProcessorContext, TimeProcessor, TraversalProcessor,
};
use crate::road_network::RoadNetwork;
use crate::storage::{MetricStore, StoreError};
use crate::types::{FcdRecord, FcdTraversal, FcdUpdate, ServerMessage, ServerResponse, SECOND_NS};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, HashMap};
use tracing::{debug, error, info, warn};

// ============================================================================
// Event queue
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    ExpiredUnitRemoval,
    ProcessorTick(String),
}

/// Ordered by time; the sequence number keeps same-time events in insertion
/// order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ScheduledEvent {
    time: i64,
    seq: u64,
    kind: EventKind,
}

/// Scheduling state of one time-based processor.
struct TimeProcessorEntry {
    processor: TimeProcessor,
    next_trigger: i64,
    previous_trigger: i64,
}

// ============================================================================
// Kernel
// ============================================================================

pub struct FcdKernel {
    network: RoadNetwork,
    store: MetricStore,
    /// Pending records per vehicle, keyed by record time. The time key makes
    /// both traversal extraction and garbage collection cheap.
    record_buffer: HashMap<String, BTreeMap<i64, FcdRecord>>,
    /// Distinct connections each vehicle has been seen on, in traversal
    /// order. More than one entry means the head connection is fully
    /// traversed.
    connections_buffer: HashMap<String, Vec<String>>,
    /// Last record of each vehicle's most recently completed traversal,
    /// handed to the next traversal as its previous record.
    record_look_back: HashMap<String, FcdRecord>,
    traversal_processors: Vec<TraversalProcessor>,
    time_processors: Vec<TimeProcessorEntry>,
    message_processors: Vec<MessageProcessor>,
    event_queue: BinaryHeap<Reverse<ScheduledEvent>>,
    next_event_seq: u64,
    unit_removal_interval: i64,
    unit_expiration_time: i64,
    store_raw_fcd: bool,
    last_removal_time: i64,
    oldest_allowed_record_time: i64,
}

impl FcdKernel {
    pub fn new(config: &ServerConfig, network: RoadNetwork, store: MetricStore) -> Self {
        let mut config = config.clone();
        config.ensure_required_processors();

        let traversal_processors: Vec<TraversalProcessor> = config
            .traversal_based_processors
            .iter()
            .map(TraversalProcessor::from_config)
            .collect();

        let mut time_processors: Vec<TimeProcessorEntry> = Vec::new();
        for processor_config in &config.time_based_processors {
            let processor = TimeProcessor::from_config(processor_config);
            // only one instance per identifier can receive tick events
            if time_processors
                .iter()
                .any(|entry| entry.processor.identifier() == processor.identifier())
            {
                warn!(
                    "duplicate time-based processor {} ignored",
                    processor.identifier()
                );
                continue;
            }
            time_processors.push(TimeProcessorEntry {
                processor,
                next_trigger: 0,
                previous_trigger: 0,
            });
        }

        let message_processors: Vec<MessageProcessor> = config
            .message_based_processors
            .iter()
            .map(MessageProcessor::from_config)
            .collect();

        let mut kernel = Self {
            network,
            store,
            record_buffer: HashMap::new(),
            connections_buffer: HashMap::new(),
            record_look_back: HashMap::new(),
            traversal_processors,
            time_processors,
            message_processors,
            event_queue: BinaryHeap::new(),
            next_event_seq: 0,
            unit_removal_interval: config.unit_removal_interval_ns(),
            unit_expiration_time: config.unit_expiration_time_ns(),
            store_raw_fcd: config.store_raw_fcd,
            last_removal_time: 0,
            oldest_allowed_record_time: 0,
        };

        for index in 0..kernel.time_processors.len() {
            let interval = kernel.time_processors[index].processor.trigger_interval();
            if interval <= 0 {
                continue;
            }
            kernel.time_processors[index].next_trigger = interval;
            let identifier = kernel.time_processors[index]
                .processor
                .identifier()
                .to_string();
            kernel.schedule(interval, EventKind::ProcessorTick(identifier));
        }
        kernel.schedule_unit_removal();
        kernel
    }

    // =========================================================================
    // Update handling
    // =========================================================================

    /// Fan one update out to the time-based processors, the traversal
    /// extraction pipeline, and the raw-record hook. A final update drops
    /// the vehicle's state afterwards.
    pub fn process_update(&mut self, vehicle_id: &str, update: &FcdUpdate) {
        for entry in self.time_processors.iter_mut() {
            entry.processor.handle_update(vehicle_id, update);
        }
        self.process_update_for_traversals(vehicle_id, update);
        if self.store_raw_fcd {
            let records: Vec<FcdRecord> = update.records.values().cloned().collect();
            if let Err(err) = self.store.insert_records(vehicle_id, &records) {
                error!(
                    "raw record persistence failed for vehicle {}: {}",
                    vehicle_id, err
                );
            }
        }
        if update.is_final {
            self.record_buffer.remove(vehicle_id);
            self.connections_buffer.remove(vehicle_id);
            self.record_look_back.remove(vehicle_id);
        }
    }

    fn process_update_for_traversals(&mut self, vehicle_id: &str, update: &FcdUpdate) {
        self.extract_traversed_connections(vehicle_id, update);
        self.enqueue_records(vehicle_id, update);
        // more than one known connection means the head one is fully
        // traversed; a single batch can complete several traversals
        loop {
            let head_connection = match self.connections_buffer.get(vehicle_id) {
                Some(connections) if connections.len() > 1 => connections[0].clone(),
                _ => break,
            };
            let Some(traversal) = self.extract_traversal(vehicle_id, &head_connection) else {
                break;
            };
            debug!(
                "handling traversal of vehicle {} on connection {}",
                vehicle_id, head_connection
            );
            let mut ctx = ProcessorContext {
                network: &self.network,
                store: &mut self.store,
            };
            for processor in self.traversal_processors.iter_mut() {
                processor.on_traversal(vehicle_id, &traversal, &mut ctx);
            }
            if let Some(connections) = self.connections_buffer.get_mut(vehicle_id) {
                connections.remove(0);
            }
        }
    }

    /// Append connection ids the batch newly touches, in time order.
    fn extract_traversed_connections(&mut self, vehicle_id: &str, update: &FcdUpdate) {
        let connections = self
            .connections_buffer
            .entry(vehicle_id.to_string())
            .or_default();
        let mut previous = connections.last().cloned();
        for record in update.records.values() {
            if previous.as_deref() != Some(record.connection_id.as_str()) {
                connections.push(record.connection_id.clone());
                previous = Some(record.connection_id.clone());
            }
        }
    }

    fn enqueue_records(&mut self, vehicle_id: &str, update: &FcdUpdate) {
        self.record_buffer
            .entry(vehicle_id.to_string())
            .or_default()
            .extend(update.records.iter().map(|(&time, record)| (time, record.clone())));
    }

    /// Pop the contiguous run of records on the head connection off the
    /// pending buffer and bundle them with the look-back record and the
    /// first remaining record (which lies on the next connection and stays
    /// in the buffer).
    fn extract_traversal(
        &mut self,
        vehicle_id: &str,
        connection_id: &str,
    ) -> Option<FcdTraversal> {
        let pending = self.record_buffer.get_mut(vehicle_id)?;
        let mut records = Vec::new();
        while let Some(entry) = pending.first_entry() {
            if entry.get().connection_id == connection_id {
                records.push(entry.remove());
            } else {
                break;
            }
        }
        let last_record = records.last()?.clone();
        let previous_record = self.record_look_back.get(vehicle_id).cloned();
        let following_record = pending.values().next().cloned();
        self.record_look_back
            .insert(vehicle_id.to_string(), last_record);
        Some(FcdTraversal {
            connection_id: connection_id.to_string(),
            records,
            previous_record,
            following_record,
        })
    }

    // =========================================================================
    // Message handling
    // =========================================================================

    /// Route a non-update message to every message-based processor claiming
    /// it, collecting their responses.
    pub fn handle_message(&mut self, message: &ServerMessage) -> Vec<ServerResponse> {
        let mut responses = Vec::new();
        let mut handled = false;
        let mut ctx = ProcessorContext {
            network: &self.network,
            store: &mut self.store,
        };
        for processor in self.message_processors.iter_mut() {
            if !processor.handles(message) {
                continue;
            }
            handled = true;
            if let Some(response) = processor.handle_message(message, &mut ctx) {
                responses.push(response);
            }
        }
        if !handled {
            debug!("no processor found to handle message {:?}", message);
        }
        responses
    }

    // =========================================================================
    // Simulated time
    // =========================================================================

    /// Fire every scheduled event due at or before `now`, in time order.
    pub fn advance_to(&mut self, now: i64) {
        loop {
            let due = matches!(self.event_queue.peek(), Some(Reverse(event)) if event.time <= now);
            if !due {
                break;
            }
            let Some(Reverse(event)) = self.event_queue.pop() else {
                break;
            };
            self.dispatch_event(event);
        }
    }

    fn dispatch_event(&mut self, event: ScheduledEvent) {
        match event.kind {
            EventKind::ExpiredUnitRemoval => {
                self.remove_expired_units();
                self.schedule_unit_removal();
            }
            EventKind::ProcessorTick(identifier) => {
                let Some(index) = self
                    .time_processors
                    .iter()
                    .position(|entry| entry.processor.identifier() == identifier)
                else {
                    debug!("no processor named {} initialized", identifier);
                    return;
                };
                self.time_processors[index].previous_trigger = event.time;
                {
                    let mut ctx = ProcessorContext {
                        network: &self.network,
                        store: &mut self.store,
                    };
                    self.time_processors[index]
                        .processor
                        .trigger(event.time, &mut ctx);
                }
                let next = event.time + self.time_processors[index].processor.trigger_interval();
                self.time_processors[index].next_trigger = next;
                self.schedule(next, EventKind::ProcessorTick(identifier));
            }
        }
    }

    fn schedule(&mut self, time: i64, kind: EventKind) {
        let seq = self.next_event_seq;
        self.next_event_seq += 1;
        self.event_queue.push(Reverse(ScheduledEvent { time, seq, kind }));
    }

    fn schedule_unit_removal(&mut self) {
        self.last_removal_time += self.unit_removal_interval;
        self.oldest_allowed_record_time += self.unit_expiration_time;
        let time = self.last_removal_time;
        self.schedule(time, EventKind::ExpiredUnitRemoval);
    }

    /// Garbage-collect vehicles whose newest buffered record is older than
    /// the advancing watermark; they are assumed to no longer send.
    fn remove_expired_units(&mut self) {
        let watermark = self.oldest_allowed_record_time;
        let expired: Vec<String> = self
            .record_buffer
            .iter()
            .filter(|(_, records)| match records.keys().next_back() {
                Some(&newest) => newest < watermark,
                None => true,
            })
            .map(|(vehicle_id, _)| vehicle_id.clone())
            .collect();
        if !expired.is_empty() {
            debug!("removing vehicles due to inactivity: {:?}", expired);
        }
        for vehicle_id in expired {
            self.record_buffer.remove(&vehicle_id);
            self.connections_buffer.remove(&vehicle_id);
            self.record_look_back.remove(&vehicle_id);
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Shut down every processor, log the store summary, and close the
    /// store. The threshold processor runs one final computation here.
    pub fn shutdown(mut self, shutdown_time: i64) -> Result<(), StoreError> {
        info!("shutting down kernel at {} s", shutdown_time / SECOND_NS);
        for index in 0..self.time_processors.len() {
            let previous_trigger = self.time_processors[index].previous_trigger;
            let mut ctx = ProcessorContext {
                network: &self.network,
                store: &mut self.store,
            };
            self.time_processors[index]
                .processor
                .shutdown(shutdown_time, previous_trigger, &mut ctx);
        }
        for index in 0..self.traversal_processors.len() {
            let mut ctx = ProcessorContext {
                network: &self.network,
                store: &mut self.store,
            };
            self.traversal_processors[index].shutdown(shutdown_time, &mut ctx);
        }
        self.record_buffer.clear();
        self.connections_buffer.clear();
        self.record_look_back.clear();
        match self.store.statistics() {
            Ok(statistics) => info!("metric store summary: {}", statistics),
            Err(err) => error!("failed to gather store statistics: {}", err),
        }
        self.store.shutdown()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_tracking(&self, vehicle_id: &str) -> bool {
        self.record_buffer.contains_key(vehicle_id)
            || self.connections_buffer.contains_key(vehicle_id)
    }

    pub fn tracked_vehicle_count(&self) -> usize {
        self.record_buffer.len()
    }

    pub fn store_mut(&mut self) -> &mut MetricStore {
        &mut self.store
    }
}

// ============================================================================
// TESTS
// ============================================================================
