// src/processors/query.rs
//
// Answers traffic-state point queries from units: given a connection and a
// time, respond with the stored traversal statistics nearest in time.

use crate::processors::ProcessorContext;
use crate::types::{ServerMessage, ServerResponse};
use tracing::{debug, error};

pub struct TrafficStateQueryProcessor;

impl TrafficStateQueryProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn handle_message(
        &mut self,
        message: &ServerMessage,
        ctx: &mut ProcessorContext<'_>,
    ) -> Option<ServerResponse> {
        let ServerMessage::TrafficStateQuery {
            connection_id,
            time_ns,
        } = message;
        let statistics = match ctx.store.get_closest_traversal_data(connection_id, *time_ns) {
            Ok(statistics) => statistics,
            Err(err) => {
                error!(
                    "traversal lookup failed for connection {}: {}",
                    connection_id, err
                );
                return None;
            }
        };
        debug!(
            "traffic state query for connection {} at {}: {}",
            connection_id,
            time_ns,
            if statistics.is_some() { "hit" } else { "no data" }
        );
        Some(ServerResponse::TrafficState {
            connection_id: connection_id.clone(),
            statistics,
        })
    }
}

impl Default for TrafficStateQueryProcessor {
    fn default() -> Self {
        Self::new()
    }
}
