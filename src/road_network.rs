// src/road_network.rs
//
// Read-only description of the scenario road network: connection id to
// ordered node positions and the maximum allowed speed. Connection lengths
// are always recomputed from the node geometry because the length carried by
// scenario files is often inaccurate.

use crate::types::GeoPosition;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A directed road segment. Nodes are its geometric vertices in traversal
/// order, so that summing inter-node distances yields a usable length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadConnection {
    pub nodes: Vec<GeoPosition>,
    /// Maximum allowed speed in m/s.
    pub max_speed: f64,
}

impl RoadConnection {
    /// Connection length as the sum of inter-node haversine distances.
    pub fn length_by_nodes(&self) -> f64 {
        self.nodes
            .windows(2)
            .map(|pair| pair[0].distance_to(&pair[1]))
            .sum()
    }

    /// First node of the connection, the origin of record offsets.
    pub fn start_node(&self) -> Option<&GeoPosition> {
        self.nodes.first()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoadNetwork {
    pub connections: HashMap<String, RoadConnection>,
}

impl RoadNetwork {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read road network file {}", path.display()))?;
        let network: RoadNetwork = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse road network file {}", path.display()))?;
        Ok(network)
    }

    pub fn connection(&self, connection_id: &str) -> Option<&RoadConnection> {
        self.connections.get(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Position `meters` north of the equator on the prime meridian. On the
    /// sphere used by the haversine distance this makes inter-node distances
    /// come out in exact meters.
    pub fn position_at(meters: f64) -> GeoPosition {
        GeoPosition::new((meters / 6_371_000.0).to_degrees(), 0.0)
    }

    #[test]
    fn test_length_by_nodes() {
        let connection = RoadConnection {
            nodes: vec![position_at(0.0), position_at(60.0), position_at(100.0)],
            max_speed: 13.89,
        };
        assert!((connection.length_by_nodes() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_length_of_degenerate_connection_is_zero() {
        let connection = RoadConnection {
            nodes: vec![position_at(5.0)],
            max_speed: 13.89,
        };
        assert_eq!(connection.length_by_nodes(), 0.0);
    }

    #[test]
    fn test_parse_network_json() {
        let raw = r#"{
            "connections": {
                "conn_a": {
                    "max_speed": 13.89,
                    "nodes": [
                        { "latitude": 0.0, "longitude": 0.0 },
                        { "latitude": 0.001, "longitude": 0.0, "elevation": 34.0 }
                    ]
                }
            }
        }"#;
        let network: RoadNetwork = serde_json::from_str(raw).unwrap();
        assert_eq!(network.len(), 1);
        let connection = network.connection("conn_a").unwrap();
        assert_eq!(connection.nodes.len(), 2);
        assert_eq!(connection.nodes[1].elevation, Some(34.0));
        assert!(network.connection("conn_b").is_none());
    }
}
