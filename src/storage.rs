// src/storage.rs
//
// Durable metric store backed by SQLite. All traffic-state results flow
// through this store: raw FCD records, per-traversal metrics, per-connection
// thresholds, and connection metadata copied from the road network.
//
// Two variants share the interface: an on-disk database, and an in-memory
// database that restores from the database file at startup and writes itself
// back on shutdown via the SQLite backup API.

use crate::road_network::RoadNetwork;
use crate::types::{FcdRecord, IntervalAverages, TraversalStatistics};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const TABLE_RECORDS: &str = "fcd_records";
const TABLE_TRAVERSAL_METRICS: &str = "traversal_metrics";
const TABLE_THRESHOLDS: &str = "connection_thresholds";
const TABLE_CONNECTIONS: &str = "connection_data";

/// Rows per transaction for bulk writes.
const INSERT_BATCH_SIZE: usize = 1000;

// =============================================================================
// Error type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

// =============================================================================
// Backend selection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// SQLite database on disk at the configured path.
    #[default]
    OnDisk,
    /// SQLite database in memory, flushed to the configured path on shutdown.
    InMemory,
}

// =============================================================================
// Store
// =============================================================================

/// Row counts of the four tables, logged as the shutdown summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatistics {
    pub record_count: i64,
    pub traversal_count: i64,
    pub threshold_count: i64,
    pub connection_count: i64,
}

impl std::fmt::Display for StoreStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "records: {}, traversals: {}, thresholds: {}, connections: {}",
            self.record_count, self.traversal_count, self.threshold_count, self.connection_count
        )
    }
}

pub struct MetricStore {
    conn: Connection,
    backend: StorageBackend,
    database_path: PathBuf,
    /// Latest thresholds per connection, mirroring the newest rows of the
    /// thresholds table. Updated only after confirmed commits.
    threshold_cache: HashMap<String, (f64, f64)>,
    /// Wall-clock session start (unix seconds); rows inserted from this
    /// session on are the ones returned by `get_traversal_metrics`.
    session_start_unix: i64,
}

impl MetricStore {
    /// Open the store, create missing tables, and populate the connection
    /// metadata from the road network. With `persistent` unset, all tables
    /// are cleared first.
    pub fn open(
        database_path: impl AsRef<Path>,
        backend: StorageBackend,
        network: &RoadNetwork,
        persistent: bool,
    ) -> Result<Self, StoreError> {
        let database_path = database_path.as_ref().to_path_buf();
        let conn = match backend {
            StorageBackend::OnDisk => Connection::open(&database_path)?,
            StorageBackend::InMemory => {
                let mut conn = Connection::open_in_memory()?;
                if database_path.exists() {
                    debug!(
                        "restoring in-memory store from {}",
                        database_path.display()
                    );
                    let source = Connection::open(&database_path)?;
                    let backup = rusqlite::backup::Backup::new(&source, &mut conn)?;
                    backup.run_to_completion(1000, Duration::from_millis(0), None)?;
                }
                conn
            }
        };

        let mut store = Self {
            conn,
            backend,
            database_path,
            threshold_cache: HashMap::new(),
            session_start_unix: chrono::Utc::now().timestamp(),
        };
        if !persistent {
            store.drop_tables()?;
        }
        store.create_tables()?;
        store.initialize_threshold_cache()?;
        store.copy_connection_data(network)?;
        info!(
            "metric store ready ({} connections, {} cached thresholds)",
            network.len(),
            store.threshold_cache.len()
        );
        Ok(store)
    }

    /// Flush and close. The in-memory variant writes its contents back to
    /// the database file first.
    pub fn shutdown(self) -> Result<(), StoreError> {
        if self.backend == StorageBackend::InMemory {
            let mut target = Connection::open(&self.database_path)?;
            let backup = rusqlite::backup::Backup::new(&self.conn, &mut target)?;
            backup.run_to_completion(1000, Duration::from_millis(0), None)?;
        }
        if let Err((_conn, err)) = self.conn.close() {
            return Err(err.into());
        }
        Ok(())
    }

    // =========================================================================
    // Schema
    // =========================================================================

    fn drop_tables(&mut self) -> Result<(), StoreError> {
        for table in [
            TABLE_RECORDS,
            TABLE_TRAVERSAL_METRICS,
            TABLE_THRESHOLDS,
            TABLE_CONNECTIONS,
        ] {
            self.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS {table};"))?;
        }
        Ok(())
    }

    fn create_tables(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE_RECORDS} (
                vehicle_id TEXT NOT NULL,
                time_ns INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                connection_id TEXT NOT NULL,
                offset_m REAL NOT NULL,
                speed REAL NOT NULL,
                heading REAL NOT NULL,
                PRIMARY KEY (connection_id, time_ns, vehicle_id)
            );
            CREATE INDEX IF NOT EXISTS idx_records_time ON {TABLE_RECORDS} (time_ns);
            CREATE INDEX IF NOT EXISTS idx_records_connection ON {TABLE_RECORDS} (connection_id);

            CREATE TABLE IF NOT EXISTS {TABLE_TRAVERSAL_METRICS} (
                vehicle_id TEXT NOT NULL,
                time_ns INTEGER NOT NULL,
                connection_id TEXT NOT NULL,
                next_connection_id TEXT,
                spatial_mean_speed REAL NOT NULL,
                temporal_mean_speed REAL NOT NULL,
                naive_mean_speed REAL NOT NULL,
                relative_metric REAL,
                traversal_time_ns INTEGER NOT NULL,
                inserted_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_time ON {TABLE_TRAVERSAL_METRICS} (time_ns);
            CREATE INDEX IF NOT EXISTS idx_metrics_connection ON {TABLE_TRAVERSAL_METRICS} (connection_id);
            CREATE INDEX IF NOT EXISTS idx_metrics_inserted ON {TABLE_TRAVERSAL_METRICS} (inserted_at);

            CREATE TABLE IF NOT EXISTS {TABLE_THRESHOLDS} (
                connection_id TEXT NOT NULL,
                temporal_threshold REAL NOT NULL,
                spatial_threshold REAL NOT NULL,
                time_ns INTEGER NOT NULL,
                inserted_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_thresholds_connection ON {TABLE_THRESHOLDS} (connection_id);
            CREATE INDEX IF NOT EXISTS idx_thresholds_inserted ON {TABLE_THRESHOLDS} (inserted_at);

            CREATE TABLE IF NOT EXISTS {TABLE_CONNECTIONS} (
                connection_id TEXT NOT NULL PRIMARY KEY,
                max_speed REAL NOT NULL,
                length_m REAL NOT NULL
            );"
        ))?;
        Ok(())
    }

    /// Seed the threshold cache with the newest row per connection.
    fn initialize_threshold_cache(&mut self) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT connection_id, temporal_threshold, spatial_threshold
             FROM {TABLE_THRESHOLDS}
             ORDER BY inserted_at ASC, rowid ASC"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        // scanning in insertion order leaves the newest value per connection
        for (connection_id, temporal, spatial) in rows {
            self.threshold_cache
                .insert(connection_id, (temporal, spatial));
        }
        Ok(())
    }

    /// Upsert connection metadata from the road network. Lengths are
    /// recomputed from node geometry.
    fn copy_connection_data(&mut self, network: &RoadNetwork) -> Result<(), StoreError> {
        let entries: Vec<(&String, f64, f64)> = network
            .connections
            .iter()
            .map(|(id, connection)| (id, connection.max_speed, connection.length_by_nodes()))
            .collect();
        for chunk in entries.chunks(INSERT_BATCH_SIZE) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "INSERT OR REPLACE INTO {TABLE_CONNECTIONS}
                     (connection_id, max_speed, length_m) VALUES (?1, ?2, ?3)"
                ))?;
                for (connection_id, max_speed, length) in chunk {
                    stmt.execute(params![connection_id, max_speed, length])?;
                }
            }
            tx.commit()?;
        }
        Ok(())
    }

    // =========================================================================
    // Record persistence
    // =========================================================================

    /// Persist the records of a single vehicle. Duplicate keys replace.
    pub fn insert_records(
        &mut self,
        vehicle_id: &str,
        records: &[FcdRecord],
    ) -> Result<usize, StoreError> {
        let mut bulk = HashMap::new();
        bulk.insert(vehicle_id.to_string(), records.to_vec());
        self.insert_records_bulk(&bulk)
    }

    /// Persist records of many vehicles in one pass, in transactions of
    /// `INSERT_BATCH_SIZE` rows. Returns the number of rows written.
    pub fn insert_records_bulk(
        &mut self,
        records: &HashMap<String, Vec<FcdRecord>>,
    ) -> Result<usize, StoreError> {
        let rows: Vec<(&String, &FcdRecord)> = records
            .iter()
            .flat_map(|(vehicle_id, list)| list.iter().map(move |r| (vehicle_id, r)))
            .collect();
        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "REPLACE INTO {TABLE_RECORDS}
                     (vehicle_id, time_ns, latitude, longitude, connection_id, offset_m, speed, heading)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ))?;
                for (vehicle_id, record) in chunk {
                    stmt.execute(params![
                        vehicle_id,
                        record.time_ns,
                        record.position.latitude,
                        record.position.longitude,
                        record.connection_id,
                        record.offset,
                        record.speed,
                        record.heading,
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(rows.len())
    }

    // =========================================================================
    // Traversal metrics
    // =========================================================================

    /// Append one traversal metric row. Returns the assigned row id, which
    /// doubles as the traversal id.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_traversal_metric(
        &mut self,
        vehicle_id: &str,
        time_ns: i64,
        connection_id: &str,
        next_connection_id: &str,
        spatial_mean_speed: f64,
        temporal_mean_speed: f64,
        naive_mean_speed: f64,
        relative_metric: f32,
        traversal_time_ns: i64,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            &format!(
                "INSERT INTO {TABLE_TRAVERSAL_METRICS}
                 (vehicle_id, time_ns, connection_id, next_connection_id,
                  spatial_mean_speed, temporal_mean_speed, naive_mean_speed,
                  relative_metric, traversal_time_ns)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                vehicle_id,
                time_ns,
                connection_id,
                next_connection_id,
                spatial_mean_speed,
                temporal_mean_speed,
                naive_mean_speed,
                relative_metric as f64,
                traversal_time_ns,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Rewrite the relative metric of the given rows (matched by traversal
    /// id). Rows without a computed metric are skipped.
    pub fn update_traversal_metrics(
        &mut self,
        traversals: &[TraversalStatistics],
    ) -> Result<usize, StoreError> {
        let rows: Vec<(&TraversalStatistics, f32)> = traversals
            .iter()
            .filter_map(|t| t.relative_metric.map(|m| (t, m)))
            .collect();
        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "UPDATE {TABLE_TRAVERSAL_METRICS}
                     SET relative_metric = ?1 WHERE rowid = ?2"
                ))?;
                for (traversal, metric) in chunk {
                    stmt.execute(params![*metric as f64, traversal.traversal_id])?;
                }
            }
            tx.commit()?;
        }
        Ok(rows.len())
    }

    // =========================================================================
    // Thresholds
    // =========================================================================

    /// Persist one threshold row per connection present in both maps, then
    /// update the in-memory cache. The cache is only touched after the
    /// commit succeeded.
    pub fn insert_thresholds(
        &mut self,
        temporal_thresholds: &HashMap<String, f64>,
        spatial_thresholds: &HashMap<String, f64>,
        simulation_time_ns: i64,
    ) -> Result<(), StoreError> {
        let entries: Vec<(&String, f64, f64)> = temporal_thresholds
            .iter()
            .filter_map(|(connection_id, &temporal)| {
                spatial_thresholds
                    .get(connection_id)
                    .map(|&spatial| (connection_id, temporal, spatial))
            })
            .collect();
        for chunk in entries.chunks(INSERT_BATCH_SIZE) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "INSERT INTO {TABLE_THRESHOLDS}
                     (connection_id, temporal_threshold, spatial_threshold, time_ns)
                     VALUES (?1, ?2, ?3, ?4)"
                ))?;
                for (connection_id, temporal, spatial) in chunk {
                    stmt.execute(params![connection_id, temporal, spatial, simulation_time_ns])?;
                }
            }
            tx.commit()?;
        }
        for (connection_id, temporal, spatial) in entries {
            self.threshold_cache
                .insert(connection_id.clone(), (temporal, spatial));
        }
        Ok(())
    }

    /// Most recent `(temporal, spatial)` thresholds for a connection, cache
    /// first, falling back to the newest stored row.
    pub fn get_thresholds(
        &mut self,
        connection_id: &str,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        if let Some(&pair) = self.threshold_cache.get(connection_id) {
            return Ok(Some(pair));
        }
        let pair = self
            .conn
            .query_row(
                &format!(
                    "SELECT temporal_threshold, spatial_threshold
                     FROM {TABLE_THRESHOLDS}
                     WHERE connection_id = ?1
                     ORDER BY inserted_at DESC, rowid DESC
                     LIMIT 1"
                ),
                [connection_id],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;
        if let Some(pair) = pair {
            self.threshold_cache
                .insert(connection_id.to_string(), pair);
        }
        Ok(pair)
    }

    /// Cache-only presence check.
    pub fn got_threshold_for(&self, connection_id: &str) -> bool {
        self.threshold_cache.contains_key(connection_id)
    }

    // =========================================================================
    // Aggregate reads
    // =========================================================================

    /// All traversal times over the full store, grouped by connection.
    pub fn get_traversal_times(&mut self) -> Result<HashMap<String, Vec<i64>>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT connection_id, traversal_time_ns
             FROM {TABLE_TRAVERSAL_METRICS}
             ORDER BY connection_id"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut result: HashMap<String, Vec<i64>> = HashMap::new();
        for (connection_id, time) in rows {
            result.entry(connection_id).or_default().push(time);
        }
        Ok(result)
    }

    /// All `(temporal, spatial)` mean speed pairs over the full store,
    /// grouped by connection.
    pub fn get_mean_speeds(&mut self) -> Result<HashMap<String, Vec<(f64, f64)>>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT connection_id, temporal_mean_speed, spatial_mean_speed
             FROM {TABLE_TRAVERSAL_METRICS}
             ORDER BY connection_id"
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut result: HashMap<String, Vec<(f64, f64)>> = HashMap::new();
        for (connection_id, temporal, spatial) in rows {
            result
                .entry(connection_id)
                .or_default()
                .push((temporal, spatial));
        }
        Ok(result)
    }

    /// All traversal rows inserted since this store was opened.
    pub fn get_traversal_metrics(&mut self) -> Result<Vec<TraversalStatistics>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT rowid, connection_id, time_ns, temporal_mean_speed, spatial_mean_speed,
                    relative_metric
             FROM {TABLE_TRAVERSAL_METRICS}
             WHERE inserted_at >= ?1
             ORDER BY connection_id"
        ))?;
        let rows = stmt
            .query_map([self.session_start_unix], |row| {
                Ok(TraversalStatistics {
                    traversal_id: row.get(0)?,
                    connection_id: row.get(1)?,
                    time_ns: row.get(2)?,
                    temporal_mean_speed: row.get(3)?,
                    spatial_mean_speed: row.get(4)?,
                    relative_metric: row.get::<_, Option<f64>>(5)?.map(|m| m as f32),
                    speed_performance_index: None,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The stored traversal nearest in time to `time_ns` on the given
    /// connection, with RTSM and Speed Performance Index.
    pub fn get_closest_traversal_data(
        &mut self,
        connection_id: &str,
        time_ns: i64,
    ) -> Result<Option<TraversalStatistics>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT m.rowid, m.connection_id, m.time_ns, m.temporal_mean_speed,
                            m.spatial_mean_speed, m.relative_metric, c.max_speed
                     FROM {TABLE_TRAVERSAL_METRICS} m
                     LEFT JOIN {TABLE_CONNECTIONS} c ON c.connection_id = m.connection_id
                     WHERE m.connection_id = ?1
                     ORDER BY ABS(m.time_ns - ?2)
                     LIMIT 1"
                ),
                params![connection_id, time_ns],
                |row| {
                    let temporal: f64 = row.get(3)?;
                    let max_speed: Option<f64> = row.get(6)?;
                    Ok(TraversalStatistics {
                        traversal_id: row.get(0)?,
                        connection_id: row.get(1)?,
                        time_ns: row.get(2)?,
                        temporal_mean_speed: temporal,
                        spatial_mean_speed: row.get(4)?,
                        relative_metric: row.get::<_, Option<f64>>(5)?.map(|m| m as f32),
                        speed_performance_index: max_speed
                            .filter(|&m| m > 0.0)
                            .map(|m| temporal / m),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Per-connection averages over `(time_ns, time_ns + interval_ns)`,
    /// including the Speed Performance Index against the posted maximum
    /// speed.
    pub fn get_averages_for_interval(
        &mut self,
        time_ns: i64,
        interval_ns: i64,
    ) -> Result<HashMap<String, IntervalAverages>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT m.connection_id, COUNT(*), AVG(m.temporal_mean_speed),
                    AVG(m.spatial_mean_speed), AVG(m.naive_mean_speed),
                    AVG(m.traversal_time_ns), AVG(m.relative_metric), c.max_speed
             FROM {TABLE_TRAVERSAL_METRICS} m
             LEFT JOIN {TABLE_CONNECTIONS} c ON c.connection_id = m.connection_id
             WHERE m.time_ns > ?1 AND m.time_ns < ?2
             GROUP BY m.connection_id"
        ))?;
        let rows = stmt
            .query_map(params![time_ns, time_ns + interval_ns], |row| {
                let temporal: f64 = row.get(2)?;
                let max_speed: Option<f64> = row.get(7)?;
                Ok(IntervalAverages {
                    connection_id: row.get(0)?,
                    sample_count: row.get(1)?,
                    temporal_mean_speed: temporal,
                    spatial_mean_speed: row.get(3)?,
                    naive_mean_speed: row.get(4)?,
                    traversal_time_ns: row.get(5)?,
                    relative_metric: row.get(6)?,
                    speed_performance_index: max_speed
                        .filter(|&m| m > 0.0)
                        .map(|m| temporal / m),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|averages| (averages.connection_id.clone(), averages))
            .collect())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        Ok(StoreStatistics {
            record_count: self.row_count(TABLE_RECORDS)?,
            traversal_count: self.row_count(TABLE_TRAVERSAL_METRICS)?,
            threshold_count: self.row_count(TABLE_THRESHOLDS)?,
            connection_count: self.row_count(TABLE_CONNECTIONS)?,
        })
    }

    fn row_count(&self, table: &str) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?)
    }
}

// =============================================================================
// TESTS
// =============================================================================
