//! The database source: tables collected into a SQLite file by some
//! other process.
//!
//! Each station/table pair maps to one database table named
//! `station_table` with `stamp` (nanoseconds), `record_no` and one
//! column per value. The source polls for rows past its record-number
//! high-water mark.

use super::record::{Record, RecordDesc, Value, ValueDesc, ValueType};
use super::request::{RequestHandle, SinkFailure};
use super::settings::SourceSettings;
use super::sink::DisconnectReason;
use super::symbol::{SymbolSeed, SymbolType};
use super::uri::SourceUri;
use super::{DataSource, SourceEvent, SourceEventSender};
use crate::stamp::Stamp;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Column, Row, SqlitePool, TypeInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum Command {
    Activate(Vec<RequestHandle>),
    Remove(RequestHandle),
    Enumerate { parent: String },
    Disconnect,
}

/// SQLite-backed table source.
pub struct DatabaseSource {
    name: String,
    events: SourceEventSender,
    /// Path of the database file, from the `file-name` property.
    path: String,
    poll_interval_ms: u32,
    connected: bool,
    queued: Vec<RequestHandle>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl DatabaseSource {
    #[must_use]
    pub fn new(name: &str, events: SourceEventSender, settings: &SourceSettings) -> Self {
        Self {
            name: name.to_string(),
            events,
            path: settings.file_name.clone().unwrap_or_default(),
            poll_interval_ms: settings.poll_schedule_interval.unwrap_or(5_000),
            connected: false,
            queued: Vec::new(),
            commands: None,
        }
    }
}

impl DataSource for DatabaseSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) {
        if self.connected {
            return;
        }
        if self.path.is_empty() {
            let _ = self.events.send(SourceEvent::Disconnected {
                source: self.name.clone(),
                reason: DisconnectReason::BadProperties,
            });
            return;
        }
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.commands = Some(command_tx);
        self.connected = true;
        let _ = self.events.send(SourceEvent::Connecting {
            source: self.name.clone(),
        });
        tokio::spawn(run_database(
            self.name.clone(),
            self.path.clone(),
            u64::from(self.poll_interval_ms.max(250)),
            self.events.clone(),
            command_rx,
        ));
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            if let Some(commands) = self.commands.take() {
                let _ = commands.send(Command::Disconnect);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn add_request(&mut self, request: RequestHandle) {
        self.queued.push(request);
    }

    fn activate_requests(&mut self) {
        let batch = std::mem::take(&mut self.queued);
        if batch.is_empty() {
            return;
        }
        match &self.commands {
            Some(commands) => {
                let _ = commands.send(Command::Activate(batch));
            }
            None => {
                for request in batch {
                    let _ = self.events.send(SourceEvent::RequestFailed {
                        request,
                        failure: SinkFailure::ConnectionFailed,
                    });
                }
            }
        }
    }

    fn remove_request(&mut self, request: &RequestHandle) {
        self.queued.retain(|held| !Arc::ptr_eq(held, request));
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Remove(request.clone()));
        }
    }

    fn start_symbol_expansion(&mut self, uri: &SourceUri) -> bool {
        match &self.commands {
            Some(commands) => commands
                .send(Command::Enumerate {
                    parent: uri.as_str().to_string(),
                })
                .is_ok(),
            None => false,
        }
    }
}

struct Cursor {
    requests: Vec<RequestHandle>,
    table_name: String,
    desc: RecordDesc,
    high_water: Option<i64>,
}

async fn run_database(
    name: String,
    path: String,
    poll_interval_ms: u64,
    events: SourceEventSender,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let url = format!("sqlite://{path}");
    let pool = match SqlitePoolOptions::new().max_connections(1).connect(&url).await {
        Ok(pool) => pool,
        Err(error) => {
            warn!(name, %error, "database open failed");
            let _ = events.send(SourceEvent::Disconnected {
                source: name,
                reason: DisconnectReason::ConnectionFailed,
            });
            return;
        }
    };
    debug!(name, path, "database source connected");
    let _ = events.send(SourceEvent::Connected {
        source: name.clone(),
    });

    let mut cursors: Vec<Cursor> = Vec::new();
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(poll_interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for cursor in &mut cursors {
                    poll_cursor(&pool, &events, cursor).await;
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Activate(batch)) => {
                        activate(&pool, &events, &mut cursors, batch).await;
                    }
                    Some(Command::Remove(request)) => {
                        for cursor in &mut cursors {
                            cursor.requests.retain(|held| !Arc::ptr_eq(held, &request));
                        }
                        cursors.retain(|cursor| !cursor.requests.is_empty());
                    }
                    Some(Command::Enumerate { parent }) => {
                        enumerate(&name, &pool, &events, &parent).await;
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = events.send(SourceEvent::Disconnected {
                            source: name,
                            reason: DisconnectReason::ByApplication,
                        });
                        return;
                    }
                }
            }
        }
    }
}

fn table_name_for(station: &str, table: &str) -> String {
    // Identifier characters only; the URI grammar already forbids
    // quoting tricks, this guards direct settings input.
    let clean = |text: &str| {
        text.chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .collect::<String>()
    };
    format!("{}_{}", clean(station), clean(table))
}

async fn describe_table(pool: &SqlitePool, station: &str, table: &str) -> Option<RecordDesc> {
    let table_name = table_name_for(station, table);
    let sql = format!("SELECT * FROM \"{table_name}\" LIMIT 1");
    let row = sqlx::query(&sql).fetch_optional(pool).await.ok()??;
    let mut desc = RecordDesc::new(station, table);
    for column in row.columns() {
        let column_name = column.name();
        if column_name == "stamp" || column_name == "record_no" {
            continue;
        }
        let value_type = match column.type_info().name() {
            "INTEGER" => ValueType::Int8,
            "TEXT" => ValueType::Ascii,
            _ => ValueType::Float8,
        };
        desc.values.push(ValueDesc::scalar(column_name, value_type));
    }
    Some(desc)
}

async fn activate(
    pool: &SqlitePool,
    events: &SourceEventSender,
    cursors: &mut Vec<Cursor>,
    batch: Vec<RequestHandle>,
) {
    for request in batch {
        let (station, table, column) = {
            let held = request.lock().expect("request poisoned");
            (
                held.uri().station().unwrap_or_default(),
                held.uri().table().unwrap_or_default(),
                held.uri().column(),
            )
        };
        let Some(desc) = describe_table(pool, &station, &table).await else {
            let _ = events.send(SourceEvent::RequestFailed {
                request,
                failure: SinkFailure::InvalidTable,
            });
            continue;
        };
        if let Some(column) = &column {
            if desc.find_value(column).is_none() {
                let _ = events.send(SourceEvent::RequestFailed {
                    request,
                    failure: SinkFailure::InvalidColumn,
                });
                continue;
            }
        }
        let schema = Record::new(desc.clone(), Stamp::now(), 0);
        request
            .lock()
            .expect("request poisoned")
            .set_description(schema.clone());
        let _ = events.send(SourceEvent::RequestReady {
            request: request.clone(),
            record: schema,
        });
        let table_name = table_name_for(&station, &table);
        match cursors.iter_mut().find(|cursor| cursor.table_name == table_name) {
            Some(cursor) => cursor.requests.push(request),
            None => cursors.push(Cursor {
                requests: vec![request],
                table_name,
                desc,
                high_water: None,
            }),
        }
    }
}

async fn poll_cursor(pool: &SqlitePool, events: &SourceEventSender, cursor: &mut Cursor) {
    let since = cursor.high_water.unwrap_or(-1);
    let sql = format!(
        "SELECT * FROM \"{}\" WHERE record_no > ? ORDER BY record_no",
        cursor.table_name
    );
    let rows = match sqlx::query(&sql).bind(since).fetch_all(pool).await {
        Ok(rows) => rows,
        Err(error) => {
            warn!(%error, table = cursor.table_name, "database poll failed");
            return;
        }
    };
    if rows.is_empty() {
        return;
    }
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let stamp: i64 = row.try_get("stamp").unwrap_or(0);
        let record_no: i64 = row.try_get("record_no").unwrap_or(0);
        cursor.high_water = Some(cursor.high_water.unwrap_or(-1).max(record_no));
        let mut record = Record::new(
            cursor.desc.clone(),
            Stamp::from_nanos(stamp),
            record_no as u32,
        );
        for slot in &cursor.desc.values {
            let value = match slot.value_type {
                ValueType::Int8 => row
                    .try_get::<i64, _>(slot.name.as_str())
                    .map(Value::Int8)
                    .unwrap_or(Value::Int8(0)),
                ValueType::Ascii => row
                    .try_get::<String, _>(slot.name.as_str())
                    .map(Value::Ascii)
                    .unwrap_or_else(|_| Value::Ascii(String::new())),
                _ => row
                    .try_get::<f64, _>(slot.name.as_str())
                    .map(Value::Float8)
                    .unwrap_or(Value::Float8(f64::NAN)),
            };
            record.values.push(value);
        }
        records.push(record);
    }
    let _ = events.send(SourceEvent::Records {
        requests: cursor.requests.clone(),
        records,
    });
}

async fn enumerate(name: &str, pool: &SqlitePool, events: &SourceEventSender, parent: &str) {
    let parent_uri = SourceUri::new(parent);
    let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
        .fetch_all(pool)
        .await
        .unwrap_or_default();
    let tables: Vec<String> = rows
        .iter()
        .filter_map(|row| row.try_get::<String, _>("name").ok())
        .collect();
    let symbols: Vec<SymbolSeed> = if parent_uri.is_source_only() {
        // Stations are the distinct prefixes of `station_table` names.
        let mut stations: HashMap<String, ()> = HashMap::new();
        for table in &tables {
            if let Some((station, _)) = table.split_once('_') {
                stations.insert(station.to_string(), ());
            }
        }
        let mut stations: Vec<String> = stations.into_keys().collect();
        stations.sort();
        stations
            .iter()
            .map(|station| SymbolSeed::branch(station, SymbolType::Station))
            .collect()
    } else if parent_uri.table().is_none() {
        let station = parent_uri.station().unwrap_or_default();
        let prefix = format!("{station}_");
        tables
            .iter()
            .filter_map(|table| table.strip_prefix(&prefix))
            .map(|table| SymbolSeed::branch(table, SymbolType::Table))
            .collect()
    } else {
        let station = parent_uri.station().unwrap_or_default();
        let table = parent_uri.table().unwrap_or_default();
        match describe_table(pool, &station, &table).await {
            Some(desc) => desc
                .values
                .iter()
                .map(|slot| SymbolSeed::leaf(&slot.name, SymbolType::Scalar, slot.value_type))
                .collect(),
            None => Vec::new(),
        }
    };
    let _ = events.send(SourceEvent::Symbols {
        source: name.to_string(),
        parent: parent.to_string(),
        symbols,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_sanitised() {
        assert_eq!(table_name_for("stn", "tbl"), "stn_tbl");
        assert_eq!(table_name_for("s-t;n", "tbl'"), "stn_tbl");
    }

    #[tokio::test]
    async fn polls_rows_past_the_high_water_mark() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE stn_tbl (stamp INTEGER, record_no INTEGER, temp REAL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO stn_tbl VALUES (100, 1, 20.5), (200, 2, 21.0)")
            .execute(&pool)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = super::super::request::request_handle(super::super::request::Request::new(
            SourceUri::new("db:stn.tbl.temp"),
        ));
        let mut cursors = Vec::new();
        activate(&pool, &tx, &mut cursors, vec![request]).await;
        assert_eq!(cursors.len(), 1);
        poll_cursor(&pool, &tx, &mut cursors[0]).await;

        let mut delivered = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::Records { records, .. } = event {
                delivered.extend(records);
            }
        }
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].record_no, 2);
        assert_eq!(delivered[1].value_by_name("temp"), Some(&Value::Float8(21.0)));

        // A second poll with no new rows delivers nothing.
        poll_cursor(&pool, &tx, &mut cursors[0]).await;
        assert!(rx.try_recv().is_err());

        // New rows past the mark are picked up.
        sqlx::query("INSERT INTO stn_tbl VALUES (300, 3, 21.5)")
            .execute(&pool)
            .await
            .unwrap();
        poll_cursor(&pool, &tx, &mut cursors[0]).await;
        let mut fresh = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::Records { records, .. } = event {
                fresh.extend(records);
            }
        }
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].record_no, 3);
    }

    #[tokio::test]
    async fn missing_table_fails_the_request() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = super::super::request::request_handle(super::super::request::Request::new(
            SourceUri::new("db:ghost.tbl.temp"),
        ));
        let mut cursors = Vec::new();
        activate(&pool, &tx, &mut cursors, vec![request]).await;
        match rx.try_recv().unwrap() {
            SourceEvent::RequestFailed { failure, .. } => {
                assert_eq!(failure, SinkFailure::InvalidTable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn enumeration_walks_station_table_columns() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE stn_tbl (stamp INTEGER, record_no INTEGER, temp REAL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO stn_tbl VALUES (1, 1, 1.0)")
            .execute(&pool)
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        enumerate("db", &pool, &tx, "db").await;
        enumerate("db", &pool, &tx, "db:stn").await;
        enumerate("db", &pool, &tx, "db:stn.tbl").await;
        let mut batches = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::Symbols { symbols, .. } = event {
                batches.push(symbols);
            }
        }
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0][0].name, "stn");
        assert_eq!(batches[1][0].name, "tbl");
        assert!(batches[2].iter().any(|seed| seed.name == "temp"));
    }
}
