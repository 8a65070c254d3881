use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, Row, params};
use tracing::debug;

use crate::event::{Action, Interfaces, LifecycleEvent, RecordedEvent};
use crate::state::ContainerState;
use crate::{Error, Result};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a writer waits on a locked database before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens or creates the store at `path`, enabling WAL and the busy timeout.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), %mode, "opened store");
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an existing store without creating or migrating it.
    pub fn open_read_only(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }

    /// Appends one event to the log and returns its row id.
    pub fn record(&self, event: &LifecycleEvent) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO lifecycle_events (
                container_id, container_name, image, action, event_type,
                event_time, event_time_nano, interfaces
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.container_id,
                event.container_name,
                event.image,
                event.action.as_str(),
                event.category,
                event.time,
                event.time_nano,
                event.interfaces.to_delimited(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Reads the log ordered by container, then fine timestamp, then insertion.
    pub fn events(
        &self,
        container_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RecordedEvent>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, container_id, container_name, image, action, event_type,
                    event_time, event_time_nano, interfaces
             FROM lifecycle_events
             WHERE ?1 IS NULL OR container_id = ?1
             ORDER BY container_id, event_time_nano, id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![container_id, limit], recorded_event_from_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Compacted rows keyed by container id.
    pub fn container_states(&self) -> Result<BTreeMap<String, ContainerState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT container_id, action, interfaces FROM container_state ORDER BY container_id",
        )?;
        let rows = stmt.query_map([], container_state_from_row)?;
        let mut states = BTreeMap::new();
        for row in rows {
            let state = row?;
            states.insert(state.container_id.clone(), state);
        }
        Ok(states)
    }

    /// Every event carrying the newest fine timestamp of its container, ordered
    /// by container and insertion. Several rows per container only show up when
    /// the runtime reported identical timestamps.
    pub(crate) fn newest_events(&self) -> Result<Vec<ContainerState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT e.container_id, e.action, e.interfaces
             FROM lifecycle_events e
             JOIN (
                SELECT container_id, MAX(event_time_nano) AS newest
                FROM lifecycle_events
                GROUP BY container_id
             ) m ON e.container_id = m.container_id AND e.event_time_nano = m.newest
             ORDER BY e.container_id, e.id",
        )?;
        let rows = stmt.query_map([], container_state_from_row)?;
        let mut newest = Vec::new();
        for row in rows {
            newest.push(row?);
        }
        Ok(newest)
    }

    pub(crate) fn upsert_state(&self, state: &ContainerState) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO container_state (container_id, action, interfaces)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(container_id) DO UPDATE
                SET action = excluded.action,
                    interfaces = excluded.interfaces",
            params![
                state.container_id,
                state.action.as_str(),
                state.interfaces.to_delimited()
            ],
        )?;
        Ok(())
    }

    pub(crate) fn remove_state(&self, container_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM container_state WHERE container_id = ?1",
            params![container_id],
        )?;
        Ok(())
    }
}

fn recorded_event_from_row(row: &Row<'_>) -> rusqlite::Result<RecordedEvent> {
    let action: String = row.get(4)?;
    let interfaces: String = row.get(8)?;
    Ok(RecordedEvent {
        id: row.get(0)?,
        event: LifecycleEvent {
            container_id: row.get(1)?,
            container_name: row.get(2)?,
            image: row.get(3)?,
            action: Action::from(action.as_str()),
            category: row.get(5)?,
            time: row.get(6)?,
            time_nano: row.get(7)?,
            interfaces: Interfaces::from_delimited(&interfaces),
        },
    })
}

fn container_state_from_row(row: &Row<'_>) -> rusqlite::Result<ContainerState> {
    let action: String = row.get(1)?;
    let interfaces: String = row.get(2)?;
    Ok(ContainerState {
        container_id: row.get(0)?,
        action: Action::from(action.as_str()),
        interfaces: Interfaces::from_delimited(&interfaces),
    })
}

#[cfg(test)]
pub(crate) mod test {
    use tempfile::TempDir;

    use super::*;

    pub(crate) fn event(id: &str, action: &str, time_nano: i64, ifaces: &str) -> LifecycleEvent {
        LifecycleEvent {
            container_id: id.into(),
            container_name: format!("{id}-name"),
            image: "alpine:latest".into(),
            action: Action::from(action),
            category: "container".into(),
            time: time_nano / 1_000_000_000,
            time_nano,
            interfaces: Interfaces::from_delimited(ifaces),
        }
    }

    #[test]
    fn test_record_and_read_back_in_timestamp_order() -> crate::Result<()> {
        let store = Store::in_memory()?;
        store.record(&event("b", "start", 20, "veth1"))?;
        store.record(&event("a", "die", 30, "veth0"))?;
        store.record(&event("a", "start", 10, "veth0"))?;

        let events = store.events(None, None)?;
        let order: Vec<(&str, i64)> = events
            .iter()
            .map(|e| (e.event.container_id.as_str(), e.event.time_nano))
            .collect();
        assert_eq!(order, vec![("a", 10), ("a", 30), ("b", 20)]);

        let only_a = store.events(Some("a"), None)?;
        assert_eq!(only_a.len(), 2);
        assert_eq!(only_a[1].event, event("a", "die", 30, "veth0"));

        let limited = store.events(None, Some(1))?;
        assert_eq!(limited.len(), 1);
        Ok(())
    }

    #[test]
    fn test_open_file_store_survives_reopen() -> crate::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested").join("buzzard.db");
        {
            let store = Store::open(&path, DEFAULT_BUSY_TIMEOUT)?;
            store.record(&event("a", "create", 1, ""))?;
            let conn = store.conn()?;
            let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
            assert_eq!(mode.to_lowercase(), "wal");
        }

        let reopened = Store::open(&path, DEFAULT_BUSY_TIMEOUT)?;
        assert_eq!(reopened.events(None, None)?.len(), 1);

        let reader = Store::open_read_only(&path, DEFAULT_BUSY_TIMEOUT)?;
        assert_eq!(reader.events(Some("a"), None)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_two_connections_write_concurrently() -> crate::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("buzzard.db");
        let first = Store::open(&path, DEFAULT_BUSY_TIMEOUT)?;
        let second = Store::open(&path, DEFAULT_BUSY_TIMEOUT)?;

        let writer = {
            let first = first.clone();
            std::thread::spawn(move || -> crate::Result<()> {
                for i in 0..50 {
                    first.record(&event("a", "start", i, "veth0"))?;
                }
                Ok(())
            })
        };
        for i in 0..50 {
            second.record(&event("b", "start", i, "veth1"))?;
        }
        writer.join().expect("writer thread")?;

        assert_eq!(first.events(None, None)?.len(), 100);
        Ok(())
    }
}
