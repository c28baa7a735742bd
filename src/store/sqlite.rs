//! SQLite backend - one row per device, contact and message

use super::{Backend, Change, State};
use crate::contacts::Contact;
use crate::devices::Device;
use crate::error::Result;
use crate::messages::{Message, MessageStatus};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use tracing::{info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NOT NULL,
    status TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    source_address TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contacts (
    device_id TEXT NOT NULL,
    phone TEXT NOT NULL,
    name TEXT NOT NULL,
    added_at TEXT NOT NULL,
    last_contact_at TEXT,
    UNIQUE(device_id, phone)
);

CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(phone);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL,
    from_device TEXT NOT NULL,
    to_number TEXT NOT NULL,
    text TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT
);
"#;

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (or create) the database. A file that is not a usable database
    /// is moved aside and replaced with an empty one.
    pub fn open(path: &Path) -> Result<Self> {
        match Self::try_open(path) {
            Ok(backend) => Ok(backend),
            Err(e) if path.is_file() => {
                let aside = path.with_extension("db.corrupt");
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    "Unusable database, starting empty: {}",
                    e
                );
                std::fs::rename(path, &aside)?;
                Self::try_open(path)
            }
            Err(e) => Err(e),
        }
    }

    fn try_open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "Database initialized");
        Ok(Self { conn })
    }

    /// Connection without a file, for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn upsert_device(conn: &Connection, device: &Device) -> Result<()> {
        conn.execute(
            "INSERT INTO devices (device_id, display_name, status, last_seen, source_address)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(device_id) DO UPDATE SET
                display_name = excluded.display_name,
                status = excluded.status,
                last_seen = excluded.last_seen,
                source_address = excluded.source_address",
            params![
                device.device_id,
                device.display_name,
                device.status.to_string(),
                device.last_seen.to_rfc3339(),
                device.source_address,
            ],
        )?;
        Ok(())
    }

    fn upsert_message(conn: &Connection, message: &Message) -> Result<()> {
        conn.execute(
            "INSERT INTO messages (id, from_device, to_number, text, status, created_at, retry_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                retry_count = excluded.retry_count,
                updated_at = excluded.updated_at",
            params![
                message.id,
                message.from_device,
                message.to_number,
                message.text,
                message.status.as_str(),
                message.created_at.to_rfc3339(),
                message.retry_count,
                message.updated_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Delete-then-insert inside one transaction
    fn replace_contacts(&mut self, device_id: &str, contacts: &[Contact]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM contacts WHERE device_id = ?1", params![device_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO contacts (device_id, phone, name, added_at, last_contact_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for contact in contacts {
                stmt.execute(params![
                    contact.device_id,
                    contact.phone,
                    contact.name,
                    contact.added_at.to_rfc3339(),
                    contact.last_contact_at.map(|t| t.to_rfc3339()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn parse_enum<T: std::str::FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    })
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn load(&mut self) -> Result<State> {
        let mut state = State::default();

        let mut stmt = self.conn.prepare(
            "SELECT device_id, display_name, status, last_seen, source_address FROM devices",
        )?;
        let devices = stmt.query_map([], |row| {
            Ok(Device {
                device_id: row.get(0)?,
                display_name: row.get(1)?,
                status: parse_enum(row, 2)?,
                last_seen: parse_time(row, 3)?,
                source_address: row.get(4)?,
            })
        })?;
        for device in devices {
            let device = device?;
            state.devices.insert(device.device_id.clone(), device);
        }

        let mut stmt = self.conn.prepare(
            "SELECT device_id, phone, name, added_at, last_contact_at FROM contacts
             ORDER BY device_id, phone",
        )?;
        let contacts = stmt.query_map([], |row| {
            Ok(Contact {
                device_id: row.get(0)?,
                phone: row.get(1)?,
                name: row.get(2)?,
                added_at: parse_time(row, 3)?,
                last_contact_at: parse_optional_time(row, 4)?,
            })
        })?;
        for contact in contacts {
            let contact = contact?;
            state
                .contacts
                .entry(contact.device_id.clone())
                .or_default()
                .push(contact);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, from_device, to_number, text, status, created_at, retry_count, updated_at
             FROM messages",
        )?;
        let messages = stmt.query_map([], |row| {
            Ok(Message {
                id: row.get(0)?,
                from_device: row.get(1)?,
                to_number: row.get(2)?,
                text: row.get(3)?,
                status: parse_enum::<MessageStatus>(row, 4)?,
                created_at: parse_time(row, 5)?,
                retry_count: row.get(6)?,
                updated_at: parse_optional_time(row, 7)?,
            })
        })?;
        for message in messages {
            let message = message?;
            state.messages.insert(message.id.clone(), message);
        }

        Ok(state)
    }

    fn persist(&mut self, change: Change<'_>, state: &State) -> Result<()> {
        match change {
            Change::Device(device_id) => {
                if let Some(device) = state.devices.get(device_id) {
                    Self::upsert_device(&self.conn, device)?;
                }
            }
            Change::AllDevices => {
                let tx = self.conn.transaction()?;
                for device in state.devices.values() {
                    Self::upsert_device(&tx, device)?;
                }
                tx.commit()?;
            }
            Change::Contacts(device_id) => {
                let set = state.contacts.get(device_id).map(Vec::as_slice).unwrap_or_default();
                self.replace_contacts(device_id, set)?;
            }
            Change::ContactActivity { phone, at } => {
                self.conn.execute(
                    "UPDATE contacts SET last_contact_at = ?1 WHERE phone = ?2",
                    params![at.to_rfc3339(), phone],
                )?;
            }
            Change::Message(id) => {
                if let Some(message) = state.messages.get(id) {
                    Self::upsert_message(&self.conn, message)?;
                }
            }
        }
        Ok(())
    }
}
