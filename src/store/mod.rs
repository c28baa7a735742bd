//! Persistent store for devices, contacts and messages
//!
//! All state lives in memory behind one lock; every mutation is applied there
//! first and then written through to a [`Backend`]. Callers never see the
//! backend, so swapping JSON files for SQLite changes nothing above this
//! module.

pub mod json;
pub mod memory;
pub mod sqlite;

use crate::config::{BackendKind, Config};
use crate::contacts::{build_contact_set, normalize_phone, Contact, ContactEntry};
use crate::devices::{Device, DeviceStatus};
use crate::error::{Error, Result};
use crate::messages::{sort_oldest_first, Message, MessageStatus};
use crate::tracker::{self, Advance, Resend};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Everything the store holds
#[derive(Debug, Clone, Default)]
pub struct State {
    pub devices: BTreeMap<String, Device>,
    /// device_id -> that device's contact set, sorted by phone
    pub contacts: BTreeMap<String, Vec<Contact>>,
    pub messages: HashMap<String, Message>,
}

/// What a mutation touched, so a backend can write only that part
#[derive(Debug, Clone, Copy)]
pub enum Change<'a> {
    Device(&'a str),
    AllDevices,
    Contacts(&'a str),
    ContactActivity { phone: &'a str, at: DateTime<Utc> },
    Message(&'a str),
}

/// Durable representation behind the store
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Read everything back after a restart
    fn load(&mut self) -> Result<State>;

    /// Make `change` durable; `state` already reflects it
    fn persist(&mut self, change: Change<'_>, state: &State) -> Result<()>;
}

/// Aggregate counts for `get_status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub devices_connected: usize,
    pub contacts_count: usize,
    pub messages_count: usize,
    pub devices: Vec<Device>,
}

struct Inner {
    state: State,
    backend: Box<dyn Backend>,
}

impl Inner {
    fn persist(&mut self, change: Change<'_>) {
        if let Err(e) = self.backend.persist(change, &self.state) {
            warn!(backend = self.backend.name(), ?change, "Failed to persist change: {}", e);
        }
    }
}

pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    /// Open the backend named in the config and load what it holds. A
    /// database that cannot be opened leaves the store running in memory.
    pub fn open(config: &Config) -> Self {
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::Json => Box::new(json::JsonBackend::new(config)),
            BackendKind::Sqlite => match open_sqlite(config) {
                Ok(backend) => Box::new(backend),
                Err(e) => {
                    warn!(
                        path = %config.sqlite_file().display(),
                        "Cannot open database, nothing will be persisted: {}",
                        e
                    );
                    Box::new(memory::MemoryBackend)
                }
            },
            BackendKind::Memory => Box::new(memory::MemoryBackend),
        };
        Self::with_backend(backend)
    }

    /// Store that forgets everything on drop
    pub fn in_memory() -> Self {
        Self::with_backend(Box::new(memory::MemoryBackend))
    }

    pub fn with_backend(mut backend: Box<dyn Backend>) -> Self {
        let mut state = match backend.load() {
            Ok(state) => state,
            Err(e) => {
                warn!(backend = backend.name(), "Could not load stored state, starting empty: {}", e);
                State::default()
            }
        };

        // Nobody is connected yet
        for device in state.devices.values_mut() {
            device.status = DeviceStatus::Offline;
        }

        info!(
            backend = backend.name(),
            devices = state.devices.len(),
            contacts = state.contacts.values().map(Vec::len).sum::<usize>(),
            messages = state.messages.len(),
            "Store loaded"
        );

        let mut inner = Inner { state, backend };
        if !inner.state.devices.is_empty() {
            inner.persist(Change::AllDevices);
        }

        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Register or refresh a device and mark it online at `source`
    pub fn identify(&self, device_id: &str, display_name: &str, source: SocketAddr) -> Device {
        let mut inner = self.lock();
        let device = Device {
            device_id: device_id.to_string(),
            display_name: display_name.to_string(),
            status: DeviceStatus::Online,
            last_seen: Utc::now(),
            source_address: source.to_string(),
        };
        if let Some(previous) = inner.state.devices.insert(device_id.to_string(), device.clone()) {
            debug!(device_id, previous = %previous.source_address, "Device re-identified");
        }
        inner.persist(Change::Device(device_id));
        device
    }

    /// Refresh `last_seen`; false if the device was never identified
    pub fn touch(&self, device_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.state.devices.get_mut(device_id) {
            Some(device) => {
                device.last_seen = Utc::now();
                device.status = DeviceStatus::Online;
            }
            None => return false,
        }
        inner.persist(Change::Device(device_id));
        true
    }

    /// Mark a device offline, unless a newer connection already took it over
    pub fn mark_offline(&self, device_id: &str, source: SocketAddr) -> bool {
        let mut inner = self.lock();
        let source = source.to_string();
        match inner.state.devices.get_mut(device_id) {
            Some(device) if device.source_address == source => {
                device.status = DeviceStatus::Offline;
                device.last_seen = Utc::now();
            }
            _ => return false,
        }
        inner.persist(Change::Device(device_id));
        true
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.lock().state.devices.get(device_id).cloned()
    }

    // ------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------

    /// All contacts keyed by phone. When several devices hold the same
    /// number the most recently added entry wins.
    pub fn contacts(&self) -> BTreeMap<String, Contact> {
        merged_contacts(&self.lock().state)
            .into_iter()
            .map(|(phone, contact)| (phone.to_string(), contact.clone()))
            .collect()
    }

    pub fn device_contacts(&self, device_id: &str) -> Vec<Contact> {
        self.lock()
            .state
            .contacts
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a device's whole contact set. Nothing changes on error.
    pub fn sync_contacts(&self, device_id: &str, entries: &[ContactEntry]) -> Result<usize> {
        let mut inner = self.lock();
        let previous = inner
            .state
            .contacts
            .get(device_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let set = build_contact_set(device_id, entries, previous, Utc::now())?;
        let count = set.len();

        if set.is_empty() {
            inner.state.contacts.remove(device_id);
        } else {
            inner.state.contacts.insert(device_id.to_string(), set);
        }
        inner.persist(Change::Contacts(device_id));

        info!(device_id, count, "Synced contacts");
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Park a message for delivery, or apply the resend rule to a known id
    pub fn send_message(&self, id: &str, from_device: &str, to: &str, text: &str) -> Result<Resend> {
        let to_number = normalize_phone(to)
            .ok_or_else(|| Error::InvalidContact(format!("bad recipient number {:?}", to)))?;

        let mut inner = self.lock();
        let now = Utc::now();

        if let Some(existing) = inner.state.messages.get_mut(id) {
            let outcome = tracker::resend(existing, now);
            if let Resend::Requeued { retry_count } = outcome {
                info!(msg_id = id, retry_count, "Requeued failed message");
                inner.persist(Change::Message(id));
            } else {
                debug!(msg_id = id, ?outcome, "Duplicate send_message");
            }
            return Ok(outcome);
        }

        let message = Message::new(id, from_device, &to_number, text, now);
        inner.state.messages.insert(id.to_string(), message);
        inner.persist(Change::Message(id));

        let mut touched = false;
        for contact in inner.state.contacts.values_mut().flatten() {
            if contact.phone == to_number {
                contact.last_contact_at = Some(now);
                touched = true;
            }
        }
        if touched {
            inner.persist(Change::ContactActivity {
                phone: &to_number,
                at: now,
            });
        }

        info!(msg_id = id, from_device, to = %to_number, "Queued message");
        Ok(Resend::Created)
    }

    /// Apply a delivery report
    pub fn advance_status(&self, id: &str, status: MessageStatus) -> Advance {
        let mut inner = self.lock();
        let outcome = match inner.state.messages.get_mut(id) {
            Some(message) => tracker::advance(message, status, Utc::now()),
            None => Advance::UnknownId,
        };
        if outcome.applied() {
            inner.persist(Change::Message(id));
        }
        outcome
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.lock().state.messages.get(id).cloned()
    }

    /// The `limit` newest messages, oldest first
    pub fn recent_messages(&self, limit: usize) -> Vec<Message> {
        let mut messages: Vec<Message> = self.lock().state.messages.values().cloned().collect();
        sort_oldest_first(&mut messages);
        let skip = messages.len().saturating_sub(limit);
        messages.split_off(skip)
    }

    /// Up to `limit` pending messages, oldest first
    pub fn pending_messages(&self, limit: usize) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .lock()
            .state
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending)
            .cloned()
            .collect();
        sort_oldest_first(&mut messages);
        messages.truncate(limit);
        messages
    }

    /// Counts taken under one lock, so they describe a single state
    pub fn summary(&self) -> StatusSummary {
        let inner = self.lock();
        let contacts_count = merged_contacts(&inner.state).len();
        StatusSummary {
            devices_connected: inner
                .state
                .devices
                .values()
                .filter(|d| d.status == DeviceStatus::Online)
                .count(),
            contacts_count,
            messages_count: inner.state.messages.len(),
            devices: inner.state.devices.values().cloned().collect(),
        }
    }
}

fn open_sqlite(config: &Config) -> Result<sqlite::SqliteBackend> {
    std::fs::create_dir_all(&config.data_dir)?;
    sqlite::SqliteBackend::open(&config.sqlite_file())
}

/// Contacts of every device keyed by phone; the newest `added_at` wins
fn merged_contacts(state: &State) -> BTreeMap<&str, &Contact> {
    let mut merged: BTreeMap<&str, &Contact> = BTreeMap::new();
    for contact in state.contacts.values().flatten() {
        match merged.get(contact.phone.as_str()) {
            Some(existing) if existing.added_at > contact.added_at => {}
            _ => {
                merged.insert(contact.phone.as_str(), contact);
            }
        }
    }
    merged
}
