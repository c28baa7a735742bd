//! JSON file backend
//!
//! Devices and contacts are small and replaced atomically as whole files.
//! Messages grow without bound, so they go to an append-only journal: one
//! record per line, the last line for an id wins. The journal is rewritten
//! once dead lines outnumber live records.

use super::{Backend, Change, State};
use crate::config::Config;
use crate::contacts::Contact;
use crate::devices::Device;
use crate::error::{Error, Result};
use crate::messages::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Journal lines allowed beyond twice the live record count before compacting
const COMPACT_SLACK: usize = 1024;

pub struct JsonBackend {
    devices_path: PathBuf,
    contacts_path: PathBuf,
    messages_path: PathBuf,
    journal: Option<File>,
    journal_lines: usize,
}

impl JsonBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            devices_path: config.devices_file(),
            contacts_path: config.contacts_file(),
            messages_path: config.messages_file(),
            journal: None,
            journal_lines: 0,
        }
    }

    fn write_devices(&self, state: &State) -> Result<()> {
        write_atomic(&self.devices_path, &state.devices)
    }

    fn write_contacts(&self, state: &State) -> Result<()> {
        let by_device: BTreeMap<&str, BTreeMap<&str, &Contact>> = state
            .contacts
            .iter()
            .map(|(device_id, set)| {
                let by_phone = set.iter().map(|c| (c.phone.as_str(), c)).collect();
                (device_id.as_str(), by_phone)
            })
            .collect();
        write_atomic(&self.contacts_path, &by_device)
    }

    fn append_message(&mut self, message: &Message, state: &State) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut journal = match self.journal.take() {
            Some(file) => file,
            None => open_journal(&self.messages_path)?,
        };
        journal.write_all(&line)?;
        journal.sync_data()?;
        self.journal = Some(journal);
        self.journal_lines += 1;

        if self.journal_lines > 2 * state.messages.len() + COMPACT_SLACK {
            self.compact(&state.messages)?;
        }
        Ok(())
    }

    /// Rewrite the journal with one line per live record
    fn compact(&mut self, messages: &HashMap<String, Message>) -> Result<()> {
        self.journal = None;

        let mut ordered: Vec<&Message> = messages.values().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut bytes = Vec::new();
        for message in ordered {
            serde_json::to_writer(&mut bytes, message)?;
            bytes.push(b'\n');
        }
        write_bytes_atomic(&self.messages_path, &bytes)?;

        debug!(
            path = %self.messages_path.display(),
            dropped = self.journal_lines.saturating_sub(messages.len()),
            "Compacted message journal"
        );
        self.journal_lines = messages.len();
        Ok(())
    }

    /// Replay the journal. Unreadable lines (a torn final write) are skipped
    /// and the journal is rewritten clean.
    fn load_messages(&mut self) -> HashMap<String, Message> {
        let mut messages = HashMap::new();
        let file = match File::open(&self.messages_path) {
            Ok(file) => file,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.messages_path.display(), "Failed to read journal, starting empty: {}", e);
                }
                return messages;
            }
        };

        let mut lines = 0;
        let mut skipped = 0;
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(line = number + 1, "Stopped reading journal: {}", e);
                    skipped += 1;
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            lines += 1;
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => {
                    messages.insert(message.id.clone(), message);
                }
                Err(e) => {
                    warn!(line = number + 1, "Skipping unreadable journal line: {}", e);
                    skipped += 1;
                }
            }
        }
        self.journal_lines = lines;

        info!(path = %self.messages_path.display(), messages = messages.len(), "Loaded");

        if skipped > 0 || lines > 2 * messages.len() + COMPACT_SLACK {
            if let Err(e) = self.compact(&messages) {
                warn!("Could not compact message journal: {}", e);
            }
        }
        messages
    }
}

impl Backend for JsonBackend {
    fn name(&self) -> &'static str {
        "json"
    }

    fn load(&mut self) -> Result<State> {
        let devices: BTreeMap<String, Device> = read_or_empty(&self.devices_path);
        let contacts: BTreeMap<String, BTreeMap<String, Contact>> =
            read_or_empty(&self.contacts_path);
        let messages = self.load_messages();

        Ok(State {
            devices,
            contacts: contacts
                .into_iter()
                .map(|(device_id, by_phone)| (device_id, by_phone.into_values().collect()))
                .collect(),
            messages,
        })
    }

    fn persist(&mut self, change: Change<'_>, state: &State) -> Result<()> {
        match change {
            Change::Device(_) | Change::AllDevices => self.write_devices(state),
            Change::Contacts(_) | Change::ContactActivity { .. } => self.write_contacts(state),
            Change::Message(id) => match state.messages.get(id) {
                Some(message) => self.append_message(message, state),
                None => Ok(()),
            },
        }
    }
}

fn open_journal(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Read a collection file. Missing means empty; unparsable is moved aside
/// and treated as empty.
fn read_or_empty<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        debug!(path = %path.display(), "No existing file");
        return T::default();
    }

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), "Failed to read, starting empty: {}", e);
            return T::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => {
            info!(path = %path.display(), "Loaded");
            value
        }
        Err(e) => {
            let aside = path.with_extension("json.corrupt");
            warn!(
                path = %path.display(),
                moved_to = %aside.display(),
                "Unparsable file, starting empty: {}",
                e
            );
            if let Err(e) = fs::rename(path, &aside) {
                warn!("Could not move corrupt file aside: {}", e);
            }
            T::default()
        }
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_bytes_atomic(path, json.as_bytes())
}

/// Write to a temp file in the same directory, then rename over the target
fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
