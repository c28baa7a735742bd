//! Contact records - per-device address books synced from phones

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A stored contact, owned by the device that synced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub device_id: String,
    pub phone: String,
    pub name: String,
    pub added_at: DateTime<Utc>,
    pub last_contact_at: Option<DateTime<Utc>>,
}

/// One entry of a `sync_contacts` request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContactEntry {
    #[serde(default)]
    pub name: String,
    pub phone: String,
}

/// Normalized numbers: optional leading '+', then digits only
static VALID_PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{2,20}$").expect("Invalid phone regex"));

/// Normalize a phone number for use as a contact key.
///
/// Formatting characters are dropped and a `00` international prefix becomes
/// `+`. Returns `None` when what is left is not a plausible number.
pub fn normalize_phone(phone: &str) -> Option<String> {
    let trimmed = phone.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    // Anything other than digits and separators means this isn't a number
    let junk = trimmed
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .any(|c| !matches!(c, '+' | ' ' | '-' | '.' | '(' | ')' | '/'));
    if junk || trimmed.chars().skip(1).any(|c| c == '+') {
        return None;
    }

    let normalized = if has_plus {
        format!("+{}", digits)
    } else if let Some(rest) = digits.strip_prefix("00") {
        format!("+{}", rest)
    } else {
        digits
    };

    VALID_PHONE.is_match(&normalized).then_some(normalized)
}

/// Validate and dedupe a synced list into the device's new contact set.
///
/// The whole list is rejected if any entry has an unusable phone, so a bad
/// sync never replaces the old set with a partial one. Later duplicates win.
/// `previous` carries `added_at`/`last_contact_at` over for numbers that stay.
pub fn build_contact_set(
    device_id: &str,
    entries: &[ContactEntry],
    previous: &[Contact],
    now: DateTime<Utc>,
) -> Result<Vec<Contact>> {
    let kept: HashMap<&str, &Contact> = previous.iter().map(|c| (c.phone.as_str(), c)).collect();
    let mut by_phone: BTreeMap<String, Contact> = BTreeMap::new();

    for (index, entry) in entries.iter().enumerate() {
        let phone = normalize_phone(&entry.phone).ok_or_else(|| {
            Error::InvalidContact(format!("entry {}: bad phone {:?}", index, entry.phone))
        })?;
        let name = if entry.name.trim().is_empty() {
            phone.clone()
        } else {
            entry.name.trim().to_string()
        };

        let (added_at, last_contact_at) = match kept.get(phone.as_str()) {
            Some(old) => (old.added_at, old.last_contact_at),
            None => (now, None),
        };

        by_phone.insert(
            phone.clone(),
            Contact {
                device_id: device_id.to_string(),
                phone,
                name,
                added_at,
                last_contact_at,
            },
        );
    }

    Ok(by_phone.into_values().collect())
}
