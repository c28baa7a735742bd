//! Delivery tracker - lifecycle rules for message records
//!
//! Statuses only move forward along `pending -> sent -> delivered` and
//! `pending -> failed`. The one way back is an explicit resend of a failed
//! message, which bumps `retry_count`.

use crate::messages::{Message, MessageStatus};
use chrono::{DateTime, Utc};

/// Result of asking the tracker to move a message to a new status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Applied { from: MessageStatus, to: MessageStatus },
    /// Already in the requested status
    Unchanged,
    /// Would move backwards or sideways
    Rejected { from: MessageStatus, to: MessageStatus },
    UnknownId,
}

impl Advance {
    pub fn applied(&self) -> bool {
        matches!(self, Advance::Applied { .. })
    }
}

/// Result of a `send_message` for an id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resend {
    /// Fresh id, new pending record
    Created,
    /// Was failed; back to pending with the retry counted
    Requeued { retry_count: u32 },
    /// Already pending, sent or delivered; nothing changes
    Duplicate(MessageStatus),
}

impl Resend {
    pub fn ack_status(&self) -> &'static str {
        match self {
            Resend::Created => "queued",
            Resend::Requeued { .. } => "requeued",
            Resend::Duplicate(_) => "duplicate",
        }
    }
}

/// Whether `from -> to` is a forward edge of the status order
pub fn can_advance(from: MessageStatus, to: MessageStatus) -> bool {
    use MessageStatus::*;
    matches!(
        (from, to),
        (Pending, Sent) | (Pending, Failed) | (Pending, Delivered) | (Sent, Delivered)
    )
}

/// Apply a status report to a record
pub fn advance(message: &mut Message, to: MessageStatus, now: DateTime<Utc>) -> Advance {
    let from = message.status;
    if from == to {
        return Advance::Unchanged;
    }
    if !can_advance(from, to) {
        return Advance::Rejected { from, to };
    }
    message.status = to;
    message.updated_at = Some(now);
    Advance::Applied { from, to }
}

/// Handle a `send_message` that reuses an existing id
pub fn resend(message: &mut Message, now: DateTime<Utc>) -> Resend {
    match message.status {
        MessageStatus::Failed => {
            message.retry_count = message.retry_count.saturating_add(1);
            message.status = MessageStatus::Pending;
            message.updated_at = Some(now);
            Resend::Requeued {
                retry_count: message.retry_count,
            }
        }
        status => Resend::Duplicate(status),
    }
}
