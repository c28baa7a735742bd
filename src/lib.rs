//! Relay Host - TCP hub between SMS-capable phones and desktop consoles
//!
//! Phones connect on the device port, identify themselves, push their
//! address books and report SMS delivery status. Consoles connect on the
//! console port to read contacts, queue outgoing messages and watch status.
//! All state lives in one [`store::Store`] shared by every connection.

pub mod config;
pub mod contacts;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod listener;
pub mod messages;
pub mod protocol;
pub mod session;
pub mod store;
pub mod tracker;

pub use error::{Error, Result};
