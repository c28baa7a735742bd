//! Request dispatch - maps one decoded request to store calls and a response
//!
//! No socket I/O happens here. The only per-connection state is the device
//! id bound by `identify`, carried in [`SessionContext`].

use crate::devices::{anonymous_device_id, device_id_for_name, Role};
use crate::error::Error;
use crate::messages::Message;
use crate::protocol::{self, Request, Response};
use crate::store::Store;
use crate::tracker::Advance;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the dispatcher knows about the connection a request came from
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub role: Role,
    pub peer: SocketAddr,
    device_id: Option<String>,
}

impl SessionContext {
    pub fn new(role: Role, peer: SocketAddr) -> Self {
        Self {
            role,
            peer,
            device_id: None,
        }
    }

    /// Device bound by `identify`, if any
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Id recorded as the owner/sender of whatever this connection writes
    pub fn sender_id(&self) -> String {
        match &self.device_id {
            Some(id) => id.clone(),
            None => anonymous_device_id(self.role, self.peer),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<Store>,
    retention: usize,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>, retention: usize) -> Self {
        Self { store, retention }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Decode a framed value and dispatch it. Decoding problems become an
    /// error response.
    pub fn handle_value(&self, ctx: &mut SessionContext, value: Value) -> Response {
        match protocol::decode(value) {
            Ok(request) => self.dispatch(ctx, request),
            Err(e) => {
                warn!(peer = %ctx.peer, role = %ctx.role, "Rejected request: {}", e);
                e.into()
            }
        }
    }

    pub fn dispatch(&self, ctx: &mut SessionContext, request: Request) -> Response {
        debug!(peer = %ctx.peer, kind = request.kind(), "Dispatching");

        if ctx.role == Role::Console && !console_allowed(&request) {
            warn!(peer = %ctx.peer, kind = request.kind(), "Device-only request on console port");
            return Response::error(format!("{} is not accepted on the console port", request.kind()));
        }

        match request {
            Request::Identify { device, device_id } => self.identify(ctx, &device, device_id),

            Request::Ping => {
                if let Some(device_id) = ctx.device_id() {
                    self.store.touch(device_id);
                }
                Response::Pong
            }

            Request::GetContacts => Response::Contacts {
                data: self.store.contacts(),
            },

            Request::SyncContacts { contacts } => {
                let owner = ctx.sender_id();
                match self.store.sync_contacts(&owner, &contacts) {
                    Ok(count) => Response::Ack {
                        status: "synced",
                        id: None,
                        device_id: Some(owner),
                        count: Some(count),
                    },
                    Err(e) => request_failed("sync_contacts", e),
                }
            }

            Request::SendMessage { id, to, text } => {
                if id.trim().is_empty() {
                    return Response::error("malformed send_message request: empty id");
                }
                match self.store.send_message(&id, &ctx.sender_id(), &to, &text) {
                    Ok(outcome) => Response::ack_id(outcome.ack_status(), &id),
                    Err(e) => request_failed("send_message", e),
                }
            }

            Request::SmsStatus { id, status } => {
                match self.store.advance_status(&id, status) {
                    Advance::Applied { from, to } => {
                        info!(msg_id = %id, %from, %to, "Message status updated");
                    }
                    Advance::Unchanged => {
                        debug!(msg_id = %id, %status, "Status report repeats current status");
                    }
                    Advance::Rejected { from, to } => {
                        warn!(msg_id = %id, %from, %to, "Ignoring backwards status transition");
                    }
                    Advance::UnknownId => {
                        warn!(msg_id = %id, %status, "Status report for unknown message");
                    }
                }
                Response::ack_id("received", &id)
            }

            Request::GetStatus => {
                let summary = self.store.summary();
                Response::Status {
                    devices_connected: summary.devices_connected,
                    contacts_count: summary.contacts_count,
                    messages_count: summary.messages_count,
                    devices: summary.devices,
                    timestamp: Utc::now().to_rfc3339(),
                }
            }

            Request::GetMessages => Response::Messages {
                data: keyed_by_id(self.store.recent_messages(self.retention)),
            },

            Request::GetPending => Response::Pending {
                data: keyed_by_id(self.store.pending_messages(self.retention)),
            },
        }
    }

    fn identify(&self, ctx: &mut SessionContext, name: &str, device_id: Option<String>) -> Response {
        let device_id = device_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| device_id_for_name(name));
        if device_id.is_empty() {
            return Response::error("malformed identify request: empty device name");
        }

        if let Some(previous) = ctx.device_id.take() {
            if previous != device_id {
                self.store.mark_offline(&previous, ctx.peer);
            }
        }

        let display_name = if name.trim().is_empty() { &device_id } else { name.trim() };
        self.store.identify(&device_id, display_name, ctx.peer);
        info!(peer = %ctx.peer, %device_id, name = display_name, "Device identified");

        ctx.device_id = Some(device_id.clone());
        Response::Ack {
            status: "identified",
            id: None,
            device_id: Some(device_id),
            count: None,
        }
    }
}

/// The console reads state and queues messages; everything else is the
/// phones' side of the protocol
fn console_allowed(request: &Request) -> bool {
    !matches!(
        request,
        Request::Identify { .. }
            | Request::SyncContacts { .. }
            | Request::SmsStatus { .. }
            | Request::GetPending
    )
}

fn keyed_by_id(messages: Vec<Message>) -> BTreeMap<String, Message> {
    messages.into_iter().map(|m| (m.id.clone(), m)).collect()
}

fn request_failed(kind: &str, err: Error) -> Response {
    match err {
        Error::InvalidContact(reason) => {
            warn!(kind, "Rejected request: {}", reason);
            Response::error(format!("malformed {} request: {}", kind, reason))
        }
        other => {
            warn!(kind, "Request failed: {}", other);
            Response::error(format!("{} failed: {}", kind, other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceStatus;
    use crate::messages::MessageStatus;
    use serde_json::json;

    fn setup() -> (Dispatcher, SessionContext) {
        let store = Arc::new(Store::in_memory());
        let ctx = SessionContext::new(Role::Device, "127.0.0.1:40000".parse().unwrap());
        (Dispatcher::new(store, 100), ctx)
    }

    fn send(d: &Dispatcher, ctx: &mut SessionContext, value: Value) -> Value {
        serde_json::to_value(d.handle_value(ctx, value)).unwrap()
    }

    #[test]
    fn test_identify_binds_device() {
        let (d, mut ctx) = setup();
        let resp = send(&d, &mut ctx, json!({"type": "identify", "device": "ZFold6"}));

        assert_eq!(resp, json!({"type": "ack", "status": "identified", "device_id": "zfold6"}));
        assert_eq!(ctx.device_id(), Some("zfold6"));
        let device = d.store().device("zfold6").unwrap();
        assert_eq!(device.display_name, "ZFold6");
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[test]
    fn test_reidentify_as_other_device_releases_old() {
        let (d, mut ctx) = setup();
        send(&d, &mut ctx, json!({"type": "identify", "device": "A"}));
        send(&d, &mut ctx, json!({"type": "identify", "device": "B"}));

        assert_eq!(d.store().device("a").unwrap().status, DeviceStatus::Offline);
        assert_eq!(d.store().device("b").unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn test_identify_empty_name_rejected() {
        let (d, mut ctx) = setup();
        let resp = send(&d, &mut ctx, json!({"type": "identify", "device": "  "}));
        assert_eq!(resp["type"], "error");
        assert!(ctx.device_id().is_none());
    }

    #[test]
    fn test_anonymous_sender_id() {
        let (d, mut ctx) = setup();
        send(&d, &mut ctx, json!({"type": "send_message", "id": "m1", "to": "+46700000000", "text": "hi"}));
        let msg = d.store().message("m1").unwrap();
        assert_eq!(msg.from_device, "device@127.0.0.1:40000");
    }

    #[test]
    fn test_send_message_ack_statuses() {
        let (d, mut ctx) = setup();
        let req = json!({"type": "send_message", "id": "m1", "to": "+46700000000", "text": "hi"});

        assert_eq!(send(&d, &mut ctx, req.clone())["status"], "queued");
        assert_eq!(send(&d, &mut ctx, req.clone())["status"], "duplicate");

        send(&d, &mut ctx, json!({"type": "sms_status", "id": "m1", "status": "failed"}));
        let resp = send(&d, &mut ctx, req);
        assert_eq!(resp["status"], "requeued");
        assert_eq!(resp["id"], "m1");
        assert_eq!(d.store().message("m1").unwrap().retry_count, 1);
    }

    #[test]
    fn test_send_message_bad_number() {
        let (d, mut ctx) = setup();
        let resp = send(&d, &mut ctx, json!({"type": "send_message", "id": "m1", "to": "mom", "text": "hi"}));
        assert_eq!(resp["type"], "error");
        assert!(resp["message"].as_str().unwrap().contains("send_message"));
    }

    #[test]
    fn test_send_message_empty_id() {
        let (d, mut ctx) = setup();
        let resp = send(&d, &mut ctx, json!({"type": "send_message", "id": " ", "to": "+4670", "text": "hi"}));
        assert_eq!(resp["type"], "error");
    }

    #[test]
    fn test_sms_status_flow() {
        let (d, mut ctx) = setup();
        send(&d, &mut ctx, json!({"type": "send_message", "id": "m1", "to": "+46700000000", "text": "hi"}));
        let resp = send(&d, &mut ctx, json!({"type": "sms_status", "id": "m1", "status": "delivered"}));
        assert_eq!(resp, json!({"type": "ack", "status": "received", "id": "m1"}));

        // Backwards report is acked but changes nothing
        send(&d, &mut ctx, json!({"type": "sms_status", "id": "m1", "status": "pending"}));
        let msg = d.store().message("m1").unwrap();
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(msg.retry_count, 0);
    }

    #[test]
    fn test_sms_status_unknown_id_still_acked() {
        let (d, mut ctx) = setup();
        let resp = send(&d, &mut ctx, json!({"type": "sms_status", "id": "ghost", "status": "sent"}));
        assert_eq!(resp["type"], "ack");
    }

    #[test]
    fn test_sync_and_get_contacts() {
        let (d, mut ctx) = setup();
        send(&d, &mut ctx, json!({"type": "identify", "device": "ZFold6"}));
        let resp = send(
            &d,
            &mut ctx,
            json!({"type": "sync_contacts", "contacts": [{"name": "Alice", "phone": "+46701234567"}]}),
        );
        assert_eq!(resp["status"], "synced");
        assert_eq!(resp["count"], 1);

        let resp = send(&d, &mut ctx, json!({"type": "get_contacts"}));
        assert_eq!(resp["type"], "contacts");
        assert_eq!(resp["data"]["+46701234567"]["name"], "Alice");
        assert_eq!(resp["data"]["+46701234567"]["device_id"], "zfold6");
    }

    #[test]
    fn test_sync_contacts_bad_entry() {
        let (d, mut ctx) = setup();
        let resp = send(
            &d,
            &mut ctx,
            json!({"type": "sync_contacts", "contacts": [{"name": "X", "phone": "nope"}]}),
        );
        assert_eq!(resp["type"], "error");
    }

    #[test]
    fn test_get_status_counts() {
        let (d, mut ctx) = setup();
        send(&d, &mut ctx, json!({"type": "identify", "device": "ZFold6"}));
        send(&d, &mut ctx, json!({"type": "send_message", "id": "m1", "to": "+46700000000", "text": "hi"}));

        let resp = send(&d, &mut ctx, json!({"type": "get_status"}));
        assert_eq!(resp["type"], "status");
        assert_eq!(resp["devices_connected"], 1);
        assert_eq!(resp["contacts_count"], 0);
        assert_eq!(resp["messages_count"], 1);
        assert!(resp["timestamp"].is_string());
    }

    #[test]
    fn test_get_messages_respects_retention() {
        let store = Arc::new(Store::in_memory());
        let d = Dispatcher::new(store, 2);
        let mut ctx = SessionContext::new(Role::Console, "127.0.0.1:1".parse().unwrap());
        for i in 0..4 {
            send(&d, &mut ctx, json!({"type": "send_message", "id": format!("m{}", i), "to": "+4670", "text": ""}));
        }

        let resp = send(&d, &mut ctx, json!({"type": "get_messages"}));
        let data = resp["data"].as_object().unwrap();
        assert_eq!(data.len(), 2);
        assert!(data.contains_key("m3"));
    }

    #[test]
    fn test_console_cannot_change_device_state() {
        let store = Arc::new(Store::in_memory());
        let d = Dispatcher::new(store.clone(), 100);
        let mut console = SessionContext::new(Role::Console, "127.0.0.1:2".parse().unwrap());
        send(&d, &mut console, json!({"type": "send_message", "id": "m1", "to": "+4670", "text": ""}));

        let rejected = [
            json!({"type": "sms_status", "id": "m1", "status": "failed"}),
            json!({"type": "sync_contacts", "contacts": [{"name": "A", "phone": "+4670"}]}),
            json!({"type": "identify", "device": "Console"}),
            json!({"type": "get_pending"}),
        ];
        for request in rejected {
            let resp = send(&d, &mut console, request);
            assert_eq!(resp["type"], "error");
            assert!(resp["message"].as_str().unwrap().contains("console port"));
        }

        assert_eq!(store.message("m1").unwrap().status, MessageStatus::Pending);
        let summary = store.summary();
        assert_eq!(summary.contacts_count, 0);
        assert_eq!(summary.devices_connected, 0);
        assert!(console.device_id().is_none());
    }

    #[test]
    fn test_get_pending() {
        let (d, mut ctx) = setup();
        send(&d, &mut ctx, json!({"type": "send_message", "id": "a", "to": "+4670", "text": ""}));
        send(&d, &mut ctx, json!({"type": "send_message", "id": "b", "to": "+4670", "text": ""}));
        send(&d, &mut ctx, json!({"type": "sms_status", "id": "a", "status": "sent"}));

        let resp = send(&d, &mut ctx, json!({"type": "get_pending"}));
        assert_eq!(resp["type"], "pending");
        let data = resp["data"].as_object().unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key("b"));
    }

    #[test]
    fn test_unknown_type_names_it() {
        let (d, mut ctx) = setup();
        let resp = send(&d, &mut ctx, json!({"type": "frobnicate"}));
        assert_eq!(resp["type"], "error");
        assert!(resp["message"].as_str().unwrap().contains("frobnicate"));
    }

    #[test]
    fn test_ping_refreshes_identified_device() {
        let (d, mut ctx) = setup();
        assert_eq!(send(&d, &mut ctx, json!({"type": "ping"})), json!({"type": "pong"}));

        send(&d, &mut ctx, json!({"type": "identify", "device": "ZFold6"}));
        let before = d.store().device("zfold6").unwrap().last_seen;
        std::thread::sleep(std::time::Duration::from_millis(5));
        send(&d, &mut ctx, json!({"type": "ping"}));
        assert!(d.store().device("zfold6").unwrap().last_seen > before);
    }
}
