//! One TCP connection, from accept to close
//!
//! Bytes are framed into JSON values, each value is dispatched in arrival
//! order and its response written back before the next value is read. A
//! framing error ends the connection; a bad request does not.

use crate::devices::Role;
use crate::dispatch::{Dispatcher, SessionContext};
use crate::framing::JsonFramer;
use crate::protocol::Response;
use crate::Result;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8192;

/// Per-connection limits, taken from the config
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Close {
    PeerClosed,
    BadFrame,
    Shutdown,
}

/// Serve a connection until the peer leaves, the stream breaks or the host
/// shuts down. A device bound by `identify` is marked offline afterwards.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    role: Role,
    dispatcher: Dispatcher,
    settings: SessionSettings,
    shutdown: watch::Receiver<bool>,
) {
    let mut ctx = SessionContext::new(role, peer);

    match serve(stream, &mut ctx, &dispatcher, settings, shutdown).await {
        Ok(Close::PeerClosed) => info!(%peer, %role, "Connection closed by peer"),
        Ok(Close::BadFrame) => info!(%peer, %role, "Connection closed after framing error"),
        Ok(Close::Shutdown) => debug!(%peer, %role, "Connection closed for shutdown"),
        Err(e) => warn!(%peer, %role, "Connection failed: {}", e),
    }

    if let Some(device_id) = ctx.device_id().map(str::to_string) {
        let store = dispatcher.store().clone();
        let id = device_id.clone();
        match tokio::task::spawn_blocking(move || store.mark_offline(&id, peer)).await {
            Ok(true) => info!(%peer, %device_id, "Device offline"),
            Ok(false) => debug!(%peer, %device_id, "Device already taken over by another connection"),
            Err(e) => warn!(%peer, %device_id, "Could not mark device offline: {}", e),
        }
    }
}

async fn serve(
    stream: TcpStream,
    ctx: &mut SessionContext,
    dispatcher: &Dispatcher,
    settings: SessionSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Close> {
    let (mut reader, mut writer) = stream.into_split();
    let mut framer = JsonFramer::new(settings.max_frame_bytes);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        if *shutdown.borrow() {
            return Ok(Close::Shutdown);
        }

        let read = tokio::select! {
            _ = shutdown.changed() => return Ok(Close::Shutdown),
            read = timeout(settings.idle_timeout, reader.read(&mut chunk)) => read,
        };

        let n = match read {
            Err(_) => {
                debug!(peer = %ctx.peer, buffered = framer.buffered(), "Connection idle");
                continue;
            }
            Ok(Ok(0)) => return Ok(Close::PeerClosed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
        };
        framer.push(&chunk[..n]);

        loop {
            match framer.next_value() {
                Ok(Some(value)) => {
                    let response = dispatch_blocking(dispatcher, ctx, value).await?;
                    write_response(&mut writer, &response).await?;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %ctx.peer, "Dropping connection: {}", e);
                    // Best effort, the peer may already be gone
                    let _ = write_response(&mut writer, &Response::error(e.to_string())).await;
                    let _ = writer.shutdown().await;
                    return Ok(Close::BadFrame);
                }
            }
        }
    }
}

/// Store calls can hit the disk while holding the store lock, so they run on
/// the blocking pool rather than a runtime worker
async fn dispatch_blocking(
    dispatcher: &Dispatcher,
    ctx: &mut SessionContext,
    value: Value,
) -> Result<Response> {
    let dispatcher = dispatcher.clone();
    let mut owned = ctx.clone();
    let (owned, response) = tokio::task::spawn_blocking(move || {
        let response = dispatcher.handle_value(&mut owned, value);
        (owned, response)
    })
    .await?;
    *ctx = owned;
    Ok(response)
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let bytes = response.to_bytes()?;
    writer.write_all(&bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceStatus;
    use crate::store::{Backend, Change, State, Store};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    struct Harness {
        client: BufReader<TcpStream>,
        store: Arc<Store>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn connect(idle: Duration) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();

        let store = Arc::new(Store::in_memory());
        let dispatcher = Dispatcher::new(store.clone(), 100);
        let (shutdown, rx) = watch::channel(false);
        let settings = SessionSettings {
            idle_timeout: idle,
            max_frame_bytes: 4096,
        };
        let task = tokio::spawn(handle_connection(server, peer, Role::Device, dispatcher, settings, rx));

        Harness {
            client: BufReader::new(client),
            store,
            shutdown,
            task,
        }
    }

    async fn reply(client: &mut BufReader<TcpStream>) -> serde_json::Value {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Backend that takes a long time to make anything durable
    struct SlowBackend;

    impl Backend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn load(&mut self) -> Result<State> {
            Ok(State::default())
        }

        fn persist(&mut self, _change: Change<'_>, _state: &State) -> Result<()> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        }
    }

    async fn open_session(listener: &TcpListener, dispatcher: &Dispatcher) -> BufReader<TcpStream> {
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (shutdown, rx) = watch::channel(false);
        let settings = SessionSettings {
            idle_timeout: Duration::from_secs(5),
            max_frame_bytes: 4096,
        };
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            handle_connection(server, peer, Role::Device, dispatcher, settings, rx).await;
            drop(shutdown);
        });
        BufReader::new(client)
    }

    #[tokio::test]
    async fn test_slow_store_does_not_stall_other_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dispatcher = Dispatcher::new(Arc::new(Store::with_backend(Box::new(SlowBackend))), 100);
        let mut slow = open_session(&listener, &dispatcher).await;
        let mut fast = open_session(&listener, &dispatcher).await;

        slow.get_mut()
            .write_all(br#"{"type":"send_message","id":"m1","to":"+4670","text":"x"}"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        fast.get_mut().write_all(br#"{"type":"ping"}"#).await.unwrap();
        assert_eq!(reply(&mut fast).await["type"], "pong");
        assert!(started.elapsed() < Duration::from_millis(300));

        assert_eq!(reply(&mut slow).await["status"], "queued");
    }

    #[tokio::test]
    async fn test_request_reply() {
        let mut h = connect(Duration::from_secs(5)).await;
        h.client.get_mut().write_all(br#"{"type":"ping"}"#).await.unwrap();
        assert_eq!(reply(&mut h.client).await["type"], "pong");
    }

    #[tokio::test]
    async fn test_idle_timeout_keeps_connection() {
        let mut h = connect(Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.client.get_mut().write_all(br#"{"type":"ping"}"#).await.unwrap();
        assert_eq!(reply(&mut h.client).await["type"], "pong");
    }

    #[tokio::test]
    async fn test_bad_frame_closes() {
        let mut h = connect(Duration::from_secs(5)).await;
        h.client.get_mut().write_all(b"{\"type\": nope}").await.unwrap();

        assert_eq!(reply(&mut h.client).await["type"], "error");
        let mut rest = String::new();
        let n = h.client.read_line(&mut rest).await.unwrap_or(0);
        assert_eq!(n, 0);
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_marks_offline() {
        let mut h = connect(Duration::from_secs(5)).await;
        h.client
            .get_mut()
            .write_all(br#"{"type":"identify","device":"ZFold6"}"#)
            .await
            .unwrap();
        reply(&mut h.client).await;
        assert_eq!(h.store.device("zfold6").unwrap().status, DeviceStatus::Online);

        drop(h.client);
        h.task.await.unwrap();
        assert_eq!(h.store.device("zfold6").unwrap().status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let h = connect(Duration::from_secs(5)).await;
        h.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("session did not stop")
            .unwrap();
    }
}
