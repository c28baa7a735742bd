//! TCP listeners for the device and console ports

use crate::config::Config;
use crate::devices::Role;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::session::{self, SessionSettings};
use crate::store::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

/// Pause after a failed accept so a persistent error (fd exhaustion) does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Cloneable handle that asks a running [`Server`] to stop
#[derive(Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    /// Idempotent; safe to call from any thread
    pub fn stop(&self) {
        if !self.0.send_replace(true) {
            info!("Shutdown requested");
        }
    }
}

pub struct Server {
    device_addr: SocketAddr,
    console_addr: SocketAddr,
    stop: StopHandle,
    loops: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind both ports and start accepting. Fails without serving anything
    /// if either port cannot be bound.
    pub async fn start(config: &Config, store: Arc<Store>) -> Result<Self> {
        let device = bind(Role::Device, config.device_addr).await?;
        let console = bind(Role::Console, config.console_addr).await?;
        let device_addr = device.local_addr()?;
        let console_addr = console.local_addr()?;

        let (tx, rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(store, config.message_retention);
        let settings = SessionSettings {
            idle_timeout: config.idle_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        };
        let grace = config.shutdown_grace();

        let loops = vec![
            tokio::spawn(accept_loop(device, Role::Device, dispatcher.clone(), settings, rx.clone(), grace)),
            tokio::spawn(accept_loop(console, Role::Console, dispatcher, settings, rx, grace)),
        ];

        info!(%device_addr, %console_addr, "Relay host listening");

        Ok(Self {
            device_addr,
            console_addr,
            stop: StopHandle(Arc::new(tx)),
            loops,
        })
    }

    pub fn device_addr(&self) -> SocketAddr {
        self.device_addr
    }

    pub fn console_addr(&self) -> SocketAddr {
        self.console_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait until both accept loops and their sessions have finished
    pub async fn wait(self) {
        for handle in self.loops {
            if let Err(e) = handle.await {
                error!("Accept loop panicked: {}", e);
            }
        }
        info!("Relay host stopped");
    }

    /// Stop and wait
    pub async fn shutdown(self) {
        self.stop();
        self.wait().await;
    }
}

async fn bind(role: Role, addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind {
            role: role.as_str(),
            addr,
            source,
        })
}

async fn accept_loop(
    listener: TcpListener,
    role: Role,
    dispatcher: Dispatcher,
    settings: SessionSettings,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
) {
    let mut sessions = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, %role, "Connection accepted");
                    sessions.spawn(session::handle_connection(
                        stream,
                        peer,
                        role,
                        dispatcher.clone(),
                        settings,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!(%role, "Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },

            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    error!(%role, "Session task failed: {}", e);
                }
            }
        }
    }

    drop(listener);

    let drained = tokio::time::timeout(grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(%role, remaining = sessions.len(), "Aborting sessions after grace period");
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
}
