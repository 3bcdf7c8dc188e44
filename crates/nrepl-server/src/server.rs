// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! TCP listener and server lifecycle

use crate::connection::handle_connection;
use crate::error::{NReplError, Result};
use crate::eval::{Evaluator, Introspector};
use crate::ops::Dispatcher;
use crate::session::SessionStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1667;

/// Back-off after a failed accept so a persistent error does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Listener address; port 0 asks the OS for an ephemeral port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An nREPL server that has not started listening yet
pub struct NReplServer {
    dispatcher: Arc<Dispatcher>,
}

impl NReplServer {
    /// Server backed by one engine that both evaluates and introspects
    pub fn new<E>(engine: Arc<E>) -> Self
    where
        E: Evaluator + Introspector + 'static,
    {
        Self::with_collaborators(engine.clone(), engine)
    }

    pub fn with_collaborators(
        evaluator: Arc<dyn Evaluator>,
        introspector: Arc<dyn Introspector>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(
                Arc::new(SessionStore::new()),
                evaluator,
                introspector,
            )),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        self.dispatcher.sessions()
    }

    /// Bind the listener and start accepting in a background task
    pub async fn bind(self, config: &ServerConfig) -> Result<ServerHandle> {
        let listener = TcpListener::bind(config.address()).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "nREPL server listening");

        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(accept_loop(
            listener,
            self.dispatcher,
            Arc::clone(&running),
            Arc::clone(&shutdown),
        ));

        Ok(ServerHandle {
            local_addr,
            running,
            shutdown,
            task,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "client connected");
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(peer = %peer, "could not set TCP_NODELAY: {}", err);
                    }

                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        match handle_connection(stream, dispatcher).await {
                            Ok(()) => info!(peer = %peer, "client disconnected"),
                            Err(err) => warn!(peer = %peer, "client connection ended: {}", err),
                        }
                    });
                }
                Err(err) => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("accept failed: {}", err);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }

    drop(listener);
    info!("nREPL server stopped");
}

/// Handle to a running server
///
/// Connections accepted before [`ServerHandle::stop`] keep being served
/// until their clients disconnect.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections; calling it again is a no-op
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!(addr = %self.local_addr, "stopping nREPL server");
            self.shutdown.notify_one();
        }
    }

    /// Wait for the accept loop to exit
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|err| NReplError::Connection(std::io::Error::other(err)))
    }
}
