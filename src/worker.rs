//! Worker (server role).
//!
//! Listens for dispatchers, authenticates them, and answers each request in
//! turn: decode the command batch, run every recognized command in order,
//! send back the result batch. One connection is served at a time and a
//! request is fully answered before the next one is read. A connection that
//! goes quiet between requests is closed after the idle timeout.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::backend::ShellBackend;
use crate::codec::{self, CodecError};
use crate::command::{Command, CommandResult, Executor};
use crate::credentials::{Keypair, WorkerCredentials};
use crate::transport::{ChannelError, CommandRecord, PeerPolicy, SecureChannel};

/// How long a new connection may take to complete the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an authenticated connection may sit between requests.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("undecodable request: {0}")]
    Decode(#[source] CodecError),

    #[error("could not encode results: {0}")]
    Encode(#[source] CodecError),

    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// A bound worker.
pub struct Worker<B> {
    listener: TcpListener,
    keypair: Keypair,
    peers: PeerPolicy,
    executor: Executor<B>,
    idle_timeout: Duration,
}

impl<B> std::fmt::Debug for Worker<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("listener", &self.listener)
            .field("public_key", &self.keypair.public)
            .field("peers", &self.peers)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl<B: ShellBackend> Worker<B> {
    /// Bind the listening socket. Failure here is fatal for the process.
    pub async fn bind(
        addr: SocketAddr,
        credentials: WorkerCredentials,
        allowed_addresses: Vec<IpAddr>,
        executor: Executor<B>,
    ) -> Result<Self, WorkerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| WorkerError::Bind { addr, source })?;

        info!(
            addr = %listener.local_addr().unwrap_or(addr),
            public_key = %credentials.keypair.public,
            authorized_keys = credentials.authorized_keys.len(),
            "Worker listening"
        );

        Ok(Self {
            listener,
            keypair: credentials.keypair,
            peers: PeerPolicy::new(allowed_addresses, credentials.authorized_keys),
            executor,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    /// Close connections that send nothing for `timeout` between requests.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections until `shutdown` resolves.
    pub async fn serve_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            () = self.serve() => {}
            () = shutdown => info!("Shutdown requested, worker stopping"),
        }
    }

    /// Serve connections forever, one at a time.
    pub async fn serve(&self) {
        loop {
            let (stream, peer) = accept_with_backoff(|| self.listener.accept()).await;
            stream.set_nodelay(true).ok();

            info!(%peer, "Connection opened");
            match self.handle_connection(stream, peer.ip()).await {
                Ok(()) => info!(%peer, "Connection closed"),
                Err(e) => warn!(%peer, error = %e, "Connection dropped"),
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: IpAddr,
    ) -> Result<(), ConnectionError> {
        let mut channel = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            SecureChannel::accept(stream, peer, &self.keypair, &self.peers),
        )
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)??;

        loop {
            let request = match tokio::time::timeout(self.idle_timeout, channel.recv()).await {
                Ok(Ok(request)) => request,
                Ok(Err(ChannelError::Closed)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    info!(%peer, idle = ?self.idle_timeout, "Closing idle connection");
                    return Ok(());
                }
            };
            let response = self.handle_request(&request).await?;
            channel.send(&response).await?;
        }
    }

    async fn handle_request(&self, request: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let records: Vec<CommandRecord> =
            codec::decode(request).map_err(ConnectionError::Decode)?;
        debug!(records = records.len(), bytes = request.len(), "Received batch");

        let results = self.execute_batch(records).await;
        codec::encode(&results).map_err(ConnectionError::Encode)
    }

    /// Run every recognized record in order. Records that are not a known
    /// command are logged and skipped, so the result batch may be shorter.
    pub async fn execute_batch(&self, records: Vec<CommandRecord>) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let command = match Command::try_from(record) {
                Ok(command) => command,
                Err(e) => {
                    warn!(error = %e, "Skipping command the worker cannot handle");
                    continue;
                }
            };

            info!(command = %command.label(), "Running command");
            let result = self.executor.run(&command).await;
            if result.success {
                info!(command = %result.command, "Command succeeded");
            } else {
                error!(
                    command = %result.command,
                    reason = %result.result.trim_end(),
                    "Command failed"
                );
            }
            results.push(result);
        }
        results
    }
}

/// Resolve when `signal` fires. A signal that cannot be listened for is
/// logged and never fires, so the worker keeps serving until killed.
pub async fn shutdown_on<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!(error = %e, "Cannot listen for shutdown signal, serving until killed");
        std::future::pending::<()>().await;
    }
}

/// Accept the next connection, pausing after each failure.
async fn accept_with_backoff<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
