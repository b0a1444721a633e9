//! Dispatcher (client role).
//!
//! Opens a secure channel to one worker, sends a command batch and waits for
//! the matching result batch.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::codec::{self, CodecError};
use crate::command::{Command, CommandResult};
use crate::credentials::ClientCredentials;
use crate::transport::{ChannelError, SecureChannel};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no response from worker within {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

/// A connected dispatcher.
#[derive(Debug)]
pub struct Dispatcher {
    channel: SecureChannel<TcpStream>,
    response_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Connect to `host:port` and complete the handshake with the worker
    /// named in `credentials`.
    pub async fn connect(
        host: &str,
        port: u16,
        credentials: &ClientCredentials,
    ) -> Result<Self, DispatchError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| DispatchError::Connect {
                addr: format!("{host}:{port}"),
                source,
            })?;
        stream.set_nodelay(true).ok();

        let channel =
            SecureChannel::initiate(stream, &credentials.keypair, &credentials.worker_key).await?;
        info!(host, port, "Connected to worker");
        Ok(Self {
            channel,
            response_timeout: None,
        })
    }

    /// Stop waiting for results after `timeout`. `None` waits forever.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Encode and send one batch.
    pub async fn send(&mut self, batch: &[Command]) -> Result<(), DispatchError> {
        let payload = codec::encode(batch)?;
        debug!(commands = batch.len(), bytes = payload.len(), "Sending batch");
        self.channel.send(&payload).await?;
        Ok(())
    }

    /// Wait for the result batch answering the last [`send`](Self::send).
    ///
    /// After a [`DispatchError::Timeout`] the connection is unusable and
    /// every later call fails with [`ChannelError::Poisoned`].
    pub async fn receive(&mut self) -> Result<Vec<CommandResult>, DispatchError> {
        let payload = match self.response_timeout {
            None => self.channel.recv().await?,
            Some(limit) => tokio::time::timeout(limit, self.channel.recv())
                .await
                .map_err(|_| DispatchError::Timeout(limit))??,
        };
        let results: Vec<CommandResult> = codec::decode(&payload)?;
        debug!(results = results.len(), bytes = payload.len(), "Received results");
        Ok(results)
    }

    /// Send a batch and wait for its results.
    pub async fn dispatch(
        &mut self,
        batch: &[Command],
    ) -> Result<Vec<CommandResult>, DispatchError> {
        self.send(batch).await?;
        self.receive().await
    }

    /// Close the connection cleanly.
    pub async fn close(self) -> Result<(), DispatchError> {
        self.channel.close().await?;
        Ok(())
    }
}
