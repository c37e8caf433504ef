use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::core::TxRecord;
use crate::rpc::RpcError;
use crate::shutdown::Shutdown;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("ZMQ error: {0}")]
    Zmq(#[from] zmq::Error),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("no data received for {0:?}")]
    Idle(Duration),
    #[error("stream ended unexpectedly")]
    EndOfStream,
}

/// Something that can open a subscription to confirmed transactions.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;

    /// Connect and complete the handshake.
    async fn connect(&self) -> Result<Box<dyn TransactionStream>, SourceError>;
}

/// One open subscription.
#[async_trait]
pub trait TransactionStream: Send {
    /// `Ok(None)` means the upstream closed the stream.
    async fn next(&mut self) -> Result<Option<TxRecord>, SourceError>;

    async fn close(&mut self);
}

/// Receives each transaction in arrival order.
#[async_trait]
pub trait TxConsumer: Send + Sync {
    async fn consume(&self, tx: TxRecord);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Streaming,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Fixed delay between a failure and the next connect attempt.
    pub reconnect_delay: Duration,
    /// Treat a subscription that stays silent this long as failed.
    pub idle_timeout: Option<Duration>,
}

/// The single live subscription. Replaced, never duplicated, on reconnect.
pub struct StreamSession {
    pub id: u64,
    stream: Box<dyn TransactionStream>,
    delivered: u64,
}

impl StreamSession {
    fn new(id: u64, stream: Box<dyn TransactionStream>) -> Self {
        Self {
            id,
            stream,
            delivered: 0,
        }
    }

    async fn close(mut self) {
        self.stream.close().await;
        debug!(session = self.id, delivered = self.delivered, "Stream session closed");
    }
}

enum SessionEnd {
    Cancelled,
    Failed(SourceError),
}

/// Keeps one subscription alive, reconnecting after a fixed delay until shutdown.
pub struct StreamSupervisor {
    source: Arc<dyn TransactionSource>,
    consumer: Arc<dyn TxConsumer>,
    config: StreamConfig,
    state: watch::Sender<SupervisorState>,
    shutdown: Shutdown,
}

impl StreamSupervisor {
    pub fn new(
        source: Arc<dyn TransactionSource>,
        consumer: Arc<dyn TxConsumer>,
        config: StreamConfig,
        shutdown: Shutdown,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            source,
            consumer,
            config,
            state,
            shutdown,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SupervisorState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "Stream state changed");
        }
    }

    /// Drive the subscription until shutdown. Stream errors are never fatal.
    pub async fn run(&self) {
        let endpoint = self.source.endpoint();
        let mut attempt: u64 = 0;

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            attempt += 1;
            self.set_state(SupervisorState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                result = self.source.connect() => result,
            };

            let failure = match connected {
                Ok(stream) => {
                    let mut session = StreamSession::new(attempt, stream);
                    self.set_state(SupervisorState::Streaming);
                    info!(endpoint = %endpoint, session = session.id, "Transaction stream connected");

                    let end = self.pump(&mut session).await;
                    session.close().await;
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            self.set_state(SupervisorState::Error);
            error!(
                endpoint = %endpoint,
                attempt,
                "Transaction stream failed: {failure}, reconnecting in {:?}",
                self.config.reconnect_delay
            );

            tokio::select! {
                biased;
                _ = self.shutdown.wait() => {
                    info!("Shutdown during reconnect delay");
                    break;
                }
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.set_state(SupervisorState::Cancelled);
        info!(endpoint = %endpoint, "Stream supervisor stopped");
    }

    /// Forward items until the session fails or shutdown is raised. Each
    /// item is fully consumed before the next one is read.
    async fn pump(&self, session: &mut StreamSession) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.wait() => return SessionEnd::Cancelled,
                next = self.next_item(session) => next,
            };

            match next {
                Ok(Some(tx)) => {
                    self.consumer.consume(tx).await;
                    session.delivered += 1;
                }
                Ok(None) => return SessionEnd::Failed(SourceError::EndOfStream),
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }

    async fn next_item(&self, session: &mut StreamSession) -> Result<Option<TxRecord>, SourceError> {
        match self.config.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, session.stream.next())
                .await
                .map_err(|_| SourceError::Idle(limit))?,
            None => session.stream.next().await,
        }
    }
}
