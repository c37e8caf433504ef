use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use async_trait::async_trait;
use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{NodeRpc, RpcError, block_transactions};
use crate::core::TxRecord;
use crate::stream::{SourceError, TransactionSource, TransactionStream};

/// How often the subscriber thread checks for a stop request.
const POLL_TIMEOUT_MS: i64 = 1000;

type BlockEvent = Result<BlockHash, zmq::Error>;

/// A block whose fetch failed on transport, fetched first by the next session.
type RetrySlot = Arc<Mutex<Option<BlockHash>>>;

/// Confirmed transactions from a node: `hashblock` over ZMQ, block bodies over RPC.
pub struct ZmqBlockSource {
    endpoint: String,
    rpc: Arc<NodeRpc>,
    retry: RetrySlot,
}

impl ZmqBlockSource {
    pub fn new(endpoint: impl Into<String>, rpc: Arc<NodeRpc>) -> Self {
        Self {
            endpoint: endpoint.into(),
            rpc,
            retry: RetrySlot::default(),
        }
    }
}

#[async_trait]
impl TransactionSource for ZmqBlockSource {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&self) -> Result<Box<dyn TransactionStream>, SourceError> {
        let info = self.rpc.getblockchaininfo().await?;
        info!(rpc = %self.rpc.url(), chain = %info["chain"], blocks = %info["blocks"], "Node RPC reachable");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let endpoint = self.endpoint.clone();
            let stop = stop.clone();
            std::thread::spawn(move || run_subscriber(&endpoint, events_tx, stop, ready_tx))
        };

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e.into());
            }
            Err(_) => return Err(SourceError::EndOfStream),
        }
        info!(endpoint = %self.endpoint, "ZMQ hashblock subscriber connected");

        Ok(Box::new(ZmqBlockStream {
            rpc: self.rpc.clone(),
            events: events_rx,
            pending: VecDeque::new(),
            retry: self.retry.clone(),
            stop,
            thread: Some(thread),
        }))
    }
}

struct ZmqBlockStream {
    rpc: Arc<NodeRpc>,
    events: mpsc::UnboundedReceiver<BlockEvent>,
    pending: VecDeque<TxRecord>,
    retry: RetrySlot,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ZmqBlockStream {
    async fn fetch(&self, hash: BlockHash) -> Result<Vec<TxRecord>, RpcError> {
        let block = self.rpc.getblock(&hash.to_string()).await?;
        block_transactions(&block)
    }
}

#[async_trait]
impl TransactionStream for ZmqBlockStream {
    async fn next(&mut self) -> Result<Option<TxRecord>, SourceError> {
        loop {
            if let Some(tx) = self.pending.pop_front() {
                return Ok(Some(tx));
            }

            let retried = self.retry.lock().take();
            let hash = match retried {
                Some(hash) => {
                    info!(block = %hash, "Retrying block from previous session");
                    hash
                }
                None => match self.events.recv().await {
                    Some(event) => event?,
                    None => return Ok(None),
                },
            };
            let txs = match self.fetch(hash).await {
                Ok(txs) => txs,
                Err(e) => {
                    // Only transport failures are worth retrying.
                    if matches!(e, RpcError::Http(_)) {
                        *self.retry.lock() = Some(hash);
                    }
                    return Err(e.into());
                }
            };
            debug!(block = %hash, txs = txs.len(), "Block fetched");
            self.pending.extend(txs);
        }
    }

    async fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.pending.clear();
        if let Some(thread) = self.thread.take() {
            // Exits within one poll timeout.
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }
}

impl Drop for ZmqBlockStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn open_socket(ctx: &zmq::Context, endpoint: &str) -> Result<zmq::Socket, zmq::Error> {
    let socket = ctx.socket(zmq::SUB)?;
    socket.connect(endpoint)?;
    socket.set_subscribe(b"hashblock")?;
    Ok(socket)
}

/// Blocking subscriber loop (the zmq crate is synchronous).
fn run_subscriber(
    endpoint: &str,
    events: mpsc::UnboundedSender<BlockEvent>,
    stop: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<(), zmq::Error>>,
) {
    let ctx = zmq::Context::new();
    let socket = match open_socket(&ctx, endpoint) {
        Ok(socket) => {
            let _ = ready.send(Ok(()));
            socket
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while !stop.load(Ordering::Relaxed) {
        let readable = {
            let mut items = [socket.as_poll_item(zmq::POLLIN)];
            match zmq::poll(&mut items, POLL_TIMEOUT_MS) {
                Ok(_) => items[0].is_readable(),
                Err(e) => {
                    let _ = events.send(Err(e));
                    return;
                }
            }
        };
        if !readable {
            continue;
        }

        match socket.recv_multipart(zmq::DONTWAIT) {
            Ok(msg) if msg.len() >= 2 && msg[0] == b"hashblock" => match parse_block_hash(&msg[1]) {
                Some(hash) => {
                    if events.send(Ok(hash)).is_err() {
                        debug!("Block channel closed, stopping ZMQ subscriber");
                        return;
                    }
                }
                None => warn!("Invalid hashblock body length: {}", msg[1].len()),
            },
            Ok(msg) => warn!("Unexpected hashblock message format, parts: {}", msg.len()),
            Err(zmq::Error::EAGAIN) => {}
            Err(e) => {
                let _ = events.send(Err(e));
                return;
            }
        }
    }
}

/// ZMQ publishes the hash in display (big-endian) order.
fn parse_block_hash(body: &[u8]) -> Option<BlockHash> {
    let mut bytes: [u8; 32] = body.try_into().ok()?;
    bytes.reverse();
    Some(BlockHash::from_byte_array(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, response::IntoResponse, routing::post};
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Node stub whose first `failures` requests answer with a non-JSON body.
    async fn flaky_node(failures: usize) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/",
            post(move |Json(_req): Json<Value>| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        return "node busy".into_response();
                    }
                    Json(json!({
                        "result": {
                            "height": 900_000,
                            "tx": [{"txid": "aa", "vin": [{"txid": "ff", "vout": 0}], "vout": [{"value": 2.5}]}]
                        },
                        "error": null
                    }))
                    .into_response()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), calls)
    }

    fn stream(rpc: Arc<NodeRpc>, retry: RetrySlot) -> (ZmqBlockStream, mpsc::UnboundedSender<BlockEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = ZmqBlockStream {
            rpc,
            events: events_rx,
            pending: VecDeque::new(),
            retry,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        };
        (stream, events_tx)
    }

    #[tokio::test]
    async fn failed_block_fetch_is_retried_by_next_session() {
        let (url, calls) = flaky_node(1).await;
        let rpc = Arc::new(NodeRpc::with_url(url, "user", "pass", Duration::from_secs(5)).unwrap());
        let retry = RetrySlot::default();
        let hash = parse_block_hash(&[7u8; 32]).unwrap();

        let (mut first, events) = stream(rpc.clone(), retry.clone());
        events.send(Ok(hash)).unwrap();
        assert!(matches!(first.next().await, Err(SourceError::Rpc(RpcError::Http(_)))));
        assert_eq!(*retry.lock(), Some(hash));

        // The new session has no announcements of its own yet.
        let (mut second, _events) = stream(rpc, retry.clone());
        let tx = second.next().await.unwrap().unwrap();
        assert_eq!(tx.hash, "aa");
        assert_eq!(tx.block_height, 900_000);
        assert!(retry.lock().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn node_errors_are_not_retried() {
        let app = Router::new().route(
            "/",
            post(|| async { Json(json!({"result": null, "error": {"code": -5, "message": "Block not found"}})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let rpc = Arc::new(NodeRpc::with_url(format!("http://{addr}/"), "u", "p", Duration::from_secs(5)).unwrap());
        let retry = RetrySlot::default();

        let (mut session, events) = stream(rpc, retry.clone());
        events.send(Ok(parse_block_hash(&[9u8; 32]).unwrap())).unwrap();
        assert!(matches!(session.next().await, Err(SourceError::Rpc(RpcError::Rpc(_)))));
        assert!(retry.lock().is_none());
    }

    #[test]
    fn block_hash_keeps_display_order() {
        let mut body = [0u8; 32];
        body[0] = 0x00;
        body[1] = 0xab;
        body[31] = 0x01;
        let hash = parse_block_hash(&body).unwrap();
        let hex = hash.to_string();
        assert!(hex.starts_with("00ab"));
        assert!(hex.ends_with("01"));
    }

    #[test]
    fn rejects_short_body() {
        assert!(parse_block_hash(&[0u8; 31]).is_none());
    }
}
