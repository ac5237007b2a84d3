//! RPC transport capability
//!
//! The harness only needs two things from a conductor connection: issue a
//! method call and receive pushed signal frames. [`RpcClient`] is that
//! capability; [`Connector`] opens one per interface URL. The websocket
//! implementation speaks JSON-RPC 2.0 and treats any server frame carrying a
//! `signal` key as a signal.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::error::{TransportError, TransportResult};

/// A connected RPC endpoint on the conductor
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Invoke `method` with `params` and wait for its result
    async fn call(&self, method: &str, params: Value) -> TransportResult<Value>;

    /// Receive every signal frame pushed after this call
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value>;
}

/// Opens [`RpcClient`]s by URL
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `url`
    async fn connect(&self, url: &str) -> TransportResult<Arc<dyn RpcClient>>;
}

/// Websocket URL for a local interface port
pub fn local_url(port: u16) -> String {
    format!("ws://localhost:{port}")
}

/// Ask the OS for a currently unused local port
pub fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Connector producing [`WsRpcClient`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> TransportResult<Arc<dyn RpcClient>> {
        let client = WsRpcClient::connect(url).await?;
        Ok(Arc::new(client))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type PendingRequests = HashMap<String, oneshot::Sender<TransportResult<Value>>>;
type Subscribers = Vec<mpsc::UnboundedSender<Value>>;

/// JSON-RPC client over a single websocket
pub struct WsRpcClient {
    writer: Mutex<WsWriter>,
    pending: Arc<SyncMutex<PendingRequests>>,
    subscribers: Arc<SyncMutex<Subscribers>>,
    reader_task: tokio::task::JoinHandle<()>,
}

/// Removes a pending request when its waiter goes away, answered or not
struct PendingGuard {
    id: String,
    pending: Arc<SyncMutex<PendingRequests>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl WsRpcClient {
    /// Connect and start the background receive loop
    pub async fn connect(url: &str) -> TransportResult<Self> {
        let parsed = Url::parse(url).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(TransportError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed.scheme()
            )));
        }

        let (stream, _response) =
            connect_async(url)
                .await
                .map_err(|err| TransportError::Connect {
                    url: url.to_string(),
                    detail: err.to_string(),
                })?;
        let (writer, mut reader) = stream.split();

        let pending: Arc<SyncMutex<PendingRequests>> = Arc::default();
        let subscribers: Arc<SyncMutex<Subscribers>> = Arc::default();
        let task_pending = Arc::clone(&pending);
        let task_subscribers = Arc::clone(&subscribers);
        let task_url = url.to_string();

        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(url = %task_url, error = %err, "websocket receive failed");
                        break;
                    }
                };
                let value: Value = match serde_json::from_str(text.as_str()) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(url = %task_url, error = %err, "unparseable frame");
                        continue;
                    }
                };
                dispatch_frame(value, &task_pending, &task_subscribers);
            }

            for (_, sender) in task_pending.lock().drain() {
                let _ = sender.send(Err(TransportError::Closed));
            }
            task_subscribers.lock().clear();
        });

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            subscribers,
            reader_task,
        })
    }
}

fn dispatch_frame(
    value: Value,
    pending: &SyncMutex<PendingRequests>,
    subscribers: &SyncMutex<Subscribers>,
) {
    if value.get("signal").is_some() {
        subscribers
            .lock()
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
        return;
    }

    let Some(id) = value.get("id").and_then(Value::as_str) else {
        debug!(frame = %value, "ignoring frame without id");
        return;
    };
    let result = match value.get("error") {
        Some(error) => Err(TransportError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        }),
        None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
    };
    // A missing entry means the caller stopped waiting; the reply is dropped.
    if let Some(sender) = pending.lock().remove(id) {
        let _ = sender.send(result);
    }
}

#[async_trait]
impl RpcClient for WsRpcClient {
    async fn call(&self, method: &str, params: Value) -> TransportResult<Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            id: id.clone(),
            pending: Arc::clone(&self.pending),
        };

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let payload = serde_json::to_string(&request)?;
        self.writer
            .lock()
            .await
            .send(Message::Text(payload.into()))
            .await
            .map_err(|err| TransportError::WebSocket(err.to_string()))?;

        rx.await.map_err(|_| TransportError::Closed)?
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }
}

impl Drop for WsRpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
