//! RPC connection client: one duplex byte channel, one background receive
//! loop, any number of foreground callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tandem_json_rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, MessageReassembler};

use crate::config::ClientConfig;
use crate::correlation::CorrelationTable;
use crate::error::{ClientError, ClientResult};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<BoxedWriter>>;

type RequestObserver = Box<dyn Fn(JsonRpcRequest) + Send + Sync>;
type ResponseObserver = Box<dyn Fn(JsonRpcResponse) + Send + Sync>;

/// Multicast observer lists for inbound traffic. Zero or more listeners per
/// event; all are notified, order unspecified.
#[derive(Default)]
struct Observers {
    requests: Vec<RequestObserver>,
    notifications: Vec<RequestObserver>,
    error_responses: Vec<ResponseObserver>,
}

/// A JSON-RPC 2.0 client bound to one duplex byte channel.
///
/// The receive loop reassembles inbound bytes into discrete messages,
/// correlates responses back to in-flight calls, and forwards inbound
/// requests/notifications to registered observers (the server layer
/// subscribes here). Outbound writes are serialized through a single
/// mutex so partial messages never interleave.
pub struct RpcClient {
    writer: SharedWriter,
    reader: Mutex<Option<BoxedReader>>,
    correlation: Arc<CorrelationTable>,
    observers: Arc<Mutex<Observers>>,
    shutdown: CancellationToken,
    listening: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    config: ClientConfig,
}

impl RpcClient {
    /// Create a client over separate read/write halves.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        config: ClientConfig,
    ) -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            reader: Mutex::new(Some(Box::new(reader))),
            correlation: Arc::new(CorrelationTable::new()),
            observers: Arc::new(Mutex::new(Observers::default())),
            shutdown: CancellationToken::new(),
            listening: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
            config,
        }
    }

    /// Create a client over a single full-duplex stream (TCP socket,
    /// in-process pipe).
    pub fn from_stream(
        stream: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
        config: ClientConfig,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, config)
    }

    /// Spawn the background receive loop. Idempotent: calling twice, or
    /// after [`close`](Self::close), is a no-op.
    pub fn start_listening(&self) {
        if self.shutdown.is_cancelled() || self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(reader) = self.reader.lock().take() else {
            return;
        };

        let writer = self.writer.clone();
        let correlation = self.correlation.clone();
        let observers = self.observers.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            receive_loop(reader, writer, correlation, observers, shutdown).await;
        });
        *self.loop_handle.lock() = Some(handle);
    }

    /// Subscribe to inbound calls (requests carrying an id).
    pub fn on_request(&self, observer: impl Fn(JsonRpcRequest) + Send + Sync + 'static) {
        self.observers.lock().requests.push(Box::new(observer));
    }

    /// Subscribe to inbound notifications.
    pub fn on_notification(&self, observer: impl Fn(JsonRpcRequest) + Send + Sync + 'static) {
        self.observers.lock().notifications.push(Box::new(observer));
    }

    /// Subscribe to inbound error responses that matched no pending call.
    pub fn on_error_response(&self, observer: impl Fn(JsonRpcResponse) + Send + Sync + 'static) {
        self.observers.lock().error_responses.push(Box::new(observer));
    }

    /// Issue a call with the configured default timeout. Returns `None`
    /// when no response arrived (timeout, cancellation, connection closed).
    pub async fn call(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> ClientResult<Option<JsonRpcResponse>> {
        self.call_with(method, params, self.config.request_timeout, &self.shutdown)
            .await
    }

    /// Issue a call with an explicit timeout and cancellation signal.
    /// `None` (or zero) timeout waits forever.
    pub async fn call_with(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ClientResult<Option<JsonRpcResponse>> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let id = self.correlation.next_id();
        self.correlation.register(id);

        let request = JsonRpcRequest::call(method, params, id);
        let text = serde_json::to_string(&request)?;
        if let Err(error) = write_text(&self.writer, &text).await {
            self.correlation.remove(id);
            return Err(error.into());
        }

        Ok(self.correlation.await_response(id, timeout, cancel).await)
    }

    /// Send a notification: no id is allocated and no response is awaited.
    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> ClientResult<()> {
        let notification = JsonRpcRequest::notification(method, params);
        let text = serde_json::to_string(&notification)?;
        write_text(&self.writer, &text).await?;
        Ok(())
    }

    /// Send a success response for an inbound call.
    pub async fn reply(&self, id: u64, result: Value) -> ClientResult<()> {
        self.send_response(JsonRpcResponse::success(id, result)).await
    }

    /// Send an error response for an inbound call.
    pub async fn reply_error(&self, error: JsonRpcError) -> ClientResult<()> {
        self.send_response(error.into()).await
    }

    /// Serialize and write a response over the connection.
    pub async fn send_response(&self, response: JsonRpcResponse) -> ClientResult<()> {
        let text = serde_json::to_string(&response)?;
        write_text(&self.writer, &text).await?;
        Ok(())
    }

    /// Stop the receive loop and wait for it to wind down. All pending
    /// calls are retired with a "no response" outcome. The join is bounded
    /// by the configured close timeout.
    pub async fn close(&self) -> ClientResult<()> {
        self.close_with(None).await
    }

    /// Like [`close`](Self::close), but the join wait can additionally be
    /// cut short by a caller-supplied cancellation signal.
    pub async fn close_with(&self, cancel: Option<CancellationToken>) -> ClientResult<()> {
        self.shutdown.cancel();
        self.correlation.mark_closed();

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = handle => {}
                        _ = cancel.cancelled() => {
                            debug!("close join cut short by cancellation");
                        }
                    }
                }
                None => {
                    if tokio::time::timeout(self.config.close_timeout, handle)
                        .await
                        .is_err()
                    {
                        warn!("receive loop did not stop within the close timeout");
                    }
                }
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.correlation.is_closed()
    }

    /// A token that fires once the connection is closed, whether by
    /// [`close`](Self::close) or by the peer going away. Layers that spawn
    /// per-connection tasks tie their lifetime to this.
    pub fn closed_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.correlation.pending_count()
    }
}

/// Single-writer critical section for the connection: one complete message
/// per lock hold, flushed before release.
async fn write_text(writer: &SharedWriter, text: &str) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}

async fn receive_loop(
    reader: BoxedReader,
    writer: SharedWriter,
    correlation: Arc<CorrelationTable>,
    observers: Arc<Mutex<Observers>>,
    shutdown: CancellationToken,
) {
    let mut reassembler = MessageReassembler::new(BufReader::new(reader));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("receive loop cancelled");
                break;
            }
            next = reassembler.next_message() => match next {
                Ok(Some(text)) => {
                    handle_inbound(&text, &writer, &correlation, &observers).await;
                }
                Ok(None) => {
                    debug!("peer closed the connection");
                    break;
                }
                Err(error) => {
                    warn!(%error, "inbound stream failed, treating as connection closure");
                    break;
                }
            }
        }
    }
    correlation.mark_closed();
    // Peer-initiated closure must fire the same signal as close(), so
    // anything tied to closed_token() winds down either way.
    shutdown.cancel();
}

/// Classify one reassembled message and route it: responses to the
/// correlation table, requests/notifications to observers, anything else
/// answered with a null-id wire error.
async fn handle_inbound(
    text: &str,
    writer: &SharedWriter,
    correlation: &CorrelationTable,
    observers: &Mutex<Observers>,
) {
    if let Some(request) = JsonRpcRequest::parse(text) {
        debug!(method = %request.method, id = ?request.id, "inbound request");
        let observers = observers.lock();
        let list = if request.is_notification() {
            &observers.notifications
        } else {
            &observers.requests
        };
        for observer in list {
            observer(request.clone());
        }
        return;
    }

    if let Some(response) = JsonRpcResponse::parse(text) {
        if let Some(id) = response.id {
            if correlation.complete(id, response.clone()) {
                return;
            }
        }
        if response.is_success() {
            debug!(id = ?response.id, "dropping unmatched success response");
        } else {
            debug!(id = ?response.id, "inbound error response with no pending call");
            for observer in &observers.lock().error_responses {
                observer(response.clone());
            }
        }
        return;
    }

    // Neither shape fits. The id cannot be trusted at this point, so both
    // reply forms carry a null id.
    let reply = if serde_json::from_str::<Value>(text).is_err() {
        warn!("unparseable inbound message, replying ParseError");
        JsonRpcError::parse_error()
    } else {
        warn!("inbound JSON is neither request nor response, replying InvalidRequest");
        JsonRpcError::invalid_request()
    };
    match serde_json::to_string(&JsonRpcResponse::from(reply)) {
        Ok(reply_text) => {
            if let Err(error) = write_text(writer, &reply_text).await {
                warn!(%error, "failed to write error reply");
            }
        }
        Err(error) => warn!(%error, "failed to serialize error reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair() -> (Arc<RpcClient>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let client = Arc::new(RpcClient::from_stream(near, ClientConfig::default()));
        (client, far)
    }

    /// Drive the far end of the pipe with a fixed responder.
    fn echo_peer(far: tokio::io::DuplexStream) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(far);
            let mut reassembler = MessageReassembler::new(BufReader::new(read));
            while let Ok(Some(text)) = reassembler.next_message().await {
                if let Some(request) = JsonRpcRequest::parse(&text) {
                    if let Some(id) = request.id {
                        let response =
                            JsonRpcResponse::success(id, json!(format!("echo:{}", request.method)));
                        let reply = serde_json::to_string(&response).unwrap();
                        write.write_all(reply.as_bytes()).await.unwrap();
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_call_receives_matching_response() {
        let (client, far) = pair();
        let peer = echo_peer(far);
        client.start_listening();

        let response = client
            .call("test.hello", Some(json!({"custom": "hello"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.id, Some(1));
        assert_eq!(
            response.result_as::<String>().unwrap().unwrap(),
            "echo:test.hello"
        );

        client.close().await.unwrap();
        peer.abort();
    }

    #[tokio::test]
    async fn test_call_times_out_without_response() {
        let (client, _far) = pair();
        client.start_listening();

        let outcome = client
            .call_with(
                "void",
                None,
                Some(Duration::from_millis(50)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(client.pending_calls(), 0);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_carries_no_id() {
        let (client, far) = pair();
        client.start_listening();

        client.notify("fire", Some(json!([1, 2]))).await.unwrap();
        client.close().await.unwrap();

        let (read, _write) = tokio::io::split(far);
        let mut reassembler = MessageReassembler::new(BufReader::new(read));
        let text = reassembler.next_message().await.unwrap().unwrap();
        assert!(!text.contains("\"id\""));
        assert!(text.contains("\"method\":\"fire\""));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_start_listening_is_idempotent() {
        let (client, far) = pair();
        let peer = echo_peer(far);
        client.start_listening();
        client.start_listening();

        let response = client.call("m", None).await.unwrap();
        assert!(response.is_some());

        client.close().await.unwrap();
        client.start_listening(); // after close: no-op
        peer.abort();
    }

    #[tokio::test]
    async fn test_unmatched_error_response_reaches_observer() {
        let (client, far) = pair();
        let seen = Arc::new(AtomicBool::new(false));
        {
            let seen = seen.clone();
            client.on_error_response(move |response| {
                assert_eq!(response.id, None);
                seen.store(true, Ordering::SeqCst);
            });
        }
        client.start_listening();

        let (_read, mut write) = tokio::io::split(far);
        write
            .write_all(br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32600,"message":"Invalid Request"}}"#)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(seen.load(Ordering::SeqCst));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_inbound_answered_with_null_id() {
        let (client, far) = pair();
        client.start_listening();

        let (read, mut write) = tokio::io::split(far);
        // A bare keyword: valid JSON, but neither message shape.
        write.write_all(b"true").await.unwrap();

        let mut reassembler = MessageReassembler::new(BufReader::new(read));
        let reply = reassembler.next_message().await.unwrap().unwrap();
        let response = JsonRpcResponse::parse(&reply).unwrap();
        assert_eq!(response.id, None);
        assert_eq!(response.error.unwrap().code, -32600);

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_retires_inflight_calls() {
        let (client, _far) = pair();
        client.start_listening();

        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.call_with("slow", None, None, &CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await.unwrap();

        let outcome = caller.await.unwrap().unwrap();
        assert!(outcome.is_none());
        assert_eq!(client.pending_calls(), 0);
    }
}
