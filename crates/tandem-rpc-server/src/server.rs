//! Server orchestration: wiring accepted connections to handler dispatch.
//!
//! The server owns zero or more accepted connections. Each connection gets
//! its own [`RpcClient`] (running the receive loop), its own execution
//! context stack, and a single dispatch task; inbound calls and
//! notifications flow through an unbounded channel so dispatch stays
//! strictly sequential per connection.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tandem_json_rpc::{JsonRpcError, JsonRpcRequest};
use tandem_rpc_client::{ClientConfig, RpcClient};

use crate::context::{ExecutionContextStack, StateTransition};
use crate::registry::{HandlerError, HandlerRegistry, RpcHandler};

enum Inbound {
    Call(JsonRpcRequest),
    Notification(JsonRpcRequest),
}

/// Builder for [`RpcServer`].
///
/// Two construction styles are supported: without `allowed_methods` every
/// registered handler is always callable; with it, the root execution
/// context restricts dispatch to the listed names until a method pushes a
/// different frame.
#[derive(Default)]
pub struct RpcServerBuilder {
    registry: HandlerRegistry,
    allowed_methods: Option<Vec<String>>,
    client_config: ClientConfig,
}

impl RpcServerBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            allowed_methods: None,
            client_config: ClientConfig::default(),
        }
    }

    /// Register a handler object for a method.
    pub fn handler(self, method: &str, handler: impl RpcHandler + 'static) -> Self {
        self.registry.add(method, handler);
        self
    }

    /// Register an untyped function handler.
    pub fn handler_fn<F>(self, method: &str, callback: F) -> Self
    where
        F: Fn(
                Option<tandem_json_rpc::LazyValue>,
            ) -> futures::future::BoxFuture<
                'static,
                Result<crate::registry::HandlerOutcome, HandlerError>,
            > + Send
            + Sync
            + 'static,
    {
        self.registry.add_fn(method, callback);
        self
    }

    /// Register a typed function handler for parameter type `T`.
    pub fn typed_handler<T, F>(self, method: &str, callback: F) -> Self
    where
        T: serde::de::DeserializeOwned + Send + Sync + 'static,
        F: Fn(T) -> futures::future::BoxFuture<
                'static,
                Result<crate::registry::HandlerOutcome, HandlerError>,
            > + Send
            + Sync
            + 'static,
    {
        self.registry.add_typed(method, callback);
        self
    }

    /// Restrict the root execution context to these method names.
    /// Reserved (`rpc.`-prefixed) names are a fatal construction error.
    pub fn allowed_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods: Vec<String> = methods.into_iter().map(Into::into).collect();
        for name in &methods {
            assert!(
                !name.starts_with(tandem_json_rpc::RESERVED_METHOD_PREFIX),
                "reserved method name '{}' in allow-list",
                name
            );
        }
        self.allowed_methods = Some(methods);
        self
    }

    /// Connection configuration applied to accepted clients.
    pub fn client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = config;
        self
    }

    pub fn build(self) -> RpcServer {
        RpcServer {
            registry: Arc::new(self.registry),
            allowed_methods: self.allowed_methods,
            client_config: self.client_config,
            connections: Mutex::new(Vec::new()),
        }
    }
}

/// A JSON-RPC 2.0 server over caller-supplied duplex byte channels.
///
/// Transport setup (listening, accepting, binding) is the caller's concern;
/// the server takes over once a connected stream is handed to
/// [`accept`](Self::accept).
pub struct RpcServer {
    registry: Arc<HandlerRegistry>,
    allowed_methods: Option<Vec<String>>,
    client_config: ClientConfig,
    connections: Mutex<Vec<Arc<RpcClient>>>,
}

impl RpcServer {
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::new()
    }

    /// The handler registry; entries may be added or removed while the
    /// server is running.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Take ownership of a connected duplex stream: constructs the
    /// connection client, wires dispatch, and starts its receive loop.
    pub fn accept(
        &self,
        stream: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
    ) -> Arc<RpcClient> {
        let client = Arc::new(RpcClient::from_stream(stream, self.client_config.clone()));
        self.attach(client.clone());
        client
    }

    /// Wire an existing connection client into this server's dispatch and
    /// start it listening.
    pub fn attach(&self, client: Arc<RpcClient>) {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let tx = tx.clone();
            client.on_request(move |request| {
                let _ = tx.send(Inbound::Call(request));
            });
        }
        client.on_notification(move |request| {
            let _ = tx.send(Inbound::Notification(request));
        });

        let stack = match &self.allowed_methods {
            Some(names) => ExecutionContextStack::with_root_methods(
                names
                    .iter()
                    .map(|name| (name.clone(), self.registry.expected_params_for(name)))
                    .collect(),
            ),
            None => ExecutionContextStack::new(),
        };

        tokio::spawn(dispatch_loop(
            client.clone(),
            self.registry.clone(),
            stack,
            rx,
        ));

        self.connections.lock().push(client.clone());
        client.start_listening();
    }

    /// Number of live connections. Connections whose peer disconnected are
    /// pruned here.
    pub fn connection_count(&self) -> usize {
        let mut connections = self.connections.lock();
        connections.retain(|client| !client.is_closed());
        connections.len()
    }

    /// Close every accepted connection, retiring their pending calls.
    pub async fn close_all(&self) {
        let connections: Vec<_> = self.connections.lock().drain(..).collect();
        for client in connections {
            if let Err(error) = client.close().await {
                warn!(%error, "failed to close connection");
            }
        }
    }
}

/// Sequential dispatch for one connection. Being the only task that touches
/// the context stack, it needs no synchronization around it. The channel's
/// senders live in the client's observer lists, so the loop also watches
/// the connection's close signal to know when to stop.
async fn dispatch_loop(
    client: Arc<RpcClient>,
    registry: Arc<HandlerRegistry>,
    mut stack: ExecutionContextStack,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
) {
    let closed = client.closed_token();
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            inbound = rx.recv() => {
                let Some(inbound) = inbound else { break };
                match inbound {
                    Inbound::Call(request) => {
                        dispatch_call(&client, &registry, &mut stack, request).await;
                    }
                    Inbound::Notification(request) => {
                        dispatch_notification(&registry, &mut stack, request).await;
                    }
                }
            }
        }
    }
    debug!("dispatch loop ended");
}

async fn dispatch_call(
    client: &RpcClient,
    registry: &HandlerRegistry,
    stack: &mut ExecutionContextStack,
    request: JsonRpcRequest,
) {
    let Some(id) = request.id else {
        return;
    };
    let method = request.method.as_str();

    if !stack.allows(method) {
        debug!(method, id, "method not in current execution context");
        send_error(client, JsonRpcError::method_not_found(id, method)).await;
        return;
    }

    let entries = registry.entries_for(method);
    if entries.is_empty() {
        send_error(client, JsonRpcError::method_not_found(id, method)).await;
        return;
    }

    // Fan-out: every entry runs, in registration order, each isolated from
    // the failures of the others.
    for entry in entries {
        match entry.handler.handle(method, request.params.as_ref()).await {
            Ok(outcome) => {
                if let Err(error) = client.reply(id, outcome.result).await {
                    warn!(method, id, %error, "failed to write response");
                }
                apply_transition(stack, method, outcome.transition);
            }
            Err(HandlerError::InvalidParams { expected, message }) => {
                debug!(method, id, expected, "typed handler rejected params");
                let detail = format!("expected {}: {}", expected, message);
                send_error(client, JsonRpcError::invalid_params(id, &detail)).await;
            }
            Err(HandlerError::Failed(message)) => {
                warn!(method, id, %message, "handler failed");
                let detail = format!("method '{}' failed: {}", method, message);
                send_error(client, JsonRpcError::internal_error(Some(id), Some(detail))).await;
            }
        }
    }
}

async fn dispatch_notification(
    registry: &HandlerRegistry,
    stack: &mut ExecutionContextStack,
    request: JsonRpcRequest,
) {
    let method = request.method.as_str();

    if !stack.allows(method) {
        debug!(method, "notification outside current execution context, ignored");
        return;
    }

    let entries = registry.entries_for(method);
    if entries.is_empty() {
        // Notifications have no reply path; unknown methods are ignored.
        debug!(method, "notification with no registered handler, ignored");
        return;
    }

    for entry in entries {
        match entry.handler.handle(method, request.params.as_ref()).await {
            Ok(outcome) => apply_transition(stack, method, outcome.transition),
            Err(error) => {
                warn!(method, %error, "notification handler failed");
            }
        }
    }
}

/// Transitions apply only after a successful invocation.
fn apply_transition(
    stack: &mut ExecutionContextStack,
    method: &str,
    transition: Option<StateTransition>,
) {
    if let Some(transition) = transition {
        stack.apply(&transition, method);
    }
}

async fn send_error(client: &RpcClient, error: JsonRpcError) {
    if let Err(write_error) = client.reply_error(error).await {
        warn!(%write_error, "failed to write error response");
    }
}
