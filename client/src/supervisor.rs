//! Connection supervisor and the caller-facing handles.
//!
//! LIFECYCLE
//! =========
//! 1. [`connect`] spawns the supervisor task and returns a [`Handle`].
//! 2. Each session: open the socket, send `AUTH` derived from the stored
//!    access token (any `Bearer ` prefix stripped), then pump frames.
//! 3. On `AUTH` success the connect hooks fire — that is the designated
//!    re-subscribe point after a reconnect.
//! 4. On close: disconnect hooks fire, then reconnect after the delay.
//!
//! DESIGN
//! ======
//! The outbound queue survives reconnects: frames enqueued while offline
//! are flushed after the next successful open. Inbound frames are routed
//! through the [`Coordinator`]; whatever it cannot place is inspected here
//! for the supervisor's own auth replies.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, Routed};
use messages::{
    AuthRequest, ClientMessage, ReplyStatus, ServerMessage, SubscribeRequest, UnsubscribeRequest,
};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("supervisor is shut down")]
    Closed,
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("reply channel dropped before a response arrived")]
    ChannelClosed,
    #[error("failed to serialize outbound frame: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Connection settings for [`connect`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub access_token: Option<String>,
    pub reconnect_delay: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Store the access token sent in the connection-open `AUTH`. A
    /// `Bearer ` header prefix is stripped.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        let token = token.strip_prefix("Bearer ").unwrap_or(&token).to_owned();
        self.access_token = Some(token);
        self
    }
}

// =============================================================================
// CLIENT
// =============================================================================

/// Cheap-to-clone sending half: enqueue frames, correlate replies, manage
/// subscriptions. Usable from connect hooks.
#[derive(Clone)]
pub struct Client {
    coordinator: Arc<Coordinator>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    request_timeout: Duration,
}

impl Client {
    /// Enqueue a frame. Fails only once the supervisor is shut down.
    pub fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.outbound.send(message).map_err(|_| ClientError::Closed)
    }

    /// Send a frame and await the reply carrying the same `uid`. A `uid` is
    /// assigned when the frame does not carry one.
    pub async fn request(&self, mut message: ClientMessage) -> Result<ServerMessage, ClientError> {
        let uid = ensure_uid(&mut message, &self.coordinator);
        let rx = self.coordinator.register_request(&uid);
        if let Err(err) = self.send(message) {
            self.coordinator.abandon_request(&uid);
            return Err(err);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::ChannelClosed),
            Err(_) => {
                self.coordinator.abandon_request(&uid);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Register a subscription and send `SUBSCRIBE`. Every frame the server
    /// pushes under the subscription's `uid` (starting with `init`) arrives
    /// on the returned stream.
    pub fn subscribe(&self, mut request: SubscribeRequest) -> Result<SubscriptionStream, ClientError> {
        let uid = request.uid.clone().unwrap_or_else(|| self.coordinator.next_uid());
        request.uid = Some(uid.clone());

        let events = self.coordinator.register_subscription(&uid);
        self.send(ClientMessage::Subscribe(request.clone()))?;
        Ok(SubscriptionStream { uid, request, events, client: self.clone() })
    }

    /// Send `UNSUBSCRIBE` for one uid and release its channel.
    pub fn unsubscribe(&self, uid: &str) -> Result<(), ClientError> {
        self.coordinator.forget_subscription(uid);
        self.send(ClientMessage::Unsubscribe(UnsubscribeRequest { uid: Some(uid.to_owned()) }))
    }
}

fn ensure_uid(message: &mut ClientMessage, coordinator: &Coordinator) -> String {
    let slot = match message {
        ClientMessage::Auth(m) => &mut m.uid,
        ClientMessage::Subscribe(m) => &mut m.uid,
        ClientMessage::Unsubscribe(m) => &mut m.uid,
        ClientMessage::Focus(m) => &mut m.uid,
        ClientMessage::Items(m) => &mut m.uid,
        ClientMessage::Pong => return coordinator.next_uid(),
    };
    match slot {
        Some(uid) => uid.clone(),
        None => {
            let uid = coordinator.next_uid();
            *slot = Some(uid.clone());
            uid
        }
    }
}

/// A live subscription: the retained `uid`, the original request (for
/// re-sending after reconnect), and the event stream.
pub struct SubscriptionStream {
    uid: String,
    request: SubscribeRequest,
    events: mpsc::UnboundedReceiver<ServerMessage>,
    client: Client,
}

impl SubscriptionStream {
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The request this stream was registered with, `uid` included. Re-send
    /// it from an `on_connect` hook to resubscribe after a reconnect.
    #[must_use]
    pub fn request(&self) -> &SubscribeRequest {
        &self.request
    }

    /// Next frame for this subscription. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.events.recv().await
    }

    /// Tear the subscription down on both sides.
    pub fn unsubscribe(self) -> Result<(), ClientError> {
        self.client.unsubscribe(&self.uid)
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

type ConnectHook = Box<dyn Fn(Client) + Send + Sync>;
type DisconnectHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_connect: Mutex<Vec<ConnectHook>>,
    on_disconnect: Mutex<Vec<DisconnectHook>>,
}

struct SupervisorInner {
    config: ClientConfig,
    coordinator: Arc<Coordinator>,
    client: Client,
    hooks: Hooks,
    connected: watch::Sender<bool>,
    shutdown: Notify,
}

/// The wrapper callers hold: hooks plus the sending [`Client`].
pub struct Handle {
    inner: Arc<SupervisorInner>,
}

impl Handle {
    /// Register a hook fired on every successful authentication. When the
    /// supervisor is already connected the hook fires immediately as well,
    /// so late registration cannot miss the current session.
    pub fn on_connect(&self, hook: impl Fn(Client) + Send + Sync + 'static) {
        if *self.inner.connected.borrow() {
            hook(self.inner.client.clone());
        }
        self.inner
            .hooks
            .on_connect
            .lock()
            .expect("connect hooks poisoned")
            .push(Box::new(hook));
    }

    /// Register a hook fired on every disconnect.
    pub fn on_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner
            .hooks
            .on_disconnect
            .lock()
            .expect("disconnect hooks poisoned")
            .push(Box::new(hook));
    }

    #[must_use]
    pub fn client(&self) -> Client {
        self.inner.client.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Wait until the supervisor has an authenticated session.
    pub async fn wait_connected(&self, deadline: Duration) -> Result<(), ClientError> {
        let mut rx = self.inner.connected.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(ClientError::Closed);
                }
            }
        };
        timeout(deadline, wait).await.map_err(|_| ClientError::Timeout)?
    }

    /// Stop reconnecting and close the current session.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_one();
    }
}

/// Spawn the supervisor for one gateway endpoint.
#[must_use]
pub fn connect(config: ClientConfig) -> Handle {
    let coordinator = Arc::new(Coordinator::new());
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (connected, _) = watch::channel(false);

    let client = Client {
        coordinator: coordinator.clone(),
        outbound: outbound_tx,
        request_timeout: config.request_timeout,
    };
    let inner = Arc::new(SupervisorInner {
        config,
        coordinator,
        client,
        hooks: Hooks::default(),
        connected,
        shutdown: Notify::new(),
    });

    tokio::spawn(run(inner.clone(), outbound_rx));
    Handle { inner }
}

async fn run(inner: Arc<SupervisorInner>, mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>) {
    loop {
        let stopped = tokio::select! {
            () = inner.shutdown.notified() => true,
            connection = connect_async(inner.config.url.as_str()) => match connection {
                Ok((socket, _)) => {
                    info!(url = %inner.config.url, "ws: connected");
                    session(&inner, socket, &mut outbound_rx).await
                }
                Err(err) => {
                    warn!(url = %inner.config.url, error = %err, "ws: connect failed");
                    false
                }
            },
        };

        let was_connected = inner.connected.send_replace(false);
        if was_connected {
            for hook in inner
                .hooks
                .on_disconnect
                .lock()
                .expect("disconnect hooks poisoned")
                .iter()
            {
                hook();
            }
        }
        if stopped {
            break;
        }

        tokio::select! {
            () = inner.shutdown.notified() => break,
            () = tokio::time::sleep(inner.config.reconnect_delay) => {}
        }
    }
}

/// Pump one socket session. Returns `true` when the supervisor should stop
/// instead of reconnecting.
async fn session(
    inner: &Arc<SupervisorInner>,
    socket: Socket,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
) -> bool {
    let (mut sink, mut stream) = socket.split();

    // Authenticate on open, or treat the bare socket as connected when no
    // token is configured (public gateways).
    let auth_uid = inner.coordinator.next_uid();
    match &inner.config.access_token {
        Some(token) => {
            let auth = ClientMessage::Auth(AuthRequest {
                access_token: Some(token.clone()),
                uid: Some(auth_uid.clone()),
                ..AuthRequest::default()
            });
            if send_frame(&mut sink, &auth).await.is_err() {
                return false;
            }
        }
        None => mark_connected(inner),
    }

    loop {
        tokio::select! {
            () = inner.shutdown.notified() => return true,
            outgoing = outbound_rx.recv() => match outgoing {
                // All client handles dropped; nothing can ever send again.
                None => return true,
                Some(frame) => {
                    if send_frame(&mut sink, &frame).await.is_err() {
                        return false;
                    }
                }
            },
            incoming = stream.next() => {
                let text = match incoming {
                    None | Some(Ok(Message::Close(_))) => return false,
                    Some(Err(err)) => {
                        debug!(error = %err, "ws: transport error");
                        return false;
                    }
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };

                let message = match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(error = %err, "ws: unparseable server frame");
                        continue;
                    }
                };

                match inner.coordinator.route(message) {
                    Routed::Ping => {
                        if send_frame(&mut sink, &ClientMessage::Pong).await.is_err() {
                            return false;
                        }
                    }
                    Routed::Delivered => {}
                    Routed::Unclaimed(message) => handle_unclaimed(inner, &auth_uid, &message),
                }
            }
        }
    }
}

fn handle_unclaimed(inner: &Arc<SupervisorInner>, auth_uid: &str, message: &ServerMessage) {
    match message {
        ServerMessage::Auth { status: ReplyStatus::Ok, uid, .. }
            if uid.as_deref() == Some(auth_uid) =>
        {
            mark_connected(inner);
        }
        ServerMessage::Auth { status: ReplyStatus::Error, error, .. } => {
            warn!(?error, "ws: authentication rejected");
        }
        other => debug!(?other, "ws: unclaimed server frame"),
    }
}

fn mark_connected(inner: &Arc<SupervisorInner>) {
    let was_connected = inner.connected.send_replace(true);
    if was_connected {
        return;
    }
    for hook in inner
        .hooks
        .on_connect
        .lock()
        .expect("connect hooks poisoned")
        .iter()
    {
        hook(inner.client.clone());
    }
}

async fn send_frame(
    sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    frame: &ClientMessage,
) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(frame) else {
        return Ok(());
    };
    sink.send(Message::Text(text.into())).await.map_err(|err| {
        debug!(error = %err, "ws: send failed");
    })
}

#[cfg(test)]
#[path = "supervisor_test.rs"]
mod tests;
