//! Connection manager: per-socket tasks, auth epochs, expiry timers.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade admits the socket (see `upgrade`); a [`ClientId`] is allocated
//!    and the handle enters the live set.
//! 2. In handshake mode the first frame must be `AUTH` within the deadline.
//! 3. The read loop processes frames strictly in arrival order; a dedicated
//!    writer task drains the outbound queue, so there is exactly one socket
//!    writer.
//! 4. Teardown removes subscriptions and the live-set entry before the
//!    socket closes, so no dispatch can target a dead socket.
//!
//! DESIGN
//! ======
//! `safe_send` never blocks the dispatcher on a slow client: a full queue
//! is retried on a 100 ms backoff a bounded number of times, then the frame
//! is dropped with a warning. A closed queue (client gone) drops silently.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthOutcome, now_secs};
use crate::bus::{ChangeEvent, LifecycleEvent};
use crate::config::AuthMode;
use crate::gateway::{Gateway, router};
use crate::services::Accountability;
use messages::{ClientMessage, ErrorBody, ErrorCode, ServerMessage};

const OUTBOUND_CAPACITY: usize = 64;
const SAFE_SEND_BACKOFF: Duration = Duration::from_millis(100);
const SAFE_SEND_RETRIES: usize = 10;
const WRITER_DRAIN: Duration = Duration::from_secs(1);

// =============================================================================
// CLIENT HANDLE
// =============================================================================

/// Stable identifier allocated at connect time. The subscription registry
/// stores these instead of handles to keep ownership acyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct ClientState {
    accountability: Option<Accountability>,
    expires_at: Option<i64>,
    expiry_timer: Option<JoinHandle<()>>,
}

/// Cheap-to-clone view of one live connection.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    outbound: mpsc::Sender<ServerMessage>,
    state: Arc<Mutex<ClientState>>,
    shutdown: Arc<Notify>,
    awaiting_pong: Arc<AtomicBool>,
}

impl ClientHandle {
    pub(crate) fn new(id: ClientId, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            outbound,
            state: Arc::new(Mutex::new(ClientState {
                accountability: None,
                expires_at: None,
                expiry_timer: None,
            })),
            shutdown: Arc::new(Notify::new()),
            awaiting_pong: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Snapshot of the current accountability, if authenticated.
    #[must_use]
    pub fn accountability(&self) -> Option<Accountability> {
        self.state.lock().expect("client state poisoned").accountability.clone()
    }

    #[must_use]
    pub fn user(&self) -> Option<Uuid> {
        self.state
            .lock()
            .expect("client state poisoned")
            .accountability
            .as_ref()
            .and_then(|a| a.user)
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        self.state.lock().expect("client state poisoned").expires_at
    }

    /// Enqueue a frame for the writer task. Bounded backoff on a full
    /// queue; silent drop once the client is gone.
    pub async fn safe_send(&self, frame: ServerMessage) {
        let mut frame = frame;
        for _ in 0..SAFE_SEND_RETRIES {
            match self.outbound.try_send(frame) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    frame = returned;
                    sleep(SAFE_SEND_BACKOFF).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
        warn!(client_id = %self.id, "outbound queue full; dropping frame");
    }

    /// Replace the auth epoch wholesale and restart the expiry timer.
    pub(crate) fn install_epoch(
        &self,
        gateway: &Gateway,
        accountability: Accountability,
        expires_at: Option<i64>,
    ) {
        let mut state = self.state.lock().expect("client state poisoned");
        if let Some(timer) = state.expiry_timer.take() {
            timer.abort();
        }
        state.accountability = Some(accountability);
        state.expires_at = expires_at;
        if let Some(at) = expires_at {
            state.expiry_timer = Some(tokio::spawn(expiry_task(gateway.clone(), self.id, at)));
        }
    }

    /// Drop the epoch and cancel any timer. Used on auth failure and on
    /// teardown.
    pub(crate) fn clear_epoch(&self) {
        let mut state = self.state.lock().expect("client state poisoned");
        if let Some(timer) = state.expiry_timer.take() {
            timer.abort();
        }
        state.accountability = None;
        state.expires_at = None;
    }

    /// Epoch clear used by the timer task itself: dropping the handle here
    /// must not abort the running task, which still owes the grace window.
    fn expire_epoch(&self) {
        let mut state = self.state.lock().expect("client state poisoned");
        state.expiry_timer.take();
        state.accountability = None;
        state.expires_at = None;
    }

    /// Ask the read loop to close this connection.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub(crate) async fn shutdown_notified(&self) {
        self.shutdown.notified().await;
    }

    /// Heartbeat bookkeeping: returns `false` when the previous ping was
    /// never answered.
    pub(crate) fn begin_ping(&self) -> bool {
        !self.awaiting_pong.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_pong(&self) {
        self.awaiting_pong.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// TOKEN EXPIRY
// =============================================================================

/// One-shot task armed per epoch: fire at `expires_at`, clear the epoch,
/// notify the client, then close after the grace window unless it
/// re-authenticated (or the gateway runs public).
async fn expiry_task(gateway: Gateway, client_id: ClientId, expires_at: i64) {
    let wait = expires_at.saturating_sub(now_secs());
    if wait > 0 {
        sleep(Duration::from_secs(wait.unsigned_abs())).await;
    }

    let Some(client) = gateway.client(client_id).await else {
        return;
    };

    info!(%client_id, "auth epoch expired");
    let expired_user = client.user();
    client.expire_epoch();
    if let Some(user) = expired_user {
        gateway.presence_exit_if_last(user, client_id).await;
    }
    client
        .safe_send(ServerMessage::error(
            ErrorCode::TokenExpired,
            "session token expired",
            None,
        ))
        .await;

    sleep(gateway.config().auth_timeout).await;
    if client.accountability().is_none() && gateway.config().auth_mode != AuthMode::Public {
        debug!(%client_id, "no re-authentication within grace window; closing");
        client.request_shutdown();
    }
}

// =============================================================================
// CONNECTION TASKS
// =============================================================================

enum CloseKind {
    Closed,
    Errored,
}

/// Drive one admitted connection to completion.
pub(crate) async fn run_connection(gateway: Gateway, socket: WebSocket, seed: Option<AuthOutcome>) {
    let client_id = ClientId::new();
    let (sink, mut stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_outbound(sink, outbound_rx));

    let handle = ClientHandle::new(client_id, outbound_tx);
    gateway.insert_client(handle.clone()).await;
    info!(%client_id, "ws: connection admitted");

    if let Some(outcome) = seed {
        // Strict mode resolved the identity at upgrade time.
        let user = outcome.accountability.user;
        handle.install_epoch(&gateway, outcome.accountability, outcome.expires_at);
        if let Some(user) = user {
            gateway.presence_enter(user);
        }
    } else if gateway.config().auth_mode == AuthMode::Handshake
        && !handshake(&gateway, &handle, &mut stream).await
    {
        teardown(&gateway, &handle, &CloseKind::Closed).await;
        drop(handle);
        let _ = timeout(WRITER_DRAIN, writer).await;
        return;
    }

    gateway.bus().notify(LifecycleEvent::Connected {
        client: client_id.as_uuid(),
        user: handle.user(),
    });

    let close_kind = loop {
        tokio::select! {
            () = handle.shutdown_notified() => break CloseKind::Closed,
            frame = stream.next() => match frame {
                None | Some(Ok(Message::Close(_))) => break CloseKind::Closed,
                Some(Err(err)) => {
                    debug!(%client_id, error = %err, "ws: transport error");
                    break CloseKind::Errored;
                }
                Some(Ok(Message::Text(text))) => {
                    router::handle_text(&gateway, &handle, text.as_str()).await;
                }
                Some(Ok(_)) => {}
            }
        }
    };

    teardown(&gateway, &handle, &close_kind).await;
    drop(handle);
    let _ = timeout(WRITER_DRAIN, writer).await;
}

/// Handshake mode: the first frame must be a successful `AUTH` within the
/// configured deadline, or the connection is refused.
async fn handshake(
    gateway: &Gateway,
    handle: &ClientHandle,
    stream: &mut SplitStream<WebSocket>,
) -> bool {
    let refuse = |message: &str| {
        ServerMessage::auth_error(ErrorBody::new(ErrorCode::AuthenticationFailed, message), None)
    };

    let text = match timeout(gateway.config().auth_timeout, stream.next()).await {
        Err(_elapsed) => {
            handle.safe_send(refuse("authentication handshake timed out")).await;
            return false;
        }
        Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return false,
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            handle.safe_send(refuse("first message must be AUTH")).await;
            return false;
        }
    };

    match ClientMessage::parse(text.as_str()) {
        Ok(ClientMessage::Auth(request)) => router::handle_auth(gateway, handle, &request).await,
        Ok(_) => {
            handle.safe_send(refuse("first message must be AUTH")).await;
            false
        }
        Err(err) => {
            handle.safe_send(refuse(&err.to_string())).await;
            false
        }
    }
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerMessage>,
) {
    while let Some(frame) = rx.recv().await {
        let Ok(text) = serde_json::to_string(&frame) else {
            continue;
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Unwind one connection. Subscriptions and the live-set entry go first so
/// the dispatcher never observes a dead socket.
async fn teardown(gateway: &Gateway, handle: &ClientHandle, kind: &CloseKind) {
    let user = handle.user();
    handle.clear_epoch();

    let removed = gateway.registry().remove_all(handle.id()).await;
    gateway.remove_client(handle.id()).await;

    let affected: BTreeSet<String> = removed.into_iter().map(|sub| sub.collection).collect();
    for collection in affected {
        gateway.bus().publish(ChangeEvent::Focus { collection });
    }

    // Presence recomputes membership from the live set, so the client must
    // already be out of it (removed above, and excluded by id) for the
    // last-tab case to resolve on this close instead of the next one.
    if let Some(user) = user {
        gateway.presence_exit_if_last(user, handle.id()).await;
    }

    match kind {
        CloseKind::Closed => {
            info!(client_id = %handle.id(), "ws: client disconnected");
            gateway.bus().notify(LifecycleEvent::Closed { client: handle.id().as_uuid() });
        }
        CloseKind::Errored => {
            warn!(client_id = %handle.id(), "ws: client errored");
            gateway.bus().notify(LifecycleEvent::Errored { client: handle.id().as_uuid() });
        }
    }
}

// =============================================================================
// TEST SUPPORT
// =============================================================================

#[cfg(test)]
pub(crate) fn test_handle() -> (ClientHandle, mpsc::Receiver<ServerMessage>) {
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    (ClientHandle::new(ClientId::new(), tx), rx)
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
