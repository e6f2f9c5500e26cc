//! Native client for the Conduit realtime gateway.
//!
//! ARCHITECTURE
//! ============
//! Three layers over one socket:
//!
//! - [`Coordinator`] — correlates inbound frames with pending requests and
//!   subscription channels by `uid`. Pure bookkeeping, no I/O.
//! - [`Supervisor`] (internal) — owns the socket: authenticates on open,
//!   reconnects after a delay on close, answers server pings, and funnels
//!   every inbound frame through the coordinator.
//! - [`Handle`] / [`Client`] — what callers hold: `on_connect` /
//!   `on_disconnect` hooks and `subscribe` / `unsubscribe` / `send`.
//!
//! Resubscription after a reconnect is the caller's responsibility; the
//! `on_connect` hook is the designated place to re-send subscriptions.

mod coordinator;
mod supervisor;

pub use coordinator::{Coordinator, Routed};
pub use supervisor::{Client, ClientConfig, ClientError, Handle, SubscriptionStream, connect};
