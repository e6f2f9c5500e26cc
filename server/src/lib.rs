//! Conduit gateway server library.
//!
//! SYSTEM CONTEXT
//! ==============
//! The gateway sits between websocket clients and a content-management data
//! service. Clients authenticate, register collection-scoped subscriptions,
//! and receive re-evaluated payloads whenever the data service mutates or
//! presence changes. The data service itself, the permission resolver, and
//! the schema resolver are external collaborators consumed through the
//! traits in [`services`].

pub mod auth;
pub mod bus;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod services;
