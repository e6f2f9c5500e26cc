//! Upgrade & auth controller.
//!
//! DESIGN
//! ======
//! One axum handler, three admission policies:
//!
//! - `public` — upgrade unconditionally; the connection starts with null
//!   accountability and may authenticate inline later.
//! - `strict` — the `access_token` query parameter must resolve to an
//!   accountability with a user, or the request is answered `401` and the
//!   socket is never upgraded.
//! - `handshake` — upgrade unconditionally; the connection task requires a
//!   successful `AUTH` as the first frame (see `connection::handshake`).

use std::collections::HashMap;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::auth::{AuthOutcome, token_expiry};
use crate::config::AuthMode;
use crate::gateway::{Gateway, connection};

pub async fn handle_upgrade(
    State(gateway): State<Gateway>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    match gateway.config().auth_mode {
        AuthMode::Public | AuthMode::Handshake => {
            ws.on_upgrade(move |socket| connection::run_connection(gateway, socket, None))
        }
        AuthMode::Strict => {
            let Some(token) = params.get("access_token").cloned() else {
                return unauthorized();
            };

            let accountability = match gateway
                .services()
                .access
                .accountability_for_token(&token)
                .await
            {
                Ok(accountability) if accountability.user.is_some() => accountability,
                Ok(_) => return unauthorized(),
                Err(err) => {
                    warn!(error = %err, "strict upgrade rejected");
                    return unauthorized();
                }
            };

            let seed = AuthOutcome {
                accountability,
                expires_at: token_expiry(&token),
                refresh_token: None,
            };
            ws.on_upgrade(move |socket| connection::run_connection(gateway, socket, Some(seed)))
        }
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

#[cfg(test)]
#[path = "upgrade_test.rs"]
mod tests;
