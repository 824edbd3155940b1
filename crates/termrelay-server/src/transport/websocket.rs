//! WebSocket upgrade using tokio-tungstenite.
//!
//! The bearer credential is checked inside the HTTP upgrade callback, so a
//! rejected client gets a plain HTTP error and never a WebSocket.

use crate::auth::{Authenticator, ServerRateLimits};
use parking_lot::Mutex;
use std::net::SocketAddr;
use termrelay_core::{RelayError, RelayResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Upgrade `stream` to a WebSocket, authenticating the request.
///
/// Returns the socket and the authenticated owner id.
pub async fn accept<S>(
    stream: S,
    remote: SocketAddr,
    auth: &dyn Authenticator,
    rate_limits: &Mutex<ServerRateLimits>,
) -> RelayResult<(WebSocketStream<S>, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outcome: Option<RelayResult<String>> = None;

    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if !rate_limits.lock().check_upgrade(&remote.ip()) {
            outcome = Some(Err(RelayError::RateLimited(format!(
                "too many upgrade attempts from {}",
                remote.ip()
            ))));
            return Err(reject(StatusCode::TOO_MANY_REQUESTS, "rate limited"));
        }
        let validated = bearer_token(req)
            .ok_or_else(|| RelayError::AuthFailed("missing bearer token".into()))
            .and_then(|token| auth.validate(&token));
        match validated {
            Ok(owner) => {
                outcome = Some(Ok(owner));
                Ok(resp)
            }
            Err(e) => {
                outcome = Some(Err(e));
                Err(reject(StatusCode::UNAUTHORIZED, "unauthorized"))
            }
        }
    };

    let upgraded = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    match (upgraded, outcome) {
        (Ok(ws), Some(Ok(owner))) => {
            debug!(remote = %remote, owner = %owner, "WebSocket connection accepted");
            Ok((ws, owner))
        }
        (_, Some(Err(e))) => {
            warn!(remote = %remote, error = %e, "WebSocket upgrade rejected");
            Err(e)
        }
        (Err(e), _) => Err(RelayError::Transport(format!(
            "WebSocket handshake failed: {e}"
        ))),
        (Ok(_), None) => Err(RelayError::AuthFailed("upgrade was not authenticated".into())),
    }
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// The bearer credential from `Authorization: Bearer …` or a
/// percent-encoded `?token=…`.
pub fn bearer_token(req: &Request) -> Option<String> {
    let from_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme
                .eq_ignore_ascii_case("bearer")
                .then(|| token.trim().to_string())
        })
        .filter(|token| !token.is_empty());
    if from_header.is_some() {
        return from_header;
    }

    req.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .and_then(|(_, value)| urlencoding::decode(value).ok())
            .map(|token| token.into_owned())
            .filter(|token| !token.is_empty())
    })
}
