//! Core server: accepts TCP connections, upgrades them and hands them to the
//! relay engine.
//!
//! Owns the supervisor, the authenticator and the periodic sweep that
//! enforces the grace window and idle timeout.

use crate::auth::{Authenticator, ServerRateLimits, TokenAuthenticator};
use crate::config::ServerConfig;
use crate::relay::{ConnectionRegistry, RelayEngine};
use crate::session::{JsonlHistory, NullSink, SessionEventSink, SessionSupervisor};
use crate::ssh::{SshConnector, SystemSshConnector};
use crate::transport::{tls, websocket};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use termrelay_core::{generate_secret, RelayError, RelayResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The terminal relay server.
pub struct RelayServer {
    config: ServerConfig,
    auth: Arc<dyn Authenticator>,
    supervisor: Arc<SessionSupervisor>,
    engine: Arc<RelayEngine>,
    rate_limits: Arc<Mutex<ServerRateLimits>>,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Assemble a server from explicit collaborators.
    pub fn new(
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        ssh: Arc<dyn SshConnector>,
        events: Arc<dyn SessionEventSink>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let supervisor = SessionSupervisor::new(
            registry,
            config.limits.clone(),
            config.shell.clone(),
            ssh,
            events,
        );
        let rate_limits = Arc::new(Mutex::new(ServerRateLimits::default()));
        let shutdown = CancellationToken::new();
        let engine = RelayEngine::new(supervisor.clone(), rate_limits.clone(), shutdown.clone());

        Self {
            config,
            auth,
            supervisor,
            engine,
            rate_limits,
            shutdown,
        }
    }

    /// Assemble a server with the default collaborators for `config`.
    ///
    /// Must be called inside a Tokio runtime (the history writer is a task).
    pub fn from_config(config: ServerConfig) -> RelayResult<Self> {
        let secret = match &config.auth_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("no [auth] secret configured, using a random per-process secret");
                generate_secret()?
            }
        };
        let auth: Arc<dyn Authenticator> = Arc::new(TokenAuthenticator::new(secret));
        let ssh: Arc<dyn SshConnector> =
            Arc::new(SystemSshConnector::new(config.ssh_profiles.clone()));
        let events: Arc<dyn SessionEventSink> = match &config.history_dir {
            Some(dir) => {
                let history = JsonlHistory::spawn(dir)?;
                info!(path = %history.path().display(), "recording session history");
                Arc::new(history)
            }
            None => Arc::new(NullSink),
        };
        Ok(Self::new(config, auth, ssh, events))
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// Cancel to stop accepting and close every session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> RelayResult<()> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Transport(format!("bind {addr} failed: {e}")))?;

        let tls = match (&self.config.tls_cert, &self.config.tls_key) {
            (Some(cert), Some(key)) => Some(tls::load_tls_acceptor(cert, key)?),
            _ => None,
        };
        info!(
            addr = %addr,
            tls = tls.is_some(),
            max_sessions = self.config.limits.max_sessions,
            "termrelay-server ready"
        );

        self.serve(listener, tls).await
    }

    /// Serve connections from `listener` until the shutdown token fires,
    /// then close every session.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> RelayResult<()> {
        let sweeper = tokio::spawn(sweep_loop(
            self.supervisor.clone(),
            self.rate_limits.clone(),
            self.shutdown.clone(),
        ));

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    let server = self.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        server.handle_tcp(stream, remote, tls).await;
                    });
                }
                Err(e) => error!(error = %e, "TCP accept failed"),
            }
        }

        info!("shutting down, closing sessions");
        self.supervisor.shutdown().await;
        if let Err(e) = sweeper.await {
            warn!(error = %e, "sweep task failed");
        }
        Ok(())
    }

    async fn handle_tcp(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        tls: Option<TlsAcceptor>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "set_nodelay failed");
        }
        match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => self.upgrade(stream, remote).await,
                Err(e) => debug!(remote = %remote, error = %e, "TLS handshake failed"),
            },
            None => self.upgrade(stream, remote).await,
        }
    }

    async fn upgrade<S>(self: Arc<Self>, stream: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match websocket::accept(stream, remote, self.auth.as_ref(), &self.rate_limits).await {
            Ok((ws, owner_id)) => {
                self.engine
                    .clone()
                    .serve_connection(ws, owner_id, Some(remote))
                    .await
            }
            Err(e) => debug!(remote = %remote, error = %e, "upgrade failed"),
        }
    }
}

/// Periodic eviction of expired sessions.
async fn sweep_loop(
    supervisor: Arc<SessionSupervisor>,
    rate_limits: Arc<Mutex<ServerRateLimits>>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(supervisor.limits().sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let evicted = supervisor.evict_idle().await;
        if evicted > 0 {
            let remaining = supervisor.count().await;
            info!(evicted, remaining, "sweep evicted sessions");
        }
        rate_limits.lock().gc();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, ShellConfig};
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use termrelay_core::{decode, encode, ErrorCode, Frame, SessionType};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::StatusCode;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const SECRET: [u8; 32] = [42u8; 32];

    async fn start() -> (Arc<RelayServer>, SocketAddr) {
        let file = ServerConfig::parse_file("").unwrap();
        let mut config = ServerConfig::resolve(file, ConfigOverrides::default()).unwrap();
        config.shell = ShellConfig {
            program: "/bin/sh".into(),
            args: Vec::new(),
            env: [("PS1".to_string(), "relay$ ".to_string())].into_iter().collect(),
        };
        let server = Arc::new(RelayServer::new(
            config,
            Arc::new(TokenAuthenticator::new(SECRET.to_vec())),
            Arc::new(SystemSshConnector::new(Vec::new())),
            Arc::new(NullSink),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().serve(listener, None));
        (server, addr)
    }

    async fn connect_as(addr: SocketAddr, owner: &str) -> Client {
        let token = TokenAuthenticator::new(SECRET.to_vec())
            .issue(owner, 60)
            .unwrap();
        let mut request = format!("ws://{addr}/terminal").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {token}").parse().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, frame: &Frame) {
        ws.send(Message::Text(encode(frame).into())).await.unwrap();
    }

    async fn next_frame(ws: &mut Client) -> Frame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("read failed");
            if let Message::Text(text) = message {
                return decode(&text).unwrap();
            }
        }
    }

    fn local_shell() -> Frame {
        Frame::Connect {
            session_id: None,
            session_type: SessionType::LocalShell,
            ssh_profile_id: None,
            rows: Some(24),
            cols: Some(80),
        }
    }

    /// Collect output until `needle` appears.
    async fn read_until(ws: &mut Client, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            if let Frame::Output { data, .. } = next_frame(ws).await {
                seen.push_str(&data);
            }
        }
        seen
    }

    #[tokio::test]
    async fn unauthenticated_upgrade_is_refused() {
        let (server, addr) = start().await;
        let err = tokio_tungstenite::connect_async(format!("ws://{addr}/terminal"))
            .await
            .err()
            .unwrap();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
            }
            other => panic!("expected HTTP 401, got {other:?}"),
        }

        let bad = format!("ws://{addr}/terminal?token=mallory.9999999999.00");
        assert!(tokio_tungstenite::connect_async(bad).await.is_err());
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn fresh_local_shell_runs_commands() {
        let (server, addr) = start().await;
        let mut ws = connect_as(addr, "alice").await;
        send(&mut ws, &local_shell()).await;

        let session_id = match next_frame(&mut ws).await {
            Frame::Connect { session_id, .. } => session_id.unwrap(),
            other => panic!("expected connect ack, got {other:?}"),
        };
        match next_frame(&mut ws).await {
            Frame::Output { data, .. } => {
                assert!(data.contains("relay$ "), "first output: {data:?}")
            }
            other => panic!("expected the shell prompt, got {other:?}"),
        }

        send(
            &mut ws,
            &Frame::Input {
                session_id: Some(session_id),
                data: "echo relay-$((6*7))\n".into(),
            },
        )
        .await;
        read_until(&mut ws, "relay-42").await;

        send(
            &mut ws,
            &Frame::Resize {
                session_id: None,
                data: termrelay_core::TerminalSize::new(40, 120),
            },
        )
        .await;
        send(
            &mut ws,
            &Frame::Input {
                session_id: None,
                data: "stty size\n".into(),
            },
        )
        .await;
        read_until(&mut ws, "40 120").await;

        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn unknown_types_are_ignored_and_malformed_frames_reported() {
        let (server, addr) = start().await;
        let mut ws = connect_as(addr, "alice").await;

        ws.send(Message::Text(r#"{"type":"telemetry","x":1}"#.to_string().into()))
            .await
            .unwrap();
        send(&mut ws, &Frame::Ping).await;
        assert_eq!(next_frame(&mut ws).await, Frame::Pong);

        ws.send(Message::Text("{not json".to_string().into()))
            .await
            .unwrap();
        match next_frame(&mut ws).await {
            Frame::Error { code, .. } => assert_eq!(code, ErrorCode::MalformedFrame),
            other => panic!("expected error frame, got {other:?}"),
        }

        // The connection survives both.
        send(&mut ws, &Frame::Ping).await;
        assert_eq!(next_frame(&mut ws).await, Frame::Pong);
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn input_before_connect_is_not_attached() {
        let (server, addr) = start().await;
        let mut ws = connect_as(addr, "alice").await;
        send(
            &mut ws,
            &Frame::Input {
                session_id: None,
                data: "ls\n".into(),
            },
        )
        .await;
        match next_frame(&mut ws).await {
            Frame::Error { code, .. } => assert_eq!(code, ErrorCode::NotAttached),
            other => panic!("expected error frame, got {other:?}"),
        }
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn reconnect_resumes_and_disconnect_closes() {
        let (server, addr) = start().await;
        let mut first = connect_as(addr, "alice").await;
        send(&mut first, &local_shell()).await;
        let session_id = match next_frame(&mut first).await {
            Frame::Connect { session_id, .. } => session_id.unwrap(),
            other => panic!("expected connect ack, got {other:?}"),
        };

        // Drop the socket without saying goodbye; the session survives.
        drop(first);
        let supervisor = server.supervisor().clone();
        for _ in 0..200 {
            if supervisor.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(supervisor.registry().is_empty());
        assert_eq!(supervisor.count().await, 1);

        let mut second = connect_as(addr, "alice").await;
        send(
            &mut second,
            &Frame::Connect {
                session_id: Some(session_id),
                session_type: SessionType::LocalShell,
                ssh_profile_id: None,
                rows: None,
                cols: None,
            },
        )
        .await;
        match next_frame(&mut second).await {
            Frame::Connect { session_id: ack, .. } => assert_eq!(ack, Some(session_id)),
            other => panic!("expected connect ack, got {other:?}"),
        }
        send(
            &mut second,
            &Frame::Input {
                session_id: Some(session_id),
                data: "echo still-$((1+1))\n".into(),
            },
        )
        .await;
        read_until(&mut second, "still-2").await;

        send(&mut second, &Frame::disconnect(Some(session_id), "done")).await;
        for _ in 0..200 {
            if supervisor.count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(supervisor.count().await, 0);
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn shutdown_notifies_attached_clients() {
        let (server, addr) = start().await;
        let mut ws = connect_as(addr, "alice").await;
        send(&mut ws, &local_shell()).await;
        let _ack = next_frame(&mut ws).await;

        server.shutdown_token().cancel();
        loop {
            match next_frame(&mut ws).await {
                Frame::Disconnect { reason, .. } => {
                    assert_eq!(reason, "server shutdown");
                    break;
                }
                Frame::Output { .. } => continue,
                other => panic!("expected disconnect, got {other:?}"),
            }
        }
        // The socket is closed with a handshake, not reset.
        match tokio::time::timeout(Duration::from_secs(10), ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
