//! TCP listener and per-connection handshake (spec.md §4.K). The TLS
//! handshake cryptography itself is delegated to `tokio-rustls` (spec.md §1
//! non-goal); this module only wires it up and enforces the banlist and
//! accept/handshake timeouts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::dispatch::router;
use crate::error::{WiredError, WiredResult};
use crate::server::Server;
use crate::users::session::{ClientInfo, Session};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(20);

pub type ClientWriter = WriteHalf<TlsStream<tokio::net::TcpStream>>;
pub type ClientReader = ReadHalf<TlsStream<tokio::net::TcpStream>>;

/// Binds every configured address and accepts connections until the process
/// is asked to shut down. Also starts the periodic maintenance sweep
/// (spec.md §5's background timers: ban-expiry, transfer waiting-timeout).
pub async fn run(
    server: Arc<Server<ClientWriter>>,
    tls: TlsAcceptor,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> WiredResult<()> {
    let addresses = if server.config.address.is_empty() {
        vec!["0.0.0.0".to_string()]
    } else {
        server.config.address.clone()
    };

    let mut listeners = Vec::new();
    for address in &addresses {
        let bind_addr: SocketAddr = format!("{}:{}", address, server.config.port)
            .parse()
            .map_err(|e| WiredError::Internal(format!("invalid bind address: {}", e)))?;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| WiredError::io(e, ""))?;
        tracing::info!(%bind_addr, "listening");
        listeners.push(listener);
    }

    {
        let server = server.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {
                        server.run_maintenance_sweep().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    let mut accept_tasks = Vec::new();
    for listener in listeners {
        let server = server.clone();
        let tls = tls.clone();
        let mut shutdown = shutdown.clone();
        accept_tasks.push(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    result = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept()) => result,
                    _ = shutdown.changed() => break,
                };
                let Ok(Ok((socket, peer_addr))) = accepted else {
                    continue;
                };
                let server = server.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    if let Err(error) = handshake_and_serve(server, tls, socket, peer_addr).await {
                        tracing::warn!(%peer_addr, %error, "connection ended");
                    }
                });
            }
        }));
    }

    for task in accept_tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn handshake_and_serve(
    server: Arc<Server<ClientWriter>>,
    tls: TlsAcceptor,
    socket: tokio::net::TcpStream,
    peer_addr: SocketAddr,
) -> WiredResult<()> {
    let (banned, _) = server.banlist.is_banned(peer_addr.ip()).await;
    if banned {
        tracing::info!(%peer_addr, "rejected banned ip");
        return Err(WiredError::PermissionDenied("banned ip".to_string()));
    }

    let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, tls.accept(socket))
        .await
        .map_err(|_| WiredError::Internal("tls handshake timed out".to_string()))?
        .map_err(|e| WiredError::io(e, ""))?;

    let (mut reader, writer) = tokio::io::split(tls_stream);
    let host = peer_addr.ip().to_string();

    let session = server
        .users
        .add(|id| Session::new(id, peer_addr.ip(), host, writer))
        .await;

    let client_info = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        crate::protocol::read_message(&mut reader),
    )
    .await
    .map_err(|_| WiredError::Internal("client handshake timed out".to_string()))?
    .map_err(|e| {
        WiredError::Internal(format!("reading client handshake: {}", e))
    })?;

    if client_info.name() != "wired.client_info" {
        return Err(WiredError::Protocol("expected client_info first".to_string()));
    }
    session
        .set_client_info(ClientInfo {
            application_name: field_string(&client_info, "wired.info.application_name"),
            application_version: field_string(&client_info, "wired.info.application_version"),
            os_name: client_info
                .get("wired.info.os_name")
                .and_then(|f| f.as_str())
                .map(str::to_string),
            os_version: client_info
                .get("wired.info.os_version")
                .and_then(|f| f.as_str())
                .map(str::to_string),
        })
        .await;
    session.set_state(crate::users::session::SessionState::GaveClientInfo).await;
    session.send(&server_info_message(&server)).await?;

    let result = router::serve_connection(server.clone(), session.clone(), reader).await;
    server.users.remove(session.id()).await;
    session.with_subscriptions(|s| s.unsubscribe_all()).await;
    result
}

fn field_string(message: &crate::protocol::Message, field: &str) -> String {
    message
        .get(field)
        .and_then(|f| f.as_str())
        .unwrap_or_default()
        .to_string()
}

fn server_info_message(server: &Server<ClientWriter>) -> crate::protocol::Message {
    use crate::protocol::Field;
    crate::protocol::Message::new("wired.server_info")
        .with("wired.info.name", Field::String(server.config.name.clone()))
        .with(
            "wired.info.description",
            Field::String(server.config.description.clone()),
        )
        .with("wired.info.start_date", Field::Date(server.started_at))
}
