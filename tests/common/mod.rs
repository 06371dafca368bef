//! Shared fixtures for the crate-level integration tests.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use wired::accounts::Privileges;
use wired::config::WiredConfig;
use wired::protocol::{Field, Message};
use wired::users::session::SessionState;
use wired::users::Session;
use wired::Server;

pub type TestServer = Server<tokio::io::DuplexStream>;

pub async fn test_server() -> (Arc<TestServer>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = WiredConfig::builder(dir.path().join("files"))
        .accounts_dir(dir.path().join("accounts"))
        .boards_dir(dir.path().join("boards"))
        .banlist_path(dir.path().join("banlist"))
        .events_dir(dir.path().join("events"))
        .schema_path("assets/schema.xml")
        .build();
    let server = Server::load(config).await.unwrap();
    (Arc::new(server), dir)
}

/// Registers a fresh session through the registry (so broadcasts and
/// `user_with_id` lookups can find it) and advances it straight to
/// `GaveClientInfo`, matching what `server::acceptor::handshake_and_serve`
/// would have already done before handing off to the dispatch loop.
pub async fn add_session(server: &TestServer) -> (Arc<Session<tokio::io::DuplexStream>>, tokio::io::DuplexStream) {
    let (writer, reader) = tokio::io::duplex(65536);
    let session = server
        .users
        .add(|id| Session::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost".into(), writer))
        .await;
    session.set_state(SessionState::GaveClientInfo).await;
    (session, reader)
}

pub async fn create_account(server: &TestServer, login: &str, password: &str, privileges: Privileges) {
    server
        .accounts
        .create_user(login, password, login.to_string(), None, privileges)
        .await
        .unwrap();
}

pub async fn login(
    server: &TestServer,
    session: &Session<tokio::io::DuplexStream>,
    login_name: &str,
    password: &str,
) -> wired::error::WiredResult<wired::dispatch::handlers::HandlerOutcome> {
    let message = Message::new("wired.send_login")
        .with("wired.user.login", Field::String(login_name.to_string()))
        .with("wired.user.password", Field::String(password.to_string()));
    wired::dispatch::dispatch_one(server, session, &message).await
}
