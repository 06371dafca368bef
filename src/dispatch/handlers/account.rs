//! Account category (spec.md §4.B): password changes, account/group
//! CRUD, and the privileges blob each read/create reply carries.
//!
//! Every mutation that could hand out more than the editor already holds is
//! checked against [`crate::accounts::AccountManager::verify_edit_does_not_escalate`]
//! before it touches the store, mirroring `original_source/wired/accounts.c`'s
//! `wd_account_check_privileges`. Renaming a user or group additionally
//! cascades into every board/dropbox ACL entry naming the old account
//! (spec.md §8 scenario 6), reusing `boards::store::rename_acl_references`'s
//! per-path result the same way `board::rename_board` broadcasts its own
//! rename.

use tokio::io::AsyncWrite;

use crate::accounts::privileges::Privileges;
use crate::broadcast::{self, Category};
use crate::dispatch::handlers::{
    log, login_of, opt_data, opt_string, privileges_of, req_string, require, HandlerOutcome, HandlerResult,
};
use crate::error::WiredError;
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::users::Session;

fn decode_privileges(data: Option<Vec<u8>>, fallback: Privileges) -> Privileges {
    match data {
        Some(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            toml::from_str(&text).unwrap_or(fallback)
        }
        None => fallback,
    }
}

async fn notify_accounts_changed<W>(server: &Server<W>)
where
    W: AsyncWrite + Unpin + Send,
{
    broadcast::broadcast_to_subscribers(server, Category::Accounts, &Message::new("wired.account.accounts_changed")).await;
}

/// Disconnects every live session logged in as `login` (spec.md §8 scenario
/// 6's "a renamed or deleted account's live sessions are not silently left
/// attached to a name that no longer exists"), mirroring
/// `user::disconnect_user`'s `request_disconnect` call.
async fn disconnect_sessions_for<W>(server: &Server<W>, login: &str)
where
    W: AsyncWrite + Unpin + Send,
{
    for session in server.users.users_with_login(login).await {
        session.force_disconnect().await;
    }
}

pub async fn change_password<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.account_change_password, "account_change_password")?;

    let login = login_of(session).await?;
    let password = req_string(message, "wired.account.password")?;
    server.accounts.change_password(&login, &password).await?;

    log::record(server, "change_password", &login, vec![]).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn list_users<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.account_list_accounts, "account_list_accounts")?;

    let mut rows: Vec<Message> = server
        .accounts
        .user_list_messages()
        .await
        .into_iter()
        .map(|m| m.echo_transaction(message))
        .collect();
    rows.push(Message::new("wired.account.user_list.done").echo_transaction(message));
    Ok(HandlerOutcome::Messages(rows))
}

pub async fn list_groups<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.account_list_accounts, "account_list_accounts")?;

    let mut rows: Vec<Message> = server
        .accounts
        .group_list_messages()
        .await
        .into_iter()
        .map(|m| m.echo_transaction(message))
        .collect();
    rows.push(Message::new("wired.account.group_list.done").echo_transaction(message));
    Ok(HandlerOutcome::Messages(rows))
}

pub async fn read_user<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.account_read_accounts, "account_read_accounts")?;

    let name = req_string(message, "wired.account.name")?;
    let account = server.accounts.read_user(&name).await?;
    Ok(HandlerOutcome::Messages(vec![account.to_user_message().echo_transaction(message)]))
}

pub async fn read_group<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.account_read_accounts, "account_read_accounts")?;

    let name = req_string(message, "wired.account.group")?;
    let account = server.accounts.read_group(&name).await?;
    Ok(HandlerOutcome::Messages(vec![account.to_group_message().echo_transaction(message)]))
}

pub async fn create_user<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let editor_privileges = privileges_of(server, session).await?;
    require(editor_privileges.account_create_accounts, "account_create_accounts")?;

    let name = req_string(message, "wired.account.name")?;
    let password = req_string(message, "wired.account.password")?;
    let full_name = opt_string(message, "wired.account.full_name").unwrap_or_default();
    let group = opt_string(message, "wired.account.group");
    let proposed = decode_privileges(opt_data(message, "wired.account.privileges"), Privileges::default());

    crate::accounts::AccountManager::verify_edit_does_not_escalate(&editor_privileges, &proposed)?;

    let account = server
        .accounts
        .create_user(&name, &password, full_name, group, proposed)
        .await?;

    let editor = login_of(session).await?;
    log::record(server, "create_user", &editor, vec![name.clone()]).await;
    notify_accounts_changed(server).await;
    Ok(HandlerOutcome::Messages(vec![account.to_user_message().echo_transaction(message)]))
}

pub async fn create_group<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let editor_privileges = privileges_of(server, session).await?;
    require(editor_privileges.account_create_accounts, "account_create_accounts")?;

    let name = req_string(message, "wired.account.group")?;
    let proposed = decode_privileges(opt_data(message, "wired.account.privileges"), Privileges::default());
    crate::accounts::AccountManager::verify_edit_does_not_escalate(&editor_privileges, &proposed)?;

    let account = server.accounts.create_group(&name, proposed).await?;

    let editor = login_of(session).await?;
    log::record(server, "create_group", &editor, vec![name.clone()]).await;
    notify_accounts_changed(server).await;
    Ok(HandlerOutcome::Messages(vec![account.to_group_message().echo_transaction(message)]))
}

pub async fn edit_user<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let editor_privileges = privileges_of(server, session).await?;
    require(editor_privileges.account_edit_accounts, "account_edit_accounts")?;

    let name = req_string(message, "wired.account.name")?;
    let existing = server.accounts.read_user(&name).await?;
    let full_name = opt_string(message, "wired.account.full_name");
    let group = opt_string(message, "wired.account.group");
    let new_name = opt_string(message, "wired.account.new_name");
    let proposed = decode_privileges(
        opt_data(message, "wired.account.privileges"),
        existing.privileges.clone(),
    );
    if proposed != existing.privileges {
        if proposed.escalates_over(&editor_privileges).is_some() {
            return Err(WiredError::PrivilegeEscalation {
                name: name.clone(),
                privilege: proposed
                    .escalates_over(&editor_privileges)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
    }

    let editor = login_of(session).await?;
    server
        .accounts
        .edit_user(&name, &editor, |account| {
            if let Some(full_name) = full_name.clone() {
                account.full_name = full_name;
            }
            if let Some(group) = group.clone() {
                account.group = Some(group);
            }
            account.privileges = proposed.clone();
        })
        .await?;

    let mut effective_name = name.clone();
    if let Some(new_name) = new_name.filter(|n| n != &name) {
        server.accounts.rename_user(&name, &new_name).await?;
        let changed_paths = server.boards.rename_acl_references(&name, &new_name).await?;
        for path in changed_paths {
            let acl = server.boards.read_acl(&path).await?;
            broadcast::broadcast_to_subscribers(
                server,
                Category::Board(&path),
                &Message::new("wired.board.permissions_changed")
                    .with("wired.board.path", Field::String(path.clone()))
                    .with("wired.board.owner", Field::String(acl.owner))
                    .with("wired.board.group", Field::String(acl.group))
                    .with("wired.board.permissions", Field::Uint32(acl.mode as u32)),
            )
            .await;
        }
        effective_name = new_name;
    }

    log::record(server, "edit_user", &editor, vec![effective_name]).await;
    notify_accounts_changed(server).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn edit_group<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let editor_privileges = privileges_of(server, session).await?;
    require(editor_privileges.account_edit_accounts, "account_edit_accounts")?;

    let name = req_string(message, "wired.account.group")?;
    let existing = server.accounts.read_group(&name).await?;
    let new_name = opt_string(message, "wired.account.new_name");
    let proposed = decode_privileges(
        opt_data(message, "wired.account.privileges"),
        existing.privileges.clone(),
    );
    if proposed != existing.privileges {
        crate::accounts::AccountManager::verify_edit_does_not_escalate(&editor_privileges, &proposed)?;
    }

    let editor = login_of(session).await?;
    server
        .accounts
        .edit_group(&name, &editor, |account| account.privileges = proposed.clone())
        .await?;

    let mut effective_name = name.clone();
    if let Some(new_name) = new_name.filter(|n| n != &name) {
        server.accounts.rename_group(&name, &new_name).await?;
        let changed_paths = server.boards.rename_acl_references(&name, &new_name).await?;
        for path in changed_paths {
            let acl = server.boards.read_acl(&path).await?;
            broadcast::broadcast_to_subscribers(
                server,
                Category::Board(&path),
                &Message::new("wired.board.permissions_changed")
                    .with("wired.board.path", Field::String(path.clone()))
                    .with("wired.board.owner", Field::String(acl.owner))
                    .with("wired.board.group", Field::String(acl.group))
                    .with("wired.board.permissions", Field::Uint32(acl.mode as u32)),
            )
            .await;
        }
        effective_name = new_name;
    }

    log::record(server, "edit_group", &editor, vec![effective_name]).await;
    notify_accounts_changed(server).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn delete_user<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.account_delete_accounts, "account_delete_accounts")?;

    let name = req_string(message, "wired.account.name")?;
    server.accounts.delete_user(&name).await?;
    disconnect_sessions_for(server, &name).await;

    let editor = login_of(session).await?;
    log::record(server, "delete_user", &editor, vec![name]).await;
    notify_accounts_changed(server).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn delete_group<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.account_delete_accounts, "account_delete_accounts")?;

    let name = req_string(message, "wired.account.group")?;
    server.accounts.delete_group(&name).await?;

    let editor = login_of(session).await?;
    log::record(server, "delete_group", &editor, vec![name]).await;
    notify_accounts_changed(server).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn subscribe_accounts<W>(_server: &Server<W>, session: &Session<W>, _message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    session.with_subscriptions(|s| s.accounts = true).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn unsubscribe_accounts<W>(_server: &Server<W>, session: &Session<W>, _message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    session.with_subscriptions(|s| s.accounts = false).await;
    Ok(HandlerOutcome::Okay)
}
