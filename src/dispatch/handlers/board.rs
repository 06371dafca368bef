//! Board category (spec.md §4.F): board hierarchy CRUD, threads, posts, and
//! the `wired.board.subscribe_boards` feed.
//!
//! Structural operations (add/rename/move/delete a board, set permissions)
//! are gated purely by privilege. Reading a board and writing into it are
//! additionally gated by its ACL (`boards::acl`) — a viewer can fail ACL
//! even while holding the blanket `board_add_posts` privilege, and vice
//! versa.

use tokio::io::AsyncWrite;
use uuid::Uuid;

use crate::boards::acl::{BoardAcl, Viewer};
use crate::boards::Post;
use crate::broadcast::{self, Category};
use crate::dispatch::handlers::{
    login_of, opt_string, privileges_of, req_string, req_u32, req_uuid, require, HandlerOutcome, HandlerResult,
};
use crate::error::WiredError;
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::users::Session;

/// Owned stand-in for a [`Viewer`], whose fields borrow from an
/// `accounts::Account` that would otherwise not outlive the handler call.
struct ViewerContext {
    account_name: String,
    group_name: Option<String>,
    extra_groups: Vec<String>,
}

impl ViewerContext {
    fn as_viewer(&self) -> Viewer<'_> {
        Viewer {
            account_name: &self.account_name,
            group_name: self.group_name.as_deref(),
            extra_groups: &self.extra_groups,
            admin_override: false,
        }
    }
}

async fn viewer_context<W>(server: &Server<W>, session: &Session<W>) -> crate::error::WiredResult<ViewerContext>
where
    W: AsyncWrite + Unpin + Send,
{
    let login = login_of(session).await?;
    let account = server.accounts.read_user_with_group_overlay(&login).await?;
    Ok(ViewerContext {
        account_name: login,
        group_name: account.group,
        extra_groups: account.groups,
    })
}

fn board_list_message(path: &str, acl: &BoardAcl) -> Message {
    Message::new("wired.board.board_list")
        .with("wired.board.path", Field::String(path.to_string()))
        .with("wired.board.owner", Field::String(acl.owner.clone()))
        .with("wired.board.group", Field::String(acl.group.clone()))
        .with("wired.board.permissions", Field::Uint32(acl.mode as u32))
}

fn post_list_message(path: &str, thread: Uuid, post: &Post) -> Message {
    Message::new("wired.board.post_list")
        .with("wired.board.path", Field::String(path.to_string()))
        .with("wired.board.thread", Field::Uuid(thread))
        .with("wired.board.post", Field::Uuid(post.uuid))
        .with("wired.board.subject", Field::String(post.subject.clone()))
        .with("wired.board.text", Field::String(post.text.clone()))
        .with("wired.board.nick", Field::String(post.author_nick.clone()))
        .with("wired.board.post_date", Field::Date(post.posted_at))
}

pub async fn get_boards<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let ctx = viewer_context(server, session).await?;
    let viewer = ctx.as_viewer();
    let mut out = Vec::new();
    for path in server.boards.list_boards().await? {
        let acl = server.boards.read_acl(&path).await?;
        if acl.readable_by(&viewer) && acl.writable_by(&viewer) {
            out.push(board_list_message(&path, &acl).echo_transaction(message));
        }
    }
    out.push(Message::new("wired.board.board_list.done").echo_transaction(message));
    Ok(HandlerOutcome::Messages(out))
}

pub async fn get_posts<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let path = req_string(message, "wired.board.path")?;
    let ctx = viewer_context(server, session).await?;
    let acl = server.boards.read_acl(&path).await?;
    if !acl.readable_by(&ctx.as_viewer()) {
        return Err(WiredError::PermissionDenied("board_acl_read".to_string()));
    }

    let mut out: Vec<Message> = server
        .boards
        .posts_in_board(&path)
        .await?
        .into_iter()
        .map(|(thread, post)| post_list_message(&path, thread, &post).echo_transaction(message))
        .collect();
    out.push(Message::new("wired.board.post_list.done").echo_transaction(message));
    Ok(HandlerOutcome::Messages(out))
}

pub async fn add_board<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.board_add_boards, "board_add_boards")?;

    let path = req_string(message, "wired.board.path")?;
    let login = login_of(session).await?;
    let acl = BoardAcl {
        owner: opt_string(message, "wired.board.owner").unwrap_or(login),
        group: opt_string(message, "wired.board.group").unwrap_or_default(),
        mode: req_u32_or(message, "wired.board.permissions", default_board_mode()) as u16,
    };
    server.boards.add_board(&path, acl.clone()).await?;

    broadcast::broadcast_to_subscribers(
        server,
        Category::Board(&path),
        &Message::new("wired.board.board_added")
            .with("wired.board.path", Field::String(path.clone()))
            .with("wired.board.owner", Field::String(acl.owner))
            .with("wired.board.group", Field::String(acl.group))
            .with("wired.board.permissions", Field::Uint32(acl.mode as u32)),
    )
    .await;
    Ok(HandlerOutcome::Okay)
}

pub async fn rename_board<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.board_rename_boards, "board_rename_boards")?;

    let path = req_string(message, "wired.board.path")?;
    let new_name = req_string(message, "wired.board.new_name")?;
    server.boards.rename_board(&path, &new_name).await?;

    broadcast::broadcast_to_subscribers(
        server,
        Category::Board(&path),
        &Message::new("wired.board.board_renamed")
            .with("wired.board.path", Field::String(path.clone()))
            .with("wired.board.new_name", Field::String(new_name)),
    )
    .await;
    Ok(HandlerOutcome::Okay)
}

pub async fn move_board<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.board_move_boards, "board_move_boards")?;

    let path = req_string(message, "wired.board.path")?;
    let new_parent = req_string(message, "wired.board.new_path")?;
    let new_path = server.boards.move_board(&path, &new_parent).await?;

    broadcast::broadcast_to_subscribers(
        server,
        Category::Board(&path),
        &Message::new("wired.board.board_moved")
            .with("wired.board.path", Field::String(path.clone()))
            .with("wired.board.new_path", Field::String(new_path)),
    )
    .await;
    Ok(HandlerOutcome::Okay)
}

pub async fn delete_board<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.board_delete_boards, "board_delete_boards")?;

    let path = req_string(message, "wired.board.path")?;
    server.boards.delete_board(&path).await?;

    broadcast::broadcast_to_subscribers(
        server,
        Category::Board(&path),
        &Message::new("wired.board.board_deleted").with("wired.board.path", Field::String(path.clone())),
    )
    .await;
    Ok(HandlerOutcome::Okay)
}

pub async fn set_permissions<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.board_set_permissions, "board_set_permissions")?;

    let path = req_string(message, "wired.board.path")?;
    let existing = server.boards.read_acl(&path).await?;
    let acl = BoardAcl {
        owner: opt_string(message, "wired.board.owner").unwrap_or(existing.owner),
        group: opt_string(message, "wired.board.group").unwrap_or(existing.group),
        mode: req_u32(message, "wired.board.permissions")? as u16,
    };
    server.boards.set_permissions(&path, acl.clone()).await?;

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
    Ok(HandlerOutcome::Okay)
}

pub async fn add_thread<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.board_add_threads, "board_add_threads")?;

    let path = req_string(message, "wired.board.path")?;
    let ctx = viewer_context(server, session).await?;
    let acl = server.boards.read_acl(&path).await?;
    if !acl.writable_by(&ctx.as_viewer()) {
        return Err(WiredError::PermissionDenied("board_acl_write".to_string()));
    }

    let subject = req_string(message, "wired.board.subject")?;
    let text = req_string(message, "wired.board.text")?;
    let thread_id = server.boards.add_thread(&path).await?;
    let login = login_of(session).await?;
    let post = server
        .boards
        .add_post(&path, thread_id, session.nick().await, login, subject, text)
        .await?;

    broadcast::broadcast_to_subscribers(server, Category::Board(&path), &post.to_post_added(&path, thread_id)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn move_thread<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.board_move_boards, "board_move_boards")?;

    let path = req_string(message, "wired.board.path")?;
    let thread_id = req_uuid(message, "wired.board.thread")?;
    let new_path = req_string(message, "wired.board.new_path")?;

    let moved_posts: Vec<Post> = server
        .boards
        .posts_in_board(&path)
        .await?
        .into_iter()
        .filter(|(thread, _)| *thread == thread_id)
        .map(|(_, post)| post)
        .collect();

    server.boards.move_thread(&path, thread_id, &new_path).await?;

    // A move can cross an ACL boundary, so it is not one event: subscribers
    // who could read `path` see the thread vanish, subscribers who can read
    // `new_path` see its posts reappear there. Category-based ACL filtering
    // at delivery time means a subscriber who can read both just sees both,
    // which nets out to an ordinary move from their perspective.
    broadcast::broadcast_to_subscribers(
        server,
        Category::Board(&path),
        &Message::new("wired.board.thread_deleted")
            .with("wired.board.path", Field::String(path))
            .with("wired.board.thread", Field::Uuid(thread_id)),
    )
    .await;
    for post in &moved_posts {
        broadcast::broadcast_to_subscribers(server, Category::Board(&new_path), &post.to_post_added(&new_path, thread_id))
            .await;
    }
    Ok(HandlerOutcome::Okay)
}

pub async fn delete_thread<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.board_delete_all_posts, "board_delete_all_posts")?;

    let path = req_string(message, "wired.board.path")?;
    let thread_id = req_uuid(message, "wired.board.thread")?;
    server.boards.delete_thread(&path, thread_id).await?;

    broadcast::broadcast_to_subscribers(
        server,
        Category::Board(&path),
        &Message::new("wired.board.thread_deleted")
            .with("wired.board.path", Field::String(path.clone()))
            .with("wired.board.thread", Field::Uuid(thread_id)),
    )
    .await;
    Ok(HandlerOutcome::Okay)
}

pub async fn add_post<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.board_add_posts, "board_add_posts")?;

    let path = req_string(message, "wired.board.path")?;
    let ctx = viewer_context(server, session).await?;
    let acl = server.boards.read_acl(&path).await?;
    if !acl.writable_by(&ctx.as_viewer()) {
        return Err(WiredError::PermissionDenied("board_acl_write".to_string()));
    }

    let thread_id = req_uuid(message, "wired.board.thread")?;
    let text = req_string(message, "wired.board.text")?;
    let login = login_of(session).await?;
    let post = server
        .boards
        .add_post(&path, thread_id, session.nick().await, login, String::new(), text)
        .await?;

    broadcast::broadcast_to_subscribers(server, Category::Board(&path), &post.to_post_added(&path, thread_id)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn edit_post<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let path = req_string(message, "wired.board.path")?;
    let thread_id = req_uuid(message, "wired.board.thread")?;
    let post_uuid = req_uuid(message, "wired.board.post")?;
    let login = login_of(session).await?;

    let existing = server.boards.read_post(&path, thread_id, post_uuid).await?;
    let privileges = privileges_of(server, session).await?;
    if existing.author_login == login {
        require(
            privileges.board_edit_own_posts.or(privileges.board_edit_all_posts),
            "board_edit_own_posts",
        )?;
    } else {
        require(privileges.board_edit_all_posts, "board_edit_all_posts")?;
    }

    let text = req_string(message, "wired.board.text")?;
    let post = server
        .boards
        .edit_post(&path, thread_id, post_uuid, existing.subject.clone(), text)
        .await?;

    broadcast::broadcast_to_subscribers(server, Category::Board(&path), &post.to_post_edited(&path, thread_id)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn delete_post<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let path = req_string(message, "wired.board.path")?;
    let thread_id = req_uuid(message, "wired.board.thread")?;
    let post_uuid = req_uuid(message, "wired.board.post")?;
    let login = login_of(session).await?;

    let existing = server.boards.read_post(&path, thread_id, post_uuid).await?;
    let privileges = privileges_of(server, session).await?;
    if existing.author_login == login {
        require(
            privileges.board_delete_own_posts.or(privileges.board_delete_all_posts),
            "board_delete_own_posts",
        )?;
    } else {
        require(privileges.board_delete_all_posts, "board_delete_all_posts")?;
    }

    server.boards.delete_post(&path, thread_id, post_uuid).await?;

    broadcast::broadcast_to_subscribers(
        server,
        Category::Board(&path),
        &Message::new("wired.board.post_deleted")
            .with("wired.board.path", Field::String(path.clone()))
            .with("wired.board.thread", Field::Uuid(thread_id))
            .with("wired.board.post", Field::Uuid(post_uuid)),
    )
    .await;
    Ok(HandlerOutcome::Okay)
}

pub async fn subscribe_boards<W>(_server: &Server<W>, session: &Session<W>, _message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    session.with_subscriptions(|s| s.boards = true).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn unsubscribe_boards<W>(_server: &Server<W>, session: &Session<W>, _message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    session.with_subscriptions(|s| s.boards = false).await;
    Ok(HandlerOutcome::Okay)
}

fn req_u32_or(message: &Message, field: &str, default: u32) -> u32 {
    match message.get(field) {
        Some(Field::Uint32(v)) => *v,
        _ => default,
    }
}

fn default_board_mode() -> u32 {
    (crate::boards::acl::EVERYONE_READ | crate::boards::acl::EVERYONE_WRITE) as u32
}
