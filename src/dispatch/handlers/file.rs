//! File category (spec.md §4.G): virtual-path listing, metadata, dropbox
//! ACLs, the search index, and directory subscriptions. Transfer admission
//! (`wired.transfer.download_file`/`upload_file`) lives in
//! [`super::transfer`] — this module only covers non-streaming file
//! operations.

use std::path::Path;

use tokio::io::AsyncWrite;

use crate::boards::acl::{BoardAcl, Viewer};
use crate::broadcast::{self, Category};
use crate::dispatch::handlers::{
    login_of, opt_bool, opt_string, opt_u32, privileges_of, req_bool, req_enum, req_string, require,
    HandlerOutcome, HandlerResult,
};
use crate::error::WiredError;
use crate::files::{index, EntryType};
use crate::protocol::{Field, Message};
use crate::server::Server;
use crate::users::Session;

/// Owned stand-in for a [`Viewer`] plus the account's `files_root` prefix,
/// resolved once per request (mirrors `board::ViewerContext`).
struct FileContext {
    files_root: String,
    account_name: String,
    group_name: Option<String>,
    extra_groups: Vec<String>,
    admin_override: bool,
}

impl FileContext {
    fn viewer(&self) -> Viewer<'_> {
        Viewer {
            account_name: &self.account_name,
            group_name: self.group_name.as_deref(),
            extra_groups: &self.extra_groups,
            admin_override: self.admin_override,
        }
    }
}

async fn file_context<W>(server: &Server<W>, session: &Session<W>) -> crate::error::WiredResult<FileContext>
where
    W: AsyncWrite + Unpin + Send,
{
    let login = login_of(session).await?;
    let account = server.accounts.read_user_with_group_overlay(&login).await?;
    let admin_override = account.privileges.file_access_all_dropboxes.unwrap_or(false);
    Ok(FileContext {
        files_root: account.files_root,
        account_name: login,
        group_name: account.group,
        extra_groups: account.groups,
        admin_override,
    })
}

pub(crate) fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => String::new(),
    }
}

pub(crate) async fn notify_directory_changed<W>(server: &Server<W>, virtual_dir: &str)
where
    W: AsyncWrite + Unpin + Send,
{
    let notice = Message::new("wired.file.directory_changed").with("wired.file.path", Field::String(virtual_dir.to_string()));
    broadcast::broadcast_to_subscribers(server, Category::Directory(virtual_dir), &notice).await;
}

pub async fn list_directory<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_list_files, "file_list_files")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let recursive = opt_bool(message, "wired.file.recursive").unwrap_or(false);
    let depth_limit = privileges.file_recursive_list_depth_limit.unwrap_or(0);
    let real = server.files.resolve(&ctx.files_root, &path)?;

    let stop_at = server.files.resolve(&ctx.files_root, "")?;
    let hidden = match server.files.innermost_dropbox_acl(&stop_at, &real).await? {
        Some(acl) => !acl.readable_by(&ctx.viewer()),
        None => false,
    };

    let entries = if hidden {
        Vec::new()
    } else {
        server.files.list(&real, &path, recursive, depth_limit, &ctx.viewer()).await?
    };
    let mut rows: Vec<Message> = entries.iter().map(|e| e.to_message().echo_transaction(message)).collect();
    rows.push(
        Message::new("wired.file.file_list.done")
            .with("wired.file.path", Field::String(path))
            .with("wired.file.free_space", Field::Uint64(server.files.available_space(&real)))
            .echo_transaction(message),
    );
    Ok(HandlerOutcome::Messages(rows))
}

pub async fn get_info<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_get_info, "file_get_info")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let real = server.files.resolve(&ctx.files_root, &path)?;

    let stop_at = server.files.resolve(&ctx.files_root, "")?;
    if let Some(acl) = server.files.innermost_dropbox_acl(&stop_at, &real).await? {
        if !acl.readable_by(&ctx.viewer()) {
            return Err(WiredError::PermissionDenied("board_acl_read".to_string()));
        }
    }

    let ty = server.files.entry_type(&real).await?;
    let meta = std::fs::metadata(&real).map_err(|e| WiredError::io(e, &real))?;

    let mut reply = Message::new("wired.file.info")
        .with("wired.file.path", Field::String(path))
        .with("wired.file.type", Field::Enum(ty.into()))
        .with(
            "wired.file.data_size",
            Field::Uint64(if meta.is_dir() { 0 } else { meta.len() }),
        );
    if let Some(created) = meta.created().ok().map(chrono::DateTime::<chrono::Utc>::from) {
        reply.set("wired.file.creation_date", Field::Date(created));
    }
    if let Some(modified) = meta.modified().ok().map(chrono::DateTime::<chrono::Utc>::from) {
        reply.set("wired.file.modification_date", Field::Date(modified));
    }
    Ok(HandlerOutcome::Messages(vec![reply.echo_transaction(message)]))
}

pub async fn move_file<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let new_path = req_string(message, "wired.file.new_path")?;

    let old_parent = parent_of(&path);
    let new_parent = parent_of(&new_path);
    if old_parent == new_parent {
        require(privileges.file_rename_files, "file_rename_files")?;
    } else {
        require(privileges.file_move_files, "file_move_files")?;
    }

    let real_src = server.files.resolve(&ctx.files_root, &path)?;
    let real_dst = server.files.resolve(&ctx.files_root, &new_path)?;
    server.files.move_entry(&real_src, &real_dst).await?;

    notify_directory_changed(server, &old_parent).await;
    if new_parent != old_parent {
        notify_directory_changed(server, &new_parent).await;
    }
    Ok(HandlerOutcome::Okay)
}

pub async fn create_link<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_create_links, "file_create_links")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let target_path = req_string(message, "wired.file.target_path")?;
    let real_link = server.files.resolve(&ctx.files_root, &path)?;
    let real_target = server.files.resolve(&ctx.files_root, &target_path)?;
    create_symlink(&real_target, &real_link)?;

    notify_directory_changed(server, &parent_of(&path)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn set_type<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_set_type, "file_set_type")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let ty = EntryType::try_from(req_enum(message, "wired.file.type")?)?;
    let real = server.files.resolve(&ctx.files_root, &path)?;
    server.files.set_type(&real, ty).await?;

    notify_directory_changed(server, &parent_of(&path)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn set_comment<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_set_comment, "file_set_comment")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let comment = opt_string(message, "wired.file.comment").unwrap_or_default();
    let real = server.files.resolve(&ctx.files_root, &path)?;
    server.files.set_comment(&real, &comment).await?;

    notify_directory_changed(server, &parent_of(&path)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn set_executable<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_set_executable, "file_set_executable")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let executable = req_bool(message, "wired.file.executable")?;
    let real = server.files.resolve(&ctx.files_root, &path)?;
    set_executable_bit(&real, executable)?;

    notify_directory_changed(server, &parent_of(&path)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn set_permissions<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_set_permissions, "file_set_permissions")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let real = server.files.resolve(&ctx.files_root, &path)?;
    let existing = server.files.own_dropbox_acl(&real).await?.unwrap_or_default();

    let acl = BoardAcl {
        owner: opt_string(message, "wired.board.owner").unwrap_or(existing.owner),
        group: opt_string(message, "wired.board.group").unwrap_or(existing.group),
        mode: opt_u32(message, "wired.board.permissions").map(|v| v as u16).unwrap_or(existing.mode),
    };
    server.files.set_dropbox_acl(&real, &acl).await?;

    notify_directory_changed(server, &parent_of(&path)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn set_label<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_set_comment, "file_set_comment")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let label = opt_string(message, "wired.file.label").unwrap_or_default();
    let real = server.files.resolve(&ctx.files_root, &path)?;
    server.files.set_label(&real, &label).await?;

    notify_directory_changed(server, &parent_of(&path)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn delete<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_delete_files, "file_delete_files")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let real = server.files.resolve(&ctx.files_root, &path)?;
    server.files.delete(&real).await?;

    notify_directory_changed(server, &parent_of(&path)).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn create_directory<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_create_directories, "file_create_directories")?;

    let ctx = file_context(server, session).await?;
    let path = req_string(message, "wired.file.path")?;
    let real = server.files.resolve(&ctx.files_root, &path)?;
    server.files.create_directory(&real).await?;

    notify_directory_changed(server, &parent_of(&path)).await;
    Ok(HandlerOutcome::Okay)
}

/// Uses `file_list_files`: the schema has no dedicated search privilege, and
/// a search is a read-only listing operation over the same namespace.
pub async fn search<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let privileges = privileges_of(server, session).await?;
    require(privileges.file_list_files, "file_list_files")?;

    let ctx = file_context(server, session).await?;
    let query = req_string(message, "wired.file.query")?;

    let index_path = server.search_index_path();
    if !index_path.exists() {
        index::rebuild(&server.files, &server.config.files, &index_path).await?;
    }
    let reader = index::IndexReader::read_from(&index_path)?;

    let mut rows: Vec<Message> = reader
        .search(&query, &ctx.files_root)
        .into_iter()
        .map(|m| m.echo_transaction(message))
        .collect();
    rows.push(Message::new("wired.file.search_list.done").echo_transaction(message));
    Ok(HandlerOutcome::Messages(rows))
}

/// `wired.file.preview_file` has no body in the schema beyond the path and
/// is answered with the same row shape as a listing entry; the original
/// truncates the actual byte preview in a way this tree has no text/binary
/// sniffing counterpart for, so only the metadata row is returned.
pub async fn preview_file<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    get_info(server, session, message).await
}

pub async fn subscribe_directory<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let path = req_string(message, "wired.file.path")?;
    session.with_subscriptions(|s| s.subscribe_directory(path.clone())).await;
    server.directory_events.subscribe(&path, session.id()).await;
    Ok(HandlerOutcome::Okay)
}

pub async fn unsubscribe_directory<W>(server: &Server<W>, session: &Session<W>, message: &Message) -> HandlerResult
where
    W: AsyncWrite + Unpin + Send,
{
    let path = req_string(message, "wired.file.path")?;
    session.with_subscriptions(|s| s.unsubscribe_directory(&path)).await;
    server.directory_events.unsubscribe(&path, session.id()).await;
    Ok(HandlerOutcome::Okay)
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> crate::error::WiredResult<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| WiredError::io(e, link))
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, _link: &Path) -> crate::error::WiredResult<()> {
    Err(WiredError::Internal("links are not supported on this platform".to_string()))
}

#[cfg(unix)]
fn set_executable_bit(real: &Path, executable: bool) -> crate::error::WiredResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(real).map_err(|e| WiredError::io(e, real))?;
    let mut perms = meta.permissions();
    let mode = if executable {
        perms.mode() | 0o111
    } else {
        perms.mode() & !0o111
    };
    perms.set_mode(mode);
    std::fs::set_permissions(real, perms).map_err(|e| WiredError::io(e, real))
}

#[cfg(not(unix))]
fn set_executable_bit(_real: &Path, _executable: bool) -> crate::error::WiredResult<()> {
    Ok(())
}
