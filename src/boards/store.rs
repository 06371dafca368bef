//! Board directory operations (spec.md §4.F): path validation, ACL sidecar
//! storage, and thread/post mutation, all behind one rwlock per the "one
//! rwlock per directory subsystem; no finer granularity" rule (spec.md §5).

use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::boards::acl::BoardAcl;
use crate::boards::thread::{self, Post};
use crate::error::{WiredError, WiredResult};

const META_DIR: &str = ".meta";
const PERMISSIONS_FILE: &str = "permissions";

/// Splits and validates a slash-delimited board path. Rejects `..`, a
/// leading `/`, and empty segments (spec.md §4.F).
pub fn validate_board_path(path: &str) -> WiredResult<Vec<String>> {
    if path.is_empty() {
        return Err(WiredError::BoardNotFound(path.to_string()));
    }
    let mut segments = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() || segment == ".." || segment == "." {
            return Err(WiredError::BoardNotFound(path.to_string()));
        }
        segments.push(segment.to_string());
    }
    Ok(segments)
}

pub struct BoardStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl BoardStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: RwLock::new(()),
        }
    }

    fn dir_for(&self, path: &str) -> WiredResult<PathBuf> {
        let segments = validate_board_path(path)?;
        Ok(segments.iter().fold(self.root.clone(), |acc, s| acc.join(s)))
    }

    fn acl_path(dir: &Path) -> PathBuf {
        dir.join(META_DIR).join(PERMISSIONS_FILE)
    }

    pub async fn add_board(&self, path: &str, acl: BoardAcl) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let dir = self.dir_for(path)?;
        if dir.exists() {
            return Err(WiredError::BoardExists(path.to_string()));
        }
        std::fs::create_dir_all(dir.join(META_DIR)).map_err(|e| WiredError::io(e, &dir))?;
        self.write_acl_at(&dir, &acl)?;
        Ok(())
    }

    pub async fn delete_board(&self, path: &str) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let dir = self.dir_for(path)?;
        if !dir.exists() {
            return Err(WiredError::BoardNotFound(path.to_string()));
        }
        std::fs::remove_dir_all(&dir).map_err(|e| WiredError::io(e, &dir))?;
        Ok(())
    }

    /// Renames the last path segment, keeping the board under the same
    /// parent. Returns the new full path.
    pub async fn rename_board(&self, path: &str, new_name: &str) -> WiredResult<String> {
        let _guard = self.lock.write().await;
        let dir = self.dir_for(path)?;
        if !dir.exists() {
            return Err(WiredError::BoardNotFound(path.to_string()));
        }
        let mut segments = validate_board_path(path)?;
        segments.pop();
        segments.push(new_name.to_string());
        let new_path = segments.join("/");
        let new_dir = self.dir_for(&new_path)?;
        if new_dir.exists() {
            return Err(WiredError::BoardExists(new_path));
        }
        std::fs::rename(&dir, &new_dir).map_err(|e| WiredError::io(e, &dir))?;
        Ok(new_path)
    }

    /// Moves a board (and its whole subtree) under a different parent path.
    /// Returns the new full path.
    pub async fn move_board(&self, path: &str, new_parent: &str) -> WiredResult<String> {
        let _guard = self.lock.write().await;
        let dir = self.dir_for(path)?;
        if !dir.exists() {
            return Err(WiredError::BoardNotFound(path.to_string()));
        }
        let name = validate_board_path(path)?
            .pop()
            .ok_or_else(|| WiredError::BoardNotFound(path.to_string()))?;
        let new_path = if new_parent.is_empty() {
            name
        } else {
            format!("{}/{}", new_parent, name)
        };
        let new_dir = self.dir_for(&new_path)?;
        if new_dir.exists() {
            return Err(WiredError::BoardExists(new_path));
        }
        if let Some(parent) = new_dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WiredError::io(e, parent))?;
        }
        std::fs::rename(&dir, &new_dir).map_err(|e| WiredError::io(e, &dir))?;
        Ok(new_path)
    }

    pub async fn read_acl(&self, path: &str) -> WiredResult<BoardAcl> {
        let _guard = self.lock.read().await;
        let dir = self.dir_for(path)?;
        self.read_acl_at(&dir)
    }

    fn read_acl_at(&self, dir: &Path) -> WiredResult<BoardAcl> {
        let acl_path = Self::acl_path(dir);
        let bytes = std::fs::read(&acl_path).map_err(|e| WiredError::io(e, &acl_path))?;
        BoardAcl::parse_sidecar(&bytes)
            .ok_or_else(|| WiredError::Internal(format!("corrupt ACL sidecar: {}", acl_path.display())))
    }

    fn write_acl_at(&self, dir: &Path, acl: &BoardAcl) -> WiredResult<()> {
        let acl_path = Self::acl_path(dir);
        if let Some(parent) = acl_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WiredError::io(e, parent))?;
        }
        let tmp = acl_path.with_extension("tmp");
        std::fs::write(&tmp, acl.to_sidecar()).map_err(|e| WiredError::io(e, &tmp))?;
        std::fs::rename(&tmp, &acl_path).map_err(|e| WiredError::io(e, &acl_path))?;
        Ok(())
    }

    pub async fn set_permissions(&self, path: &str, acl: BoardAcl) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let dir = self.dir_for(path)?;
        if !dir.exists() {
            return Err(WiredError::BoardNotFound(path.to_string()));
        }
        self.write_acl_at(&dir, &acl)
    }

    /// Every board directory's path relative to `root`, found by walking
    /// the tree for `.meta/permissions` sidecars.
    pub async fn list_boards(&self) -> WiredResult<Vec<String>> {
        let _guard = self.lock.read().await;
        let mut out = Vec::new();
        self.walk_boards(&self.root, &mut out)?;
        Ok(out)
    }

    fn walk_boards(&self, dir: &Path, out: &mut Vec<String>) -> WiredResult<()> {
        if !dir.exists() {
            return Ok(());
        }
        let entries = std::fs::read_dir(dir).map_err(|e| WiredError::io(e, dir))?;
        for entry in entries {
            let entry = entry.map_err(|e| WiredError::io(e, dir))?;
            let path = entry.path();
            if !path.is_dir() || path.file_name().and_then(|n| n.to_str()) == Some(META_DIR) {
                continue;
            }
            if Self::acl_path(&path).exists() {
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
            self.walk_boards(&path, out)?;
        }
        Ok(())
    }

    pub async fn add_thread(&self, path: &str) -> WiredResult<Uuid> {
        let _guard = self.lock.write().await;
        let dir = self.dir_for(path)?;
        if !dir.exists() {
            return Err(WiredError::BoardNotFound(path.to_string()));
        }
        let thread_dir = thread::create_thread_dir(&dir)?;
        thread::parse_thread_dir_name(
            thread_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(""),
        )
        .ok_or_else(|| WiredError::Internal("failed to create thread".to_string()))
    }

    pub async fn add_post(
        &self,
        path: &str,
        thread_id: Uuid,
        author_nick: String,
        author_login: String,
        subject: String,
        text: String,
    ) -> WiredResult<Post> {
        let _guard = self.lock.write().await;
        let board_dir = self.dir_for(path)?;
        let thread_dir = board_dir.join(thread::thread_dir_name(thread_id));
        if !thread_dir.exists() {
            return Err(WiredError::BoardNotFound(format!("{}/{}", path, thread_id)));
        }
        let post = Post::new(author_nick, author_login, subject, text);
        thread::write_post(&thread_dir, &post)?;
        Ok(post)
    }

    pub async fn edit_post(
        &self,
        path: &str,
        thread_id: Uuid,
        post_uuid: Uuid,
        subject: String,
        text: String,
    ) -> WiredResult<Post> {
        let _guard = self.lock.write().await;
        let thread_dir = self.dir_for(path)?.join(thread::thread_dir_name(thread_id));
        let post_path = thread_dir.join(thread::post_file_name(post_uuid));
        let mut post = thread::read_post(&post_path)?;
        post.subject = subject;
        post.text = text;
        post.edited_at = Some(chrono::Utc::now());
        thread::write_post(&thread_dir, &post)?;
        Ok(post)
    }

    pub async fn delete_post(&self, path: &str, thread_id: Uuid, post_uuid: Uuid) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let thread_dir = self.dir_for(path)?.join(thread::thread_dir_name(thread_id));
        thread::delete_post(&thread_dir, post_uuid)
    }

    /// Deletes an entire thread (and every post in it).
    pub async fn delete_thread(&self, path: &str, thread_id: Uuid) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let thread_dir = self.dir_for(path)?.join(thread::thread_dir_name(thread_id));
        if !thread_dir.exists() {
            return Err(WiredError::BoardNotFound(format!("{}/{}", path, thread_id)));
        }
        std::fs::remove_dir_all(&thread_dir).map_err(|e| WiredError::io(e, &thread_dir))
    }

    /// Moves a thread to a different board, keeping its uuid. Returns the
    /// destination board path, for the caller to broadcast against.
    pub async fn move_thread(&self, path: &str, thread_id: Uuid, new_path: &str) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let thread_dir = self.dir_for(path)?.join(thread::thread_dir_name(thread_id));
        if !thread_dir.exists() {
            return Err(WiredError::BoardNotFound(format!("{}/{}", path, thread_id)));
        }
        let dest_board = self.dir_for(new_path)?;
        if !dest_board.exists() {
            return Err(WiredError::BoardNotFound(new_path.to_string()));
        }
        let dest_dir = dest_board.join(thread::thread_dir_name(thread_id));
        if dest_dir.exists() {
            return Err(WiredError::BoardExists(format!("{}/{}", new_path, thread_id)));
        }
        std::fs::rename(&thread_dir, &dest_dir).map_err(|e| WiredError::io(e, &thread_dir))
    }

    pub async fn read_post(&self, path: &str, thread_id: Uuid, post_uuid: Uuid) -> WiredResult<Post> {
        let _guard = self.lock.read().await;
        let thread_dir = self.dir_for(path)?.join(thread::thread_dir_name(thread_id));
        thread::read_post(&thread_dir.join(thread::post_file_name(post_uuid)))
    }

    /// Every post in `path`'s board, grouped by thread.
    pub async fn posts_in_board(&self, path: &str) -> WiredResult<Vec<(Uuid, Post)>> {
        let _guard = self.lock.read().await;
        let dir = self.dir_for(path)?;
        if !dir.exists() {
            return Err(WiredError::BoardNotFound(path.to_string()));
        }
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| WiredError::io(e, &dir))?;
        for entry in entries {
            let entry = entry.map_err(|e| WiredError::io(e, &dir))?;
            let thread_path = entry.path();
            let name = thread_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if thread::parse_thread_dir_name(name).is_none() {
                continue;
            }
            let thread = thread::read_thread(&thread_path)?;
            for post in thread.posts {
                out.push((thread.uuid, post));
            }
        }
        Ok(out)
    }

    /// Rewrites every board's ACL whose owner or group equals `old_name`
    /// (account rename cascade, spec.md §4.F / §8 scenario 6). Returns the
    /// paths of every board that was rewritten, for the caller to
    /// broadcast `permissions_changed` to.
    pub async fn rename_acl_references(&self, old_name: &str, new_name: &str) -> WiredResult<Vec<String>> {
        let paths = self.list_boards().await?;
        let mut changed = Vec::new();
        for path in paths {
            let mut acl = self.read_acl(&path).await?;
            let mut touched = false;
            if acl.owner == old_name {
                acl.owner = new_name.to_string();
                touched = true;
            }
            if acl.group == old_name {
                acl.group = new_name.to_string();
                touched = true;
            }
            if touched {
                self.set_permissions(&path, acl).await?;
                changed.push(path);
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(owner: &str) -> BoardAcl {
        BoardAcl {
            owner: owner.to_string(),
            group: String::new(),
            mode: crate::boards::acl::EVERYONE_READ | crate::boards::acl::EVERYONE_WRITE,
        }
    }

    #[test]
    fn rejects_dotdot_and_leading_slash_and_empty_segments() {
        assert!(validate_board_path("../etc").is_err());
        assert!(validate_board_path("/etc").is_err());
        assert!(validate_board_path("a//b").is_err());
        assert!(validate_board_path("a/b").is_ok());
    }

    #[tokio::test]
    async fn add_then_delete_board_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path());
        store.add_board("general", acl("alice")).await.unwrap();
        assert_eq!(store.list_boards().await.unwrap(), vec!["general".to_string()]);
        store.delete_board("general").await.unwrap();
        assert!(store.list_boards().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_board_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path());
        store.add_board("general", acl("alice")).await.unwrap();
        let result = store.add_board("general", acl("alice")).await;
        assert!(matches!(result, Err(WiredError::BoardExists(_))));
    }

    #[tokio::test]
    async fn thread_and_post_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path());
        store.add_board("g", acl("alice")).await.unwrap();
        let thread_id = store.add_thread("g").await.unwrap();
        let post = store
            .add_post("g", thread_id, "alice".into(), "alice".into(), "hi".into(), "body".into())
            .await
            .unwrap();

        let posts = store.posts_in_board("g").await.unwrap();
        assert_eq!(posts.len(), 1);

        let edited = store
            .edit_post("g", thread_id, post.uuid, "hi2".into(), "body2".into())
            .await
            .unwrap();
        assert_eq!(edited.subject, "hi2");
        assert!(edited.edited_at.is_some());

        store.delete_post("g", thread_id, post.uuid).await.unwrap();
        assert!(store.posts_in_board("g").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_acl_references_rewrites_matching_boards() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path());
        store.add_board("b", acl("alice")).await.unwrap();
        let changed = store.rename_acl_references("alice", "bob").await.unwrap();
        assert_eq!(changed, vec!["b".to_string()]);
        assert_eq!(store.read_acl("b").await.unwrap().owner, "bob");
    }

    #[tokio::test]
    async fn move_board_relocates_whole_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path());
        store.add_board("a", acl("alice")).await.unwrap();
        store.add_board("dest", acl("alice")).await.unwrap();
        let new_path = store.move_board("a", "dest").await.unwrap();
        assert_eq!(new_path, "dest/a");
        assert!(store.read_acl("dest/a").await.is_ok());
    }

    #[tokio::test]
    async fn delete_thread_removes_every_post_in_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path());
        store.add_board("g", acl("alice")).await.unwrap();
        let thread_id = store.add_thread("g").await.unwrap();
        store
            .add_post("g", thread_id, "alice".into(), "alice".into(), "hi".into(), "body".into())
            .await
            .unwrap();
        store.delete_thread("g", thread_id).await.unwrap();
        assert!(store.posts_in_board("g").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn move_thread_relocates_it_to_another_board() {
        let dir = tempfile::tempdir().unwrap();
        let store = BoardStore::new(dir.path());
        store.add_board("a", acl("alice")).await.unwrap();
        store.add_board("b", acl("alice")).await.unwrap();
        let thread_id = store.add_thread("a").await.unwrap();
        store
            .add_post("a", thread_id, "alice".into(), "alice".into(), "hi".into(), "body".into())
            .await
            .unwrap();
        store.move_thread("a", thread_id, "b").await.unwrap();
        assert!(store.posts_in_board("a").await.unwrap().is_empty());
        assert_eq!(store.posts_in_board("b").await.unwrap().len(), 1);
    }
}
