//! Path virtualization, folder types, sidecar metadata, and directory
//! listing (spec.md §4.G).
//!
//! Every client-visible path is virtual: an account's `files_root` (if
//! non-empty) is transparently prefixed to resolve the real on-disk path
//! and stripped again before anything is sent back to the client.

use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use crate::boards::acl::{BoardAcl, Viewer};
use crate::error::{WiredError, WiredResult};
use crate::protocol::{Field, Message};

const META_DIR: &str = ".meta";

/// The four folder tags spec.md §4.G distinguishes, stored in the
/// `.meta/type` sidecar (absent => `Directory`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Uploads,
    Dropbox,
}

impl EntryType {
    fn sidecar_tag(self) -> Option<&'static str> {
        match self {
            EntryType::File => None,
            EntryType::Directory => None,
            EntryType::Uploads => Some("uploads"),
            EntryType::Dropbox => Some("dropbox"),
        }
    }

    fn from_sidecar_tag(tag: &str) -> Option<EntryType> {
        match tag {
            "uploads" => Some(EntryType::Uploads),
            "dropbox" => Some(EntryType::Dropbox),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub virtual_path: String,
    pub entry_type: EntryType,
    pub data_size: u64,
    /// Resource fork size for a file, or directory-entry count for a dir.
    pub resource_size_or_count: u64,
    pub creation_time: chrono::DateTime<chrono::Utc>,
    pub modification_time: chrono::DateTime<chrono::Utc>,
    pub is_link: bool,
    pub executable: bool,
    pub label: Option<String>,
    /// Only meaningful for `EntryType::Dropbox`: whether the *listing*
    /// session may read/write it.
    pub readable: bool,
    pub writable: bool,
}

impl FileEntry {
    pub fn to_message(&self) -> Message {
        let mut message = Message::new("wired.file.file_list")
            .with("wired.file.path", Field::String(self.virtual_path.clone()))
            .with("wired.file.type", Field::Enum(self.entry_type.into()))
            .with("wired.file.data_size", Field::Uint64(self.data_size))
            .with(
                "wired.file.creation_date",
                Field::Date(self.creation_time),
            )
            .with(
                "wired.file.modification_date",
                Field::Date(self.modification_time),
            )
            .with("wired.file.link", Field::Bool(self.is_link))
            .with("wired.file.executable", Field::Bool(self.executable))
            .with(
                "wired.file.label",
                Field::String(self.label.clone().unwrap_or_default()),
            )
            .with("wired.file.readable", Field::Bool(self.readable))
            .with("wired.file.writable", Field::Bool(self.writable));
        if matches!(self.entry_type, EntryType::Directory | EntryType::Uploads | EntryType::Dropbox) {
            message.set(
                "wired.file.directory_count",
                Field::Uint32(self.resource_size_or_count as u32),
            );
        } else {
            message.set("wired.file.rsrc_size", Field::Uint64(self.resource_size_or_count));
        }
        message
    }
}

// `EntryType` needs a stable numeric order to serialize as `Field::Enum`.
impl From<EntryType> for i32 {
    fn from(value: EntryType) -> Self {
        match value {
            EntryType::File => 0,
            EntryType::Directory => 1,
            EntryType::Uploads => 2,
            EntryType::Dropbox => 3,
        }
    }
}

impl TryFrom<i32> for EntryType {
    type Error = WiredError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EntryType::File),
            1 => Ok(EntryType::Directory),
            2 => Ok(EntryType::Uploads),
            3 => Ok(EntryType::Dropbox),
            other => Err(WiredError::InvalidMessage {
                name: "wired.file.set_type".to_string(),
                reason: format!("unknown file type {}", other),
            }),
        }
    }
}

/// Rejects `..`, a leading `.`, and any path segment beginning with `.`
/// (spec.md §4.G: "rejects `..`, leading `.`, and strings containing `/.`
/// + `.`").
pub fn validate_virtual_path(path: &str) -> WiredResult<()> {
    if path.is_empty() {
        return Ok(());
    }
    for segment in path.split('/') {
        if segment == ".." || segment.starts_with('.') {
            return Err(WiredError::FileNotFound(path.to_string()));
        }
    }
    Ok(())
}

/// One rwlock guards the whole files subsystem (spec.md §5: "one rwlock per
/// directory subsystem; no finer granularity").
pub struct FileTree {
    root: PathBuf,
    lock: RwLock<()>,
}

impl FileTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: RwLock::new(()),
        }
    }

    /// Resolves a virtual path to its real on-disk path, prefixing the
    /// account's `files_root` override when set.
    pub fn resolve(&self, files_root: &str, virtual_path: &str) -> WiredResult<PathBuf> {
        validate_virtual_path(virtual_path)?;
        let mut real = self.root.clone();
        if !files_root.is_empty() {
            real = real.join(files_root.trim_start_matches('/'));
        }
        if !virtual_path.is_empty() {
            real = real.join(virtual_path.trim_start_matches('/'));
        }
        Ok(real)
    }

    fn type_sidecar(dir: &Path) -> PathBuf {
        dir.join(META_DIR).join("type")
    }

    fn comment_sidecar(path: &Path) -> PathBuf {
        path.join(META_DIR).join("comments")
    }

    fn label_sidecar(path: &Path) -> PathBuf {
        path.join(META_DIR).join("labels")
    }

    fn permissions_sidecar(path: &Path) -> PathBuf {
        path.join(META_DIR).join("permissions")
    }

    pub async fn entry_type(&self, real_path: &Path) -> WiredResult<EntryType> {
        let _guard = self.lock.read().await;
        self.entry_type_locked(real_path)
    }

    fn entry_type_locked(&self, real_path: &Path) -> WiredResult<EntryType> {
        let meta = std::fs::metadata(real_path).map_err(|e| WiredError::io(e, real_path))?;
        if !meta.is_dir() {
            return Ok(EntryType::File);
        }
        let sidecar = Self::type_sidecar(real_path);
        if let Ok(tag) = std::fs::read_to_string(&sidecar) {
            if let Some(ty) = EntryType::from_sidecar_tag(tag.trim()) {
                return Ok(ty);
            }
        }
        Ok(EntryType::Directory)
    }

    /// Sets a directory's type. Setting back to `Directory` deletes the
    /// sidecar rather than writing an empty one (spec.md §4.G).
    pub async fn set_type(&self, real_path: &Path, ty: EntryType) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let sidecar = Self::type_sidecar(real_path);
        match ty.sidecar_tag() {
            Some(tag) => {
                if let Some(parent) = sidecar.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| WiredError::io(e, parent))?;
                }
                write_atomically(&sidecar, tag.as_bytes())?;
            }
            None => {
                if sidecar.exists() {
                    std::fs::remove_file(&sidecar).map_err(|e| WiredError::io(e, &sidecar))?;
                }
            }
        }
        Ok(())
    }

    /// The dropbox ACL stored directly on `real_path`, if it is itself a
    /// dropbox (does not walk up to an ancestor).
    pub async fn own_dropbox_acl(&self, real_path: &Path) -> WiredResult<Option<BoardAcl>> {
        let _guard = self.lock.read().await;
        let path = Self::permissions_sidecar(real_path);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|e| WiredError::io(e, &path))?;
        Ok(BoardAcl::parse_sidecar(&bytes))
    }

    pub async fn set_dropbox_acl(&self, real_path: &Path, acl: &BoardAcl) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let path = Self::permissions_sidecar(real_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WiredError::io(e, parent))?;
        }
        write_atomically(&path, &acl.to_sidecar())
    }

    /// Walks `real_path` up toward `stop_at` (the files root) looking for
    /// the innermost dropbox ACL that governs it (spec.md §3: "any path
    /// under a dropbox inherits the innermost dropbox's ACL").
    pub async fn innermost_dropbox_acl(
        &self,
        stop_at: &Path,
        real_path: &Path,
    ) -> WiredResult<Option<BoardAcl>> {
        let mut current = real_path.to_path_buf();
        loop {
            if self.entry_type_path_exists_as_dropbox(&current).await? {
                return self.own_dropbox_acl(&current).await;
            }
            if current == stop_at || !current.pop() {
                return Ok(None);
            }
        }
    }

    async fn entry_type_path_exists_as_dropbox(&self, path: &Path) -> WiredResult<bool> {
        if !path.is_dir() {
            return Ok(false);
        }
        Ok(self.entry_type(path).await.ok() == Some(EntryType::Dropbox))
    }

    pub async fn comment(&self, real_path: &Path) -> WiredResult<Option<String>> {
        let _guard = self.lock.read().await;
        let path = Self::comment_sidecar(real_path.parent().unwrap_or(real_path));
        Ok(read_sidecar_entry(&path, real_path))
    }

    pub async fn set_comment(&self, real_path: &Path, comment: &str) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let path = Self::comment_sidecar(real_path.parent().unwrap_or(real_path));
        write_sidecar_entry(&path, real_path, comment)
    }

    pub async fn label(&self, real_path: &Path) -> WiredResult<Option<String>> {
        let _guard = self.lock.read().await;
        let path = Self::label_sidecar(real_path.parent().unwrap_or(real_path));
        Ok(read_sidecar_entry(&path, real_path))
    }

    pub async fn set_label(&self, real_path: &Path, label: &str) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        let path = Self::label_sidecar(real_path.parent().unwrap_or(real_path));
        write_sidecar_entry(&path, real_path, label)
    }

    pub async fn create_directory(&self, real_path: &Path) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        if real_path.exists() {
            return Err(WiredError::FileExists(real_path.display().to_string()));
        }
        std::fs::create_dir_all(real_path).map_err(|e| WiredError::io(e, real_path))
    }

    pub async fn delete(&self, real_path: &Path) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        if !real_path.exists() {
            return Err(WiredError::FileNotFound(real_path.display().to_string()));
        }
        if real_path.is_dir() {
            std::fs::remove_dir_all(real_path).map_err(|e| WiredError::io(e, real_path))?;
        } else {
            std::fs::remove_file(real_path).map_err(|e| WiredError::io(e, real_path))?;
        }
        Ok(())
    }

    pub async fn move_entry(&self, src: &Path, dst: &Path) -> WiredResult<()> {
        let _guard = self.lock.write().await;
        if !src.exists() {
            return Err(WiredError::FileNotFound(src.display().to_string()));
        }
        if dst.exists() {
            return Err(WiredError::FileExists(dst.display().to_string()));
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WiredError::io(e, parent))?;
        }
        std::fs::rename(src, dst).map_err(|e| WiredError::io(e, src))
    }

    /// Lists one directory's entries, computing dropbox readable/writable
    /// bits for `viewer` as it goes. `recursive` walks subdirectories up to
    /// `depth_limit` levels (0 = unlimited). An entry inside an unreadable
    /// dropbox still appears as a row, but its children are skipped
    /// (spec.md §4.G / §8 dropbox-isolation scenario).
    pub async fn list(
        &self,
        real_dir: &Path,
        virtual_dir: &str,
        recursive: bool,
        depth_limit: u32,
        viewer: &Viewer<'_>,
    ) -> WiredResult<Vec<FileEntry>> {
        let mut out = Vec::new();
        self.list_into(real_dir, virtual_dir, recursive, depth_limit, 1, viewer, &mut out)
            .await?;
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn list_into<'a>(
        &'a self,
        real_dir: &'a Path,
        virtual_dir: &'a str,
        recursive: bool,
        depth_limit: u32,
        depth: u32,
        viewer: &'a Viewer<'a>,
        out: &'a mut Vec<FileEntry>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = WiredResult<()>> + 'a>> {
        Box::pin(async move {
            let _guard = self.lock.read().await;
            let entries = std::fs::read_dir(real_dir).map_err(|e| WiredError::io(e, real_dir))?;
            for entry in entries {
                let entry = entry.map_err(|e| WiredError::io(e, real_dir))?;
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name == META_DIR {
                    continue;
                }
                let meta = entry.metadata().map_err(|e| WiredError::io(e, &path))?;
                let ty = self.entry_type_locked(&path).unwrap_or(EntryType::File);
                let virtual_path = if virtual_dir.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{}", virtual_dir, name)
                };

                let (readable, writable) = if ty == EntryType::Dropbox {
                    let acl = self.own_dropbox_acl(&path).await?.unwrap_or_default();
                    (acl.readable_by(viewer), acl.writable_by(viewer))
                } else {
                    (true, true)
                };

                let created = meta.created().ok().map(chrono::DateTime::<chrono::Utc>::from);
                let modified = meta.modified().ok().map(chrono::DateTime::<chrono::Utc>::from);

                out.push(FileEntry {
                    virtual_path: virtual_path.clone(),
                    entry_type: ty,
                    data_size: if meta.is_dir() { 0 } else { meta.len() },
                    resource_size_or_count: if meta.is_dir() {
                        std::fs::read_dir(&path).map(|d| d.count() as u64).unwrap_or(0)
                    } else {
                        0
                    },
                    creation_time: created.unwrap_or_else(chrono::Utc::now),
                    modification_time: modified.unwrap_or_else(chrono::Utc::now),
                    is_link: meta.file_type().is_symlink(),
                    executable: is_executable(&meta),
                    label: None,
                    readable,
                    writable,
                });

                let within_depth = depth_limit == 0 || depth < depth_limit;
                if recursive && meta.is_dir() && within_depth && readable {
                    drop(_guard);
                    self.list_into(
                        &path,
                        &virtual_path,
                        recursive,
                        depth_limit,
                        depth + 1,
                        viewer,
                        out,
                    )
                    .await?;
                }
            }
            Ok(())
        })
    }

    /// Placeholder for the platform free-space query (`statvfs`/
    /// `GetDiskFreeSpaceEx`), delegated as an external collaborator per
    /// spec.md §1's out-of-scope list.
    pub fn available_space(&self, _real_dir: &Path) -> u64 {
        u64::MAX
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}

fn write_atomically(path: &Path, contents: &[u8]) -> WiredResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).map_err(|e| WiredError::io(e, &tmp))?;
    std::fs::rename(&tmp, path).map_err(|e| WiredError::io(e, path))
}

/// Comment/label sidecars are one small keyed file per directory mapping
/// entry name -> text, matching the permissions sidecar's "small structured
/// file" idiom rather than one file per entry.
fn read_sidecar_entry(sidecar: &Path, entry_path: &Path) -> Option<String> {
    let name = entry_path.file_name()?.to_str()?;
    let text = std::fs::read_to_string(sidecar).ok()?;
    let map: std::collections::HashMap<String, String> = toml::from_str(&text).ok()?;
    map.get(name).cloned()
}

fn write_sidecar_entry(sidecar: &Path, entry_path: &Path, value: &str) -> WiredResult<()> {
    let name = entry_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| WiredError::FileNotFound(entry_path.display().to_string()))?;
    let mut map: std::collections::HashMap<String, String> = std::fs::read_to_string(sidecar)
        .ok()
        .and_then(|t| toml::from_str(&t).ok())
        .unwrap_or_default();
    map.insert(name.to_string(), value.to_string());
    if let Some(parent) = sidecar.parent() {
        std::fs::create_dir_all(parent).map_err(|e| WiredError::io(e, parent))?;
    }
    let text = toml::to_string_pretty(&map)
        .map_err(|e| WiredError::Internal(format!("serializing sidecar: {}", e)))?;
    write_atomically(sidecar, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewer<'a>() -> Viewer<'a> {
        Viewer {
            account_name: "alice",
            group_name: None,
            extra_groups: &[],
            admin_override: false,
        }
    }

    #[test]
    fn validate_rejects_traversal_and_dotfiles() {
        assert!(validate_virtual_path("a/../b").is_err());
        assert!(validate_virtual_path("a/.hidden").is_err());
        assert!(validate_virtual_path("a/b").is_ok());
    }

    #[tokio::test]
    async fn files_root_override_prefixes_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let tree = FileTree::new(dir.path());
        let real = tree.resolve("alice-home", "docs/readme.txt").unwrap();
        assert_eq!(real, dir.path().join("alice-home").join("docs/readme.txt"));
    }

    #[tokio::test]
    async fn set_type_then_clear_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tree = FileTree::new(dir.path());
        let sub = dir.path().join("drop");
        std::fs::create_dir_all(&sub).unwrap();
        tree.set_type(&sub, EntryType::Dropbox).await.unwrap();
        assert_eq!(tree.entry_type(&sub).await.unwrap(), EntryType::Dropbox);
        tree.set_type(&sub, EntryType::Directory).await.unwrap();
        assert_eq!(tree.entry_type(&sub).await.unwrap(), EntryType::Directory);
    }

    #[tokio::test]
    async fn dropbox_isolation_hides_listing_but_not_existence() {
        let dir = tempfile::tempdir().unwrap();
        let tree = FileTree::new(dir.path());
        let drop = dir.path().join("drop");
        std::fs::create_dir_all(&drop).unwrap();
        tree.set_type(&drop, EntryType::Dropbox).await.unwrap();
        tree.set_dropbox_acl(
            &drop,
            &BoardAcl {
                owner: "carol".into(),
                group: String::new(),
                mode: crate::boards::acl::EVERYONE_WRITE,
            },
        )
        .await
        .unwrap();
        std::fs::write(drop.join("f.dat"), b"hi").unwrap();

        let entries = tree.list(dir.path(), "", true, 0, &viewer()).await.unwrap();
        let drop_entry = entries.iter().find(|e| e.virtual_path == "drop").unwrap();
        assert!(!drop_entry.readable);
        assert!(!entries.iter().any(|e| e.virtual_path == "drop/f.dat"));
    }

    #[tokio::test]
    async fn recursion_respects_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let tree = FileTree::new(dir.path());
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();

        let entries = tree.list(dir.path(), "", true, 2, &viewer()).await.unwrap();
        assert!(entries.iter().any(|e| e.virtual_path == "a"));
        assert!(entries.iter().any(|e| e.virtual_path == "a/b"));
        assert!(!entries.iter().any(|e| e.virtual_path == "a/b/c"));
    }

    #[tokio::test]
    async fn comment_round_trips_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let tree = FileTree::new(dir.path());
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, b"x").unwrap();
        tree.set_comment(&file, "important").await.unwrap();
        assert_eq!(tree.comment(&file).await.unwrap().as_deref(), Some("important"));
    }
}
