//! The on-disk file search index (spec.md §4.G / §6): a flat, bit-exact
//! binary file the tracker and `file.search` rebuild from a tree walk and
//! read back with a linear scan (the format has no actual B-tree; "search
//! index" names its purpose, not its data structure).
//!
//! Layout:
//! ```text
//! magic:              4 bytes, ASCII "WDIX"
//! version:            u32 BE, = 6
//! files_count:        u32 BE
//! directories_count:  u32 BE
//! files_size:         u64 BE
//! entries...
//! ```
//! Each entry is `entry_length: u32 BE` (byte count of everything that
//! follows, excluding this field itself), `name_length: u32 BE`, `name`
//! (`name_length` bytes of UTF-8, NUL-terminated), and the pre-serialized
//! [`crate::protocol::codec::encode_message`] bytes of a `wired.file.search_list`
//! row for that entry.

use std::collections::HashSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::boards::acl::Viewer;
use crate::error::{WiredError, WiredResult};
use crate::files::tree::{EntryType, FileTree};
use crate::protocol::codec::{decode_message, encode_message};
use crate::protocol::{Field, Message};

const MAGIC: &[u8; 4] = b"WDIX";
const VERSION: u32 = 6;

struct Header {
    files_count: u32,
    directories_count: u32,
    files_size: u64,
}

/// One row: a virtual path plus the pre-built `wired.file.search_list`
/// message the tracker would reply with for that hit.
struct Entry {
    name: String,
    message: Message,
}

fn read_u32(r: &mut impl io::Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(r: &mut impl io::Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Builds the index from scratch: callers append all entries (typically from
/// a `FileTree::list` walk) then call [`IndexWriter::write_to`] to persist.
pub struct IndexWriter {
    entries: Vec<Entry>,
    directories_count: u32,
    files_size: u64,
}

impl IndexWriter {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            directories_count: 0,
            files_size: 0,
        }
    }

    pub fn add_file(&mut self, virtual_path: &str, message: Message) {
        if let Some(Field::Uint64(size)) = message.get("wired.file.data_size") {
            self.files_size += size;
        }
        self.entries.push(Entry {
            name: virtual_path.to_string(),
            message,
        });
    }

    pub fn add_directory(&mut self, virtual_path: &str, message: Message) {
        self.directories_count += 1;
        self.entries.push(Entry {
            name: virtual_path.to_string(),
            message,
        });
    }

    pub fn write_to(&self, path: &Path) -> WiredResult<()> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_be_bytes());
        let files_count = self.entries.len() as u32 - self.directories_count;
        out.extend_from_slice(&files_count.to_be_bytes());
        out.extend_from_slice(&self.directories_count.to_be_bytes());
        out.extend_from_slice(&self.files_size.to_be_bytes());

        for entry in &self.entries {
            let mut body = Vec::new();
            let name_bytes = entry.name.as_bytes();
            body.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
            body.extend_from_slice(name_bytes);
            body.push(0);
            body.extend_from_slice(&encode_message(&entry.message));

            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            out.extend_from_slice(&body);
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &out).map_err(|e| WiredError::io(e, &tmp))?;
        std::fs::rename(&tmp, path).map_err(|e| WiredError::io(e, path))
    }
}

impl Default for IndexWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a built index back, resolving a `file.search` query by linear scan
/// (spec.md does not require sorted/binary-searchable storage, only a
/// bit-exact file format).
pub struct IndexReader {
    header: Header,
    entries: Vec<Entry>,
    /// Paths deleted since the index was last rebuilt; suppressed from
    /// search results until the next rebuild reconciles them.
    tombstones: HashSet<PathBuf>,
}

impl IndexReader {
    pub fn read_from(path: &Path) -> WiredResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| WiredError::io(e, path))?;
        let mut cursor = io::Cursor::new(bytes.as_slice());

        let mut magic = [0u8; 4];
        cursor
            .read_exact(&mut magic)
            .map_err(|e| WiredError::io(e, path))?;
        if &magic != MAGIC {
            return Err(WiredError::Internal(format!(
                "bad index magic in {}",
                path.display()
            )));
        }
        let version = read_u32(&mut cursor).map_err(|e| WiredError::io(e, path))?;
        if version != VERSION {
            return Err(WiredError::Internal(format!(
                "unsupported index version {} in {}",
                version,
                path.display()
            )));
        }
        let files_count = read_u32(&mut cursor).map_err(|e| WiredError::io(e, path))?;
        let directories_count = read_u32(&mut cursor).map_err(|e| WiredError::io(e, path))?;
        let files_size = read_u64(&mut cursor).map_err(|e| WiredError::io(e, path))?;

        let mut entries = Vec::new();
        let total = files_count + directories_count;
        for _ in 0..total {
            let entry_length = read_u32(&mut cursor).map_err(|e| WiredError::io(e, path))?;
            let start = cursor.position() as usize;
            let end = start + entry_length as usize;
            let body = &bytes[start..end];

            let name_length = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
            let name_bytes = &body[4..4 + name_length];
            let name = String::from_utf8_lossy(name_bytes).into_owned();
            // Skip the NUL terminator following the name.
            let message_start = 4 + name_length + 1;
            let message = decode_message(&body[message_start..])?;

            entries.push(Entry { name, message });
            cursor.set_position(end as u64);
        }

        Ok(Self {
            header: Header {
                files_count,
                directories_count,
                files_size,
            },
            entries,
            tombstones: HashSet::new(),
        })
    }

    pub fn files_count(&self) -> u32 {
        self.header.files_count
    }

    pub fn directories_count(&self) -> u32 {
        self.header.directories_count
    }

    pub fn files_size(&self) -> u64 {
        self.header.files_size
    }

    /// Marks a path as removed without rewriting the whole index.
    pub fn tombstone(&mut self, virtual_path: &Path) {
        self.tombstones.insert(virtual_path.to_path_buf());
    }

    /// Case-insensitive substring search over entry names, rewriting each
    /// hit's `wired.file.path` field to be relative to `files_root_prefix`
    /// when it falls under it (spec.md §4.G: a files-root account sees index
    /// hits re-rooted to its own virtual namespace).
    pub fn search(&self, query: &str, files_root_prefix: &str) -> Vec<Message> {
        let needle = query.to_lowercase();
        self.entries
            .iter()
            .filter(|e| !self.tombstones.contains(Path::new(&e.name)))
            .filter(|e| e.name.to_lowercase().contains(&needle))
            .filter_map(|e| rewrite_for_prefix(e, files_root_prefix))
            .collect()
    }
}

/// Walks the whole served tree and writes a fresh index (spec.md §4.G: the
/// original's `wd_files_search_index` rebuild path). Entries are indexed
/// under an admin view so the index covers every dropbox regardless of who
/// eventually queries it; [`IndexReader::search`] re-roots and re-checks
/// nothing beyond the path prefix, so per-query dropbox visibility is only
/// as fresh as the entry's `readable`/`writable` bits were at rebuild time.
pub async fn rebuild(tree: &FileTree, files_root: &Path, index_path: &Path) -> WiredResult<()> {
    let admin = Viewer {
        account_name: "",
        group_name: None,
        extra_groups: &[],
        admin_override: true,
    };
    let entries = tree.list(files_root, "", true, 0, &admin).await?;
    let mut writer = IndexWriter::new();
    for entry in &entries {
        let message = Message::new("wired.file.search_list")
            .with("wired.file.path", Field::String(entry.virtual_path.clone()))
            .with("wired.file.type", Field::Enum(entry.entry_type.into()))
            .with("wired.file.data_size", Field::Uint64(entry.data_size))
            .with("wired.file.rsrc_size", Field::Uint64(entry.resource_size_or_count))
            .with("wired.file.creation_date", Field::Date(entry.creation_time))
            .with("wired.file.modification_date", Field::Date(entry.modification_time))
            .with("wired.file.readable", Field::Bool(entry.readable))
            .with("wired.file.writable", Field::Bool(entry.writable));
        match entry.entry_type {
            EntryType::File => writer.add_file(&entry.virtual_path, message),
            EntryType::Directory | EntryType::Uploads | EntryType::Dropbox => {
                writer.add_directory(&entry.virtual_path, message)
            }
        }
    }
    writer.write_to(index_path)
}

fn rewrite_for_prefix(entry: &Entry, files_root_prefix: &str) -> Option<Message> {
    if files_root_prefix.is_empty() {
        return Some(entry.message.clone());
    }
    let prefix = files_root_prefix.trim_start_matches('/');
    let relative = entry.name.strip_prefix(prefix)?.trim_start_matches('/');
    let mut message = entry.message.clone();
    message.set(
        "wired.file.path",
        Field::String(relative.to_string()),
    );
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(path: &str) -> Message {
        Message::new("wired.file.search_list")
            .with("wired.file.path", Field::String(path.to_string()))
            .with("wired.file.data_size", Field::Uint64(42))
    }

    #[test]
    fn write_then_read_round_trips_header_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.wdix");

        let mut writer = IndexWriter::new();
        writer.add_file("docs/readme.txt", sample_message("docs/readme.txt"));
        writer.add_directory("docs", sample_message("docs"));
        writer.write_to(&path).unwrap();

        let reader = IndexReader::read_from(&path).unwrap();
        assert_eq!(reader.files_count(), 1);
        assert_eq!(reader.directories_count(), 1);
        assert_eq!(reader.files_size(), 42);
    }

    #[test]
    fn search_is_case_insensitive_substring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.wdix");
        let mut writer = IndexWriter::new();
        writer.add_file("Docs/ReadMe.txt", sample_message("Docs/ReadMe.txt"));
        writer.write_to(&path).unwrap();

        let reader = IndexReader::read_from(&path).unwrap();
        let hits = reader.search("readme", "");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn tombstoned_entries_are_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.wdix");
        let mut writer = IndexWriter::new();
        writer.add_file("a.txt", sample_message("a.txt"));
        writer.write_to(&path).unwrap();

        let mut reader = IndexReader::read_from(&path).unwrap();
        assert_eq!(reader.search("a.txt", "").len(), 1);
        reader.tombstone(Path::new("a.txt"));
        assert_eq!(reader.search("a.txt", "").len(), 0);
    }

    #[test]
    fn files_root_prefix_rewrites_hit_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.wdix");
        let mut writer = IndexWriter::new();
        writer.add_file("alice-home/notes.txt", sample_message("alice-home/notes.txt"));
        writer.write_to(&path).unwrap();

        let reader = IndexReader::read_from(&path).unwrap();
        let hits = reader.search("notes", "alice-home");
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].get("wired.file.path").and_then(Field::as_str),
            Some("notes.txt")
        );
    }
}
