//! Threads and posts (spec.md §4.F): a thread is the directory
//! `<uuid>.thread`; a post is the file `<uuid>.post` inside it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{WiredError, WiredResult};
use crate::protocol::{Field, Message};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub uuid: Uuid,
    pub author_nick: String,
    pub author_login: String,
    #[serde(default)]
    pub icon: Vec<u8>,
    pub posted_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    pub subject: String,
    pub text: String,
}

impl Post {
    pub fn new(author_nick: String, author_login: String, subject: String, text: String) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            author_nick,
            author_login,
            icon: Vec::new(),
            posted_at: Utc::now(),
            edited_at: None,
            subject,
            text,
        }
    }

    pub fn to_post_added(&self, board: &str, thread: Uuid) -> Message {
        Message::new("wired.board.post_added")
            .with("wired.board.path", Field::String(board.to_string()))
            .with("wired.board.thread", Field::Uuid(thread))
            .with("wired.board.post", Field::Uuid(self.uuid))
            .with("wired.board.nick", Field::String(self.author_nick.clone()))
            .with("wired.board.post_date", Field::Date(self.posted_at))
            .with("wired.board.subject", Field::String(self.subject.clone()))
            .with("wired.board.text", Field::String(self.text.clone()))
    }

    pub fn to_post_edited(&self, board: &str, thread: Uuid) -> Message {
        Message::new("wired.board.post_edited")
            .with("wired.board.path", Field::String(board.to_string()))
            .with("wired.board.thread", Field::Uuid(thread))
            .with("wired.board.post", Field::Uuid(self.uuid))
            .with("wired.board.text", Field::String(self.text.clone()))
    }
}

pub struct Thread {
    pub uuid: Uuid,
    pub posts: Vec<Post>,
}

pub fn thread_dir_name(uuid: Uuid) -> String {
    format!("{}.thread", uuid)
}

pub fn post_file_name(uuid: Uuid) -> String {
    format!("{}.post", uuid)
}

/// Parses a `<uuid>.thread` directory name back to its uuid, if well-formed.
pub fn parse_thread_dir_name(name: &str) -> Option<Uuid> {
    Uuid::parse_str(name.strip_suffix(".thread")?).ok()
}

pub fn parse_post_file_name(name: &str) -> Option<Uuid> {
    Uuid::parse_str(name.strip_suffix(".post")?).ok()
}

pub fn write_post(thread_dir: &Path, post: &Post) -> WiredResult<()> {
    let path = thread_dir.join(post_file_name(post.uuid));
    let text = toml::to_string_pretty(post)
        .map_err(|e| WiredError::Internal(format!("serializing post: {}", e)))?;
    let tmp = path.with_extension("post.tmp");
    std::fs::write(&tmp, &text).map_err(|e| WiredError::io(e, &tmp))?;
    std::fs::rename(&tmp, &path).map_err(|e| WiredError::io(e, &path))?;
    Ok(())
}

pub fn read_post(path: &Path) -> WiredResult<Post> {
    let text = std::fs::read_to_string(path).map_err(|e| WiredError::io(e, path))?;
    toml::from_str(&text).map_err(|e| WiredError::Internal(format!("parsing post: {}", e)))
}

pub fn read_thread(thread_dir: &Path) -> WiredResult<Thread> {
    let uuid = parse_thread_dir_name(
        thread_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(""),
    )
    .ok_or_else(|| WiredError::Internal(format!("not a thread dir: {}", thread_dir.display())))?;

    let mut posts = Vec::new();
    let entries = std::fs::read_dir(thread_dir).map_err(|e| WiredError::io(e, thread_dir))?;
    for entry in entries {
        let entry = entry.map_err(|e| WiredError::io(e, thread_dir))?;
        let path = entry.path();
        if parse_post_file_name(path.file_name().and_then(|n| n.to_str()).unwrap_or("")).is_some()
        {
            posts.push(read_post(&path)?);
        }
    }
    posts.sort_by_key(|p| p.posted_at);
    Ok(Thread { uuid, posts })
}

pub fn delete_post(thread_dir: &Path, uuid: Uuid) -> WiredResult<()> {
    let path = thread_dir.join(post_file_name(uuid));
    std::fs::remove_file(&path).map_err(|e| WiredError::io(e, &path))
}

pub fn create_thread_dir(board_dir: &Path) -> WiredResult<PathBuf> {
    let uuid = Uuid::new_v4();
    let dir = board_dir.join(thread_dir_name(uuid));
    std::fs::create_dir_all(&dir).map_err(|e| WiredError::io(e, &dir))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_and_post_names_round_trip() {
        let uuid = Uuid::new_v4();
        assert_eq!(parse_thread_dir_name(&thread_dir_name(uuid)), Some(uuid));
        assert_eq!(parse_post_file_name(&post_file_name(uuid)), Some(uuid));
        assert_eq!(parse_thread_dir_name("not-a-uuid.thread"), None);
    }

    #[test]
    fn write_then_read_post_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let post = Post::new(
            "alice".into(),
            "alice".into(),
            "hello".into(),
            "world".into(),
        );
        write_post(dir.path(), &post).unwrap();
        let reread = read_post(&dir.path().join(post_file_name(post.uuid))).unwrap();
        assert_eq!(reread, post);
    }

    #[test]
    fn read_thread_sorts_posts_by_time_and_ignores_stray_files() {
        let board = tempfile::tempdir().unwrap();
        let thread_dir = create_thread_dir(board.path()).unwrap();
        std::fs::write(thread_dir.join("stray.txt"), "ignore me").unwrap();

        let mut first = Post::new("a".into(), "a".into(), "s1".into(), "t1".into());
        first.posted_at = Utc::now() - chrono::Duration::seconds(10);
        let second = Post::new("a".into(), "a".into(), "s2".into(), "t2".into());
        write_post(&thread_dir, &second).unwrap();
        write_post(&thread_dir, &first).unwrap();

        let thread = read_thread(&thread_dir).unwrap();
        assert_eq!(thread.posts.len(), 2);
        assert_eq!(thread.posts[0].uuid, first.uuid);
        assert_eq!(thread.posts[1].uuid, second.uuid);
    }
}
