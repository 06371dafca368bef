//! Chat rooms (spec.md §4.E): the public room (id 1, persists its topic) and
//! ad-hoc private rooms that vanish once empty.
//!
//! A [`Chat`] only ever stores member/invitee *session ids*, never a
//! `Session` itself — ownership stays with `users::registry::UserRegistry`
//! (spec.md §3 "Ownership": "a Chat holds non-owning references (by session
//! id) to its members"). This also keeps the module free of the `W`
//! transport type parameter that `Session`/`UserRegistry` carry; callers
//! (the dispatcher) resolve ids back into sessions to actually send
//! messages, using `broadcast`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{WiredError, WiredResult};
use crate::protocol::{Field, Message};

/// Id of the always-present public chat room.
pub const PUBLIC_CHAT_ID: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub nick: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl Topic {
    pub fn to_message(&self) -> Message {
        Message::new("wired.chat.topic")
            .with("wired.chat.topic.nick", Field::String(self.nick.clone()))
            .with(
                "wired.chat.topic.date",
                Field::Date(self.timestamp),
            )
            .with("wired.chat.topic.topic", Field::String(self.text.clone()))
    }
}

struct Chat {
    members: Vec<u32>,
    invited: HashSet<u32>,
    topic: Option<Topic>,
}

impl Chat {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            invited: HashSet::new(),
            topic: None,
        }
    }
}

/// `// lock order: users -> chats (this registry) -> individual chat`
/// (spec.md §5). A single rwlock guards the whole chat dictionary; there is
/// no finer per-chat lock because chat member lists are small and mutated
/// infrequently relative to message fan-out, which only reads them.
pub struct ChatRegistry {
    chats: RwLock<HashMap<u32, Chat>>,
    topic_path: PathBuf,
}

impl ChatRegistry {
    /// Creates the registry with the public room already present, loading
    /// its persisted topic from `topic_path` if one exists.
    pub async fn load(topic_path: impl Into<PathBuf>) -> WiredResult<Self> {
        let topic_path = topic_path.into();
        let mut chats = HashMap::new();
        let mut public = Chat::new();
        if topic_path.exists() {
            let text =
                std::fs::read_to_string(&topic_path).map_err(|e| WiredError::io(e, &topic_path))?;
            public.topic = toml::from_str(&text).ok();
        }
        chats.insert(PUBLIC_CHAT_ID, public);
        Ok(Self {
            chats: RwLock::new(chats),
            topic_path,
        })
    }

    /// Allocates a random, non-colliding, non-public chat id and creates an
    /// empty private chat for it.
    pub async fn create_private_chat(&self) -> u32 {
        let mut chats = self.chats.write().await;
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u32 = rng.gen_range(2..u32::MAX);
            if !chats.contains_key(&candidate) {
                break candidate;
            }
        };
        chats.insert(id, Chat::new());
        id
    }

    /// Joins `session_id` to `chat_id` unconditionally, bypassing the
    /// invited-set check `join` applies to private rooms. Used only for a
    /// private chat's creator immediately after `create_private_chat`,
    /// which has no member yet to extend an invitation.
    pub async fn join_as_owner(&self, chat_id: u32, session_id: u32) -> WiredResult<Vec<u32>> {
        let mut chats = self.chats.write().await;
        let chat = chats.get_mut(&chat_id).ok_or(WiredError::ChatNotFound(chat_id))?;
        if chat.members.contains(&session_id) {
            return Err(WiredError::AlreadyOnChat(session_id));
        }
        let existing = chat.members.clone();
        chat.members.push(session_id);
        Ok(existing)
    }

    /// Joins `session_id` to `chat_id`. Public room: unconditional. Private
    /// room: the session must be in the invited set. Returns the member
    /// list *before* this join, for the caller to broadcast a join event to.
    pub async fn join(&self, chat_id: u32, session_id: u32) -> WiredResult<Vec<u32>> {
        let mut chats = self.chats.write().await;
        let chat = chats.get_mut(&chat_id).ok_or(WiredError::ChatNotFound(chat_id))?;
        if chat.members.contains(&session_id) {
            return Err(WiredError::AlreadyOnChat(session_id));
        }
        if chat_id != PUBLIC_CHAT_ID && !chat.invited.contains(&session_id) {
            return Err(WiredError::NotInvitedToChat(session_id));
        }
        let existing = chat.members.clone();
        chat.members.push(session_id);
        chat.invited.remove(&session_id);
        Ok(existing)
    }

    /// Leaves `session_id` from `chat_id`. Returns the remaining members and
    /// whether the chat was destroyed as a result (always `false` for the
    /// public room, which is exempt from destruction).
    pub async fn leave(&self, chat_id: u32, session_id: u32) -> WiredResult<(Vec<u32>, bool)> {
        let mut chats = self.chats.write().await;
        let chat = chats.get_mut(&chat_id).ok_or(WiredError::ChatNotFound(chat_id))?;
        let before = chat.members.len();
        chat.members.retain(|&m| m != session_id);
        if chat.members.len() == before {
            return Err(WiredError::NotOnChat(session_id));
        }
        let remaining = chat.members.clone();
        let destroy = chat_id != PUBLIC_CHAT_ID && chat.members.is_empty();
        if destroy {
            chats.remove(&chat_id);
        }
        Ok((remaining, destroy))
    }

    /// Removes `target` the same way `leave` does, for use by `kick_user`
    /// (the dispatcher checks the kicker's privilege before calling this).
    pub async fn kick_user(&self, chat_id: u32, target: u32) -> WiredResult<(Vec<u32>, bool)> {
        self.leave(chat_id, target).await
    }

    pub async fn members(&self, chat_id: u32) -> WiredResult<Vec<u32>> {
        let chats = self.chats.read().await;
        let chat = chats.get(&chat_id).ok_or(WiredError::ChatNotFound(chat_id))?;
        Ok(chat.members.clone())
    }

    pub async fn is_member(&self, chat_id: u32, session_id: u32) -> bool {
        self.chats
            .read()
            .await
            .get(&chat_id)
            .map(|c| c.members.contains(&session_id))
            .unwrap_or(false)
    }

    pub async fn topic(&self, chat_id: u32) -> WiredResult<Option<Topic>> {
        let chats = self.chats.read().await;
        let chat = chats.get(&chat_id).ok_or(WiredError::ChatNotFound(chat_id))?;
        Ok(chat.topic.clone())
    }

    /// Sets the topic. Persists to disk only for the public room (spec.md
    /// §4.E: "Topic for the public room is persisted to disk on change").
    pub async fn set_topic(&self, chat_id: u32, nick: String, text: String) -> WiredResult<Topic> {
        let topic = Topic {
            nick,
            timestamp: Utc::now(),
            text,
        };
        {
            let mut chats = self.chats.write().await;
            let chat = chats.get_mut(&chat_id).ok_or(WiredError::ChatNotFound(chat_id))?;
            chat.topic = Some(topic.clone());
        }
        if chat_id == PUBLIC_CHAT_ID {
            self.flush_topic(&topic)?;
        }
        Ok(topic)
    }

    fn flush_topic(&self, topic: &Topic) -> WiredResult<()> {
        let text = toml::to_string_pretty(topic)
            .map_err(|e| WiredError::Internal(format!("serializing topic: {}", e)))?;
        let tmp = self.topic_path.with_extension("tmp");
        std::fs::write(&tmp, &text).map_err(|e| WiredError::io(e, &tmp))?;
        std::fs::rename(&tmp, &self.topic_path).map_err(|e| WiredError::io(e, &self.topic_path))?;
        Ok(())
    }

    /// Adds `target` to `chat_id`'s invited set; requires `inviter` already
    /// be a member (the dispatcher checks this before, or this checks it
    /// directly — both equivalent since invites only make sense from inside
    /// a chat).
    pub async fn invite(&self, chat_id: u32, inviter: u32, target: u32) -> WiredResult<()> {
        let mut chats = self.chats.write().await;
        let chat = chats.get_mut(&chat_id).ok_or(WiredError::ChatNotFound(chat_id))?;
        if !chat.members.contains(&inviter) {
            return Err(WiredError::NotOnChat(inviter));
        }
        chat.invited.insert(target);
        Ok(())
    }

    pub async fn decline_invitation(&self, chat_id: u32, target: u32) -> WiredResult<()> {
        let mut chats = self.chats.write().await;
        let chat = chats.get_mut(&chat_id).ok_or(WiredError::ChatNotFound(chat_id))?;
        if !chat.invited.remove(&target) {
            return Err(WiredError::NotInvitedToChat(target));
        }
        Ok(())
    }

    pub async fn exists(&self, chat_id: u32) -> bool {
        self.chats.read().await.contains_key(&chat_id)
    }

    /// Every chat `session_id` currently belongs to, for disconnect-time
    /// cleanup (a session may be a member of the public room and any number
    /// of private rooms at once).
    pub async fn chat_ids_for(&self, session_id: u32) -> Vec<u32> {
        self.chats
            .read()
            .await
            .iter()
            .filter(|(_, chat)| chat.members.contains(&session_id))
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Splits chat text on newlines and drops empty lines (spec.md §4.E
/// `send_say`/`send_me`; §8 boundary: an all-newline `say` fans out zero
/// messages).
pub fn split_say_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn public_chat_exists_at_boot_with_id_one() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChatRegistry::load(dir.path().join("topic")).await.unwrap();
        assert!(registry.exists(PUBLIC_CHAT_ID).await);
        assert_eq!(registry.join(PUBLIC_CHAT_ID, 1).await.unwrap(), Vec::<u32>::new());
    }

    #[tokio::test]
    async fn private_chat_id_is_never_one() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChatRegistry::load(dir.path().join("topic")).await.unwrap();
        for _ in 0..20 {
            assert_ne!(registry.create_private_chat().await, PUBLIC_CHAT_ID);
        }
    }

    #[tokio::test]
    async fn joining_a_private_chat_without_invitation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChatRegistry::load(dir.path().join("topic")).await.unwrap();
        let chat_id = registry.create_private_chat().await;
        let result = registry.join(chat_id, 5).await;
        assert!(matches!(result, Err(WiredError::NotInvitedToChat(5))));
    }

    #[tokio::test]
    async fn invited_session_can_join_private_chat() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChatRegistry::load(dir.path().join("topic")).await.unwrap();
        let chat_id = registry.create_private_chat().await;
        registry.join(chat_id, 1).await.unwrap();
        registry.invite(chat_id, 1, 2).await.unwrap();
        registry.join(chat_id, 2).await.unwrap();
        assert_eq!(registry.members(chat_id).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn private_chat_is_destroyed_when_last_member_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChatRegistry::load(dir.path().join("topic")).await.unwrap();
        let chat_id = registry.create_private_chat().await;
        registry.join(chat_id, 1).await.unwrap();
        let (remaining, destroyed) = registry.leave(chat_id, 1).await.unwrap();
        assert!(remaining.is_empty());
        assert!(destroyed);
        assert!(!registry.exists(chat_id).await);
    }

    #[tokio::test]
    async fn public_chat_survives_becoming_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChatRegistry::load(dir.path().join("topic")).await.unwrap();
        registry.join(PUBLIC_CHAT_ID, 1).await.unwrap();
        let (_, destroyed) = registry.leave(PUBLIC_CHAT_ID, 1).await.unwrap();
        assert!(!destroyed);
        assert!(registry.exists(PUBLIC_CHAT_ID).await);
    }

    #[tokio::test]
    async fn topic_persists_to_disk_for_public_chat_only() {
        let dir = tempfile::tempdir().unwrap();
        let topic_path = dir.path().join("topic");
        let registry = ChatRegistry::load(&topic_path).await.unwrap();
        registry
            .set_topic(PUBLIC_CHAT_ID, "admin".into(), "hello".into())
            .await
            .unwrap();
        assert!(topic_path.exists());

        let chat_id = registry.create_private_chat().await;
        registry.join(chat_id, 1).await.unwrap();
        registry
            .set_topic(chat_id, "admin".into(), "private".into())
            .await
            .unwrap();
        let reloaded = ChatRegistry::load(&topic_path).await.unwrap();
        let topic = reloaded.topic(PUBLIC_CHAT_ID).await.unwrap().unwrap();
        assert_eq!(topic.text, "hello");
    }

    #[tokio::test]
    async fn chat_ids_for_lists_every_chat_a_session_has_joined() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ChatRegistry::load(dir.path().join("topic")).await.unwrap();
        registry.join(PUBLIC_CHAT_ID, 1).await.unwrap();
        let private = registry.create_private_chat().await;
        registry.join(private, 1).await.unwrap();

        let mut ids = registry.chat_ids_for(1).await;
        ids.sort();
        let mut expected = vec![PUBLIC_CHAT_ID, private];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(registry.chat_ids_for(2).await.is_empty());
    }

    #[test]
    fn split_say_drops_empty_lines() {
        assert_eq!(
            split_say_lines("hello\n\nworld\n"),
            vec!["hello".to_string(), "world".to_string()]
        );
        assert!(split_say_lines("\n\n\n").is_empty());
    }
}
