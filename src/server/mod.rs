//! The root server struct (spec.md §4): owns every subsystem and is handed
//! to each accepted connection as an `Arc`, matching design note §9's
//! requirement to avoid process-wide mutable statics.

pub mod acceptor;

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

use crate::accounts::AccountManager;
use crate::banlist::Banlist;
use crate::boards::BoardStore;
use crate::chat::ChatRegistry;
use crate::config::WiredConfig;
use crate::error::WiredResult;
use crate::eventlog::EventLog;
use crate::files::{index, DirectoryEvents, FileTree};
use crate::protocol::MessageSchema;
use crate::transfers::TransferQueue;
use crate::users::UserRegistry;

/// Every subsystem a connection's dispatch loop needs, held behind an
/// `Arc` and cloned cheaply into each spawned task.
pub struct Server<W> {
    pub config: WiredConfig,
    pub schema: MessageSchema,
    pub accounts: AccountManager,
    pub banlist: Banlist,
    pub users: UserRegistry<W>,
    pub chats: ChatRegistry,
    pub boards: BoardStore,
    pub files: FileTree,
    pub directory_events: DirectoryEvents,
    pub transfers: TransferQueue,
    pub events: EventLog,
    pub started_at: chrono::DateTime<chrono::Utc>,
    last_index_rebuild: RwLock<Option<Instant>>,
}

impl<W> Server<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub async fn load(config: WiredConfig) -> WiredResult<Self> {
        let schema = MessageSchema::load(&config.schema_path)?;
        let accounts = AccountManager::load(
            config.accounts_dir.join("users"),
            config.accounts_dir.join("groups"),
        )
        .await?;
        let banlist = Banlist::load(&config.banlist_path).await?;
        let chats = ChatRegistry::load(chat_topic_path(&config.boards_dir)).await?;
        let boards = BoardStore::new(&config.boards_dir);
        let files = FileTree::new(&config.files);
        let events = EventLog::new(&config.events_dir);

        Ok(Self {
            config,
            schema,
            accounts,
            banlist,
            users: UserRegistry::new(),
            chats,
            boards,
            files,
            directory_events: DirectoryEvents::new(),
            transfers: TransferQueue::new(),
            events,
            started_at: chrono::Utc::now(),
            last_index_rebuild: RwLock::new(None),
        })
    }

    /// Periodic maintenance: ban-expiry sweep, transfer waiting-timeout
    /// sweep, search-index rebuild, and an event-log flush, run from a
    /// background task started in [`acceptor::run`] (spec.md §5 "background
    /// timers").
    pub async fn run_maintenance_sweep(&self) {
        self.banlist.sweep_expired().await;
        let expired = crate::transfers::sweep_waiting_timeouts(
            &self.transfers,
            self.config.transfers.waiting_timeout_secs as i64,
        )
        .await;
        for transfer in expired {
            tracing::debug!(transfer = %transfer.id, "waiting timeout, requeued");
        }
        self.rebuild_search_index_if_due().await;
        if let Err(error) = self.events.flush().await {
            tracing::warn!(%error, "event log flush failed");
        }
    }

    pub fn search_index_path(&self) -> PathBuf {
        self.config.files.join(".wired-search-index")
    }

    /// Rebuilds the search index once `config.index_time` seconds have
    /// elapsed since the last rebuild (`index_time == 0` disables this).
    async fn rebuild_search_index_if_due(&self) {
        if self.config.index_time == 0 {
            return;
        }
        let due = {
            let last = self.last_index_rebuild.read().await;
            match *last {
                Some(at) => at.elapsed().as_secs() >= self.config.index_time,
                None => true,
            }
        };
        if !due {
            return;
        }
        let index_path = self.search_index_path();
        match index::rebuild(&self.files, &self.config.files, &index_path).await {
            Ok(()) => *self.last_index_rebuild.write().await = Some(Instant::now()),
            Err(error) => tracing::warn!(%error, "search index rebuild failed"),
        }
    }
}

fn chat_topic_path(boards_dir: &Path) -> std::path::PathBuf {
    boards_dir
        .parent()
        .unwrap_or(boards_dir)
        .join("chat-topic")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_builds_every_subsystem_from_a_fresh_directory() {
        let dir = tempfile::tempdir().unwrap();
        let schema_path = dir.path().join("schema.xml");
        std::fs::copy(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("assets/schema.xml"),
            &schema_path,
        )
        .unwrap();

        let config = WiredConfig::builder(dir.path().join("files"))
            .accounts_dir(dir.path().join("accounts"))
            .boards_dir(dir.path().join("boards"))
            .banlist_path(dir.path().join("banlist"))
            .events_dir(dir.path().join("events"))
            .schema_path(schema_path)
            .build();

        let server: Server<tokio::io::DuplexStream> = Server::load(config).await.unwrap();
        assert_eq!(server.users.len().await, 0);
    }
}
