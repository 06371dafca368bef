//! Keyed, locked, disk-backed account storage (spec.md §4.B).
//!
//! Users and groups are each a separate [`AccountStore`] instance keyed by
//! account name. Every account is one TOML file under the store's
//! directory; writes go through the store's write lock and are flushed by
//! writing to a sibling temp file and renaming it into place, so a crash
//! mid-write never leaves a half-written account file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::accounts::privileges::Privileges;
use crate::error::{WiredError, WiredResult};
use crate::protocol::{Field, Message};

/// A user or group account. Groups leave `password`, `login_time`, `files`,
/// and `group` unset; they exist only to be overlaid onto users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Non-empty string: transparently prefixed onto every virtual file
    /// path this account uses (spec.md §4.G).
    #[serde(default)]
    pub files_root: String,
    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
    #[serde(default)]
    pub login_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited_by: Option<String>,
    #[serde(default)]
    pub privileges: Privileges,
}

impl Account {
    fn new_user(name: impl Into<String>, password_hash: String) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            full_name: String::new(),
            password_hash: Some(password_hash),
            group: None,
            groups: Vec::new(),
            files_root: String::new(),
            creation_time: now,
            modification_time: now,
            login_time: None,
            edited_by: None,
            privileges: Privileges::default(),
        }
    }

    fn new_group(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            full_name: String::new(),
            password_hash: None,
            group: None,
            groups: Vec::new(),
            files_root: String::new(),
            creation_time: now,
            modification_time: now,
            login_time: None,
            edited_by: None,
            privileges: Privileges::default(),
        }
    }

    /// Serializes this account's privileges as an opaque blob for the
    /// `wired.account.privileges`-carrying field. The schema treats
    /// privileges as `data`; the concrete encoding (bincode-free, a plain
    /// TOML document) is private to this crate.
    pub fn privileges_field(&self) -> Field {
        let encoded = toml::to_string(&self.privileges).unwrap_or_default();
        Field::Data(encoded.into_bytes())
    }

    pub fn to_user_message(&self) -> Message {
        Message::new("wired.account.user")
            .with("wired.account.name", Field::String(self.name.clone()))
            .with(
                "wired.account.full_name",
                Field::String(self.full_name.clone()),
            )
            .with(
                "wired.account.group",
                Field::String(self.group.clone().unwrap_or_default()),
            )
            .with("wired.account.privileges", self.privileges_field())
    }

    pub fn to_group_message(&self) -> Message {
        Message::new("wired.account.group")
            .with("wired.account.group", Field::String(self.name.clone()))
            .with("wired.account.privileges", self.privileges_field())
    }
}

/// A locked, disk-backed dictionary of accounts of one kind (users or
/// groups). The two kinds get independent stores and independent locks
/// (spec.md §5: "two independent read/write-locked dictionaries").
pub struct AccountStore {
    dir: PathBuf,
    kind: AccountKind,
    accounts: RwLock<HashMap<String, Account>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    User,
    Group,
}

impl AccountStore {
    /// Loads every `*.toml` file under `dir` into memory. `dir` is created
    /// if missing.
    pub async fn load(dir: impl Into<PathBuf>, kind: AccountKind) -> WiredResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| WiredError::io(e, &dir))?;

        let mut accounts = HashMap::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| WiredError::io(e, &dir))?;
        for entry in entries {
            let entry = entry.map_err(|e| WiredError::io(e, &dir))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let text = std::fs::read_to_string(&path).map_err(|e| WiredError::io(e, &path))?;
            let account: Account = toml::from_str(&text)
                .map_err(|e| WiredError::Internal(format!("parsing {}: {}", path.display(), e)))?;
            accounts.insert(account.name.clone(), account);
        }

        Ok(Self {
            dir,
            kind,
            accounts: RwLock::new(accounts),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", name))
    }

    fn not_found(&self, name: &str) -> WiredError {
        match self.kind {
            AccountKind::User => WiredError::AccountNotFound(name.to_string()),
            AccountKind::Group => WiredError::AccountNotFound(name.to_string()),
        }
    }

    fn exists(&self, name: &str) -> WiredError {
        WiredError::AccountExists(name.to_string())
    }

    pub async fn read(&self, name: &str) -> WiredResult<Account> {
        self.accounts
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| self.not_found(name))
    }

    pub async fn create(&self, account: Account) -> WiredResult<()> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account.name) {
            return Err(self.exists(&account.name));
        }
        self.flush_to_disk(&account)?;
        accounts.insert(account.name.clone(), account);
        Ok(())
    }

    /// Creates a new user account with a pre-hashed password.
    pub async fn create_user(&self, name: &str, password_hash: String) -> WiredResult<Account> {
        let account = Account::new_user(name, password_hash);
        self.create(account.clone()).await?;
        Ok(account)
    }

    pub async fn create_group(&self, name: &str) -> WiredResult<Account> {
        let account = Account::new_group(name);
        self.create(account.clone()).await?;
        Ok(account)
    }

    /// Applies `edit` to the stored account and flushes. `edit` receives a
    /// mutable reference so callers can update only the fields they mean to
    /// change.
    pub async fn edit<F>(&self, name: &str, editor: &str, edit: F) -> WiredResult<Account>
    where
        F: FnOnce(&mut Account),
    {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(name).ok_or_else(|| self.not_found(name))?;
        edit(account);
        account.modification_time = Utc::now();
        account.edited_by = Some(editor.to_string());
        self.flush_to_disk(account)?;
        Ok(account.clone())
    }

    pub async fn change_password(&self, name: &str, password_hash: String) -> WiredResult<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(name).ok_or_else(|| self.not_found(name))?;
        account.password_hash = Some(password_hash);
        account.modification_time = Utc::now();
        self.flush_to_disk(account)?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> WiredResult<()> {
        let mut accounts = self.accounts.write().await;
        if !accounts.contains_key(name) {
            return Err(self.not_found(name));
        }
        let path = self.path_for(name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| WiredError::io(e, &path))?;
        }
        accounts.remove(name);
        Ok(())
    }

    pub async fn list(&self) -> Vec<Account> {
        self.accounts.read().await.values().cloned().collect()
    }

    pub async fn rename(&self, old_name: &str, new_name: &str) -> WiredResult<()> {
        let mut accounts = self.accounts.write().await;
        if !accounts.contains_key(old_name) {
            return Err(self.not_found(old_name));
        }
        if accounts.contains_key(new_name) {
            return Err(self.exists(new_name));
        }
        let mut account = accounts.remove(old_name).unwrap();
        let old_path = self.path_for(old_name);
        account.name = new_name.to_string();
        self.flush_to_disk(&account)?;
        if old_path.exists() {
            std::fs::remove_file(&old_path).map_err(|e| WiredError::io(e, &old_path))?;
        }
        accounts.insert(new_name.to_string(), account);
        Ok(())
    }

    fn flush_to_disk(&self, account: &Account) -> WiredResult<()> {
        let path = self.path_for(&account.name);
        let text = toml::to_string_pretty(account)
            .map_err(|e| WiredError::Internal(format!("serializing account: {}", e)))?;
        write_atomically(&path, &text)
    }
}

fn write_atomically(path: &Path, contents: &str) -> WiredResult<()> {
    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, contents).map_err(|e| WiredError::io(e, &tmp_path))?;
    std::fs::rename(&tmp_path, path).map_err(|e| WiredError::io(e, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path(), AccountKind::User)
            .await
            .unwrap();
        store.create_user("alice", "hash".into()).await.unwrap();
        let account = store.read("alice").await.unwrap();
        assert_eq!(account.name, "alice");
        assert_eq!(account.password_hash.as_deref(), Some("hash"));
    }

    #[tokio::test]
    async fn create_duplicate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path(), AccountKind::User)
            .await
            .unwrap();
        store.create_user("alice", "hash".into()).await.unwrap();
        let result = store.create_user("alice", "hash2".into()).await;
        assert!(matches!(result, Err(WiredError::AccountExists(_))));
    }

    #[tokio::test]
    async fn edit_persists_and_stamps_editor() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path(), AccountKind::User)
            .await
            .unwrap();
        store.create_user("alice", "hash".into()).await.unwrap();
        store
            .edit("alice", "admin", |a| a.full_name = "Alice Example".into())
            .await
            .unwrap();
        let account = store.read("alice").await.unwrap();
        assert_eq!(account.full_name, "Alice Example");
        assert_eq!(account.edited_by.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn delete_missing_account_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path(), AccountKind::User)
            .await
            .unwrap();
        let result = store.delete("nobody").await;
        assert!(matches!(result, Err(WiredError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn reload_from_disk_recovers_accounts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AccountStore::load(dir.path(), AccountKind::User)
                .await
                .unwrap();
            store.create_user("alice", "hash".into()).await.unwrap();
        }
        let reloaded = AccountStore::load(dir.path(), AccountKind::User)
            .await
            .unwrap();
        assert!(reloaded.read("alice").await.is_ok());
    }
}
