//! Account store (spec.md §4.B): two independent, locked dictionaries of
//! users and groups, plus the operations that sit above them (group
//! overlay, password hashing, list replies, escalation checks).

pub mod privileges;
pub mod store;

use sha1::{Digest, Sha1};

use crate::error::WiredResult;
use crate::protocol::{Field, Message};
use store::{Account, AccountKind, AccountStore};

pub use privileges::Privileges;
pub use store::Account as AccountRecord;

/// Owns the user store and the group store. Held by [`crate::server::Server`].
pub struct AccountManager {
    users: AccountStore,
    groups: AccountStore,
}

impl AccountManager {
    pub async fn load(
        users_dir: impl Into<std::path::PathBuf>,
        groups_dir: impl Into<std::path::PathBuf>,
    ) -> WiredResult<Self> {
        Ok(Self {
            users: AccountStore::load(users_dir, AccountKind::User).await?,
            groups: AccountStore::load(groups_dir, AccountKind::Group).await?,
        })
    }

    pub async fn read_user(&self, name: &str) -> WiredResult<Account> {
        self.users.read(name).await
    }

    pub async fn read_group(&self, name: &str) -> WiredResult<Account> {
        self.groups.read(name).await
    }

    /// Effective privileges: the user's own privileges overlaid on its
    /// group's (if it belongs to one). A user with no group simply gets
    /// its own privileges (every `None` field stays `None`, i.e. "off").
    pub async fn read_user_with_group_overlay(&self, name: &str) -> WiredResult<Account> {
        let mut user = self.users.read(name).await?;
        if let Some(group_name) = user.group.clone() {
            if let Ok(group) = self.groups.read(&group_name).await {
                user.privileges = Privileges::overlay(&user.privileges, &group.privileges);
            }
        }
        Ok(user)
    }

    pub async fn create_user(
        &self,
        name: &str,
        password: &str,
        full_name: String,
        group: Option<String>,
        privileges: Privileges,
    ) -> WiredResult<Account> {
        let account = self.users.create_user(name, hash_password(password)).await?;
        self.users
            .edit(name, name, |a| {
                a.full_name = full_name;
                a.group = group;
                a.privileges = privileges;
            })
            .await?;
        Ok(account)
    }

    pub async fn create_group(&self, name: &str, privileges: Privileges) -> WiredResult<Account> {
        self.groups.create_group(name).await?;
        self.groups
            .edit(name, name, |a| a.privileges = privileges)
            .await
    }

    pub async fn edit_user<F>(&self, name: &str, editor: &str, edit: F) -> WiredResult<Account>
    where
        F: FnOnce(&mut Account),
    {
        self.users.edit(name, editor, edit).await
    }

    pub async fn edit_group<F>(&self, name: &str, editor: &str, edit: F) -> WiredResult<Account>
    where
        F: FnOnce(&mut Account),
    {
        self.groups.edit(name, editor, edit).await
    }

    pub async fn delete_user(&self, name: &str) -> WiredResult<()> {
        self.users.delete(name).await
    }

    pub async fn delete_group(&self, name: &str) -> WiredResult<()> {
        self.groups.delete(name).await
    }

    pub async fn change_password(&self, name: &str, new_password: &str) -> WiredResult<()> {
        self.users
            .change_password(name, hash_password(new_password))
            .await
    }

    pub async fn verify_password(&self, name: &str, password: &str) -> bool {
        match self.users.read(name).await {
            Ok(account) => account.password_hash.as_deref() == Some(&hash_password(password)),
            Err(_) => false,
        }
    }

    /// Renames a user account in place (spec.md §8 scenario 6). The caller
    /// is responsible for cascading the rename into boards' ACL entries.
    pub async fn rename_user(&self, old_name: &str, new_name: &str) -> WiredResult<()> {
        self.users.rename(old_name, new_name).await
    }

    /// Renames a group account and rewrites every user account referencing
    /// it (spec.md §8 scenario 6).
    pub async fn rename_group(&self, old_name: &str, new_name: &str) -> WiredResult<()> {
        self.groups.rename(old_name, new_name).await?;
        self.rename_group_references(old_name, new_name).await
    }

    /// Rewrites every account whose `group` matches `old_name` to `new_name`
    /// (paired with `boards::store`'s rename cascade over ACL entries).
    pub async fn rename_group_references(&self, old_name: &str, new_name: &str) -> WiredResult<()> {
        for account in self.users.list().await {
            if account.group.as_deref() == Some(old_name) {
                self.users
                    .edit(&account.name, "system", |a| {
                        a.group = Some(new_name.to_string())
                    })
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn user_list_messages(&self) -> Vec<Message> {
        self.users
            .list()
            .await
            .into_iter()
            .map(|a| {
                Message::new("wired.account.user_list")
                    .with("wired.account.name", Field::String(a.name))
                    .with("wired.account.full_name", Field::String(a.full_name))
            })
            .collect()
    }

    pub async fn group_list_messages(&self) -> Vec<Message> {
        self.groups
            .list()
            .await
            .into_iter()
            .map(|a| {
                Message::new("wired.account.group_list")
                    .with("wired.account.group", Field::String(a.name))
            })
            .collect()
    }

    /// Pure check: would `edited` (a proposed new privilege set) grant the
    /// target more than `editor`'s own effective privileges allow the
    /// editor to hand out? The dispatcher calls this, then separately
    /// checks `editor` holds `account_edit_accounts`/`account_create_accounts`
    /// itself (spec.md open question (a): the privilege gate stays in the
    /// dispatcher, not here).
    pub fn verify_edit_does_not_escalate(
        editor_privileges: &Privileges,
        proposed: &Privileges,
    ) -> WiredResult<()> {
        if let Some(field) = proposed.escalates_over(editor_privileges) {
            return Err(crate::error::WiredError::PrivilegeEscalation {
                name: String::new(),
                privilege: field.to_string(),
            });
        }
        Ok(())
    }
}

fn hash_password(password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overlay_combines_user_and_group_privileges() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AccountManager::load(dir.path().join("users"), dir.path().join("groups"))
            .await
            .unwrap();
        manager
            .create_group(
                "admins",
                Privileges {
                    account_edit_accounts: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        manager
            .create_user(
                "alice",
                "secret",
                "Alice".into(),
                Some("admins".into()),
                Privileges::default(),
            )
            .await
            .unwrap();

        let effective = manager.read_user_with_group_overlay("alice").await.unwrap();
        assert_eq!(effective.privileges.account_edit_accounts, Some(true));
    }

    #[tokio::test]
    async fn verify_password_checks_the_stored_hash() {
        let dir = tempfile::tempdir().unwrap();
        let manager = AccountManager::load(dir.path().join("users"), dir.path().join("groups"))
            .await
            .unwrap();
        manager
            .create_user("alice", "secret", String::new(), None, Privileges::default())
            .await
            .unwrap();
        assert!(manager.verify_password("alice", "secret").await);
        assert!(!manager.verify_password("alice", "wrong").await);
    }

    #[test]
    fn escalation_check_blocks_unprivileged_grant() {
        let editor = Privileges::default();
        let proposed = Privileges {
            account_delete_accounts: Some(true),
            ..Default::default()
        };
        assert!(AccountManager::verify_edit_does_not_escalate(&editor, &proposed).is_err());
    }
}
