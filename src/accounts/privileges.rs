//! The privilege field table and the user/group overlay rule (spec.md §4.B).
//!
//! Every boolean or numeric capability is `Option<T>`: `None` means "not set
//! on this account, defer to its group." `overlay` implements that rule
//! uniformly instead of repeating `a.or(b)` once per field at every call
//! site, matching the field-driven table the original `accounts.c` builds
//! instead of a fixed struct (`wd_account_privileges_with_user` there walks
//! the same field list this struct's fields enumerate).

use serde::{Deserialize, Serialize};

/// One account's privilege set. Present on both user and group accounts;
/// a user's effective privileges are `overlay(user.privileges,
/// group.privileges)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Privileges {
    pub user_cannot_set_nick: Option<bool>,
    pub user_get_info: Option<bool>,
    pub user_kick_users: Option<bool>,
    pub user_ban_users: Option<bool>,
    pub user_cannot_be_disconnected: Option<bool>,
    pub user_get_users: Option<bool>,

    pub chat_set_topic: Option<bool>,
    pub chat_create_chats: Option<bool>,

    pub message_send_messages: Option<bool>,
    pub message_broadcast: Option<bool>,

    pub news_read_news: Option<bool>,
    pub news_post_news: Option<bool>,
    pub news_clear_news: Option<bool>,

    pub board_add_boards: Option<bool>,
    pub board_rename_boards: Option<bool>,
    pub board_move_boards: Option<bool>,
    pub board_delete_boards: Option<bool>,
    pub board_set_permissions: Option<bool>,
    pub board_add_threads: Option<bool>,
    pub board_add_posts: Option<bool>,
    pub board_edit_own_posts: Option<bool>,
    pub board_edit_all_posts: Option<bool>,
    pub board_delete_own_posts: Option<bool>,
    pub board_delete_all_posts: Option<bool>,

    pub file_list_files: Option<bool>,
    pub file_get_info: Option<bool>,
    pub file_create_directories: Option<bool>,
    pub file_create_links: Option<bool>,
    pub file_move_files: Option<bool>,
    pub file_rename_files: Option<bool>,
    pub file_set_type: Option<bool>,
    pub file_set_comment: Option<bool>,
    pub file_set_permissions: Option<bool>,
    pub file_set_executable: Option<bool>,
    pub file_delete_files: Option<bool>,
    pub file_access_all_dropboxes: Option<bool>,
    pub file_recursive_list_depth_limit: Option<u32>,

    pub transfer_download_files: Option<bool>,
    pub transfer_upload_files: Option<bool>,
    pub transfer_upload_directories: Option<bool>,
    pub transfer_upload_anywhere: Option<bool>,
    pub transfer_download_limit: Option<u32>,
    pub transfer_upload_limit: Option<u32>,
    pub transfer_download_speed_limit: Option<u32>,
    pub transfer_upload_speed_limit: Option<u32>,

    pub account_change_password: Option<bool>,
    pub account_list_accounts: Option<bool>,
    pub account_read_accounts: Option<bool>,
    pub account_create_accounts: Option<bool>,
    pub account_edit_accounts: Option<bool>,
    pub account_delete_accounts: Option<bool>,
    pub account_raise_account_privileges: Option<bool>,

    pub log_view_log: Option<bool>,

    pub settings_get_settings: Option<bool>,
    pub settings_set_settings: Option<bool>,

    pub tracker_list_servers: Option<bool>,
    pub tracker_register_servers: Option<bool>,
}

macro_rules! overlay_field {
    ($user:expr, $group:expr, $field:ident) => {
        $user.$field.or($group.$field)
    };
}

impl Privileges {
    /// Computes effective privileges: each field takes the user's value if
    /// present, else falls back to the group's.
    pub fn overlay(user: &Privileges, group: &Privileges) -> Privileges {
        Privileges {
            user_cannot_set_nick: overlay_field!(user, group, user_cannot_set_nick),
            user_get_info: overlay_field!(user, group, user_get_info),
            user_kick_users: overlay_field!(user, group, user_kick_users),
            user_ban_users: overlay_field!(user, group, user_ban_users),
            user_cannot_be_disconnected: overlay_field!(user, group, user_cannot_be_disconnected),
            user_get_users: overlay_field!(user, group, user_get_users),
            chat_set_topic: overlay_field!(user, group, chat_set_topic),
            chat_create_chats: overlay_field!(user, group, chat_create_chats),
            message_send_messages: overlay_field!(user, group, message_send_messages),
            message_broadcast: overlay_field!(user, group, message_broadcast),
            news_read_news: overlay_field!(user, group, news_read_news),
            news_post_news: overlay_field!(user, group, news_post_news),
            news_clear_news: overlay_field!(user, group, news_clear_news),
            board_add_boards: overlay_field!(user, group, board_add_boards),
            board_rename_boards: overlay_field!(user, group, board_rename_boards),
            board_move_boards: overlay_field!(user, group, board_move_boards),
            board_delete_boards: overlay_field!(user, group, board_delete_boards),
            board_set_permissions: overlay_field!(user, group, board_set_permissions),
            board_add_threads: overlay_field!(user, group, board_add_threads),
            board_add_posts: overlay_field!(user, group, board_add_posts),
            board_edit_own_posts: overlay_field!(user, group, board_edit_own_posts),
            board_edit_all_posts: overlay_field!(user, group, board_edit_all_posts),
            board_delete_own_posts: overlay_field!(user, group, board_delete_own_posts),
            board_delete_all_posts: overlay_field!(user, group, board_delete_all_posts),
            file_list_files: overlay_field!(user, group, file_list_files),
            file_get_info: overlay_field!(user, group, file_get_info),
            file_create_directories: overlay_field!(user, group, file_create_directories),
            file_create_links: overlay_field!(user, group, file_create_links),
            file_move_files: overlay_field!(user, group, file_move_files),
            file_rename_files: overlay_field!(user, group, file_rename_files),
            file_set_type: overlay_field!(user, group, file_set_type),
            file_set_comment: overlay_field!(user, group, file_set_comment),
            file_set_permissions: overlay_field!(user, group, file_set_permissions),
            file_set_executable: overlay_field!(user, group, file_set_executable),
            file_delete_files: overlay_field!(user, group, file_delete_files),
            file_access_all_dropboxes: overlay_field!(user, group, file_access_all_dropboxes),
            file_recursive_list_depth_limit: overlay_field!(
                user,
                group,
                file_recursive_list_depth_limit
            ),
            transfer_download_files: overlay_field!(user, group, transfer_download_files),
            transfer_upload_files: overlay_field!(user, group, transfer_upload_files),
            transfer_upload_directories: overlay_field!(
                user,
                group,
                transfer_upload_directories
            ),
            transfer_upload_anywhere: overlay_field!(user, group, transfer_upload_anywhere),
            transfer_download_limit: overlay_field!(user, group, transfer_download_limit),
            transfer_upload_limit: overlay_field!(user, group, transfer_upload_limit),
            transfer_download_speed_limit: overlay_field!(
                user,
                group,
                transfer_download_speed_limit
            ),
            transfer_upload_speed_limit: overlay_field!(
                user,
                group,
                transfer_upload_speed_limit
            ),
            account_change_password: overlay_field!(user, group, account_change_password),
            account_list_accounts: overlay_field!(user, group, account_list_accounts),
            account_read_accounts: overlay_field!(user, group, account_read_accounts),
            account_create_accounts: overlay_field!(user, group, account_create_accounts),
            account_edit_accounts: overlay_field!(user, group, account_edit_accounts),
            account_delete_accounts: overlay_field!(user, group, account_delete_accounts),
            account_raise_account_privileges: overlay_field!(
                user,
                group,
                account_raise_account_privileges
            ),
            log_view_log: overlay_field!(user, group, log_view_log),
            settings_get_settings: overlay_field!(user, group, settings_get_settings),
            settings_set_settings: overlay_field!(user, group, settings_set_settings),
            tracker_list_servers: overlay_field!(user, group, tracker_list_servers),
            tracker_register_servers: overlay_field!(user, group, tracker_register_servers),
        }
    }

    /// `true` iff `self` would grant the editor's target a strict superset
    /// of `editor`'s own boolean privileges. Used by
    /// `verify_edit_does_not_escalate` (spec.md open question (a) keeps the
    /// privilege check itself in the dispatcher; this is the pure
    /// comparison it calls).
    pub fn escalates_over(&self, editor: &Privileges) -> Option<&'static str> {
        macro_rules! check {
            ($field:ident) => {
                if self.$field.unwrap_or(false) && !editor.$field.unwrap_or(false) {
                    return Some(stringify!($field));
                }
            };
        }
        check!(account_create_accounts);
        check!(account_delete_accounts);
        check!(account_edit_accounts);
        check!(account_raise_account_privileges);
        check!(user_kick_users);
        check!(user_ban_users);
        check!(file_access_all_dropboxes);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_user_value_when_present() {
        let user = Privileges {
            chat_set_topic: Some(true),
            ..Default::default()
        };
        let group = Privileges {
            chat_set_topic: Some(false),
            ..Default::default()
        };
        let effective = Privileges::overlay(&user, &group);
        assert_eq!(effective.chat_set_topic, Some(true));
    }

    #[test]
    fn overlay_falls_back_to_group_when_user_unset() {
        let user = Privileges::default();
        let group = Privileges {
            board_add_boards: Some(true),
            ..Default::default()
        };
        let effective = Privileges::overlay(&user, &group);
        assert_eq!(effective.board_add_boards, Some(true));
    }

    #[test]
    fn escalation_is_detected_for_unprivileged_editor() {
        let editor = Privileges::default();
        let edited = Privileges {
            account_raise_account_privileges: Some(true),
            ..Default::default()
        };
        assert_eq!(
            edited.escalates_over(&editor),
            Some("account_raise_account_privileges")
        );
    }

    #[test]
    fn no_escalation_when_editor_already_has_privilege() {
        let editor = Privileges {
            account_raise_account_privileges: Some(true),
            ..Default::default()
        };
        let edited = Privileges {
            account_raise_account_privileges: Some(true),
            ..Default::default()
        };
        assert_eq!(edited.escalates_over(&editor), None);
    }
}
