//! Groups (workspaces) — named collections of users that share an IPC
//! namespace folder (`skynet_core::types::GroupFolder`). The `main` group
//! always exists and is the only one with cross-group IPC visibility;
//! every other group is restricted to its own folder.

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::OptionalExtension;
use skynet_core::types::GroupFolder;
use uuid::Uuid;

use crate::error::{Result, UserError};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Group {
    pub id: String,
    pub folder: String,
    pub display_name: String,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Thread-safe store for groups and their membership.
pub struct GroupStore {
    db: Mutex<rusqlite::Connection>,
}

impl GroupStore {
    pub fn new(conn: rusqlite::Connection) -> Self {
        Self { db: Mutex::new(conn) }
    }

    /// Create `main` if it doesn't already exist. Idempotent — safe to call
    /// on every startup.
    pub fn ensure_main_group(&self, created_by: &str) -> Result<Group> {
        if let Some(g) = self.get_by_folder(GroupFolder::MAIN)? {
            return Ok(g);
        }
        self.create_group(GroupFolder::MAIN, "Main", created_by)
    }

    pub fn create_group(&self, folder: &str, display_name: &str, created_by: &str) -> Result<Group> {
        GroupFolder::parse(folder).map_err(UserError::InvalidGroup)?;
        let db = self.db.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO groups (id, folder, display_name, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![id, folder, display_name, created_by, now],
        )?;
        Ok(Group {
            id,
            folder: folder.to_string(),
            display_name: display_name.to_string(),
            created_by: created_by.to_string(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_by_folder(&self, folder: &str) -> Result<Option<Group>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, folder, display_name, created_by, created_at, updated_at
             FROM groups WHERE folder = ?1",
            [folder],
            |row| {
                Ok(Group {
                    id: row.get(0)?,
                    folder: row.get(1)?,
                    display_name: row.get(2)?,
                    created_by: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(UserError::from)
    }

    /// Delete a group by folder name. Refuses to remove `main` — every
    /// install needs at least one elevated namespace.
    pub fn remove_group(&self, folder: &str) -> Result<()> {
        if folder == GroupFolder::MAIN {
            return Err(UserError::InvalidGroup("cannot remove the main group".to_string()));
        }
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM groups WHERE folder = ?1", [folder])?;
        if n == 0 {
            return Err(UserError::InvalidGroup(format!("no such group: {folder}")));
        }
        Ok(())
    }

    pub fn list_groups(&self) -> Result<Vec<Group>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, folder, display_name, created_by, created_at, updated_at
             FROM groups ORDER BY created_at",
        )?;
        let groups = stmt
            .query_map([], |row| {
                Ok(Group {
                    id: row.get(0)?,
                    folder: row.get(1)?,
                    display_name: row.get(2)?,
                    created_by: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    pub fn add_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, added_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![group_id, user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            rusqlite::params![group_id, user_id],
        )?;
        Ok(())
    }

    pub fn is_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            rusqlite::params![group_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn members_of(&self, group_id: &str) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
        let members = stmt
            .query_map([group_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GroupStore {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (id, display_name, role, language, tone, interests, timezone,
                can_install_software, can_use_browser, can_exec_commands, content_filter,
                requires_admin_approval, first_seen_at, last_seen_at, created_at, updated_at)
             VALUES ('u1','Admin','admin','en','friendly','[]','UTC',0,0,0,'moderate',0,'t','t','t','t')",
            [],
        )
        .unwrap();
        GroupStore::new(conn)
    }

    #[test]
    fn ensure_main_group_is_idempotent() {
        let store = store();
        let g1 = store.ensure_main_group("u1").unwrap();
        let g2 = store.ensure_main_group("u1").unwrap();
        assert_eq!(g1.id, g2.id);
        assert_eq!(g1.folder, "main");
    }

    #[test]
    fn create_group_rejects_invalid_folder_name() {
        let store = store();
        assert!(store.create_group("Invalid Name", "x", "u1").is_err());
    }

    #[test]
    fn membership_tracks_add_and_remove() {
        let store = store();
        let g = store.create_group("team-2", "Team Two", "u1").unwrap();
        assert!(!store.is_member(&g.id, "u1").unwrap());
        store.add_member(&g.id, "u1").unwrap();
        assert!(store.is_member(&g.id, "u1").unwrap());
        assert_eq!(store.members_of(&g.id).unwrap(), vec!["u1".to_string()]);
        store.remove_member(&g.id, "u1").unwrap();
        assert!(!store.is_member(&g.id, "u1").unwrap());
    }
}
