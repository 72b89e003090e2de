//! Family Directory
//!
//! SQLite-Datenbank für die Mitglieder der Familie. Der Signalisierungs-
//! Kern liest hier nur Identität und Familienzugehörigkeit; der ephemere
//! Status wird über Presence-Broadcasts gepflegt und beim Start
//! zurückgesetzt.

use crate::signaling::messages::{MemberRole, MemberStatus};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Member not found: {0}")]
    MemberNotFound(String),
}

// ============================================================================
// MEMBER STRUCT
// ============================================================================

/// Familienmitglied mit zuletzt bekanntem Status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub member_id: String,
    pub family_id: String,
    pub name: String,
    pub role: MemberRole,
    pub status: MemberStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Neues Mitglied ohne Zeilen-ID (für INSERT)
#[derive(Debug, Clone)]
pub struct NewMember {
    pub member_id: String,
    pub family_id: String,
    pub name: String,
    pub role: MemberRole,
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Verzeichnis der Familienmitglieder (thread-safe über Mutex)
pub struct FamilyDirectory {
    conn: Mutex<Connection>,
}

impl FamilyDirectory {
    /// Öffnet oder erstellt die Datenbank
    pub fn open() -> Result<Self, DatabaseError> {
        let db_path = Self::database_path()?;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("opening family directory at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        // frischer Start: niemand ist verbunden
        db.set_all_offline()?;

        Ok(db)
    }

    /// In-Memory-Datenbank für Tests
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn database_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs = directories::ProjectDirs::from("app", "skye", "skye").ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine app data directory",
            )
        })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("family.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS members (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                member_id TEXT NOT NULL UNIQUE,
                family_id TEXT NOT NULL,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'OFFLINE',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_members_member_id ON members(member_id)
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_members_family_id ON members(family_id)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Legt ein Mitglied an oder aktualisiert Name/Familie
    pub fn upsert_member(&self, member: NewMember) -> Result<Member, DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO members (member_id, family_id, name, role)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(member_id) DO UPDATE SET
                family_id = excluded.family_id,
                name = excluded.name,
                role = excluded.role,
                updated_at = datetime('now')
            "#,
            params![
                member.member_id,
                member.family_id,
                member.name,
                member.role.as_str()
            ],
        )?;

        Self::get_member_inner(&conn, &member.member_id)
    }

    fn get_member_inner(conn: &Connection, member_id: &str) -> Result<Member, DatabaseError> {
        conn.query_row(
            r#"
            SELECT id, member_id, family_id, name, role, status, created_at, updated_at
            FROM members
            WHERE member_id = ?1
            "#,
            params![member_id],
            Self::row_to_member,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DatabaseError::MemberNotFound(member_id.to_string())
            }
            other => DatabaseError::Sqlite(other),
        })
    }

    fn row_to_member(row: &rusqlite::Row<'_>) -> SqliteResult<Member> {
        let role_raw: String = row.get(4)?;
        let status_raw: String = row.get(5)?;
        let role = MemberRole::parse(&role_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown role {}", role_raw).into(),
            )
        })?;
        let status = MemberStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown status {}", status_raw).into(),
            )
        })?;

        Ok(Member {
            id: row.get(0)?,
            member_id: row.get(1)?,
            family_id: row.get(2)?,
            name: row.get(3)?,
            role,
            status,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    /// Holt ein Mitglied anhand seiner ID
    pub fn get_member(&self, member_id: &str) -> Result<Member, DatabaseError> {
        let conn = self.conn.lock();
        Self::get_member_inner(&conn, member_id)
    }

    /// Alle Mitglieder einer Familie
    pub fn list_family_members(&self, family_id: &str) -> Result<Vec<Member>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, member_id, family_id, name, role, status, created_at, updated_at
            FROM members
            WHERE family_id = ?1
            ORDER BY name ASC
            "#,
        )?;

        let members = stmt
            .query_map(params![family_id], Self::row_to_member)?
            .collect::<SqliteResult<Vec<Member>>>()?;

        Ok(members)
    }

    /// Aktualisiert den Erreichbarkeits-Status eines Mitglieds
    pub fn set_status(&self, member_id: &str, status: MemberStatus) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE members
            SET status = ?2, updated_at = datetime('now')
            WHERE member_id = ?1
            "#,
            params![member_id, status.as_str()],
        )?;
        Ok(())
    }

    /// Setzt alle Mitglieder auf offline
    pub fn set_all_offline(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE members
            SET status = 'OFFLINE', updated_at = datetime('now')
            "#,
            [],
        )?;
        Ok(())
    }

    /// Entfernt ein Mitglied
    pub fn remove_member(&self, member_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            DELETE FROM members
            WHERE member_id = ?1
            "#,
            params![member_id],
        )?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_get_member() {
        let db = FamilyDirectory::open_in_memory().unwrap();

        let member = db
            .upsert_member(NewMember {
                member_id: "p1".to_string(),
                family_id: "fam1".to_string(),
                name: "Papa".to_string(),
                role: MemberRole::Parent,
            })
            .unwrap();

        assert_eq!(member.name, "Papa");
        assert_eq!(member.role, MemberRole::Parent);
        assert_eq!(member.status, MemberStatus::Offline);
    }

    #[test]
    fn test_set_status_roundtrip() {
        let db = FamilyDirectory::open_in_memory().unwrap();
        db.upsert_member(NewMember {
            member_id: "c1".to_string(),
            family_id: "fam1".to_string(),
            name: "Lucas".to_string(),
            role: MemberRole::Child,
        })
        .unwrap();

        db.set_status("c1", MemberStatus::Online).unwrap();
        assert_eq!(db.get_member("c1").unwrap().status, MemberStatus::Online);

        db.set_all_offline().unwrap();
        assert_eq!(db.get_member("c1").unwrap().status, MemberStatus::Offline);
    }

    #[test]
    fn test_list_family_members_is_scoped() {
        let db = FamilyDirectory::open_in_memory().unwrap();
        for (id, family) in [("p1", "fam1"), ("c1", "fam1"), ("x1", "fam2")] {
            db.upsert_member(NewMember {
                member_id: id.to_string(),
                family_id: family.to_string(),
                name: id.to_string(),
                role: MemberRole::Child,
            })
            .unwrap();
        }

        let members = db.list_family_members("fam1").unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.family_id == "fam1"));
    }

    #[test]
    fn test_get_missing_member_is_not_found() {
        let db = FamilyDirectory::open_in_memory().unwrap();
        assert!(matches!(
            db.get_member("nobody"),
            Err(DatabaseError::MemberNotFound(_))
        ));
    }
}
