//! SQLite-backed state store
//!
//! Repository over sqlx. Rooms keep their `sensors`/`actions` maps as JSON
//! text columns; `(user_id, room_id)` is unique so room ids are scoped per
//! user. The pool is limited to a single connection, which serializes
//! writers (room-level atomicity is all callers may rely on anyway).

use super::{StateStore, UserRecord, WriteOutcome};
use crate::error::{Error, Result};
use crate::models::{Alert, Room, UserIdentity};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;

/// SqliteStore instance
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if needed.
    ///
    /// `url` is an sqlx SQLite URL, e.g. `sqlite://sensegrid.db` or
    /// `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::Config(format!("invalid database url: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                password TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                room_id TEXT NOT NULL,
                room_name TEXT NOT NULL,
                device_id TEXT NOT NULL,
                sensors TEXT NOT NULL,
                actions TEXT NOT NULL,
                last_seen INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, room_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                alert_id TEXT NOT NULL UNIQUE,
                home_id TEXT NOT NULL,
                snapshot_url TEXT,
                timestamp INTEGER NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("SQLite schema ready");
        Ok(())
    }

    fn row_to_room(row: &sqlx::sqlite::SqliteRow) -> Result<Room> {
        let sensors: String = row.get("sensors");
        let actions: String = row.get("actions");
        Ok(Room {
            room_id: row.get("room_id"),
            room_name: row.get("room_name"),
            device_id: row.get("device_id"),
            sensors: serde_json::from_str(&sensors)?,
            actions: serde_json::from_str(&actions)?,
            last_seen: row.get("last_seen"),
        })
    }

    fn row_to_alert(row: &sqlx::sqlite::SqliteRow) -> Alert {
        Alert {
            alert_id: row.get("alert_id"),
            home_id: row.get("home_id"),
            snapshot_url: row.get("snapshot_url"),
            timestamp: row.get("timestamp"),
            resolved: row.get::<i64, _>("resolved") != 0,
        }
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn create_user(&self, email: &str, name: &str, password: &str) -> Result<UserIdentity> {
        let existing = sqlx::query("SELECT id FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(Error::Conflict(format!("user {} already exists", email)));
        }

        let result = sqlx::query("INSERT INTO users (email, name, password) VALUES (?, ?, ?)")
            .bind(email)
            .bind(name)
            .bind(password)
            .execute(&self.pool)
            .await?;

        Ok(UserIdentity {
            user_id: result.last_insert_rowid(),
            email: email.to_string(),
            name: name.to_string(),
        })
    }

    async fn find_user(&self, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT id, email, name, password FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| UserRecord {
            identity: UserIdentity {
                user_id: row.get("id"),
                email: row.get("email"),
                name: row.get("name"),
            },
            password: row.get("password"),
        }))
    }

    async fn list_rooms(&self, user_id: i64) -> Result<Vec<Room>> {
        let rows = sqlx::query(
            "SELECT room_id, room_name, device_id, sensors, actions, last_seen \
             FROM rooms WHERE user_id = ? ORDER BY room_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_room).collect()
    }

    async fn get_room(&self, user_id: i64, room_id: &str) -> Result<Option<Room>> {
        let row = sqlx::query(
            "SELECT room_id, room_name, device_id, sensors, actions, last_seen \
             FROM rooms WHERE user_id = ? AND room_id = ?",
        )
        .bind(user_id)
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_room).transpose()
    }

    async fn create_room(&self, user_id: i64, room: Room) -> Result<Room> {
        if self.get_room(user_id, &room.room_id).await?.is_some() {
            return Err(Error::Conflict(format!(
                "room {} already exists",
                room.room_id
            )));
        }
        self.upsert_room(user_id, room).await
    }

    async fn upsert_room(&self, user_id: i64, room: Room) -> Result<Room> {
        sqlx::query(
            r#"
            INSERT INTO rooms (user_id, room_id, room_name, device_id, sensors, actions, last_seen)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, room_id) DO UPDATE SET
                room_name = excluded.room_name,
                device_id = excluded.device_id,
                sensors = excluded.sensors,
                actions = excluded.actions,
                last_seen = MAX(rooms.last_seen, excluded.last_seen)
            "#,
        )
        .bind(user_id)
        .bind(&room.room_id)
        .bind(&room.room_name)
        .bind(&room.device_id)
        .bind(serde_json::to_string(&room.sensors)?)
        .bind(serde_json::to_string(&room.actions)?)
        .bind(room.last_seen)
        .execute(&self.pool)
        .await?;

        Ok(room)
    }

    async fn update_room_action(
        &self,
        user_id: i64,
        room_id: &str,
        action: &str,
        value: &str,
        timestamp_ms: i64,
    ) -> Result<WriteOutcome<i64>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT actions, last_seen FROM rooms WHERE user_id = ? AND room_id = ?",
        )
        .bind(user_id)
        .bind(room_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(WriteOutcome::NotFound);
        };

        let last_seen: i64 = row.get("last_seen");
        if timestamp_ms < last_seen {
            // Stale writer; last_seen only advances
            return Ok(WriteOutcome::Stale(last_seen));
        }

        let actions_json: String = row.get("actions");
        let mut actions: BTreeMap<String, String> = serde_json::from_str(&actions_json)?;
        actions.insert(action.to_string(), value.to_string());

        sqlx::query(
            "UPDATE rooms SET actions = ?, last_seen = ? WHERE user_id = ? AND room_id = ?",
        )
        .bind(serde_json::to_string(&actions)?)
        .bind(timestamp_ms)
        .bind(user_id)
        .bind(room_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(WriteOutcome::Applied(timestamp_ms))
    }

    async fn update_room_sensors(
        &self,
        user_id: i64,
        device_id: &str,
        sensors: BTreeMap<String, serde_json::Value>,
        timestamp_ms: i64,
    ) -> Result<WriteOutcome<String>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT room_id, last_seen FROM rooms WHERE user_id = ? AND device_id = ? LIMIT 1",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(WriteOutcome::NotFound);
        };

        let room_id: String = row.get("room_id");
        let last_seen: i64 = row.get("last_seen");
        if timestamp_ms < last_seen {
            return Ok(WriteOutcome::Stale(room_id));
        }

        sqlx::query(
            "UPDATE rooms SET sensors = ?, last_seen = ? WHERE user_id = ? AND room_id = ?",
        )
        .bind(serde_json::to_string(&sensors)?)
        .bind(timestamp_ms)
        .bind(user_id)
        .bind(&room_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(WriteOutcome::Applied(room_id))
    }

    async fn delete_room(&self, user_id: i64, room_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rooms WHERE user_id = ? AND room_id = ?")
            .bind(user_id)
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_alert(&self, user_id: i64, alert: Alert) -> Result<()> {
        sqlx::query(
            "INSERT INTO alerts (user_id, alert_id, home_id, snapshot_url, timestamp, resolved) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&alert.alert_id)
        .bind(&alert.home_id)
        .bind(&alert.snapshot_url)
        .bind(alert.timestamp)
        .bind(alert.resolved as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_alert(&self, user_id: i64, alert_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE alerts SET resolved = 1 \
             WHERE user_id = ? AND alert_id = ? AND resolved = 0",
        )
        .bind(user_id)
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_alerts(
        &self,
        user_id: i64,
        home_id: Option<&str>,
        unresolved_only: bool,
    ) -> Result<Vec<Alert>> {
        // Small fixed set of filter shapes; keep the queries explicit
        let rows = match (home_id, unresolved_only) {
            (Some(home), true) => {
                sqlx::query(
                    "SELECT alert_id, home_id, snapshot_url, timestamp, resolved FROM alerts \
                     WHERE user_id = ? AND home_id = ? AND resolved = 0 ORDER BY timestamp DESC",
                )
                .bind(user_id)
                .bind(home)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(home), false) => {
                sqlx::query(
                    "SELECT alert_id, home_id, snapshot_url, timestamp, resolved FROM alerts \
                     WHERE user_id = ? AND home_id = ? ORDER BY timestamp DESC",
                )
                .bind(user_id)
                .bind(home)
                .fetch_all(&self.pool)
                .await?
            }
            (None, true) => {
                sqlx::query(
                    "SELECT alert_id, home_id, snapshot_url, timestamp, resolved FROM alerts \
                     WHERE user_id = ? AND resolved = 0 ORDER BY timestamp DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
            (None, false) => {
                sqlx::query(
                    "SELECT alert_id, home_id, snapshot_url, timestamp, resolved FROM alerts \
                     WHERE user_id = ? ORDER BY timestamp DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(Self::row_to_alert).collect())
    }
}
