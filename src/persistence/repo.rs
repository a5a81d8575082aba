//! SQLite-backed repository (spec.md §6). Field-level merge semantics here
//! must match the in-memory stores exactly (spec.md §9 "Merge policies") —
//! preserve existing values when incoming is null/empty, take the max of
//! timestamps.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::bus::TracerouteUpdate;
use crate::store::{Chat, ChatMessage, MessageStatus, Node};

use super::{chat_type_from_str, chat_type_to_str, direction_from_str, direction_to_str, status_from_str, status_to_str, Bootstrap};

pub const SCHEMA_VERSION: i64 = 6;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    node_id TEXT PRIMARY KEY,
    node_num INTEGER NOT NULL DEFAULT 0,
    long_name TEXT NOT NULL DEFAULT '',
    short_name TEXT NOT NULL DEFAULT '',
    battery_level INTEGER,
    voltage REAL,
    temperature REAL,
    humidity REAL,
    pressure REAL,
    air_quality_index INTEGER,
    power_voltage REAL,
    power_current REAL,
    latitude REAL,
    longitude REAL,
    altitude INTEGER,
    board_model TEXT NOT NULL DEFAULT '',
    device_role TEXT NOT NULL DEFAULT '',
    is_unmessageable INTEGER NOT NULL DEFAULT 0,
    channel INTEGER,
    last_heard_at INTEGER NOT NULL DEFAULT 0,
    rssi INTEGER,
    snr REAL,
    updated_at INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS chats (
    chat_key TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    last_sent_by_me_at INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_key TEXT NOT NULL,
    device_message_id TEXT,
    direction TEXT NOT NULL,
    body TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    status_reason TEXT,
    at INTEGER NOT NULL,
    meta_json TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS messages_chat_device_unique
    ON messages(chat_key, device_message_id)
    WHERE device_message_id IS NOT NULL AND device_message_id != '';

CREATE TABLE IF NOT EXISTS traceroutes (
    request_id INTEGER PRIMARY KEY,
    target_node_id TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    status TEXT NOT NULL,
    forward_route_json TEXT NOT NULL DEFAULT '[]',
    forward_snr_json TEXT NOT NULL DEFAULT '[]',
    return_route_json TEXT NOT NULL DEFAULT '[]',
    return_snr_json TEXT NOT NULL DEFAULT '[]',
    error_text TEXT,
    duration_ms INTEGER
);
"#;

/// Wraps a single SQLite connection behind a mutex — all writes already pass
/// through the single-consumer writer queue, so this only protects against
/// concurrent reads racing a write, not against write/write races.
pub struct Repository {
    conn: Mutex<Connection>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening database at {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        let user_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if user_version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn upsert_node(&self, node: &Node) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO nodes (node_id, node_num, long_name, short_name, battery_level, voltage,
                temperature, humidity, pressure, air_quality_index, power_voltage, power_current,
                latitude, longitude, altitude, board_model, device_role, is_unmessageable, channel,
                last_heard_at, rssi, snr, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)
             ON CONFLICT(node_id) DO UPDATE SET
                node_num = CASE WHEN excluded.node_num != 0 THEN excluded.node_num ELSE nodes.node_num END,
                long_name = CASE WHEN excluded.long_name != '' THEN excluded.long_name ELSE nodes.long_name END,
                short_name = CASE WHEN excluded.short_name != '' THEN excluded.short_name ELSE nodes.short_name END,
                battery_level = COALESCE(excluded.battery_level, nodes.battery_level),
                voltage = COALESCE(excluded.voltage, nodes.voltage),
                temperature = COALESCE(excluded.temperature, nodes.temperature),
                humidity = COALESCE(excluded.humidity, nodes.humidity),
                pressure = COALESCE(excluded.pressure, nodes.pressure),
                air_quality_index = COALESCE(excluded.air_quality_index, nodes.air_quality_index),
                power_voltage = COALESCE(excluded.power_voltage, nodes.power_voltage),
                power_current = COALESCE(excluded.power_current, nodes.power_current),
                latitude = COALESCE(excluded.latitude, nodes.latitude),
                longitude = COALESCE(excluded.longitude, nodes.longitude),
                altitude = COALESCE(excluded.altitude, nodes.altitude),
                board_model = CASE WHEN excluded.board_model != '' THEN excluded.board_model ELSE nodes.board_model END,
                device_role = CASE WHEN excluded.device_role != '' THEN excluded.device_role ELSE nodes.device_role END,
                is_unmessageable = nodes.is_unmessageable OR excluded.is_unmessageable,
                channel = COALESCE(excluded.channel, nodes.channel),
                last_heard_at = MAX(nodes.last_heard_at, excluded.last_heard_at),
                rssi = COALESCE(excluded.rssi, nodes.rssi),
                snr = COALESCE(excluded.snr, nodes.snr),
                updated_at = MAX(nodes.updated_at, excluded.updated_at)",
            params![
                node.node_id,
                node.node_num,
                node.long_name,
                node.short_name,
                node.battery_level,
                node.voltage,
                node.temperature,
                node.humidity,
                node.pressure,
                node.air_quality_index,
                node.power_voltage,
                node.power_current,
                node.latitude,
                node.longitude,
                node.altitude,
                node.board_model,
                node.role,
                node.is_unmessageable,
                node.channel,
                node.last_heard_at,
                node.rssi,
                node.snr,
                node.updated_at,
            ],
        )?;
        Ok(())
    }

    /// A fallback title equal to the chat key never overwrites an existing
    /// real title (spec.md §4.7).
    pub fn upsert_channel_chat(&self, chat: &Chat) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chats (chat_key, type, title, last_sent_by_me_at, updated_at)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(chat_key) DO UPDATE SET
                title = CASE
                    WHEN excluded.title != excluded.chat_key AND excluded.title != ''
                        THEN excluded.title
                    WHEN chats.title = chats.chat_key OR chats.title = ''
                        THEN excluded.title
                    ELSE chats.title
                END,
                last_sent_by_me_at = MAX(chats.last_sent_by_me_at, excluded.last_sent_by_me_at),
                updated_at = MAX(chats.updated_at, excluded.updated_at)",
            params![
                chat.key,
                chat_type_to_str(chat.chat_type),
                chat.title,
                chat.last_sent_by_me_at,
                chat.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn insert_message(&self, msg: &ChatMessage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let device_id = if msg.device_message_id.is_empty() {
            None
        } else {
            Some(msg.device_message_id.as_str())
        };
        conn.execute(
            "INSERT OR IGNORE INTO messages
                (chat_key, device_message_id, direction, body, status, status_reason, at, meta_json)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                msg.chat_key,
                device_id,
                direction_to_str(msg.direction),
                msg.body,
                status_to_str(msg.status),
                msg.status_reason,
                msg.at,
                msg.meta_json,
            ],
        )?;
        Ok(())
    }

    pub fn update_message_status(&self, device_message_id: &str, status: MessageStatus, reason: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        // Transition table enforced in SQL: never regress, mirroring the
        // in-memory `should_transition` rule.
        conn.execute(
            "UPDATE messages SET
                status = ?2,
                status_reason = CASE WHEN ?2 = 'failed' THEN ?3 ELSE NULL END
             WHERE device_message_id = ?1 AND (
                (status = 'pending' AND ?2 IN ('sent','acked','failed')) OR
                (status = 'sent' AND ?2 IN ('acked','failed')) OR
                (status = 'failed' AND ?2 = 'acked') OR
                (status = 'failed' AND ?2 = 'failed')
             )",
            params![device_message_id, status_to_str(status), reason],
        )?;
        Ok(())
    }

    pub fn upsert_traceroute(&self, update: &TracerouteUpdate) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let status = format!("{:?}", update.status);
        conn.execute(
            "INSERT INTO traceroutes
                (request_id, target_node_id, started_at, updated_at, completed_at, status,
                 forward_route_json, forward_snr_json, return_route_json, return_snr_json,
                 error_text, duration_ms)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(request_id) DO UPDATE SET
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at,
                status = excluded.status,
                forward_route_json = excluded.forward_route_json,
                forward_snr_json = excluded.forward_snr_json,
                return_route_json = excluded.return_route_json,
                return_snr_json = excluded.return_snr_json,
                error_text = excluded.error_text,
                duration_ms = excluded.duration_ms",
            params![
                update.request_id,
                update.target_node_id,
                update.started_at.timestamp_millis(),
                update.updated_at.timestamp_millis(),
                update.completed_at.map(|t| t.timestamp_millis()),
                status,
                serde_json::to_string(&update.forward_route)?,
                serde_json::to_string(&update.forward_snr)?,
                serde_json::to_string(&update.return_route)?,
                serde_json::to_string(&update.return_snr)?,
                update.error_text,
                update.duration_ms,
            ],
        )?;
        Ok(())
    }

    /// Load nodes, chats and the most recent K=200 messages per chat
    /// (spec.md §4.7 Bootstrap).
    pub fn load_bootstrap(&self) -> Result<Bootstrap> {
        let conn = self.conn.lock().unwrap();

        let mut nodes = Vec::new();
        let mut stmt = conn.prepare("SELECT node_id, node_num, long_name, short_name, battery_level, voltage,
                temperature, humidity, pressure, air_quality_index, power_voltage, power_current,
                latitude, longitude, altitude, board_model, device_role, is_unmessageable, channel,
                last_heard_at, rssi, snr, updated_at FROM nodes")?;
        let rows = stmt.query_map([], |r| {
            Ok(Node {
                node_id: r.get(0)?,
                node_num: r.get(1)?,
                long_name: r.get(2)?,
                short_name: r.get(3)?,
                battery_level: r.get(4)?,
                voltage: r.get(5)?,
                temperature: r.get(6)?,
                humidity: r.get(7)?,
                pressure: r.get(8)?,
                air_quality_index: r.get(9)?,
                power_voltage: r.get(10)?,
                power_current: r.get(11)?,
                latitude: r.get(12)?,
                longitude: r.get(13)?,
                altitude: r.get(14)?,
                board_model: r.get(15)?,
                role: r.get(16)?,
                is_unmessageable: r.get(17)?,
                channel: r.get(18)?,
                last_heard_at: r.get(19)?,
                rssi: r.get(20)?,
                snr: r.get(21)?,
                updated_at: r.get(22)?,
            })
        })?;
        for row in rows {
            nodes.push(row?);
        }
        drop(stmt);

        let mut chats = Vec::new();
        let mut stmt = conn.prepare("SELECT chat_key, type, title, last_sent_by_me_at, updated_at FROM chats")?;
        let rows = stmt.query_map([], |r| {
            let type_str: String = r.get(1)?;
            Ok(Chat {
                key: r.get(0)?,
                chat_type: chat_type_from_str(&type_str),
                title: r.get(2)?,
                last_sent_by_me_at: r.get(3)?,
                updated_at: r.get(4)?,
            })
        })?;
        for row in rows {
            chats.push(row?);
        }
        drop(stmt);

        let mut messages: std::collections::HashMap<String, Vec<ChatMessage>> = std::collections::HashMap::new();
        for chat in &chats {
            let mut stmt = conn.prepare(
                "SELECT local_id, device_message_id, direction, body, status, status_reason, at, meta_json
                 FROM messages WHERE chat_key = ?1 ORDER BY at DESC LIMIT 200",
            )?;
            let rows = stmt.query_map(params![chat.key], |r| {
                let direction_str: String = r.get(2)?;
                let status_str: String = r.get(4)?;
                let local_id: i64 = r.get(0)?;
                Ok(ChatMessage {
                    local_id: local_id as u64,
                    device_message_id: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    chat_key: chat.key.clone(),
                    direction: direction_from_str(&direction_str),
                    body: r.get(3)?,
                    status: status_from_str(&status_str),
                    status_reason: r.get(5)?,
                    at: r.get(6)?,
                    meta_json: r.get(7)?,
                })
            })?;
            let mut bucket = Vec::new();
            for row in rows {
                bucket.push(row?);
            }
            bucket.sort_by_key(|m| m.at);
            messages.insert(chat.key.clone(), bucket);
        }

        Ok(Bootstrap { nodes, chats, messages })
    }

    pub fn node_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?)
    }

    pub fn chat_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM chats", [], |r| r.get(0))?)
    }

    pub fn find_message_status(&self, device_message_id: &str) -> Result<Option<MessageStatus>> {
        let conn = self.conn.lock().unwrap();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM messages WHERE device_message_id = ?1",
                params![device_message_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(status.map(|s| status_from_str(&s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChatType, Direction};

    #[test]
    fn upsert_node_preserves_existing_fields_on_sparse_update() {
        let repo = Repository::open_in_memory().unwrap();
        repo.upsert_node(&Node {
            node_id: "!1".into(),
            long_name: "Alpha".into(),
            battery_level: Some(80),
            last_heard_at: 100,
            updated_at: 100,
            ..Default::default()
        })
        .unwrap();
        repo.upsert_node(&Node {
            node_id: "!1".into(),
            long_name: "Alpha Prime".into(),
            last_heard_at: 50,
            updated_at: 50,
            ..Default::default()
        })
        .unwrap();

        let bootstrap = repo.load_bootstrap().unwrap();
        let node = bootstrap.nodes.into_iter().find(|n| n.node_id == "!1").unwrap();
        assert_eq!(node.long_name, "Alpha Prime");
        assert_eq!(node.battery_level, Some(80));
        assert_eq!(node.last_heard_at, 100);
    }

    #[test]
    fn insert_message_is_idempotent_on_dedup_key() {
        let repo = Repository::open_in_memory().unwrap();
        repo.upsert_channel_chat(&Chat {
            key: "channel:0".into(),
            title: "channel:0".into(),
            chat_type: ChatType::Channel,
            last_sent_by_me_at: 0,
            updated_at: 0,
        })
        .unwrap();
        let msg = ChatMessage {
            local_id: 0,
            device_message_id: "42".into(),
            chat_key: "channel:0".into(),
            direction: Direction::Out,
            body: "hi".into(),
            status: MessageStatus::Sent,
            status_reason: None,
            at: 1,
            meta_json: None,
        };
        repo.insert_message(&msg).unwrap();
        repo.insert_message(&msg).unwrap();
        let bootstrap = repo.load_bootstrap().unwrap();
        assert_eq!(bootstrap.messages.get("channel:0").unwrap().len(), 1);
    }

    #[test]
    fn fallback_title_never_overwrites_real_title() {
        let repo = Repository::open_in_memory().unwrap();
        repo.upsert_channel_chat(&Chat {
            key: "channel:1".into(),
            title: "General".into(),
            chat_type: ChatType::Channel,
            last_sent_by_me_at: 0,
            updated_at: 0,
        })
        .unwrap();
        repo.upsert_channel_chat(&Chat {
            key: "channel:1".into(),
            title: "channel:1".into(),
            chat_type: ChatType::Channel,
            last_sent_by_me_at: 0,
            updated_at: 0,
        })
        .unwrap();
        let bootstrap = repo.load_bootstrap().unwrap();
        let chat = bootstrap.chats.into_iter().find(|c| c.key == "channel:1").unwrap();
        assert_eq!(chat.title, "General");
    }

    #[test]
    fn message_status_never_regresses() {
        let repo = Repository::open_in_memory().unwrap();
        repo.upsert_channel_chat(&Chat {
            key: "channel:0".into(),
            title: "channel:0".into(),
            chat_type: ChatType::Channel,
            last_sent_by_me_at: 0,
            updated_at: 0,
        })
        .unwrap();
        let msg = ChatMessage {
            local_id: 0,
            device_message_id: "1".into(),
            chat_key: "channel:0".into(),
            direction: Direction::Out,
            body: "hi".into(),
            status: MessageStatus::Acked,
            status_reason: None,
            at: 1,
            meta_json: None,
        };
        repo.insert_message(&msg).unwrap();
        repo.update_message_status("1", MessageStatus::Sent, None).unwrap();
        assert_eq!(repo.find_message_status("1").unwrap(), Some(MessageStatus::Acked));
    }
}
