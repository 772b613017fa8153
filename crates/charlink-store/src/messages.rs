use async_trait::async_trait;
use charlink_shared::message::MessageStatus;
use charlink_shared::{CharacterId, ConversationKey, Message, MessageId, SenderRole, UserId};
use rusqlite::{params, Connection};
use tracing::debug;

use crate::database::{conversion_error, corrupt, decode_time, encode_time, query_error, Database};
use crate::error::Result;
use crate::log::{
    shared_snapshot, DeleteScope, MessageLog, MessageSubscription, SharedSnapshot, SnapshotOrder,
    ViewSide,
};

const SELECT_COLUMNS: &str =
    "SELECT id, user_id, character_id, text, sender, timestamp, status, reactions FROM messages";

impl Database {
    pub fn insert_message(&self, key: &ConversationKey, message: &Message) -> Result<()> {
        let conn = self.conn();
        insert(&conn, key, message)?;
        self.conversations.publish(key, owner_snapshot(&conn, key)?);
        Ok(())
    }

    /// Visible messages for one side of a conversation, oldest first.
    pub fn get_messages(&self, key: &ConversationKey, side: ViewSide) -> Result<Vec<Message>> {
        load_side(&self.conn(), key, side)
    }

    pub fn get_message_by_id(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(query_error)
    }

    pub fn hide_message(
        &self,
        key: &ConversationKey,
        id: MessageId,
        scope: DeleteScope,
    ) -> Result<bool> {
        let conn = self.conn();
        let (user_id, character_id, id) =
            (key.user_id.as_str(), key.character_id.as_str(), id.to_string());

        let affected = match scope {
            DeleteScope::Owner => conn.execute(
                "UPDATE messages SET owner_visible = 0
                 WHERE id = ?1 AND user_id = ?2 AND character_id = ?3 AND owner_visible = 1",
                params![id, user_id, character_id],
            )?,
            DeleteScope::Everyone => conn.execute(
                "DELETE FROM messages
                 WHERE id = ?1 AND user_id = ?2 AND character_id = ?3
                   AND (owner_visible = 1 OR counterpart_visible = 1)",
                params![id, user_id, character_id],
            )?,
        };

        conn.execute(
            "DELETE FROM messages WHERE id = ?1 AND owner_visible = 0 AND counterpart_visible = 0",
            params![id],
        )?;

        if affected > 0 {
            self.conversations.publish(key, owner_snapshot(&conn, key)?);
        }
        Ok(affected > 0)
    }
}

#[async_trait]
impl MessageLog for Database {
    async fn append(&self, key: &ConversationKey, mut message: Message) -> Result<Message> {
        message.conversation = key.clone();
        let key = key.clone();
        self.blocking(move |db| {
            db.insert_message(&key, &message)?;
            debug!(conversation = %key, message_id = %message.id, "message appended");
            Ok(message)
        })
        .await
    }

    async fn remove(
        &self,
        key: &ConversationKey,
        id: MessageId,
        scope: DeleteScope,
    ) -> Result<bool> {
        let key = key.clone();
        self.blocking(move |db| {
            let removed = db.hide_message(&key, id, scope)?;
            debug!(conversation = %key, message_id = %id, ?scope, removed, "message remove");
            Ok(removed)
        })
        .await
    }

    async fn subscribe(
        &self,
        key: &ConversationKey,
        order: SnapshotOrder,
    ) -> Result<MessageSubscription> {
        let key = key.clone();
        let rx = self
            .blocking(move |db| {
                let conn = db.conn();
                Ok(db.conversations.subscribe(&key, owner_snapshot(&conn, &key)?))
            })
            .await?;
        Ok(MessageSubscription::new(rx, order))
    }

    async fn snapshot(
        &self,
        key: &ConversationKey,
        side: ViewSide,
        order: SnapshotOrder,
    ) -> Result<Vec<Message>> {
        let key = key.clone();
        let messages = self.blocking(move |db| db.get_messages(&key, side)).await?;
        Ok(order.arrange(messages))
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn insert(conn: &Connection, key: &ConversationKey, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, user_id, character_id, text, sender, timestamp, status, reactions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            message.id.to_string(),
            key.user_id.as_str(),
            key.character_id.as_str(),
            message.text,
            sender_to_str(message.sender),
            encode_time(&message.timestamp),
            status_to_str(message.status),
            serde_json::to_string(&message.reactions)?,
        ],
    )?;
    Ok(())
}

fn load_side(conn: &Connection, key: &ConversationKey, side: ViewSide) -> Result<Vec<Message>> {
    let flag = match side {
        ViewSide::Owner => "owner_visible",
        ViewSide::Counterpart => "counterpart_visible",
    };
    let mut stmt = conn.prepare(&format!(
        "{SELECT_COLUMNS}
         WHERE user_id = ?1 AND character_id = ?2 AND {flag} = 1
         ORDER BY timestamp ASC, id ASC"
    ))?;

    let rows = stmt.query_map(
        params![key.user_id.as_str(), key.character_id.as_str()],
        row_to_message,
    )?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(query_error)?);
    }
    Ok(messages)
}

fn owner_snapshot(conn: &Connection, key: &ConversationKey) -> Result<SharedSnapshot> {
    Ok(shared_snapshot(&load_side(conn, key, ViewSide::Owner)?))
}

fn sender_to_str(sender: SenderRole) -> &'static str {
    match sender {
        SenderRole::User => "user",
        SenderRole::Persona => "persona",
    }
}

fn status_to_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let character_id: String = row.get(2)?;
    let text: String = row.get(3)?;
    let sender_str: String = row.get(4)?;
    let ts_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let reactions_json: String = row.get(7)?;

    let id = MessageId::parse(&id_str).map_err(|e| conversion_error(0, e))?;
    let sender = match sender_str.as_str() {
        "user" => SenderRole::User,
        "persona" => SenderRole::Persona,
        other => return Err(corrupt(4, "sender", other)),
    };
    let timestamp = decode_time(5, &ts_str)?;
    let status = match status_str.as_str() {
        "sent" => MessageStatus::Sent,
        "delivered" => MessageStatus::Delivered,
        "read" => MessageStatus::Read,
        other => return Err(corrupt(6, "status", other)),
    };
    let reactions: Vec<String> =
        serde_json::from_str(&reactions_json).map_err(|e| conversion_error(7, e))?;

    Ok(Message {
        id,
        conversation: ConversationKey::new(UserId(user_id), CharacterId(character_id)),
        text,
        sender,
        timestamp,
        status,
        reactions,
    })
}
