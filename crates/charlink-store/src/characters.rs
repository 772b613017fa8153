use std::collections::BTreeSet;

use async_trait::async_trait;
use charlink_shared::{Character, CharacterFilter, CharacterId, Counter, UserId, Visibility};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::database::{conversion_error, corrupt, decode_time, encode_time, query_error, Database};
use crate::error::{Result, StoreError};
use crate::personas::{prepare_for_put, CharacterSubscription, PersonaStore};

const SELECT_COLUMNS: &str = "SELECT id, owner_id, name, persona, greeting, avatar_url, age, \
     gender, tags, visibility, banned, verified, premium, created_at, updated_at, likes, views, \
     chats FROM characters";

impl Database {
    pub fn upsert_character(&self, character: &Character) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO characters (id, owner_id, name, persona, greeting, avatar_url, age,
                                     gender, tags, visibility, banned, verified, premium,
                                     created_at, updated_at, likes, views, chats)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id, name = excluded.name, persona = excluded.persona,
                greeting = excluded.greeting, avatar_url = excluded.avatar_url,
                age = excluded.age, gender = excluded.gender, tags = excluded.tags,
                visibility = excluded.visibility, banned = excluded.banned,
                verified = excluded.verified, premium = excluded.premium,
                updated_at = excluded.updated_at, likes = excluded.likes,
                views = excluded.views, chats = excluded.chats",
            params![
                character.id.as_str(),
                character.owner_id.as_str(),
                character.name,
                character.persona,
                character.greeting,
                character.avatar_url,
                character.age,
                character.gender,
                serde_json::to_string(&character.tags)?,
                visibility_to_str(character.visibility),
                character.banned,
                character.verified,
                character.premium,
                encode_time(&character.created_at),
                encode_time(&character.updated_at),
                to_sql_count(character.likes),
                to_sql_count(character.views),
                to_sql_count(character.chats),
            ],
        )?;

        self.characters
            .publish(&character.id, load(&conn, &character.id)?);
        Ok(())
    }

    pub fn get_character(&self, id: &CharacterId) -> Result<Option<Character>> {
        load(&self.conn(), id)
    }

    /// Characters that may appear in public listings.
    pub fn get_listed_characters(&self) -> Result<Vec<Character>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE banned = 0 AND visibility = 'public'"
        ))?;
        let rows = stmt.query_map([], row_to_character)?;

        let mut characters = Vec::new();
        for row in rows {
            characters.push(row.map_err(query_error)?);
        }
        Ok(characters)
    }

    pub fn increment_counter(&self, id: &CharacterId, counter: Counter) -> Result<()> {
        let column = match counter {
            Counter::Likes => "likes",
            Counter::Views => "views",
            Counter::Chats => "chats",
        };

        let conn = self.conn();
        let affected = conn.execute(
            &format!(
                "UPDATE characters SET {column} = {column} + 1
                 WHERE id = ?1 AND {column} < 9223372036854775807"
            ),
            params![id.as_str()],
        )?;

        let current = load(&conn, id)?;
        if current.is_none() {
            return Err(StoreError::NotFound);
        }
        if affected > 0 {
            self.characters.publish(id, current);
        }
        Ok(())
    }
}

#[async_trait]
impl PersonaStore for Database {
    async fn get(&self, id: &CharacterId) -> Result<Option<Character>> {
        let id = id.clone();
        self.blocking(move |db| db.get_character(&id)).await
    }

    async fn query(&self, filter: &CharacterFilter, limit: usize) -> Result<Vec<Character>> {
        let listed = self.blocking(|db| db.get_listed_characters()).await?;
        Ok(filter.apply(listed, limit))
    }

    async fn put(&self, character: Character) -> Result<Character> {
        let character = prepare_for_put(character)?;
        self.blocking(move |db| {
            db.upsert_character(&character)?;
            debug!(character = %character.id, "character stored");
            Ok(character)
        })
        .await
    }

    async fn subscribe(&self, id: &CharacterId) -> Result<CharacterSubscription> {
        let id = id.clone();
        let rx = self
            .blocking(move |db| {
                let conn = db.conn();
                Ok(db.characters.subscribe(&id, load(&conn, &id)?))
            })
            .await?;
        Ok(CharacterSubscription::new(rx))
    }

    async fn increment(&self, id: &CharacterId, counter: Counter) -> Result<()> {
        let id = id.clone();
        self.blocking(move |db| db.increment_counter(&id, counter)).await
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn load(conn: &Connection, id: &CharacterId) -> Result<Option<Character>> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE id = ?1"),
        params![id.as_str()],
        row_to_character,
    )
    .optional()
    .map_err(query_error)
}

fn visibility_to_str(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Public => "public",
        Visibility::Private => "private",
    }
}

fn to_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_sql_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or_default()
}

fn row_to_character(row: &rusqlite::Row<'_>) -> rusqlite::Result<Character> {
    let tags_json: String = row.get(8)?;
    let visibility_str: String = row.get(9)?;
    let created_str: String = row.get(13)?;
    let updated_str: String = row.get(14)?;

    let tags: BTreeSet<String> =
        serde_json::from_str(&tags_json).map_err(|e| conversion_error(8, e))?;
    let visibility = match visibility_str.as_str() {
        "public" => Visibility::Public,
        "private" => Visibility::Private,
        other => return Err(corrupt(9, "visibility", other)),
    };

    Ok(Character {
        id: CharacterId(row.get(0)?),
        owner_id: UserId(row.get(1)?),
        name: row.get(2)?,
        persona: row.get(3)?,
        greeting: row.get(4)?,
        avatar_url: row.get(5)?,
        age: row.get(6)?,
        gender: row.get(7)?,
        tags,
        visibility,
        banned: row.get(10)?,
        verified: row.get(11)?,
        premium: row.get(12)?,
        created_at: decode_time(13, &created_str)?,
        updated_at: decode_time(14, &updated_str)?,
        likes: from_sql_count(row.get(15)?),
        views: from_sql_count(row.get(16)?),
        chats: from_sql_count(row.get(17)?),
    })
}
