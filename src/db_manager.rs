//! SQLite-backed hashtag cache and user baseline tables.

use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::hashtag::{split_suggestions, HashtagRecord, INVALID_SENTINEL};

const HASHTAG_SELECT_COLUMNS: &str =
    "name, hashtag_id, likes, comments, engagement, score, suggestions, last_update";

/// Columns of the `hashtags` table addressable from filters and updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashtagColumn {
    Id,
    Name,
    HashtagId,
    Likes,
    Comments,
    Engagement,
    Score,
    Suggestions,
    LastUpdate,
}

impl HashtagColumn {
    fn sql_name(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Name => "name",
            Self::HashtagId => "hashtag_id",
            Self::Likes => "likes",
            Self::Comments => "comments",
            Self::Engagement => "engagement",
            Self::Score => "score",
            Self::Suggestions => "suggestions",
            Self::LastUpdate => "last_update",
        }
    }
}

/// Conjunction of equality constraints, optionally ANDed with a raw SQL expression.
///
/// The raw expression is an escape hatch for range comparisons and is spliced
/// into the statement verbatim, so it must never carry user input.
#[derive(Debug, Clone, Default)]
pub struct HashtagFilter {
    equals: Vec<(HashtagColumn, Value)>,
    raw: Option<String>,
}

impl HashtagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_name(name: &str) -> Self {
        Self::new().eq(HashtagColumn::Name, name.to_string())
    }

    pub fn eq(mut self, column: HashtagColumn, value: impl Into<Value>) -> Self {
        self.equals.push((column, value.into()));
        self
    }

    pub fn raw(mut self, expression: impl Into<String>) -> Self {
        self.raw = Some(expression.into());
        self
    }

    fn where_clause(&self) -> (String, Vec<Value>) {
        let mut conditions: Vec<String> = self
            .equals
            .iter()
            .map(|(column, _)| format!("{} = ?", column.sql_name()))
            .collect();
        if let Some(raw) = self.raw.as_ref() {
            conditions.push(format!("({raw})"));
        }
        let params = self.equals.iter().map(|(_, value)| value.clone()).collect();
        if conditions.is_empty() {
            (String::new(), params)
        } else {
            (format!(" WHERE {}", conditions.join(" AND ")), params)
        }
    }
}

/// Sort key for `DbManager::select_many`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashtagOrder {
    pub column: HashtagColumn,
    pub descending: bool,
}

impl HashtagOrder {
    pub fn asc(column: HashtagColumn) -> Self {
        Self {
            column,
            descending: false,
        }
    }
}

pub struct DbManager {
    conn: Connection,
}

impl DbManager {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn new_in_memory() -> Result<Self, rusqlite::Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        let db_manager = Self { conn };
        db_manager.initialize_schema()?;
        db_manager.migrate()?;
        Ok(db_manager)
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS hashtags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                hashtag_id TEXT,
                likes INTEGER,
                comments INTEGER,
                engagement INTEGER,
                score REAL,
                suggestions TEXT,
                last_update INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                daily_likes INTEGER
            )",
            [],
        )?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        // Caches written by older builds predate the remote identifier column
        let has_hashtag_id = {
            let mut stmt = self.conn.prepare("PRAGMA table_info(hashtags)")?;
            let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
            let mut found = false;
            for col in columns {
                if col? == "hashtag_id" {
                    found = true;
                }
            }
            found
        };

        if !has_hashtag_id {
            self.conn
                .execute("ALTER TABLE hashtags ADD COLUMN hashtag_id TEXT", [])?;
        }
        Ok(())
    }

    fn record_from_row(row: &rusqlite::Row<'_>) -> Result<HashtagRecord, rusqlite::Error> {
        let suggestions: Option<String> = row.get(6)?;
        Ok(HashtagRecord {
            name: row.get(0)?,
            hashtag_id: row.get(1)?,
            likes: row.get(2)?,
            comments: row.get(3)?,
            engagement: row.get(4)?,
            score: row.get(5)?,
            suggestions: suggestions.map(|joined| split_suggestions(&joined)),
            last_update: row.get(7)?,
        })
    }

    fn record_fields(record: &HashtagRecord) -> Vec<(HashtagColumn, Value)> {
        vec![
            (HashtagColumn::HashtagId, record.hashtag_id.clone().into()),
            (HashtagColumn::Likes, record.likes.into()),
            (HashtagColumn::Comments, record.comments.into()),
            (HashtagColumn::Engagement, record.engagement.into()),
            (HashtagColumn::Score, record.score.into()),
            (HashtagColumn::Suggestions, record.joined_suggestions().into()),
            (HashtagColumn::LastUpdate, record.last_update.into()),
        ]
    }

    pub fn exists(&self, filter: &HashtagFilter) -> Result<bool, rusqlite::Error> {
        let (where_sql, params) = filter.where_clause();
        let sql = format!("SELECT EXISTS(SELECT 1 FROM hashtags{where_sql})");
        self.conn
            .query_row(&sql, params_from_iter(params), |row| row.get(0))
    }

    pub fn select_one(
        &self,
        filter: &HashtagFilter,
    ) -> Result<Option<HashtagRecord>, rusqlite::Error> {
        Ok(self.select_many(filter, &[], Some(1))?.into_iter().next())
    }

    pub fn select_many(
        &self,
        filter: &HashtagFilter,
        order: &[HashtagOrder],
        limit: Option<usize>,
    ) -> Result<Vec<HashtagRecord>, rusqlite::Error> {
        let (where_sql, params) = filter.where_clause();
        let mut sql = format!("SELECT {HASHTAG_SELECT_COLUMNS} FROM hashtags{where_sql}");
        if !order.is_empty() {
            let keys: Vec<String> = order
                .iter()
                .map(|key| {
                    format!(
                        "{} {}",
                        key.column.sql_name(),
                        if key.descending { "DESC" } else { "ASC" }
                    )
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), Self::record_from_row)?;
        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    /// Inserts a new row and returns its generated id.
    pub fn insert(&self, record: &HashtagRecord) -> Result<i64, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO hashtags
                (name, hashtag_id, likes, comments, engagement, score, suggestions, last_update)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.name,
                record.hashtag_id,
                record.likes,
                record.comments,
                record.engagement,
                record.score,
                record.joined_suggestions(),
                record.last_update
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Applies `fields` to every row matching `filter` and returns the number of rows touched.
    pub fn update(
        &self,
        fields: &[(HashtagColumn, Value)],
        filter: &HashtagFilter,
    ) -> Result<usize, rusqlite::Error> {
        if fields.is_empty() {
            return Ok(0);
        }
        let assignments: Vec<String> = fields
            .iter()
            .map(|(column, _)| format!("{} = ?", column.sql_name()))
            .collect();
        let (where_sql, where_params) = filter.where_clause();
        let sql = format!(
            "UPDATE hashtags SET {}{where_sql}",
            assignments.join(", ")
        );
        let mut values: Vec<Value> = fields.iter().map(|(_, value)| value.clone()).collect();
        values.extend(where_params);
        self.conn.execute(&sql, params_from_iter(values))
    }

    /// Updates the row with the same name, or inserts one when none exists.
    pub fn upsert_hashtag(&self, record: &HashtagRecord) -> Result<(), rusqlite::Error> {
        let filter = HashtagFilter::by_name(&record.name);
        if self.exists(&filter)? {
            self.update(&Self::record_fields(record), &filter)?;
        } else {
            self.insert(record)?;
        }
        Ok(())
    }

    /// Inserts an empty shell row for a tag that has never been looked up.
    pub fn add_empty(&self, name: &str) -> Result<HashtagRecord, rusqlite::Error> {
        let id = self.insert(&HashtagRecord::empty(name))?;
        let record = self.select_one(&HashtagFilter::new().eq(HashtagColumn::Id, id))?;
        Ok(record.unwrap_or_else(|| HashtagRecord::empty(name)))
    }

    /// Union of the stored suggestions of `names`, de-duplicated and sorted.
    pub fn hashtag_suggestions(&self, names: &[String]) -> Result<Vec<String>, rusqlite::Error> {
        let mut suggestions = Vec::new();
        for name in names {
            if let Some(record) = self.select_one(&HashtagFilter::by_name(name))? {
                suggestions.extend(record.suggestions.unwrap_or_default());
            }
        }
        suggestions.sort();
        suggestions.dedup();
        Ok(suggestions)
    }

    /// Names last fetched before `older_than`, oldest first. Invalid tags are never stale.
    pub fn stale_hashtag_names(
        &self,
        older_than: i64,
        limit: usize,
    ) -> Result<Vec<String>, rusqlite::Error> {
        let filter = HashtagFilter::new().raw(format!(
            "last_update < {older_than} AND last_update <> {INVALID_SENTINEL}"
        ));
        let records = self.select_many(
            &filter,
            &[HashtagOrder::asc(HashtagColumn::LastUpdate)],
            Some(limit),
        )?;
        Ok(records.into_iter().map(|record| record.name).collect())
    }

    pub fn upsert_user(&self, name: &str, daily_likes: i64) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO users (name, daily_likes) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET daily_likes = excluded.daily_likes",
            params![name, daily_likes],
        )?;
        Ok(())
    }

    pub fn user_daily_likes(&self, name: &str) -> Result<Option<i64>, rusqlite::Error> {
        let daily_likes: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT daily_likes FROM users WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(daily_likes.flatten())
    }
}
