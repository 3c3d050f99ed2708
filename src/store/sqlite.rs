use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::Fields;

use super::{Document, DocumentChange, DocumentStore};

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS document (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    update_time INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
"#;

const CHANGES_CAPACITY: usize = 1024;

/// SQLite-backed document store. Documents are JSON objects keyed by
/// `(collection, id)`; every write runs in its own transaction and its change
/// is broadcast after commit.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<DocumentChange>,
}

impl SqliteStore {
    /// Opens a SQLite database file. Creates one if it doesn't exist.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite database {}", path.display()))?;
        Self::new(conn)
    }

    /// In-memory database, content is lost when the process exits.
    pub fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        Self::new(conn)
    }

    fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLE_SQL)
            .context("create document table")?;
        let (changes, _) = broadcast::channel(CHANGES_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut conn = match self.conn.lock() {
            Ok(conn) => conn,
            Err(e) => bail!("failed to lock connection: {e:#}"),
        };
        let tx = conn.transaction()?;

        let result = f(&tx);

        if result.is_ok() {
            tx.commit()
        } else {
            tx.rollback()
        }?;

        result
    }

    fn write(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<()> {
        let change = self.with_transaction(|tx| {
            let before = read_row(tx, collection, id)?.map(|doc| doc.fields);
            let after = match (&before, merge) {
                (Some(before), true) => {
                    let mut merged = before.clone();
                    merged.extend(fields);
                    merged
                }
                _ => fields,
            };
            write_row(tx, collection, id, &after)?;
            Ok(DocumentChange {
                collection: collection.to_string(),
                id: id.to_string(),
                before,
                after: Some(after),
            })
        })?;

        self.publish(change);
        Ok(())
    }

    fn create_absent(&self, collection: &str, id: &str, fields: Fields) -> Result<bool> {
        let change = self.with_transaction(|tx| {
            if read_row(tx, collection, id)?.is_some() {
                return Ok(None);
            }
            write_row(tx, collection, id, &fields)?;
            Ok(Some(DocumentChange {
                collection: collection.to_string(),
                id: id.to_string(),
                before: None,
                after: Some(fields),
            }))
        })?;

        match change {
            Some(change) => {
                self.publish(change);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn publish(&self, change: DocumentChange) {
        if self.changes.send(change).is_err() {
            debug!("No subscriber for document changes");
        }
    }
}

impl DocumentStore for SqliteStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.with_transaction(|tx| read_row(tx, collection, id))
    }

    fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<bool> {
        self.create_absent(collection, id, fields)
    }

    fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        self.write(collection, id, fields, false)
    }

    fn merge(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        self.write(collection, id, fields, true)
    }

    fn add(&self, collection: &str, fields: Fields) -> Result<String> {
        let id = Uuid::new_v4().simple().to_string();
        self.write(collection, &id, fields, false)?;
        Ok(id)
    }

    fn list(&self, collection: &str, filter: Option<(&str, &Value)>) -> Result<Vec<Document>> {
        let docs = self.with_transaction(|tx| {
            let sql = "SELECT id, data FROM document WHERE collection = ? ORDER BY rowid";
            debug!("Database list: {sql}, {collection}");
            let mut stmt = tx.prepare(sql)?;
            let rows = stmt
                .query_map(params![collection], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(id, data)| parse_row(id, &data))
                .collect::<Result<Vec<_>>>()
        })?;

        let docs = match filter {
            Some((field, value)) => docs
                .into_iter()
                .filter(|doc| doc.fields.get(field) == Some(value))
                .collect(),
            None => docs,
        };
        Ok(docs)
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }
}

fn read_row(tx: &Transaction, collection: &str, id: &str) -> Result<Option<Document>> {
    let sql = "SELECT data FROM document WHERE collection = ? AND id = ?";
    debug!("Database get: {sql}, {collection}/{id}");
    let data = tx
        .query_row(sql, params![collection, id], |row| row.get::<_, String>(0))
        .optional()?;

    match data {
        Some(data) => Ok(Some(parse_row(id.to_string(), &data)?)),
        None => Ok(None),
    }
}

fn write_row(tx: &Transaction, collection: &str, id: &str, fields: &Fields) -> Result<()> {
    let sql = r#"
    INSERT INTO document (collection, id, data, update_time)
    VALUES (?, ?, ?, ?)
    ON CONFLICT (collection, id) DO UPDATE SET data = excluded.data, update_time = excluded.update_time
    "#;
    let data = serde_json::to_string(fields).context("serialize document")?;
    let now = Utc::now().timestamp();
    debug!("Database write: {collection}/{id}, {data}");
    tx.execute(sql, params![collection, id, data, now])?;
    Ok(())
}

fn parse_row(id: String, data: &str) -> Result<Document> {
    let fields = match serde_json::from_str::<Value>(data)
        .with_context(|| format!("parse document {id}"))?
    {
        Value::Object(fields) => fields,
        _ => bail!("document {id} is not an object"),
    };
    Ok(Document { id, fields })
}
