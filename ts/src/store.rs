//! SQLite-backed Store implementation

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result, eyre};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use tracing::{debug, info};

use crate::filter::Filter;
use crate::record::Record;

/// Database file name inside the store directory
const DB_FILE: &str = "taskstore.db";

/// How long a writer waits for another process to release the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    data        TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    UNIQUE (collection, id)
);

CREATE TABLE IF NOT EXISTS record_indexes (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    field       TEXT NOT NULL,
    value_str   TEXT,
    value_int   INTEGER,
    PRIMARY KEY (collection, id, field)
);

CREATE INDEX IF NOT EXISTS idx_record_indexes_str ON record_indexes (collection, field, value_str);
CREATE INDEX IF NOT EXISTS idx_record_indexes_int ON record_indexes (collection, field, value_int);
"#;

/// Persistent record store
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create a store in the given directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(dir = %dir.display(), "Store::open: called");
        std::fs::create_dir_all(dir).context("Failed to create store directory")?;

        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path).context(format!("Failed to open {}", db_path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .context("Failed to enable WAL journal")?;
        let store = Self::init(conn, Some(db_path))?;

        info!(path = %dir.display(), "Opened task store");
        Ok(store)
    }

    /// Open a private in-memory store (tests, one-shot tools)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Store::open_in_memory: called");
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA).context("Failed to create schema")?;
        Ok(Self { conn, path })
    }

    /// Path of the database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside an `IMMEDIATE` transaction
    ///
    /// The write lock is taken up front, so reads inside `f` observe a state no
    /// other writer can change before commit. Returning `Err` rolls back.
    pub fn transaction<R>(&mut self, f: impl FnOnce(&Tx<'_>) -> Result<R>) -> Result<R> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin transaction")?;
        let wrapper = Tx { tx };
        let result = f(&wrapper)?;
        wrapper.tx.commit().context("Failed to commit transaction")?;
        Ok(result)
    }

    /// Insert a new record; fails if the id already exists in its collection
    pub fn create<T: Record>(&mut self, record: T) -> Result<T> {
        self.transaction(|tx| tx.create(record))
    }

    /// Replace an existing record
    pub fn update<T: Record>(&mut self, record: &T) -> Result<()> {
        self.transaction(|tx| tx.update(record))
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        get_record(&self.conn, id)
    }

    /// List records matching every filter, in insertion order
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        list_records(&self.conn, filters)
    }

    /// Count records matching every filter
    pub fn count<T: Record>(&self, filters: &[Filter]) -> Result<usize> {
        count_records::<T>(&self.conn, filters)
    }

    /// Re-derive index rows for every record of a collection
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        debug!(collection = T::collection_name(), "Store::rebuild_indexes: called");
        self.transaction(|tx| {
            let records: Vec<T> = list_records(tx.conn(), &[])?;
            for record in &records {
                write_indexes(tx.conn(), record)?;
            }
            Ok(records.len())
        })
    }
}

/// Handle to an open transaction
pub struct Tx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl Tx<'_> {
    fn conn(&self) -> &Connection {
        &self.tx
    }

    /// Insert a new record, assigning its sequence number
    pub fn create<T: Record>(&self, mut record: T) -> Result<T> {
        let collection = T::collection_name();
        debug!(collection, id = record.id(), "Tx::create: called");

        let inserted = self.tx.execute(
            "INSERT OR IGNORE INTO records (collection, id, data, updated_at) VALUES (?1, ?2, '', ?3)",
            params![collection, record.id(), record.updated_at()],
        )?;
        if inserted == 0 {
            return Err(eyre!("Record {}/{} already exists", collection, record.id()));
        }

        let seq = self.tx.last_insert_rowid();
        record.set_seq(seq);

        let data = serde_json::to_string(&record).context("Failed to serialize record")?;
        self.tx
            .execute("UPDATE records SET data = ?1 WHERE seq = ?2", params![data, seq])?;
        write_indexes(self.conn(), &record)?;

        Ok(record)
    }

    /// Replace an existing record
    pub fn update<T: Record>(&self, record: &T) -> Result<()> {
        let collection = T::collection_name();
        debug!(collection, id = record.id(), "Tx::update: called");

        let data = serde_json::to_string(record).context("Failed to serialize record")?;
        let updated = self.tx.execute(
            "UPDATE records SET data = ?1, updated_at = ?2 WHERE collection = ?3 AND id = ?4",
            params![data, record.updated_at(), collection, record.id()],
        )?;
        if updated == 0 {
            return Err(eyre!("Record {}/{} not found", collection, record.id()));
        }
        write_indexes(self.conn(), record)
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        get_record(self.conn(), id)
    }

    /// List records matching every filter, in insertion order
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        list_records(self.conn(), filters)
    }

    /// Count records matching every filter
    pub fn count<T: Record>(&self, filters: &[Filter]) -> Result<usize> {
        count_records::<T>(self.conn(), filters)
    }

}

fn write_indexes<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let collection = T::collection_name();
    conn.execute(
        "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
        params![collection, record.id()],
    )?;

    for (field, value) in record.indexed_fields() {
        let (value_str, value_int) = match value.to_sql() {
            Value::Text(s) => (Some(s), None),
            Value::Integer(i) => (None, Some(i)),
            _ => (None, None),
        };
        conn.execute(
            "INSERT INTO record_indexes (collection, id, field, value_str, value_int) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, record.id(), field, value_str, value_int],
        )?;
    }
    Ok(())
}

fn get_record<T: Record>(conn: &Connection, id: &str) -> Result<Option<T>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM records WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
            |row| row.get(0),
        )
        .optional()?;

    data.map(|d| serde_json::from_str(&d).context("Failed to deserialize record"))
        .transpose()
}

/// Build the WHERE clause shared by list/count queries
fn where_clause<T: Record>(filters: &[Filter]) -> (String, Vec<Value>) {
    let mut sql = String::from("r.collection = ?1");
    let mut values = vec![Value::Text(T::collection_name().to_string())];

    for filter in filters {
        let field_param = values.len() + 1;
        let value_param = values.len() + 2;
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM record_indexes i WHERE i.collection = r.collection AND i.id = r.id \
             AND i.field = ?{} AND i.{} {} ?{})",
            field_param,
            filter.value.column(),
            filter.op.as_sql(),
            value_param
        ));
        values.push(Value::Text(filter.field.clone()));
        values.push(filter.value.to_sql());
    }

    (sql, values)
}

fn list_records<T: Record>(conn: &Connection, filters: &[Filter]) -> Result<Vec<T>> {
    let (clause, values) = where_clause::<T>(filters);
    let sql = format!("SELECT r.data FROM records r WHERE {} ORDER BY r.seq", clause);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;

    let mut records = Vec::new();
    for row in rows {
        let data = row?;
        records.push(serde_json::from_str(&data).context("Failed to deserialize record")?);
    }
    Ok(records)
}

fn count_records<T: Record>(conn: &Connection, filters: &[Filter]) -> Result<usize> {
    let (clause, values) = where_clause::<T>(filters);
    let sql = format!("SELECT COUNT(*) FROM records r WHERE {}", clause);
    let count: i64 = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
    Ok(count as usize)
}
