use std::path::Path;

use anyhow::{anyhow, Context, Result};
use engram_core::{Category, MemoryId, MemoryRecord, MemoryStore, StoreError};
use rusqlite::{params, Connection, Transaction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS memory_records (
  user_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  id TEXT NOT NULL,
  record_type TEXT NOT NULL CHECK (record_type IN ('profile','project','goal','preference','temp')),
  content TEXT NOT NULL,
  rationale TEXT,
  confidence REAL,
  weight REAL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, position)
);

CREATE INDEX IF NOT EXISTS idx_memory_records_user_id ON memory_records(user_id, id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed memory store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open a private, non-persistent database. Migrations are applied.
    ///
    /// # Errors
    /// Returns an error when the in-memory database cannot be created or migrated.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than
    /// this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied sqlite schema migration");
        }

        Ok(())
    }

    /// Load a user's records in stored order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn load_records(&self, user_id: &str) -> Result<Vec<MemoryRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, record_type, content, rationale, confidence, weight, created_at, updated_at
             FROM memory_records
             WHERE user_id = ?1
             ORDER BY position ASC",
        )?;

        let mut rows = stmt.query(params![user_id])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            let record_type_raw: String = row.get(1)?;
            let category = Category::parse(&record_type_raw)
                .ok_or_else(|| anyhow!("unknown record_type: {record_type_raw}"))?;

            records.push(MemoryRecord {
                id: MemoryId(row.get(0)?),
                category,
                content: row.get(2)?,
                rationale: row.get(3)?,
                confidence: row.get(4)?,
                weight: row.get(5)?,
                created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
                updated_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
            });
        }

        Ok(records)
    }

    /// Replace a user's records, preserving the given order.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn replace_records(&mut self, user_id: &str, records: &[MemoryRecord]) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM memory_records WHERE user_id = ?1", params![user_id])
            .context("failed to clear memory records")?;
        for (position, record) in records.iter().enumerate() {
            insert_record(&tx, user_id, i64::try_from(position)?, record)?;
        }
        tx.commit().context("failed to commit write transaction")?;
        Ok(())
    }

    /// Remove every record with `record.id` for the user and append `record`.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails.
    pub fn upsert_record(&mut self, user_id: &str, record: &MemoryRecord) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "DELETE FROM memory_records WHERE user_id = ?1 AND id = ?2",
            params![user_id, record.id.as_str()],
        )
        .context("failed to remove replaced memory record")?;
        let next_position = tx
            .query_row(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM memory_records WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to read next record position")?;
        insert_record(&tx, user_id, next_position, record)?;
        tx.commit().context("failed to commit upsert transaction")?;
        Ok(())
    }

    /// Users with at least one stored record, ascending.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read from `SQLite`.
    pub fn list_users(&self) -> Result<Vec<String>> {
        let mut stmt =
            self.conn.prepare("SELECT DISTINCT user_id FROM memory_records ORDER BY user_id ASC")?;
        let users = stmt.query_map([], |row| row.get::<_, String>(0))?;
        users.collect::<rusqlite::Result<Vec<_>>>().context("failed to list users")
    }
}

impl MemoryStore for SqliteStore {
    fn get(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError> {
        self.load_records(user_id).map_err(backend_error)
    }

    fn put(&mut self, user_id: &str, records: Vec<MemoryRecord>) -> Result<(), StoreError> {
        self.replace_records(user_id, &records).map_err(backend_error)
    }

    fn upsert(&mut self, user_id: &str, record: MemoryRecord) -> Result<(), StoreError> {
        self.upsert_record(user_id, &record).map_err(backend_error)
    }
}

fn backend_error(err: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

fn insert_record(
    tx: &Transaction<'_>,
    user_id: &str,
    position: i64,
    record: &MemoryRecord,
) -> Result<()> {
    tx.execute(
        "INSERT INTO memory_records(
            user_id, position, id, record_type, content, rationale,
            confidence, weight, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            user_id,
            position,
            record.id.as_str(),
            record.category.as_str(),
            record.content,
            record.rationale,
            record.confidence,
            record.weight,
            rfc3339(record.created_at)?,
            rfc3339(record.updated_at)?,
        ],
    )
    .with_context(|| format!("failed to insert memory record {}", record.id))?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
