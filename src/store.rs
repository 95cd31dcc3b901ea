/*!
 * SQLite-backed relational store for providers and billing records
 *
 * Owns the connection, the schema lifecycle (wipe and recreate), and the
 * secondary index lifecycle used around bulk loads.
 */

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::schema::{CREATE_TABLES_SQL, DROP_TABLES_SQL, SECONDARY_INDEXES};
use crate::{BillingError, Result};

/// Handle to the billing database
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) a database file for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| BillingError::storage(format!("failed opening {}", path.display()), e))?;
        Self::configure(&conn)?;

        Ok(Self { conn, path: Some(path.to_path_buf()) })
    }

    /// Open a database file that must already exist
    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.is_file() {
            return Err(BillingError::file_not_found_with_suggestion(path.to_path_buf()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| BillingError::storage(format!("failed opening {}", path.display()), e))?;
        Self::configure(&conn)?;

        Ok(Self { conn, path: Some(path.to_path_buf()) })
    }

    /// Private in-memory database, mostly useful for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self { conn, path: None })
    }

    fn configure(conn: &Connection) -> Result<()> {
        // journal_mode returns a row, so it cannot go through execute_batch
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Ok(())
    }

    /// Location on disk, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Drop both tables and create them empty
    pub fn reset_schema(&self) -> Result<()> {
        debug!("recreating billing schema");
        self.conn
            .execute_batch(DROP_TABLES_SQL)
            .map_err(|e| BillingError::storage("failed dropping tables", e))?;
        self.conn
            .execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| BillingError::storage("failed creating tables", e))?;
        Ok(())
    }

    /// Drop every secondary index
    pub fn drop_indexes(&self) -> Result<()> {
        for index in SECONDARY_INDEXES {
            debug!(index = index.name, "dropping index");
            self.conn
                .execute_batch(&index.drop_sql())
                .map_err(|e| BillingError::storage(format!("failed dropping {}", index.name), e))?;
        }
        Ok(())
    }

    /// Create every secondary index that does not exist yet
    pub fn create_indexes(&self) -> Result<()> {
        for index in SECONDARY_INDEXES {
            debug!(index = index.name, "creating index");
            self.conn
                .execute_batch(&index.create_sql())
                .map_err(|e| BillingError::storage(format!("failed creating {}", index.name), e))?;
        }
        Ok(())
    }

    /// Names of the secondary indexes currently present, sorted
    pub fn index_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'index' AND name LIKE 'ix_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    /// Whether the billing tables exist
    pub fn has_schema(&self) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('providers', 'billing_records')",
            [],
            |row| row.get(0),
        )?;
        Ok(count == 2)
    }

    pub fn provider_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM providers")
    }

    pub fn record_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM billing_records")
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
