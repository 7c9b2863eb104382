use std::path::Path;

use anyhow::{anyhow, Context, Result};
use private_datasets_core::{
    AllowListSession, AllowListStore, AllowedUser, Dataset, DatasetCatalog, DatasetState,
    OrgAuthorizer, OrgCapacity, PrivacyError, Resource,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::info;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS packages (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  creator_user_id TEXT,
  private INTEGER NOT NULL CHECK (private IN (0, 1)),
  state TEXT NOT NULL CHECK (state IN ('active','draft','deleted')),
  owner_org TEXT,
  adquire_url TEXT,
  searchable INTEGER CHECK (searchable IN (0, 1)),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS resources (
  id TEXT PRIMARY KEY,
  package_id TEXT NOT NULL,
  FOREIGN KEY (package_id) REFERENCES packages(id)
);

CREATE TABLE IF NOT EXISTS allowed_users (
  package_id TEXT NOT NULL,
  user_name TEXT NOT NULL,
  granted_at TEXT NOT NULL,
  PRIMARY KEY (package_id, user_name)
);

CREATE TABLE IF NOT EXISTS organization_members (
  org_id TEXT NOT NULL,
  user_name TEXT NOT NULL,
  capacity TEXT NOT NULL CHECK (capacity IN ('member','editor','admin')),
  PRIMARY KEY (org_id, user_name)
);

CREATE INDEX IF NOT EXISTS idx_resources_package ON resources(package_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS search_index (
  package_id TEXT PRIMARY KEY,
  capacity TEXT NOT NULL,
  document_json TEXT NOT NULL,
  indexed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_allowed_users_user ON allowed_users(user_name);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

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
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
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
    /// Running it again on an up-to-date database is a no-op.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let current = current_schema_version(&self.conn)?;
        for (version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }
            let tx = self
                .conn
                .unchecked_transaction()
                .with_context(|| format!("failed to start migration v{version}"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            record_schema_version(&tx, version)?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
            info!(version, "applied schema migration");
        }
        Ok(())
    }

    /// Insert or replace one dataset record.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn put_dataset(&mut self, dataset: &Dataset) -> Result<()> {
        if dataset.id.trim().is_empty() {
            return Err(anyhow!("dataset id MUST be provided"));
        }

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO packages(
                id, name, creator_user_id, private, state, owner_org, adquire_url, searchable, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                creator_user_id = excluded.creator_user_id,
                private = excluded.private,
                state = excluded.state,
                owner_org = excluded.owner_org,
                adquire_url = excluded.adquire_url,
                searchable = excluded.searchable,
                updated_at = excluded.updated_at",
            params![
                dataset.id,
                dataset.name,
                dataset.creator_user_id,
                dataset.private,
                dataset.state.as_str(),
                dataset.owner_org,
                dataset.adquire_url,
                dataset.searchable,
                now_rfc3339()?,
            ],
        )
        .context("failed to upsert dataset")?;
        tx.commit().context("failed to commit dataset transaction")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_dataset(&self, package_id: &str) -> Result<Option<Dataset>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, creator_user_id, private, state, owner_org, adquire_url, searchable
             FROM packages WHERE id = ?1",
        )?;
        let raw = stmt.query_row(params![package_id], read_dataset_row).optional()?;
        raw.map(DatasetRow::into_dataset).transpose()
    }

    /// Look a dataset up by id, falling back to its name.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_dataset(&self, reference: &str) -> Result<Option<Dataset>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, creator_user_id, private, state, owner_org, adquire_url, searchable
             FROM packages WHERE id = ?1 OR name = ?1
             ORDER BY id = ?1 DESC LIMIT 1",
        )?;
        let raw = stmt.query_row(params![reference], read_dataset_row).optional()?;
        raw.map(DatasetRow::into_dataset).transpose()
    }

    /// # Errors
    /// Returns an error when the owning dataset is unknown or the write fails.
    pub fn put_resource(&mut self, resource: &Resource) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO resources(id, package_id) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET package_id = excluded.package_id",
                params![resource.id, resource.package_id],
            )
            .with_context(|| format!("failed to persist resource {}", resource.id))?;
        Ok(())
    }

    /// Resolve the dataset a resource belongs to.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn dataset_for_resource(&self, resource_id: &str) -> Result<Option<Dataset>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.name, p.creator_user_id, p.private, p.state, p.owner_org,
                    p.adquire_url, p.searchable
             FROM packages p
             JOIN resources r ON r.package_id = p.id
             WHERE r.id = ?1",
        )?;
        let raw = stmt.query_row(params![resource_id], read_dataset_row).optional()?;
        raw.map(DatasetRow::into_dataset).transpose()
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn put_org_member(
        &mut self,
        org_id: &str,
        user_name: &str,
        capacity: OrgCapacity,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO organization_members(org_id, user_name, capacity) VALUES (?1, ?2, ?3)
                 ON CONFLICT(org_id, user_name) DO UPDATE SET capacity = excluded.capacity",
                params![org_id, user_name, capacity.as_str()],
            )
            .context("failed to persist organization member")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails or an unknown capacity is stored.
    pub fn org_capacity(&self, org_id: &str, user_name: &str) -> Result<Option<OrgCapacity>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT capacity FROM organization_members WHERE org_id = ?1 AND user_name = ?2",
                params![org_id, user_name],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read organization membership")?;

        raw.map(|value| {
            OrgCapacity::parse(&value).ok_or_else(|| anyhow!("unknown capacity: {value}"))
        })
        .transpose()
    }

    /// Allow-list rows of one dataset, ordered by user name.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_allowed_users(&self, package_id: &str) -> Result<Vec<AllowedUser>> {
        let mut stmt = self.conn.prepare(
            "SELECT package_id, user_name FROM allowed_users
             WHERE package_id = ?1 ORDER BY user_name ASC",
        )?;
        let rows = stmt.query_map(params![package_id], |row| {
            Ok(AllowedUser { package_id: row.get(0)?, user_name: row.get(1)? })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read allowed users")
    }

    /// Ids of the datasets whose allow-list names `user_name`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn adquired_datasets(&self, user_name: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT package_id FROM allowed_users WHERE user_name = ?1 ORDER BY package_id ASC",
        )?;
        let rows = stmt.query_map(params![user_name], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read acquired datasets")
    }

    /// Start a unit of work for allow-list writes. Nothing is persisted until
    /// [`SqliteSession::commit`]; dropping the session rolls it back.
    ///
    /// # Errors
    /// Returns an error when a transaction is already open or cannot be started.
    pub fn session(&self) -> Result<SqliteSession<'_>> {
        let tx = self.conn.unchecked_transaction().context("failed to start session")?;
        Ok(SqliteSession { tx })
    }

    /// Store the search document of one dataset, replacing the previous one.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn put_index_document(&self, package_id: &str, document: &Value) -> Result<()> {
        let capacity = document.get("capacity").and_then(Value::as_str).unwrap_or("public");
        self.conn
            .execute(
                "INSERT INTO search_index(package_id, capacity, document_json, indexed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(package_id) DO UPDATE SET
                    capacity = excluded.capacity,
                    document_json = excluded.document_json,
                    indexed_at = excluded.indexed_at",
                params![
                    package_id,
                    capacity,
                    serde_json::to_string(document).context("failed to serialize document")?,
                    now_rfc3339()?,
                ],
            )
            .context("failed to persist search document")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn get_index_document(&self, package_id: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT document_json FROM search_index WHERE package_id = ?1",
                params![package_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("failed to deserialize search document")?,
            )),
            None => Ok(None),
        }
    }

    /// Ids of the datasets visible in public search results.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn public_index_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT package_id FROM search_index WHERE capacity = 'public' ORDER BY package_id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to read search index")
    }
}

/// Allow-list writes queued on one `SQLite` transaction.
pub struct SqliteSession<'a> {
    tx: Transaction<'a>,
}

impl SqliteSession<'_> {
    /// # Errors
    /// Returns an error when the transaction cannot be committed.
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("failed to commit session")
    }

    /// Queue the soft delete of a dataset. Returns `false` when it does not exist.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn mark_deleted(&mut self, package_id: &str) -> Result<bool> {
        let changed = self
            .tx
            .execute(
                "UPDATE packages SET state = 'deleted', updated_at = ?2 WHERE id = ?1",
                params![package_id, now_rfc3339()?],
            )
            .context("failed to mark dataset deleted")?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the write fails.
    pub fn delete_index_document(&mut self, package_id: &str) -> Result<bool> {
        let changed = self
            .tx
            .execute("DELETE FROM search_index WHERE package_id = ?1", params![package_id])
            .context("failed to delete search document")?;
        Ok(changed > 0)
    }
}

impl AllowListSession for SqliteSession<'_> {
    fn add(&mut self, entry: AllowedUser) -> Result<(), PrivacyError> {
        let granted_at = now_rfc3339().map_err(persistence)?;
        self.tx
            .execute(
                "INSERT OR IGNORE INTO allowed_users(package_id, user_name, granted_at)
                 VALUES (?1, ?2, ?3)",
                params![entry.package_id, entry.user_name, granted_at],
            )
            .context("failed to insert allowed user")
            .map_err(persistence)?;
        Ok(())
    }

    fn delete(&mut self, entry: &AllowedUser) -> Result<(), PrivacyError> {
        self.tx
            .execute(
                "DELETE FROM allowed_users WHERE package_id = ?1 AND user_name = ?2",
                params![entry.package_id, entry.user_name],
            )
            .context("failed to delete allowed user")
            .map_err(persistence)?;
        Ok(())
    }
}

impl DatasetCatalog for SqliteStore {
    fn package(&self, package_id: &str) -> Result<Option<Dataset>, PrivacyError> {
        self.get_dataset(package_id).map_err(persistence)
    }

    fn package_for_resource(&self, resource_id: &str) -> Result<Option<Dataset>, PrivacyError> {
        self.dataset_for_resource(resource_id).map_err(persistence)
    }
}

impl AllowListStore for SqliteStore {
    fn init(&self) -> Result<(), PrivacyError> {
        self.migrate().map_err(persistence)
    }

    fn allowed_users(&self, package_id: &str) -> Result<Vec<AllowedUser>, PrivacyError> {
        self.list_allowed_users(package_id).map_err(persistence)
    }
}

impl OrgAuthorizer for SqliteStore {
    fn has_permission(
        &self,
        org_id: &str,
        user_name: Option<&str>,
        permission: &str,
    ) -> Result<bool, PrivacyError> {
        let Some(user_name) = user_name else {
            return Ok(false);
        };
        let capacity = self.org_capacity(org_id, user_name).map_err(persistence)?;
        Ok(capacity.is_some_and(|capacity| capacity.grants(permission)))
    }
}

fn persistence(err: anyhow::Error) -> PrivacyError {
    PrivacyError::Persistence(format!("{err:#}"))
}

struct DatasetRow {
    id: String,
    name: String,
    creator_user_id: Option<String>,
    private: bool,
    state: String,
    owner_org: Option<String>,
    adquire_url: Option<String>,
    searchable: Option<bool>,
}

impl DatasetRow {
    fn into_dataset(self) -> Result<Dataset> {
        let state = DatasetState::parse(&self.state)
            .ok_or_else(|| anyhow!("unknown dataset state: {}", self.state))?;
        Ok(Dataset {
            id: self.id,
            name: self.name,
            creator_user_id: self.creator_user_id,
            private: self.private,
            state,
            owner_org: self.owner_org,
            adquire_url: self.adquire_url,
            searchable: self.searchable,
        })
    }
}

fn read_dataset_row(row: &Row<'_>) -> rusqlite::Result<DatasetRow> {
    Ok(DatasetRow {
        id: row.get(0)?,
        name: row.get(1)?,
        creator_user_id: row.get(2)?,
        private: row.get(3)?,
        state: row.get(4)?,
        owner_org: row.get(5)?,
        adquire_url: row.get(6)?,
        searchable: row.get(7)?,
    })
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
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
