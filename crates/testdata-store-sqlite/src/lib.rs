use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use testdata_core::{
    decode_snapshot_payload, encode_snapshot_payload, CleanupRule, LifecycleError, OutputFormat,
    RecordId, Repository, RepositoryId, RepositoryRecord, RepositoryStatus, RuleAction, RuleId,
    RuleSchedule, RuleScope, Snapshot, SnapshotId, SyntheticDataTemplate, TemplateId,
};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS repositories (
  repository_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  name TEXT NOT NULL,
  description TEXT NOT NULL,
  source_uri TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active','archived','deleted')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(owner_id, name)
);

CREATE TABLE IF NOT EXISTS repository_records (
  record_id TEXT PRIMARY KEY,
  repository_id TEXT NOT NULL,
  record_key TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE(repository_id, record_key),
  FOREIGN KEY (repository_id) REFERENCES repositories(repository_id)
);

CREATE TABLE IF NOT EXISTS snapshots (
  snapshot_id TEXT PRIMARY KEY,
  repository_id TEXT NOT NULL,
  label TEXT NOT NULL,
  captured_at TEXT NOT NULL,
  payload_ref TEXT NOT NULL,
  size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
  checksum TEXT NOT NULL,
  archived INTEGER NOT NULL DEFAULT 0 CHECK (archived IN (0,1)),
  FOREIGN KEY (repository_id) REFERENCES repositories(repository_id)
);

CREATE TABLE IF NOT EXISTS cleanup_rules (
  rule_id TEXT PRIMARY KEY,
  scope_type TEXT NOT NULL CHECK (scope_type IN ('global','repository')),
  scope_repository_id TEXT,
  predicate_json TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('delete-snapshot','archive-repository','purge-repository')),
  schedule TEXT NOT NULL,
  enabled INTEGER NOT NULL CHECK (enabled IN (0,1))
);

CREATE TABLE IF NOT EXISTS synthetic_templates (
  template_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  name TEXT NOT NULL,
  schema_json TEXT NOT NULL,
  output_format TEXT NOT NULL CHECK (output_format IN ('json','csv')),
  created_at TEXT NOT NULL,
  UNIQUE(owner_id, name)
);

CREATE INDEX IF NOT EXISTS idx_repositories_owner ON repositories(owner_id);
CREATE INDEX IF NOT EXISTS idx_repository_records_repo ON repository_records(repository_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_repo ON snapshots(repository_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_captured_at ON snapshots(captured_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_payload_ref ON snapshots(payload_ref);
";

pub struct LifecycleStore {
    conn: Connection,
    payload_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl LifecycleStore {
    /// Open a SQLite-backed lifecycle store and configure required runtime pragmas.
    /// Snapshot payload blobs live in `payload_dir`, one file per content hash.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be
    /// applied, or the payload directory cannot be created.
    pub fn open(db_path: &Path, payload_dir: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open sqlite database at {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        fs::create_dir_all(payload_dir).with_context(|| {
            format!("failed to create payload directory {}", payload_dir.display())
        })?;

        Ok(Self { conn, payload_dir: payload_dir.to_path_buf() })
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
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist a new repository.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Conflict`] when the owner already has a
    /// repository with this name, [`LifecycleError::Validation`] when the
    /// repository fails validation, and an opaque error on storage failures.
    pub fn create_repository(&mut self, repository: &Repository) -> Result<()> {
        repository.validate().map_err(anyhow::Error::from)?;

        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM repositories WHERE owner_id = ?1 AND name = ?2)",
            params![repository.owner_id, repository.name],
            |row| row.get::<_, i64>(0),
        )?;
        if exists == 1 {
            return Err(LifecycleError::Conflict(format!(
                "repository name already in use: {}",
                repository.name
            ))
            .into());
        }

        self.conn
            .execute(
                "INSERT INTO repositories(
                    repository_id, owner_id, name, description, source_uri,
                    status, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    repository.repository_id.to_string(),
                    repository.owner_id,
                    repository.name,
                    repository.description,
                    repository.source_uri,
                    repository.status.as_str(),
                    rfc3339(repository.created_at)?,
                    rfc3339(repository.updated_at)?,
                ],
            )
            .context("failed to insert repository")?;
        Ok(())
    }

    /// Load one repository, enforcing ownership.
    ///
    /// Ownership failures are indistinguishable from absence so a requester
    /// cannot probe for other owners' repository ids.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] when no repository matches the id
    /// and requester.
    pub fn get_repository(
        &self,
        repository_id: RepositoryId,
        requester: &str,
    ) -> Result<Repository> {
        let row = self
            .conn
            .prepare(
                "SELECT repository_id, owner_id, name, description, source_uri,
                        status, created_at, updated_at
                 FROM repositories WHERE repository_id = ?1",
            )?
            .query_row(params![repository_id.to_string()], repository_from_row)
            .optional()?;

        match row {
            Some(repository) if repository.owner_id == requester => Ok(repository),
            _ => Err(LifecycleError::NotFound(format!("repository {repository_id}")).into()),
        }
    }

    /// List a requester's repositories, newest first, optionally filtered by status.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_repositories(
        &self,
        requester: &str,
        status: Option<RepositoryStatus>,
    ) -> Result<Vec<Repository>> {
        let mut stmt = self.conn.prepare(
            "SELECT repository_id, owner_id, name, description, source_uri,
                    status, created_at, updated_at
             FROM repositories
             WHERE owner_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, repository_id ASC",
        )?;
        let rows = stmt.query_map(
            params![requester, status.map(RepositoryStatus::as_str)],
            repository_from_row,
        )?;

        let mut repositories = Vec::new();
        for row in rows {
            repositories.push(row?);
        }
        Ok(repositories)
    }

    /// Load every repository regardless of owner. Cleanup evaluation runs with
    /// engine authority, not on behalf of a requester.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_all_repositories(&self) -> Result<Vec<Repository>> {
        let mut stmt = self.conn.prepare(
            "SELECT repository_id, owner_id, name, description, source_uri,
                    status, created_at, updated_at
             FROM repositories
             ORDER BY created_at DESC, repository_id ASC",
        )?;
        let rows = stmt.query_map([], repository_from_row)?;

        let mut repositories = Vec::new();
        for row in rows {
            repositories.push(row?);
        }
        Ok(repositories)
    }

    /// Move a repository forward in its lifecycle on behalf of a requester.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] on absent or foreign repositories
    /// and [`LifecycleError::InvalidTransition`] when the move is not strictly
    /// forward.
    pub fn update_status(
        &mut self,
        repository_id: RepositoryId,
        requester: &str,
        to: RepositoryStatus,
        now: OffsetDateTime,
    ) -> Result<Repository> {
        // Ownership never changes, so the requester check can run before the
        // write transaction; the status is re-read inside it.
        self.get_repository(repository_id, requester)?;
        self.transition(repository_id, to, now)
    }

    /// Move a repository forward in its lifecycle with engine authority.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] when the repository does not exist
    /// and [`LifecycleError::InvalidTransition`] when the move is not strictly
    /// forward.
    pub fn apply_status_transition(
        &mut self,
        repository_id: RepositoryId,
        to: RepositoryStatus,
        now: OffsetDateTime,
    ) -> Result<Repository> {
        self.transition(repository_id, to, now)
    }

    // The status read and the guarded write share one immediate transaction,
    // so a concurrent writer cannot move the repository between them.
    fn transition(
        &mut self,
        repository_id: RepositoryId,
        to: RepositoryStatus,
        now: OffsetDateTime,
    ) -> Result<Repository> {
        let now_text = rfc3339(now)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start status transaction")?;

        let mut repository = load_repository_on(&tx, repository_id)?;
        RepositoryStatus::ensure_transition(repository.status, to)
            .map_err(anyhow::Error::from)?;

        tx.execute(
            "UPDATE repositories SET status = ?1, updated_at = ?2
             WHERE repository_id = ?3 AND status = ?4",
            params![
                to.as_str(),
                now_text,
                repository_id.to_string(),
                repository.status.as_str()
            ],
        )
        .context("failed to update repository status")?;
        tx.commit().context("failed to commit status transaction")?;

        repository.status = to;
        repository.updated_at = now;
        Ok(repository)
    }

    /// Soft-delete a repository on behalf of a requester. Snapshots stay
    /// restorable into other repositories, so they are archived rather than
    /// removed, in the same transaction as the status change.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] on absent or foreign repositories
    /// and [`LifecycleError::InvalidTransition`] when the repository is
    /// already deleted.
    pub fn delete_repository(
        &mut self,
        repository_id: RepositoryId,
        requester: &str,
        now: OffsetDateTime,
    ) -> Result<Repository> {
        self.get_repository(repository_id, requester)?;
        self.soft_delete(repository_id, now)
    }

    /// Soft-delete a repository with engine authority, for purge cleanup actions.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] when the repository does not exist
    /// and [`LifecycleError::InvalidTransition`] when it is already deleted.
    pub fn purge_repository(
        &mut self,
        repository_id: RepositoryId,
        now: OffsetDateTime,
    ) -> Result<Repository> {
        self.soft_delete(repository_id, now)
    }

    // Same single-transaction shape as `transition`: the status read, the
    // delete mark, and the snapshot archival commit together or not at all.
    fn soft_delete(
        &mut self,
        repository_id: RepositoryId,
        now: OffsetDateTime,
    ) -> Result<Repository> {
        let now_text = rfc3339(now)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start delete transaction")?;

        let mut repository = load_repository_on(&tx, repository_id)?;
        RepositoryStatus::ensure_transition(repository.status, RepositoryStatus::Deleted)
            .map_err(anyhow::Error::from)?;

        tx.execute(
            "UPDATE repositories SET status = 'deleted', updated_at = ?1
             WHERE repository_id = ?2 AND status = ?3",
            params![now_text, repository_id.to_string(), repository.status.as_str()],
        )
        .context("failed to mark repository deleted")?;
        tx.execute(
            "UPDATE snapshots SET archived = 1 WHERE repository_id = ?1",
            params![repository_id.to_string()],
        )
        .context("failed to archive repository snapshots")?;
        tx.commit().context("failed to commit delete transaction")?;

        repository.status = RepositoryStatus::Deleted;
        repository.updated_at = now;
        Ok(repository)
    }

    /// Insert one content row into a repository.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Conflict`] when the record key is already
    /// taken within the repository and [`LifecycleError::Validation`] when the
    /// repository is deleted.
    pub fn insert_record(&mut self, record: &RepositoryRecord) -> Result<()> {
        let repository = self.load_repository(record.repository_id)?;
        if repository.status == RepositoryStatus::Deleted {
            return Err(LifecycleError::Validation(format!(
                "repository {} is deleted",
                record.repository_id
            ))
            .into());
        }

        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM repository_records
             WHERE repository_id = ?1 AND record_key = ?2)",
            params![record.repository_id.to_string(), record.record_key],
            |row| row.get::<_, i64>(0),
        )?;
        if exists == 1 {
            return Err(LifecycleError::Conflict(format!(
                "record key already in use: {}",
                record.record_key
            ))
            .into());
        }

        self.conn
            .execute(
                "INSERT INTO repository_records(
                    record_id, repository_id, record_key, payload_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.record_id.to_string(),
                    record.repository_id.to_string(),
                    record.record_key,
                    serde_json::to_string(&record.payload)
                        .context("failed to serialize record payload")?,
                    rfc3339(record.created_at)?,
                ],
            )
            .context("failed to insert repository record")?;
        Ok(())
    }

    /// Load a repository's content rows ordered by record key.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_records(&self, repository_id: RepositoryId) -> Result<Vec<RepositoryRecord>> {
        list_records_on(&self.conn, repository_id)
    }

    /// Capture an immutable snapshot of a repository's current content.
    ///
    /// The payload is encoded as deterministic NDJSON, hashed, and written to
    /// the payload directory under its content hash before the metadata row
    /// commits. Identical content across captures shares one blob.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] on absent or foreign repositories
    /// and [`LifecycleError::Validation`] when the repository is deleted.
    pub fn capture_snapshot(
        &mut self,
        repository_id: RepositoryId,
        requester: &str,
        label: &str,
        now: OffsetDateTime,
    ) -> Result<Snapshot> {
        // One immediate transaction spans the status check, the content read,
        // and the row insert, so a concurrent delete cannot slip in between.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start capture transaction")?;

        let repository = load_repository_on(&tx, repository_id)?;
        if repository.owner_id != requester {
            return Err(LifecycleError::NotFound(format!("repository {repository_id}")).into());
        }
        if repository.status == RepositoryStatus::Deleted {
            return Err(LifecycleError::Validation(format!(
                "repository {repository_id} is deleted"
            ))
            .into());
        }

        let records = list_records_on(&tx, repository_id)?;
        let payload = encode_snapshot_payload(&records).map_err(anyhow::Error::from)?;
        let checksum = sha256_hex(&payload);

        let blob_path = self.payload_dir.join(&checksum);
        let newly_written = !blob_path.exists();
        if newly_written {
            write_blob_atomically(&blob_path, &payload)?;
        }

        let snapshot = Snapshot {
            snapshot_id: SnapshotId::new(),
            repository_id,
            label: label.to_string(),
            captured_at: now,
            payload_ref: checksum.clone(),
            size_bytes: payload.len() as u64,
            checksum,
            archived: false,
        };

        let inserted = tx.execute(
            "INSERT INTO snapshots(
                snapshot_id, repository_id, label, captured_at,
                payload_ref, size_bytes, checksum, archived
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                snapshot.snapshot_id.to_string(),
                snapshot.repository_id.to_string(),
                snapshot.label,
                rfc3339(snapshot.captured_at)?,
                snapshot.payload_ref,
                i64::try_from(snapshot.size_bytes).context("snapshot payload too large")?,
                snapshot.checksum,
            ],
        );

        if let Err(err) = inserted {
            drop(tx);
            // Roll back the blob only if this capture created it and no other
            // snapshot row references it.
            if newly_written && !self.payload_referenced(&snapshot.payload_ref)? {
                let _ = fs::remove_file(&blob_path);
            }
            return Err(anyhow::Error::from(err).context("failed to insert snapshot"));
        }
        tx.commit().context("failed to commit capture transaction")?;

        Ok(snapshot)
    }

    /// Load one snapshot, enforcing ownership through its repository.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] when no snapshot matches the id
    /// and requester.
    pub fn get_snapshot(&self, snapshot_id: SnapshotId, requester: &str) -> Result<Snapshot> {
        let row = self
            .conn
            .prepare(
                "SELECT s.snapshot_id, s.repository_id, s.label, s.captured_at,
                        s.payload_ref, s.size_bytes, s.checksum, s.archived
                 FROM snapshots s
                 JOIN repositories r ON r.repository_id = s.repository_id
                 WHERE s.snapshot_id = ?1 AND r.owner_id = ?2",
            )?
            .query_row(params![snapshot_id.to_string(), requester], snapshot_from_row)
            .optional()?;

        row.ok_or_else(|| LifecycleError::NotFound(format!("snapshot {snapshot_id}")).into())
    }

    /// List a repository's snapshots, newest first.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] on absent or foreign repositories.
    pub fn list_snapshots(
        &self,
        repository_id: RepositoryId,
        requester: &str,
    ) -> Result<Vec<Snapshot>> {
        self.get_repository(repository_id, requester)?;

        let mut stmt = self.conn.prepare(
            "SELECT snapshot_id, repository_id, label, captured_at,
                    payload_ref, size_bytes, checksum, archived
             FROM snapshots
             WHERE repository_id = ?1
             ORDER BY captured_at DESC, snapshot_id ASC",
        )?;
        let rows = stmt.query_map(params![repository_id.to_string()], snapshot_from_row)?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    /// Load every snapshot regardless of owner, for cleanup evaluation.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_all_snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_id, repository_id, label, captured_at,
                    payload_ref, size_bytes, checksum, archived
             FROM snapshots
             ORDER BY captured_at ASC, snapshot_id ASC",
        )?;
        let rows = stmt.query_map([], snapshot_from_row)?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    /// Restore a snapshot's content into a target repository, replacing its
    /// current rows. Destructive: no pre-restore snapshot is taken on the
    /// caller's behalf.
    ///
    /// The payload blob is re-hashed and compared against the stored checksum
    /// before any row is touched; restored rows get fresh record ids.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] when either id is absent or
    /// foreign, [`LifecycleError::Validation`] when the target repository is
    /// deleted, and [`LifecycleError::Integrity`] when the blob does not
    /// match its checksum.
    pub fn restore_snapshot(
        &mut self,
        snapshot_id: SnapshotId,
        target_repository_id: RepositoryId,
        requester: &str,
        now: OffsetDateTime,
    ) -> Result<usize> {
        let snapshot = self.get_snapshot(snapshot_id, requester)?;
        let target = self.get_repository(target_repository_id, requester)?;
        if target.status == RepositoryStatus::Deleted {
            return Err(LifecycleError::Validation(format!(
                "repository {target_repository_id} is deleted"
            ))
            .into());
        }

        let blob_path = self.payload_path(&snapshot.payload_ref);
        let payload = fs::read(&blob_path).with_context(|| {
            format!("failed to read snapshot payload {}", blob_path.display())
        })?;

        let actual = sha256_hex(&payload);
        if actual != snapshot.checksum {
            return Err(LifecycleError::Integrity {
                payload_ref: snapshot.payload_ref.clone(),
                expected: snapshot.checksum.clone(),
                actual,
            }
            .into());
        }

        let rows = decode_snapshot_payload(&payload).map_err(anyhow::Error::from)?;

        let now_text = rfc3339(now)?;
        let tx = self.conn.transaction().context("failed to start restore transaction")?;
        tx.execute(
            "DELETE FROM repository_records WHERE repository_id = ?1",
            params![target_repository_id.to_string()],
        )
        .context("failed to clear repository records")?;

        for row in &rows {
            tx.execute(
                "INSERT INTO repository_records(
                    record_id, repository_id, record_key, payload_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    RecordId::new().to_string(),
                    target_repository_id.to_string(),
                    row.record_key,
                    serde_json::to_string(&row.payload)
                        .context("failed to serialize restored payload")?,
                    rfc3339(row.created_at)?,
                ],
            )
            .context("failed to insert restored record")?;
        }

        tx.execute(
            "UPDATE repositories SET updated_at = ?1 WHERE repository_id = ?2",
            params![now_text, target_repository_id.to_string()],
        )
        .context("failed to touch repository after restore")?;
        tx.commit().context("failed to commit restore transaction")?;

        Ok(rows.len())
    }

    /// Delete one snapshot row. Idempotent: deleting an absent snapshot
    /// returns `false`. The payload blob is unlinked only when no other
    /// snapshot still references it.
    ///
    /// # Errors
    /// Returns an error when the delete transaction or blob unlink fails.
    pub fn delete_snapshot(&mut self, snapshot_id: SnapshotId) -> Result<bool> {
        let payload_ref: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_ref FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload_ref) = payload_ref else {
            return Ok(false);
        };

        self.conn
            .execute(
                "DELETE FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id.to_string()],
            )
            .context("failed to delete snapshot")?;

        if !self.payload_referenced(&payload_ref)? {
            let blob_path = self.payload_path(&payload_ref);
            if blob_path.exists() {
                fs::remove_file(&blob_path).with_context(|| {
                    format!("failed to remove snapshot payload {}", blob_path.display())
                })?;
            }
        }

        Ok(true)
    }

    /// Persist or replace a cleanup rule.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when the rule is inconsistent
    /// and an opaque error on storage failures.
    pub fn put_rule(&mut self, rule: &CleanupRule) -> Result<()> {
        rule.validate().map_err(anyhow::Error::from)?;

        self.conn
            .execute(
                "INSERT OR REPLACE INTO cleanup_rules(
                    rule_id, scope_type, scope_repository_id, predicate_json,
                    action, schedule, enabled
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rule.rule_id.to_string(),
                    rule.scope.scope_type(),
                    rule.scope.repository_id().map(|id| id.to_string()),
                    serde_json::to_string(&rule.predicate)
                        .context("failed to serialize rule predicate")?,
                    rule.action.as_str(),
                    rule.schedule.as_str(),
                    i64::from(rule.enabled),
                ],
            )
            .context("failed to upsert cleanup rule")?;
        Ok(())
    }

    /// Load one cleanup rule.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] when the rule does not exist.
    pub fn get_rule(&self, rule_id: RuleId) -> Result<CleanupRule> {
        let row = self
            .conn
            .prepare(
                "SELECT rule_id, scope_type, scope_repository_id, predicate_json,
                        action, schedule, enabled
                 FROM cleanup_rules WHERE rule_id = ?1",
            )?
            .query_row(params![rule_id.to_string()], raw_rule_from_row)
            .optional()?;

        match row {
            Some(raw) => rule_from_raw(raw),
            None => Err(LifecycleError::NotFound(format!("rule {rule_id}")).into()),
        }
    }

    /// List all cleanup rules in insertion-id order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_rules(&self) -> Result<Vec<CleanupRule>> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_id, scope_type, scope_repository_id, predicate_json,
                    action, schedule, enabled
             FROM cleanup_rules
             ORDER BY rule_id ASC",
        )?;
        let rows = stmt.query_map([], raw_rule_from_row)?;

        let mut rules = Vec::new();
        for row in rows {
            rules.push(rule_from_raw(row?)?);
        }
        Ok(rules)
    }

    /// Persist a synthetic data template.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Conflict`] when the owner already has a
    /// template with this name and [`LifecycleError::Validation`] when the
    /// template is inconsistent.
    pub fn create_template(&mut self, template: &SyntheticDataTemplate) -> Result<()> {
        template.validate().map_err(anyhow::Error::from)?;

        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM synthetic_templates WHERE owner_id = ?1 AND name = ?2)",
            params![template.owner_id, template.name],
            |row| row.get::<_, i64>(0),
        )?;
        if exists == 1 {
            return Err(LifecycleError::Conflict(format!(
                "template name already in use: {}",
                template.name
            ))
            .into());
        }

        self.conn
            .execute(
                "INSERT INTO synthetic_templates(
                    template_id, owner_id, name, schema_json, output_format, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    template.template_id.to_string(),
                    template.owner_id,
                    template.name,
                    serde_json::to_string(&template.schema)
                        .context("failed to serialize template schema")?,
                    template.output_format.as_str(),
                    rfc3339(template.created_at)?,
                ],
            )
            .context("failed to insert synthetic template")?;
        Ok(())
    }

    /// Load one template, enforcing ownership.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotFound`] when no template matches the id
    /// and requester.
    pub fn get_template(
        &self,
        template_id: TemplateId,
        requester: &str,
    ) -> Result<SyntheticDataTemplate> {
        let row = self
            .conn
            .prepare(
                "SELECT template_id, owner_id, name, schema_json, output_format, created_at
                 FROM synthetic_templates WHERE template_id = ?1 AND owner_id = ?2",
            )?
            .query_row(params![template_id.to_string(), requester], |row| {
                Ok(RawTemplateRow {
                    template_id: row.get(0)?,
                    owner_id: row.get(1)?,
                    name: row.get(2)?,
                    schema_json: row.get(3)?,
                    output_format: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .optional()?;

        match row {
            Some(raw) => template_from_raw(raw),
            None => Err(LifecycleError::NotFound(format!("template {template_id}")).into()),
        }
    }

    /// List a requester's templates, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_templates(&self, requester: &str) -> Result<Vec<SyntheticDataTemplate>> {
        let mut stmt = self.conn.prepare(
            "SELECT template_id, owner_id, name, schema_json, output_format, created_at
             FROM synthetic_templates
             WHERE owner_id = ?1
             ORDER BY created_at DESC, template_id ASC",
        )?;
        let rows = stmt.query_map(params![requester], |row| {
            Ok(RawTemplateRow {
                template_id: row.get(0)?,
                owner_id: row.get(1)?,
                name: row.get(2)?,
                schema_json: row.get(3)?,
                output_format: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut templates = Vec::new();
        for row in rows {
            templates.push(template_from_raw(row?)?);
        }
        Ok(templates)
    }

    fn load_repository(&self, repository_id: RepositoryId) -> Result<Repository> {
        load_repository_on(&self.conn, repository_id)
    }

    fn payload_path(&self, payload_ref: &str) -> PathBuf {
        self.payload_dir.join(payload_ref)
    }

    fn payload_referenced(&self, payload_ref: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE payload_ref = ?1",
            params![payload_ref],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn load_repository_on(conn: &Connection, repository_id: RepositoryId) -> Result<Repository> {
    let row = conn
        .prepare(
            "SELECT repository_id, owner_id, name, description, source_uri,
                    status, created_at, updated_at
             FROM repositories WHERE repository_id = ?1",
        )?
        .query_row(params![repository_id.to_string()], repository_from_row)
        .optional()?;

    row.ok_or_else(|| LifecycleError::NotFound(format!("repository {repository_id}")).into())
}

fn list_records_on(conn: &Connection, repository_id: RepositoryId) -> Result<Vec<RepositoryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT record_id, repository_id, record_key, payload_json, created_at
         FROM repository_records
         WHERE repository_id = ?1
         ORDER BY record_key ASC",
    )?;
    let rows = stmt.query_map(params![repository_id.to_string()], |row| {
        Ok(RawRecordRow {
            record_id: row.get(0)?,
            repository_id: row.get(1)?,
            record_key: row.get(2)?,
            payload_json: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;

    let mut records = Vec::new();
    for row in rows {
        let row = row?;
        records.push(RepositoryRecord {
            record_id: RecordId(parse_ulid(&row.record_id)?),
            repository_id: RepositoryId(parse_ulid(&row.repository_id)?),
            record_key: row.record_key,
            payload: serde_json::from_str(&row.payload_json)
                .context("failed to deserialize record payload")?,
            created_at: parse_rfc3339(&row.created_at)?,
        });
    }
    Ok(records)
}

#[derive(Debug)]
struct RawRecordRow {
    record_id: String,
    repository_id: String,
    record_key: String,
    payload_json: String,
    created_at: String,
}

#[derive(Debug)]
struct RawRuleRow {
    rule_id: String,
    scope_type: String,
    scope_repository_id: Option<String>,
    predicate_json: String,
    action: String,
    schedule: String,
    enabled: i64,
}

#[derive(Debug)]
struct RawTemplateRow {
    template_id: String,
    owner_id: String,
    name: String,
    schema_json: String,
    output_format: String,
    created_at: String,
}

fn repository_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    let repository_id: String = row.get(0)?;
    let status_raw: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok(Repository {
        repository_id: RepositoryId(ulid_from_sql(0, &repository_id)?),
        owner_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        source_uri: row.get(4)?,
        status: RepositoryStatus::parse(&status_raw).ok_or_else(|| {
            sql_decode_error(5, format!("unknown repository status: {status_raw}"))
        })?,
        created_at: rfc3339_from_sql(6, &created_at)?,
        updated_at: rfc3339_from_sql(7, &updated_at)?,
    })
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Snapshot> {
    let snapshot_id: String = row.get(0)?;
    let repository_id: String = row.get(1)?;
    let captured_at: String = row.get(3)?;
    let size_bytes: i64 = row.get(5)?;
    let archived: i64 = row.get(7)?;

    Ok(Snapshot {
        snapshot_id: SnapshotId(ulid_from_sql(0, &snapshot_id)?),
        repository_id: RepositoryId(ulid_from_sql(1, &repository_id)?),
        label: row.get(2)?,
        captured_at: rfc3339_from_sql(3, &captured_at)?,
        payload_ref: row.get(4)?,
        size_bytes: u64::try_from(size_bytes)
            .map_err(|_| sql_decode_error(5, format!("negative snapshot size: {size_bytes}")))?,
        checksum: row.get(6)?,
        archived: archived == 1,
    })
}

fn raw_rule_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRuleRow> {
    Ok(RawRuleRow {
        rule_id: row.get(0)?,
        scope_type: row.get(1)?,
        scope_repository_id: row.get(2)?,
        predicate_json: row.get(3)?,
        action: row.get(4)?,
        schedule: row.get(5)?,
        enabled: row.get(6)?,
    })
}

fn rule_from_raw(raw: RawRuleRow) -> Result<CleanupRule> {
    let scope = match raw.scope_type.as_str() {
        "global" => RuleScope::Global,
        "repository" => {
            let id = raw
                .scope_repository_id
                .as_deref()
                .ok_or_else(|| anyhow!("repository-scoped rule {} has no repository", raw.rule_id))?;
            RuleScope::Repository(RepositoryId(parse_ulid(id)?))
        }
        other => return Err(anyhow!("unknown rule scope type: {other}")),
    };
    let action = RuleAction::parse(&raw.action)
        .ok_or_else(|| anyhow!("unknown rule action: {}", raw.action))?;

    Ok(CleanupRule {
        rule_id: RuleId(parse_ulid(&raw.rule_id)?),
        scope,
        predicate: serde_json::from_str(&raw.predicate_json)
            .context("failed to deserialize rule predicate")?,
        action,
        schedule: RuleSchedule::parse(&raw.schedule),
        enabled: raw.enabled == 1,
    })
}

fn template_from_raw(raw: RawTemplateRow) -> Result<SyntheticDataTemplate> {
    let output_format = OutputFormat::parse(&raw.output_format)
        .ok_or_else(|| anyhow!("unknown output format: {}", raw.output_format))?;

    Ok(SyntheticDataTemplate {
        template_id: TemplateId(parse_ulid(&raw.template_id)?),
        owner_id: raw.owner_id,
        name: raw.name,
        schema: serde_json::from_str(&raw.schema_json)
            .context("failed to deserialize template schema")?,
        output_format,
        created_at: parse_rfc3339(&raw.created_at)?,
    })
}

fn write_blob_atomically(path: &Path, payload: &[u8]) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(anyhow!("payload path has no parent: {}", path.display()));
    };
    let tmp_path = parent.join(format!(".tmp-{}", Ulid::new()));
    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write payload blob {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        let _ = fs::remove_file(&tmp_path);
        format!("failed to move payload blob into place at {}", path.display())
    })?;
    Ok(())
}

fn sha256_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
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

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn ulid_from_sql(column: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw)
        .map_err(|_| sql_decode_error(column, format!("invalid ULID in row: {raw}")))
}

fn rfc3339_from_sql(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .map_err(|_| sql_decode_error(column, format!("invalid RFC3339 timestamp in row: {raw}")))
}

fn sql_decode_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}
