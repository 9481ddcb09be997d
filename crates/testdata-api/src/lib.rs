use std::path::PathBuf;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use testdata_core::{
    generate_record, plan_cleanup, render_drafts, ActionOutcome, ActionResult, CleanupRule,
    CleanupTarget, GenerationReport, LifecycleError, OutputFormat, PlanDecision, RecordFailure,
    RecordId, Repository, RepositoryId, RepositoryRecord, RepositoryStatus, RuleAction, RuleId,
    RulePredicate, RuleSchedule, RuleScope, Snapshot, SnapshotId, SyntheticDataTemplate,
    TemplateId, TemplateSchema,
};
use testdata_store_sqlite::{LifecycleStore, SchemaStatus};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "tdl.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateRepositoryRequest {
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub source_uri: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddRecordRequest {
    pub repository_id: RepositoryId,
    pub requester: String,
    pub record_key: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateRuleRequest {
    pub scope: RuleScope,
    pub predicate: RulePredicate,
    pub action: RuleAction,
    pub schedule: RuleSchedule,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateTemplateRequest {
    pub owner_id: String,
    pub name: String,
    pub schema: TemplateSchema,
    pub output_format: OutputFormat,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateRequest {
    pub template_id: TemplateId,
    pub repository_id: RepositoryId,
    pub requester: String,
    pub count: u64,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreResult {
    pub snapshot_id: SnapshotId,
    pub repository_id: RepositoryId,
    pub restored_records: usize,
}

#[derive(Debug, Clone)]
pub struct TestDataApi {
    db_path: PathBuf,
    payload_dir: PathBuf,
}

impl TestDataApi {
    #[must_use]
    pub fn new(db_path: PathBuf, payload_dir: PathBuf) -> Self {
        Self { db_path, payload_dir }
    }

    fn open_store(&self) -> Result<LifecycleStore> {
        LifecycleStore::open(&self.db_path, &self.payload_dir)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Register a new repository for a data source.
    ///
    /// # Errors
    /// Returns an error when validation fails or the owner already has a
    /// repository with this name.
    pub fn create_repository(&self, input: CreateRepositoryRequest) -> Result<Repository> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let created_at = input.created_at.unwrap_or_else(OffsetDateTime::now_utc);
        let repository = Repository {
            repository_id: RepositoryId::new(),
            owner_id: input.owner_id,
            name: input.name,
            description: input.description,
            source_uri: input.source_uri,
            status: RepositoryStatus::Active,
            created_at,
            updated_at: created_at,
        };
        store.create_repository(&repository)?;
        Ok(repository)
    }

    /// Fetch one repository on behalf of a requester.
    ///
    /// # Errors
    /// Returns an error when the repository is absent or owned by someone else.
    pub fn get_repository(
        &self,
        repository_id: RepositoryId,
        requester: &str,
    ) -> Result<Repository> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.get_repository(repository_id, requester)
    }

    /// List a requester's repositories, optionally filtered by status.
    ///
    /// # Errors
    /// Returns an error when storage reads fail.
    pub fn list_repositories(
        &self,
        requester: &str,
        status: Option<RepositoryStatus>,
    ) -> Result<Vec<Repository>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_repositories(requester, status)
    }

    /// Move a repository forward in its lifecycle.
    ///
    /// # Errors
    /// Returns an error when the repository is absent, foreign, or the
    /// transition is not strictly forward.
    pub fn update_status(
        &self,
        repository_id: RepositoryId,
        requester: &str,
        to: RepositoryStatus,
    ) -> Result<Repository> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.update_status(repository_id, requester, to, OffsetDateTime::now_utc())
    }

    /// Soft-delete a repository, archiving its snapshots.
    ///
    /// # Errors
    /// Returns an error when the repository is absent, foreign, or already
    /// deleted.
    pub fn delete_repository(
        &self,
        repository_id: RepositoryId,
        requester: &str,
    ) -> Result<Repository> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.delete_repository(repository_id, requester, OffsetDateTime::now_utc())
    }

    /// Insert one content row into a requester's repository.
    ///
    /// # Errors
    /// Returns an error when the repository is absent, foreign, or deleted,
    /// or the record key is already taken.
    pub fn add_record(&self, input: AddRecordRequest) -> Result<RepositoryRecord> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.get_repository(input.repository_id, &input.requester)?;

        let record = RepositoryRecord {
            record_id: RecordId::new(),
            repository_id: input.repository_id,
            record_key: input.record_key,
            payload: input.payload,
            created_at: input.created_at.unwrap_or_else(OffsetDateTime::now_utc),
        };
        store.insert_record(&record)?;
        Ok(record)
    }

    /// List a requester's repository content rows.
    ///
    /// # Errors
    /// Returns an error when the repository is absent or foreign.
    pub fn list_records(
        &self,
        repository_id: RepositoryId,
        requester: &str,
    ) -> Result<Vec<RepositoryRecord>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.get_repository(repository_id, requester)?;
        store.list_records(repository_id)
    }

    /// Capture an immutable, checksummed snapshot of a repository's content.
    ///
    /// # Errors
    /// Returns an error when the repository is absent, foreign, or deleted.
    pub fn capture_snapshot(
        &self,
        repository_id: RepositoryId,
        requester: &str,
        label: &str,
        captured_at: Option<OffsetDateTime>,
    ) -> Result<Snapshot> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.capture_snapshot(
            repository_id,
            requester,
            label,
            captured_at.unwrap_or_else(OffsetDateTime::now_utc),
        )
    }

    /// List a repository's snapshots, newest first.
    ///
    /// # Errors
    /// Returns an error when the repository is absent or foreign.
    pub fn list_snapshots(
        &self,
        repository_id: RepositoryId,
        requester: &str,
    ) -> Result<Vec<Snapshot>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_snapshots(repository_id, requester)
    }

    /// Replace the target repository's content with a snapshot's verified
    /// payload. Destructive: the caller captures a pre-restore snapshot if
    /// recovery is wanted.
    ///
    /// # Errors
    /// Returns an error when either id is absent or foreign, the target
    /// repository is deleted, or the payload fails its checksum.
    pub fn restore_snapshot(
        &self,
        snapshot_id: SnapshotId,
        target_repository_id: RepositoryId,
        requester: &str,
    ) -> Result<RestoreResult> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let restored_records = store.restore_snapshot(
            snapshot_id,
            target_repository_id,
            requester,
            OffsetDateTime::now_utc(),
        )?;
        Ok(RestoreResult {
            snapshot_id,
            repository_id: target_repository_id,
            restored_records,
        })
    }

    /// Delete one snapshot. Idempotent: an absent or foreign snapshot reports
    /// `false` rather than failing.
    ///
    /// # Errors
    /// Returns an error when the delete transaction or blob cleanup fails.
    pub fn delete_snapshot(&self, snapshot_id: SnapshotId, requester: &str) -> Result<bool> {
        let mut store = self.open_store()?;
        store.migrate()?;
        match store.get_snapshot(snapshot_id, requester) {
            Ok(_) => store.delete_snapshot(snapshot_id),
            Err(err) => match err.downcast_ref::<LifecycleError>() {
                Some(LifecycleError::NotFound(_)) => Ok(false),
                _ => Err(err),
            },
        }
    }

    /// Register a cleanup rule.
    ///
    /// # Errors
    /// Returns an error when the rule's predicate/action combination is
    /// undefined or persistence fails.
    pub fn create_rule(&self, input: CreateRuleRequest) -> Result<CleanupRule> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let rule = CleanupRule {
            rule_id: RuleId::new(),
            scope: input.scope,
            predicate: input.predicate,
            action: input.action,
            schedule: input.schedule,
            enabled: input.enabled,
        };
        store.put_rule(&rule)?;
        Ok(rule)
    }

    /// List all cleanup rules.
    ///
    /// # Errors
    /// Returns an error when storage reads fail.
    pub fn list_rules(&self) -> Result<Vec<CleanupRule>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_rules()
    }

    /// Evaluate one cleanup rule against current state and apply its plan.
    ///
    /// A disabled rule yields no results. One failing target does not stop the
    /// pass; it is reported as failed and evaluation continues. Re-running over
    /// unchanged state applies nothing.
    ///
    /// # Errors
    /// Returns an error when the rule is absent or state cannot be loaded.
    pub fn evaluate_rule(
        &self,
        rule_id: RuleId,
        now: Option<OffsetDateTime>,
    ) -> Result<Vec<ActionResult>> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let rule = store.get_rule(rule_id)?;
        if !rule.enabled {
            return Ok(Vec::new());
        }

        let now = now.unwrap_or_else(OffsetDateTime::now_utc);
        let repositories = store.list_all_repositories()?;
        let snapshots = store.list_all_snapshots()?;
        let plan =
            plan_cleanup(&rule, &repositories, &snapshots, now).map_err(anyhow::Error::from)?;

        let mut results = Vec::with_capacity(plan.len());
        for planned in plan {
            let result = match planned.decision {
                PlanDecision::Skip { reason } => ActionResult {
                    target: planned.target,
                    outcome: ActionOutcome::Skipped,
                    detail: Some(reason),
                },
                PlanDecision::Apply => apply_target(&mut store, rule.action, planned.target, now),
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Register a synthetic data template.
    ///
    /// # Errors
    /// Returns an error when the schema is inconsistent or the owner already
    /// has a template with this name.
    pub fn create_template(&self, input: CreateTemplateRequest) -> Result<SyntheticDataTemplate> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let template = SyntheticDataTemplate {
            template_id: TemplateId::new(),
            owner_id: input.owner_id,
            name: input.name,
            schema: input.schema,
            output_format: input.output_format,
            created_at: input.created_at.unwrap_or_else(OffsetDateTime::now_utc),
        };
        store.create_template(&template)?;
        Ok(template)
    }

    /// List a requester's templates.
    ///
    /// # Errors
    /// Returns an error when storage reads fail.
    pub fn list_templates(&self, requester: &str) -> Result<Vec<SyntheticDataTemplate>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.list_templates(requester)
    }

    /// Generate synthetic records from a template into a repository.
    ///
    /// The schema is validated up front, so a malformed template fails before
    /// any record is written. Each record commits independently; per-record
    /// failures (format placeholder misses, record key conflicts) are reported
    /// in the returned summary while the batch continues.
    ///
    /// # Errors
    /// Returns an error when the template or repository is absent or foreign,
    /// the repository is deleted, or the schema fails validation.
    pub fn generate(&self, input: GenerateRequest) -> Result<GenerationReport> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let template = store.get_template(input.template_id, &input.requester)?;
        template.schema.validate().map_err(anyhow::Error::from)?;

        let repository = store.get_repository(input.repository_id, &input.requester)?;
        if repository.status == RepositoryStatus::Deleted {
            return Err(LifecycleError::Validation(format!(
                "repository {} is deleted",
                input.repository_id
            ))
            .into());
        }

        let now = OffsetDateTime::now_utc();
        let mut rng = StdRng::seed_from_u64(input.seed);
        let mut report = GenerationReport {
            requested: input.count,
            written: 0,
            failed: 0,
            failures: Vec::new(),
        };

        for index in 0..input.count {
            let draft = match generate_record(&template.schema, index, &mut rng, now) {
                Ok(draft) => draft,
                Err(err) => {
                    report.failed += 1;
                    report.failures.push(RecordFailure { index, reason: err.to_string() });
                    continue;
                }
            };

            let mut payload = serde_json::Map::new();
            for (name, value) in draft.fields {
                payload.insert(name, value);
            }
            let record = RepositoryRecord {
                record_id: RecordId::new(),
                repository_id: input.repository_id,
                record_key: draft.record_key,
                payload: serde_json::Value::Object(payload),
                created_at: now,
            };

            match store.insert_record(&record) {
                Ok(()) => report.written += 1,
                Err(err) => match err.downcast_ref::<LifecycleError>() {
                    Some(domain) => {
                        report.failed += 1;
                        report
                            .failures
                            .push(RecordFailure { index, reason: domain.to_string() });
                    }
                    None => return Err(err),
                },
            }
        }

        Ok(report)
    }

    /// Render a sample of a template's output without writing anything.
    ///
    /// # Errors
    /// Returns an error when the template is absent or foreign, the schema
    /// fails validation, or any sampled record fails to generate.
    pub fn preview_template(
        &self,
        template_id: TemplateId,
        requester: &str,
        count: u64,
        seed: u64,
    ) -> Result<String> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let template = store.get_template(template_id, requester)?;
        template.schema.validate().map_err(anyhow::Error::from)?;

        let now = OffsetDateTime::now_utc();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut drafts = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        for index in 0..count {
            let draft = generate_record(&template.schema, index, &mut rng, now)
                .map_err(anyhow::Error::from)?;
            drafts.push(draft);
        }

        render_drafts(&template.schema.fields, &drafts, template.output_format)
            .map_err(anyhow::Error::from)
    }
}

fn apply_target(
    store: &mut LifecycleStore,
    action: RuleAction,
    target: CleanupTarget,
    now: OffsetDateTime,
) -> ActionResult {
    let outcome = match (action, target) {
        (RuleAction::DeleteSnapshot, CleanupTarget::Snapshot(snapshot_id)) => {
            match store.delete_snapshot(snapshot_id) {
                Ok(true) => (ActionOutcome::Applied, None),
                Ok(false) => (ActionOutcome::Skipped, Some("already deleted".to_string())),
                Err(err) => (ActionOutcome::Failed, Some(err.to_string())),
            }
        }
        (RuleAction::ArchiveRepository, CleanupTarget::Repository(repository_id)) => {
            match store.apply_status_transition(repository_id, RepositoryStatus::Archived, now) {
                Ok(_) => (ActionOutcome::Applied, None),
                Err(err) => (ActionOutcome::Failed, Some(err.to_string())),
            }
        }
        (RuleAction::PurgeRepository, CleanupTarget::Repository(repository_id)) => {
            match store.purge_repository(repository_id, now) {
                Ok(_) => (ActionOutcome::Applied, None),
                Err(err) => (ActionOutcome::Failed, Some(err.to_string())),
            }
        }
        (action, target) => (
            ActionOutcome::Failed,
            Some(format!("action {} cannot apply to {target}", action.as_str())),
        ),
    };

    ActionResult { target, outcome: outcome.0, detail: outcome.1 }
}
