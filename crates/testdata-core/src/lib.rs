use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LifecycleError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: RepositoryStatus, to: RepositoryStatus },
    #[error("integrity error: payload {payload_ref} checksum mismatch: expected {expected}, got {actual}")]
    Integrity { payload_ref: String, expected: String, actual: String },
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RepositoryId(pub Ulid);

impl RepositoryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RepositoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RepositoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SnapshotId(pub Ulid);

impl SnapshotId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RuleId(pub Ulid);

impl RuleId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TemplateId(pub Ulid);

impl TemplateId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TemplateId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TemplateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryStatus {
    Active,
    Archived,
    Deleted,
}

impl RepositoryStatus {
    /// Position in the one-way lifecycle; transitions only move to a higher rank.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Archived => 1,
            Self::Deleted => 2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Reject any transition that does not move strictly forward in the
    /// `active -> archived -> deleted` ordering.
    ///
    /// # Errors
    /// Returns [`LifecycleError::InvalidTransition`] for same-status and
    /// backward transitions.
    pub fn ensure_transition(from: Self, to: Self) -> Result<(), LifecycleError> {
        if to.rank() > from.rank() {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition { from, to })
        }
    }
}

impl Display for RepositoryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub repository_id: RepositoryId,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub source_uri: String,
    pub status: RepositoryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Repository {
    /// Validate creation-time fields.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when identity or naming fields
    /// are blank.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.owner_id.trim().is_empty() {
            return Err(LifecycleError::Validation("owner_id MUST be provided".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(LifecycleError::Validation("repository name MUST be non-empty".to_string()));
        }
        if self.source_uri.trim().is_empty() {
            return Err(LifecycleError::Validation("source_uri MUST be provided".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub repository_id: RepositoryId,
    pub label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
    /// Content address of the payload blob: the lower-hex SHA-256 of the
    /// encoded payload, which is also its filename in the payload directory.
    pub payload_ref: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub archived: bool,
}

/// One row of repository content as stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryRecord {
    pub record_id: RecordId,
    pub repository_id: RepositoryId,
    pub record_key: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One row of repository content as captured inside a snapshot payload.
/// Record ids are deliberately excluded: restoring mints fresh ids, and two
/// repositories with identical content produce identical payloads (and so
/// share one content-addressed blob).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRecord {
    pub record_key: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SnapshotRecord {
    #[must_use]
    pub fn from_record(record: &RepositoryRecord) -> Self {
        Self {
            record_key: record.record_key.clone(),
            payload: record.payload.clone(),
            created_at: record.created_at,
        }
    }
}

/// Encode repository content as deterministic NDJSON, sorted by record key.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when a row cannot be serialized.
pub fn encode_snapshot_payload(records: &[RepositoryRecord]) -> Result<Vec<u8>, LifecycleError> {
    let mut rows = records.iter().map(SnapshotRecord::from_record).collect::<Vec<_>>();
    rows.sort_by(|lhs, rhs| lhs.record_key.cmp(&rhs.record_key));

    let mut out = Vec::new();
    for row in &rows {
        let line = serde_json::to_string(row).map_err(|err| {
            LifecycleError::Validation(format!("failed to encode payload row: {err}"))
        })?;
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
    }
    Ok(out)
}

/// Decode an NDJSON snapshot payload back into captured rows.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when the payload is not valid UTF-8
/// NDJSON.
pub fn decode_snapshot_payload(payload: &[u8]) -> Result<Vec<SnapshotRecord>, LifecycleError> {
    let text = std::str::from_utf8(payload).map_err(|err| {
        LifecycleError::Validation(format!("snapshot payload is not UTF-8: {err}"))
    })?;

    let mut rows = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let row = serde_json::from_str(trimmed).map_err(|err| {
            LifecycleError::Validation(format!("invalid payload row {}: {err}", index + 1))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "repository_id", rename_all = "snake_case")]
pub enum RuleScope {
    Global,
    Repository(RepositoryId),
}

impl RuleScope {
    #[must_use]
    pub fn scope_type(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Repository(_) => "repository",
        }
    }

    #[must_use]
    pub fn repository_id(self) -> Option<RepositoryId> {
        match self {
            Self::Global => None,
            Self::Repository(id) => Some(id),
        }
    }

    #[must_use]
    pub fn includes(self, repository_id: RepositoryId) -> bool {
        match self {
            Self::Global => true,
            Self::Repository(id) => id == repository_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RulePredicate {
    /// Targets older than the given number of days at evaluation time.
    MaxAge { days: u32 },
    /// Keep the newest `keep` snapshots per repository; older ones are in scope.
    MaxCount { keep: u32 },
    /// Targets whose owning repository currently has this status.
    StatusIs { status: RepositoryStatus },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    DeleteSnapshot,
    ArchiveRepository,
    PurgeRepository,
}

impl RuleAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeleteSnapshot => "delete-snapshot",
            Self::ArchiveRepository => "archive-repository",
            Self::PurgeRepository => "purge-repository",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "delete-snapshot" => Some(Self::DeleteSnapshot),
            "archive-repository" => Some(Self::ArchiveRepository),
            "purge-repository" => Some(Self::PurgeRepository),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuleSchedule {
    OnDemand,
    Cron(String),
}

impl RuleSchedule {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::OnDemand => "on-demand",
            Self::Cron(expr) => expr.as_str(),
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value == "on-demand" {
            Self::OnDemand
        } else {
            Self::Cron(value.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CleanupRule {
    pub rule_id: RuleId,
    pub scope: RuleScope,
    pub predicate: RulePredicate,
    pub action: RuleAction,
    pub schedule: RuleSchedule,
    pub enabled: bool,
}

impl CleanupRule {
    /// Check that the predicate makes sense for the action's target kind.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] for predicate/action combinations
    /// with no defined meaning (`max_count` against repository actions) and
    /// blank cron expressions.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if matches!(self.predicate, RulePredicate::MaxCount { .. })
            && self.action != RuleAction::DeleteSnapshot
        {
            return Err(LifecycleError::Validation(
                "max_count predicate is only defined for the delete-snapshot action".to_string(),
            ));
        }
        if let RuleSchedule::Cron(expr) = &self.schedule {
            if expr.trim().is_empty() {
                return Err(LifecycleError::Validation(
                    "cron schedule MUST be non-empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CleanupTarget {
    Snapshot(SnapshotId),
    Repository(RepositoryId),
}

impl Display for CleanupTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snapshot(id) => write!(f, "snapshot {id}"),
            Self::Repository(id) => write!(f, "repository {id}"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PlanDecision {
    Apply,
    Skip { reason: String },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PlannedAction {
    pub target: CleanupTarget,
    pub decision: PlanDecision,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    Skipped,
    Failed,
}

/// Per-target result of one cleanup evaluation pass.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActionResult {
    pub target: CleanupTarget,
    pub outcome: ActionOutcome,
    pub detail: Option<String>,
}

/// Resolve a cleanup rule against loaded state into per-target decisions.
///
/// Pure function of stored state plus `now`; it never mutates anything and
/// holds no timers. Every candidate in the rule's scope gets a decision, so
/// re-evaluation over unchanged state is visibly idempotent: targets the
/// first pass actioned either disappear from the candidate set or come back
/// as skips. Candidates are ordered oldest-first to bound the damage of an
/// interrupted run.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when the rule's predicate/action
/// combination is undefined.
pub fn plan_cleanup(
    rule: &CleanupRule,
    repositories: &[Repository],
    snapshots: &[Snapshot],
    now: OffsetDateTime,
) -> Result<Vec<PlannedAction>, LifecycleError> {
    rule.validate()?;

    let scoped: Vec<&Repository> = repositories
        .iter()
        .filter(|repository| rule.scope.includes(repository.repository_id))
        .collect();

    match rule.action {
        RuleAction::DeleteSnapshot => Ok(plan_snapshot_deletions(rule, &scoped, snapshots, now)),
        RuleAction::ArchiveRepository => Ok(plan_repository_action(
            rule,
            &scoped,
            now,
            RepositoryStatus::Archived,
            "already archived",
        )),
        RuleAction::PurgeRepository => Ok(plan_repository_action(
            rule,
            &scoped,
            now,
            RepositoryStatus::Deleted,
            "already purged",
        )),
    }
}

fn plan_snapshot_deletions(
    rule: &CleanupRule,
    scoped: &[&Repository],
    snapshots: &[Snapshot],
    now: OffsetDateTime,
) -> Vec<PlannedAction> {
    let status_by_repo: BTreeMap<RepositoryId, RepositoryStatus> = scoped
        .iter()
        .map(|repository| (repository.repository_id, repository.status))
        .collect();

    let mut candidates: Vec<&Snapshot> = snapshots
        .iter()
        .filter(|snapshot| status_by_repo.contains_key(&snapshot.repository_id))
        .collect();
    candidates.sort_by(|lhs, rhs| {
        lhs.captured_at.cmp(&rhs.captured_at).then_with(|| lhs.snapshot_id.cmp(&rhs.snapshot_id))
    });

    // For max_count the survivors are the newest `keep` per repository.
    let mut survivors: BTreeSet<SnapshotId> = BTreeSet::new();
    if let RulePredicate::MaxCount { keep } = rule.predicate {
        let mut kept_per_repo: BTreeMap<RepositoryId, u32> = BTreeMap::new();
        for snapshot in candidates.iter().rev() {
            let kept = kept_per_repo.entry(snapshot.repository_id).or_insert(0);
            if *kept < keep {
                *kept += 1;
                survivors.insert(snapshot.snapshot_id);
            }
        }
    }

    let mut plan = Vec::with_capacity(candidates.len());
    for snapshot in candidates {
        let decision = match rule.predicate {
            RulePredicate::MaxAge { days } => {
                if is_older_than(snapshot.captured_at, days, now) {
                    PlanDecision::Apply
                } else {
                    PlanDecision::Skip { reason: format!("younger than {days} days") }
                }
            }
            RulePredicate::MaxCount { keep } => {
                if survivors.contains(&snapshot.snapshot_id) {
                    PlanDecision::Skip { reason: format!("within newest {keep} snapshots") }
                } else {
                    PlanDecision::Apply
                }
            }
            RulePredicate::StatusIs { status } => {
                if status_by_repo.get(&snapshot.repository_id) == Some(&status) {
                    PlanDecision::Apply
                } else {
                    PlanDecision::Skip { reason: format!("repository status is not {status}") }
                }
            }
        };
        plan.push(PlannedAction {
            target: CleanupTarget::Snapshot(snapshot.snapshot_id),
            decision,
        });
    }

    plan
}

fn plan_repository_action(
    rule: &CleanupRule,
    scoped: &[&Repository],
    now: OffsetDateTime,
    end_state: RepositoryStatus,
    actioned_reason: &str,
) -> Vec<PlannedAction> {
    let mut candidates = scoped.to_vec();
    candidates.sort_by(|lhs, rhs| {
        lhs.updated_at
            .cmp(&rhs.updated_at)
            .then_with(|| lhs.repository_id.cmp(&rhs.repository_id))
    });

    let mut plan = Vec::with_capacity(candidates.len());
    for repository in candidates {
        let decision = if repository.status.rank() >= end_state.rank() {
            PlanDecision::Skip { reason: actioned_reason.to_string() }
        } else {
            match rule.predicate {
                RulePredicate::MaxAge { days } => {
                    if is_older_than(repository.updated_at, days, now) {
                        PlanDecision::Apply
                    } else {
                        PlanDecision::Skip { reason: format!("updated within {days} days") }
                    }
                }
                RulePredicate::StatusIs { status } => {
                    if repository.status == status {
                        PlanDecision::Apply
                    } else {
                        PlanDecision::Skip { reason: format!("repository status is not {status}") }
                    }
                }
                // Rejected by CleanupRule::validate before planning.
                RulePredicate::MaxCount { keep } => PlanDecision::Skip {
                    reason: format!("max_count keep={keep} undefined for repositories"),
                },
            }
        };
        plan.push(PlannedAction {
            target: CleanupTarget::Repository(repository.repository_id),
            decision,
        });
    }
    plan
}

fn is_older_than(moment: OffsetDateTime, days: u32, now: OffsetDateTime) -> bool {
    moment + Duration::days(i64::from(days)) <= now
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Csv,
}

impl OutputFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorSpec {
    /// `start + row index`, for stable monotonically increasing values.
    Sequence { start: u64 },
    /// Inclusive seeded-random integer range.
    IntRange { min: i64, max: i64 },
    /// Seeded pick from a fixed option list.
    Choice { options: Vec<String> },
    Constant { value: serde_json::Value },
    /// Generation wall-clock time, RFC3339.
    Timestamp,
    /// Template string interpolating `{field}` placeholders against fields
    /// generated earlier in the same record. An unknown placeholder fails
    /// that record at generation time, not the whole batch.
    Format { pattern: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    /// Name of a generator declared in the template's generator map.
    pub generator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateSchema {
    pub generators: BTreeMap<String, GeneratorSpec>,
    pub fields: Vec<FieldSpec>,
    /// Field whose generated value becomes the record key; defaults to the
    /// row index when unset.
    pub key_field: Option<String>,
}

impl TemplateSchema {
    /// Check internal consistency before any record is generated.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] when a field references an
    /// undefined generator, field names collide, the key field is not a
    /// declared field, or a generator's parameters are degenerate.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.fields.is_empty() {
            return Err(LifecycleError::Validation(
                "template MUST declare at least one field".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(LifecycleError::Validation("field names MUST be non-empty".to_string()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(LifecycleError::Validation(format!(
                    "duplicate field name: {}",
                    field.name
                )));
            }
            if !self.generators.contains_key(&field.generator) {
                return Err(LifecycleError::Validation(format!(
                    "field {} references undefined generator {}",
                    field.name, field.generator
                )));
            }
        }

        if let Some(key_field) = &self.key_field {
            if !seen.contains(key_field.as_str()) {
                return Err(LifecycleError::Validation(format!(
                    "key_field {key_field} is not a declared field"
                )));
            }
        }

        for (name, spec) in &self.generators {
            match spec {
                GeneratorSpec::IntRange { min, max } if min > max => {
                    return Err(LifecycleError::Validation(format!(
                        "generator {name}: int_range min {min} exceeds max {max}"
                    )));
                }
                GeneratorSpec::Choice { options } if options.is_empty() => {
                    return Err(LifecycleError::Validation(format!(
                        "generator {name}: choice options MUST be non-empty"
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyntheticDataTemplate {
    pub template_id: TemplateId,
    pub owner_id: String,
    pub name: String,
    pub schema: TemplateSchema,
    pub output_format: OutputFormat,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SyntheticDataTemplate {
    /// Validate identity fields and the embedded schema.
    ///
    /// # Errors
    /// Returns [`LifecycleError::Validation`] on blank identity fields or an
    /// inconsistent schema.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.owner_id.trim().is_empty() {
            return Err(LifecycleError::Validation("owner_id MUST be provided".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(LifecycleError::Validation("template name MUST be non-empty".to_string()));
        }
        self.schema.validate()
    }
}

/// One generated record before persistence: ordered field values plus the
/// record key derived from the template's key field (or the row index).
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    pub record_key: String,
    pub fields: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordFailure {
    pub index: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GenerationReport {
    pub requested: u64,
    pub written: u64,
    pub failed: u64,
    pub failures: Vec<RecordFailure>,
}

/// Instantiate one record from a validated schema.
///
/// Deterministic given the RNG state and `index`; callers seed the RNG once
/// per batch for reproducible datasets.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when a format pattern references a
/// placeholder that is not an earlier field of the same record; this is a
/// per-record failure, not a batch failure.
pub fn generate_record<R: Rng>(
    schema: &TemplateSchema,
    index: u64,
    rng: &mut R,
    now: OffsetDateTime,
) -> Result<RecordDraft, LifecycleError> {
    let mut fields: Vec<(String, serde_json::Value)> = Vec::with_capacity(schema.fields.len());

    for field in &schema.fields {
        let Some(spec) = schema.generators.get(&field.generator) else {
            return Err(LifecycleError::Validation(format!(
                "field {} references undefined generator {}",
                field.name, field.generator
            )));
        };
        let value = instantiate(spec, index, rng, now, &fields)?;
        fields.push((field.name.clone(), value));
    }

    let record_key = match &schema.key_field {
        Some(key_field) => fields
            .iter()
            .find(|(name, _)| name == key_field)
            .map(|(_, value)| value_to_key(value))
            .ok_or_else(|| {
                LifecycleError::Validation(format!("key_field {key_field} is not a declared field"))
            })?,
        None => index.to_string(),
    };

    Ok(RecordDraft { record_key, fields })
}

fn instantiate<R: Rng>(
    spec: &GeneratorSpec,
    index: u64,
    rng: &mut R,
    now: OffsetDateTime,
    generated: &[(String, serde_json::Value)],
) -> Result<serde_json::Value, LifecycleError> {
    match spec {
        GeneratorSpec::Sequence { start } => {
            let value = start.checked_add(index).ok_or_else(|| {
                LifecycleError::Validation(format!(
                    "sequence starting at {start} overflows at row {index}"
                ))
            })?;
            Ok(serde_json::Value::from(value))
        }
        GeneratorSpec::IntRange { min, max } => {
            if min > max {
                return Err(LifecycleError::Validation(format!(
                    "int_range min {min} exceeds max {max}"
                )));
            }
            Ok(serde_json::Value::from(rng.gen_range(*min..=*max)))
        }
        GeneratorSpec::Choice { options } => {
            if options.is_empty() {
                return Err(LifecycleError::Validation(
                    "choice options MUST be non-empty".to_string(),
                ));
            }
            let picked = rng.gen_range(0..options.len());
            Ok(serde_json::Value::from(options[picked].clone()))
        }
        GeneratorSpec::Constant { value } => Ok(value.clone()),
        GeneratorSpec::Timestamp => {
            let text = now
                .format(&time::format_description::well_known::Rfc3339)
                .map_err(|err| LifecycleError::Validation(format!("invalid timestamp: {err}")))?;
            Ok(serde_json::Value::from(text))
        }
        GeneratorSpec::Format { pattern } => {
            let rendered = render_format(pattern, generated)?;
            Ok(serde_json::Value::from(rendered))
        }
    }
}

fn render_format(
    pattern: &str,
    generated: &[(String, serde_json::Value)],
) -> Result<String, LifecycleError> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('}') else {
            return Err(LifecycleError::Validation(format!(
                "format pattern has unterminated placeholder: {pattern}"
            )));
        };
        let placeholder = &after_open[..close];
        let Some((_, value)) = generated.iter().find(|(name, _)| name == placeholder) else {
            return Err(LifecycleError::Validation(format!(
                "format placeholder {{{placeholder}}} does not match an earlier field"
            )));
        };
        out.push_str(&value_to_key(value));
        rest = &after_open[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn value_to_key(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Render generated drafts in the template's declared output format:
/// NDJSON objects in field order, or CSV with a header row.
///
/// # Errors
/// Returns [`LifecycleError::Validation`] when a JSON row cannot be encoded.
pub fn render_drafts(
    fields: &[FieldSpec],
    drafts: &[RecordDraft],
    format: OutputFormat,
) -> Result<String, LifecycleError> {
    match format {
        OutputFormat::Json => {
            let mut out = String::new();
            for draft in drafts {
                let mut object = serde_json::Map::new();
                for (name, value) in &draft.fields {
                    object.insert(name.clone(), value.clone());
                }
                let line =
                    serde_json::to_string(&serde_json::Value::Object(object)).map_err(|err| {
                        LifecycleError::Validation(format!("failed to encode row: {err}"))
                    })?;
                out.push_str(&line);
                out.push('\n');
            }
            Ok(out)
        }
        OutputFormat::Csv => {
            let mut out = String::new();
            let header =
                fields.iter().map(|field| csv_escape(&field.name)).collect::<Vec<_>>().join(",");
            out.push_str(&header);
            out.push('\n');
            for draft in drafts {
                let row = draft
                    .fields
                    .iter()
                    .map(|(_, value)| csv_escape(&value_to_key(value)))
                    .collect::<Vec<_>>()
                    .join(",");
                out.push_str(&row);
                out.push('\n');
            }
            Ok(out)
        }
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_repository(status: RepositoryStatus) -> Repository {
        Repository {
            repository_id: RepositoryId::new(),
            owner_id: "u1".to_string(),
            name: "orders-db".to_string(),
            description: "orders fixture".to_string(),
            source_uri: "postgres://localhost/orders".to_string(),
            status,
            created_at: fixture_time(),
            updated_at: fixture_time(),
        }
    }

    fn fixture_snapshot(repository_id: RepositoryId, age_days: i64) -> Snapshot {
        Snapshot {
            snapshot_id: SnapshotId::new(),
            repository_id,
            label: format!("aged-{age_days}"),
            captured_at: fixture_time() - Duration::days(age_days),
            payload_ref: "0".repeat(64),
            size_bytes: 128,
            checksum: "0".repeat(64),
            archived: false,
        }
    }

    fn fixture_schema() -> TemplateSchema {
        let mut generators = BTreeMap::new();
        generators.insert("seq".to_string(), GeneratorSpec::Sequence { start: 100 });
        generators.insert("amount".to_string(), GeneratorSpec::IntRange { min: 1, max: 500 });
        generators.insert(
            "region".to_string(),
            GeneratorSpec::Choice {
                options: vec!["eu".to_string(), "us".to_string(), "apac".to_string()],
            },
        );
        generators.insert(
            "label".to_string(),
            GeneratorSpec::Format { pattern: "order-{order_id}-{region}".to_string() },
        );
        TemplateSchema {
            generators,
            fields: vec![
                FieldSpec { name: "order_id".to_string(), generator: "seq".to_string() },
                FieldSpec { name: "amount".to_string(), generator: "amount".to_string() },
                FieldSpec { name: "region".to_string(), generator: "region".to_string() },
                FieldSpec { name: "label".to_string(), generator: "label".to_string() },
            ],
            key_field: Some("order_id".to_string()),
        }
    }

    fn on_demand_rule(
        scope: RuleScope,
        predicate: RulePredicate,
        action: RuleAction,
    ) -> CleanupRule {
        CleanupRule {
            rule_id: RuleId::new(),
            scope,
            predicate,
            action,
            schedule: RuleSchedule::OnDemand,
            enabled: true,
        }
    }

    #[test]
    fn status_transitions_only_move_forward() {
        assert!(RepositoryStatus::ensure_transition(
            RepositoryStatus::Active,
            RepositoryStatus::Archived
        )
        .is_ok());
        assert!(RepositoryStatus::ensure_transition(
            RepositoryStatus::Active,
            RepositoryStatus::Deleted
        )
        .is_ok());
        assert!(RepositoryStatus::ensure_transition(
            RepositoryStatus::Archived,
            RepositoryStatus::Deleted
        )
        .is_ok());

        let err = match RepositoryStatus::ensure_transition(
            RepositoryStatus::Deleted,
            RepositoryStatus::Active,
        ) {
            Ok(()) => panic!("deleted -> active should be rejected"),
            Err(err) => err,
        };
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                from: RepositoryStatus::Deleted,
                to: RepositoryStatus::Active
            }
        );
    }

    proptest! {
        #[test]
        fn transition_allowed_iff_rank_increases(from_rank in 0_u8..3, to_rank in 0_u8..3) {
            let statuses =
                [RepositoryStatus::Active, RepositoryStatus::Archived, RepositoryStatus::Deleted];
            let from = statuses[usize::from(from_rank)];
            let to = statuses[usize::from(to_rank)];
            let allowed = RepositoryStatus::ensure_transition(from, to).is_ok();
            prop_assert_eq!(allowed, to_rank > from_rank);
        }

        #[test]
        fn nothing_leaves_deleted(to_rank in 0_u8..3) {
            let statuses =
                [RepositoryStatus::Active, RepositoryStatus::Archived, RepositoryStatus::Deleted];
            let to = statuses[usize::from(to_rank)];
            prop_assert!(
                RepositoryStatus::ensure_transition(RepositoryStatus::Deleted, to).is_err()
            );
        }
    }

    #[test]
    fn max_age_plan_applies_only_to_old_snapshots() {
        let repository = fixture_repository(RepositoryStatus::Active);
        let old = fixture_snapshot(repository.repository_id, 45);
        let young = fixture_snapshot(repository.repository_id, 10);
        let rule = on_demand_rule(
            RuleScope::Repository(repository.repository_id),
            RulePredicate::MaxAge { days: 30 },
            RuleAction::DeleteSnapshot,
        );

        let plan = match plan_cleanup(
            &rule,
            &[repository],
            &[young.clone(), old.clone()],
            fixture_time(),
        ) {
            Ok(plan) => plan,
            Err(err) => panic!("plan should succeed: {err}"),
        };

        assert_eq!(plan.len(), 2);
        // Oldest first.
        assert_eq!(plan[0].target, CleanupTarget::Snapshot(old.snapshot_id));
        assert_eq!(plan[0].decision, PlanDecision::Apply);
        assert_eq!(plan[1].target, CleanupTarget::Snapshot(young.snapshot_id));
        assert!(matches!(plan[1].decision, PlanDecision::Skip { .. }));
    }

    #[test]
    fn max_count_plan_keeps_newest_per_repository() {
        let repo_a = fixture_repository(RepositoryStatus::Active);
        let repo_b = fixture_repository(RepositoryStatus::Active);
        let snapshots = vec![
            fixture_snapshot(repo_a.repository_id, 3),
            fixture_snapshot(repo_a.repository_id, 2),
            fixture_snapshot(repo_a.repository_id, 1),
            fixture_snapshot(repo_b.repository_id, 5),
        ];
        let rule = on_demand_rule(
            RuleScope::Global,
            RulePredicate::MaxCount { keep: 1 },
            RuleAction::DeleteSnapshot,
        );

        let plan = match plan_cleanup(&rule, &[repo_a, repo_b], &snapshots, fixture_time()) {
            Ok(plan) => plan,
            Err(err) => panic!("plan should succeed: {err}"),
        };

        let applied = plan
            .iter()
            .filter(|planned| planned.decision == PlanDecision::Apply)
            .map(|planned| planned.target)
            .collect::<Vec<_>>();
        // repo_a keeps its newest (1 day old); repo_b keeps its only snapshot.
        assert_eq!(applied.len(), 2);
        assert!(applied.contains(&CleanupTarget::Snapshot(snapshots[0].snapshot_id)));
        assert!(applied.contains(&CleanupTarget::Snapshot(snapshots[1].snapshot_id)));
    }

    #[test]
    fn archive_plan_skips_non_active_repositories() {
        let active = fixture_repository(RepositoryStatus::Active);
        let archived = fixture_repository(RepositoryStatus::Archived);
        let deleted = fixture_repository(RepositoryStatus::Deleted);
        let rule = on_demand_rule(
            RuleScope::Global,
            RulePredicate::MaxAge { days: 0 },
            RuleAction::ArchiveRepository,
        );

        let plan = match plan_cleanup(
            &rule,
            &[active.clone(), archived, deleted],
            &[],
            fixture_time() + Duration::days(1),
        ) {
            Ok(plan) => plan,
            Err(err) => panic!("plan should succeed: {err}"),
        };

        let applied = plan
            .iter()
            .filter(|planned| planned.decision == PlanDecision::Apply)
            .collect::<Vec<_>>();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].target, CleanupTarget::Repository(active.repository_id));
    }

    #[test]
    fn max_count_is_rejected_for_repository_actions() {
        let rule = on_demand_rule(
            RuleScope::Global,
            RulePredicate::MaxCount { keep: 3 },
            RuleAction::ArchiveRepository,
        );
        let err = match plan_cleanup(&rule, &[], &[], fixture_time()) {
            Ok(_) => panic!("max_count with archive-repository should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[test]
    fn schema_rejects_undefined_generator_reference() {
        let mut schema = fixture_schema();
        schema
            .fields
            .push(FieldSpec { name: "orphan".to_string(), generator: "missing".to_string() });

        let err = match schema.validate() {
            Ok(()) => panic!("undefined generator reference should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("undefined generator"));
    }

    #[test]
    fn schema_rejects_degenerate_generators_and_bad_key_field() {
        let mut bad_range = fixture_schema();
        bad_range
            .generators
            .insert("amount".to_string(), GeneratorSpec::IntRange { min: 10, max: 1 });
        assert!(bad_range.validate().is_err());

        let mut empty_choice = fixture_schema();
        empty_choice
            .generators
            .insert("region".to_string(), GeneratorSpec::Choice { options: vec![] });
        assert!(empty_choice.validate().is_err());

        let mut bad_key = fixture_schema();
        bad_key.key_field = Some("nope".to_string());
        assert!(bad_key.validate().is_err());
    }

    #[test]
    fn generation_is_deterministic_for_a_seed() {
        let schema = fixture_schema();
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);

        for index in 0..20_u64 {
            let draft_a = match generate_record(&schema, index, &mut rng_a, fixture_time()) {
                Ok(draft) => draft,
                Err(err) => panic!("generation should succeed: {err}"),
            };
            let draft_b = match generate_record(&schema, index, &mut rng_b, fixture_time()) {
                Ok(draft) => draft,
                Err(err) => panic!("generation should succeed: {err}"),
            };
            assert_eq!(draft_a, draft_b);
            assert_eq!(draft_a.record_key, (100 + index).to_string());
        }
    }

    #[test]
    fn format_placeholder_must_reference_an_earlier_field() {
        let mut schema = fixture_schema();
        schema.generators.insert(
            "label".to_string(),
            GeneratorSpec::Format { pattern: "order-{does_not_exist}".to_string() },
        );

        let mut rng = StdRng::seed_from_u64(7);
        let err = match generate_record(&schema, 0, &mut rng, fixture_time()) {
            Ok(_) => panic!("unknown placeholder should fail the record"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("does_not_exist"));
    }

    #[test]
    fn sequence_overflow_fails_the_record_not_the_batch() {
        let mut schema = fixture_schema();
        schema
            .generators
            .insert("seq".to_string(), GeneratorSpec::Sequence { start: u64::MAX });

        let mut rng = StdRng::seed_from_u64(7);
        if let Err(err) = generate_record(&schema, 0, &mut rng, fixture_time()) {
            panic!("index 0 still fits in the sequence: {err}");
        }
        let err = match generate_record(&schema, 1, &mut rng, fixture_time()) {
            Ok(_) => panic!("overflowing sequence should fail the record"),
            Err(err) => err,
        };
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[test]
    fn csv_rendering_escapes_delimiters() {
        let fields = vec![
            FieldSpec { name: "name".to_string(), generator: "seq".to_string() },
            FieldSpec { name: "note".to_string(), generator: "seq".to_string() },
        ];
        let drafts = vec![RecordDraft {
            record_key: "0".to_string(),
            fields: vec![
                ("name".to_string(), serde_json::Value::from("plain")),
                ("note".to_string(), serde_json::Value::from("a,b \"quoted\"")),
            ],
        }];

        let rendered = match render_drafts(&fields, &drafts, OutputFormat::Csv) {
            Ok(rendered) => rendered,
            Err(err) => panic!("render should succeed: {err}"),
        };
        assert_eq!(rendered, "name,note\nplain,\"a,b \"\"quoted\"\"\"\n");
    }

    #[test]
    fn snapshot_payload_encoding_is_order_independent() {
        let repository_id = RepositoryId::new();
        let mk = |key: &str| RepositoryRecord {
            record_id: RecordId::new(),
            repository_id,
            record_key: key.to_string(),
            payload: serde_json::json!({ "key": key }),
            created_at: fixture_time(),
        };

        let forward = match encode_snapshot_payload(&[mk("a"), mk("b")]) {
            Ok(bytes) => bytes,
            Err(err) => panic!("encode should succeed: {err}"),
        };
        let reversed = match encode_snapshot_payload(&[mk("b"), mk("a")]) {
            Ok(bytes) => bytes,
            Err(err) => panic!("encode should succeed: {err}"),
        };
        assert_eq!(forward, reversed);

        let decoded = match decode_snapshot_payload(&forward) {
            Ok(rows) => rows,
            Err(err) => panic!("decode should succeed: {err}"),
        };
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].record_key, "a");
    }
}
