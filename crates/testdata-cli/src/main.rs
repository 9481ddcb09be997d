use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use testdata_api::{
    AddRecordRequest, CreateRepositoryRequest, CreateRuleRequest, CreateTemplateRequest,
    GenerateRequest, TestDataApi,
};
use testdata_core::{
    OutputFormat, RepositoryId, RepositoryStatus, RuleAction, RuleId, RulePredicate, RuleSchedule,
    RuleScope, SnapshotId, TemplateId,
};
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tdl")]
#[command(about = "Test data lifecycle CLI")]
struct Cli {
    #[arg(long, default_value = "./testdata.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./testdata_payloads")]
    payloads: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Repo {
        #[command(subcommand)]
        command: Box<RepoCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Snapshot {
        #[command(subcommand)]
        command: Box<SnapshotCommand>,
    },
    Rule {
        #[command(subcommand)]
        command: Box<RuleCommand>,
    },
    Template {
        #[command(subcommand)]
        command: Box<TemplateCommand>,
    },
    Generate(GenerateArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum RepoCommand {
    Create(RepoCreateArgs),
    Show(RepoRefArgs),
    List(RepoListArgs),
    Archive(RepoRefArgs),
    Delete(RepoRefArgs),
}

#[derive(Debug, Args)]
struct RepoCreateArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    source_uri: String,
}

#[derive(Debug, Args)]
struct RepoRefArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    requester: String,
}

#[derive(Debug, Args)]
struct RepoListArgs {
    #[arg(long)]
    requester: String,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Add(RecordAddArgs),
    List(RecordListArgs),
}

#[derive(Debug, Args)]
struct RecordAddArgs {
    #[arg(long)]
    repository_id: String,
    #[arg(long)]
    requester: String,
    #[arg(long)]
    key: String,
    /// Record payload as an inline JSON value.
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
struct RecordListArgs {
    #[arg(long)]
    repository_id: String,
    #[arg(long)]
    requester: String,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Capture(SnapshotCaptureArgs),
    List(SnapshotListArgs),
    Restore(SnapshotRestoreArgs),
    Delete(SnapshotRefArgs),
}

#[derive(Debug, Args)]
struct SnapshotCaptureArgs {
    #[arg(long)]
    repository_id: String,
    #[arg(long)]
    requester: String,
    #[arg(long)]
    label: String,
    #[arg(long)]
    captured_at: Option<String>,
}

#[derive(Debug, Args)]
struct SnapshotListArgs {
    #[arg(long)]
    repository_id: String,
    #[arg(long)]
    requester: String,
}

#[derive(Debug, Args)]
struct SnapshotRefArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    requester: String,
}

#[derive(Debug, Args)]
struct SnapshotRestoreArgs {
    #[arg(long)]
    id: String,
    /// Repository whose content is overwritten by the snapshot payload.
    #[arg(long)]
    repository_id: String,
    #[arg(long)]
    requester: String,
}

#[derive(Debug, Subcommand)]
enum RuleCommand {
    Add(RuleAddArgs),
    List,
    Evaluate(RuleEvaluateArgs),
}

#[derive(Debug, Args)]
struct RuleAddArgs {
    #[arg(long, value_enum)]
    scope: ScopeArg,
    #[arg(long)]
    repository_id: Option<String>,
    #[arg(long, value_enum)]
    predicate: PredicateArg,
    #[arg(long)]
    days: Option<u32>,
    #[arg(long)]
    keep: Option<u32>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long, value_enum)]
    action: ActionArg,
    #[arg(long, default_value = "on-demand")]
    schedule: String,
    #[arg(long, default_value_t = false)]
    disabled: bool,
}

#[derive(Debug, Args)]
struct RuleEvaluateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Subcommand)]
enum TemplateCommand {
    Add(TemplateAddArgs),
    List(TemplateListArgs),
    Preview(TemplatePreviewArgs),
}

#[derive(Debug, Args)]
struct TemplateAddArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    name: String,
    /// Path to a JSON file holding the template schema.
    #[arg(long)]
    schema_file: PathBuf,
    #[arg(long, value_enum, default_value_t = FormatArg::Json)]
    format: FormatArg,
}

#[derive(Debug, Args)]
struct TemplateListArgs {
    #[arg(long)]
    requester: String,
}

#[derive(Debug, Args)]
struct TemplatePreviewArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    requester: String,
    #[arg(long, default_value_t = 5)]
    count: u64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    template_id: String,
    #[arg(long)]
    repository_id: String,
    #[arg(long)]
    requester: String,
    #[arg(long)]
    count: u64,
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Archived,
    Deleted,
}

impl StatusArg {
    fn into_status(self) -> RepositoryStatus {
        match self {
            Self::Active => RepositoryStatus::Active,
            Self::Archived => RepositoryStatus::Archived,
            Self::Deleted => RepositoryStatus::Deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Global,
    Repository,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PredicateArg {
    MaxAge,
    MaxCount,
    StatusIs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ActionArg {
    DeleteSnapshot,
    ArchiveRepository,
    PurgeRepository,
}

impl ActionArg {
    fn into_action(self) -> RuleAction {
        match self {
            Self::DeleteSnapshot => RuleAction::DeleteSnapshot,
            Self::ArchiveRepository => RuleAction::ArchiveRepository,
            Self::PurgeRepository => RuleAction::PurgeRepository,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
}

impl FormatArg {
    fn into_format(self) -> OutputFormat {
        match self {
            Self::Json => OutputFormat::Json,
            Self::Csv => OutputFormat::Csv,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = TestDataApi::new(cli.db, cli.payloads);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Repo { command } => run_repo(*command, &api),
        Command::Record { command } => run_record(*command, &api),
        Command::Snapshot { command } => run_snapshot(*command, &api),
        Command::Rule { command } => run_rule(*command, &api),
        Command::Template { command } => run_template(*command, &api),
        Command::Generate(args) => run_generate(&args, &api),
    }
}

fn run_db(command: DbCommand, api: &TestDataApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
    }
}

fn run_repo(command: RepoCommand, api: &TestDataApi) -> Result<()> {
    match command {
        RepoCommand::Create(args) => {
            let repository = api.create_repository(CreateRepositoryRequest {
                owner_id: args.owner,
                name: args.name,
                description: args.description,
                source_uri: args.source_uri,
                created_at: None,
            })?;
            emit_json(
                serde_json::to_value(&repository).context("failed to serialize repository")?,
            )
        }
        RepoCommand::Show(args) => {
            let repository =
                api.get_repository(parse_repository_id(&args.id)?, &args.requester)?;
            emit_json(
                serde_json::to_value(&repository).context("failed to serialize repository")?,
            )
        }
        RepoCommand::List(args) => {
            let repositories = api
                .list_repositories(&args.requester, args.status.map(StatusArg::into_status))?;
            emit_json(serde_json::json!({ "repositories": repositories }))
        }
        RepoCommand::Archive(args) => {
            let repository = api.update_status(
                parse_repository_id(&args.id)?,
                &args.requester,
                RepositoryStatus::Archived,
            )?;
            emit_json(
                serde_json::to_value(&repository).context("failed to serialize repository")?,
            )
        }
        RepoCommand::Delete(args) => {
            let repository =
                api.delete_repository(parse_repository_id(&args.id)?, &args.requester)?;
            emit_json(
                serde_json::to_value(&repository).context("failed to serialize repository")?,
            )
        }
    }
}

fn run_record(command: RecordCommand, api: &TestDataApi) -> Result<()> {
    match command {
        RecordCommand::Add(args) => {
            let payload: Value = serde_json::from_str(&args.payload)
                .context("record payload is not valid JSON")?;
            let record = api.add_record(AddRecordRequest {
                repository_id: parse_repository_id(&args.repository_id)?,
                requester: args.requester,
                record_key: args.key,
                payload,
                created_at: None,
            })?;
            emit_json(serde_json::to_value(&record).context("failed to serialize record")?)
        }
        RecordCommand::List(args) => {
            let records =
                api.list_records(parse_repository_id(&args.repository_id)?, &args.requester)?;
            emit_json(serde_json::json!({ "records": records }))
        }
    }
}

fn run_snapshot(command: SnapshotCommand, api: &TestDataApi) -> Result<()> {
    match command {
        SnapshotCommand::Capture(args) => {
            let captured_at = args.captured_at.as_deref().map(parse_rfc3339).transpose()?;
            let snapshot = api.capture_snapshot(
                parse_repository_id(&args.repository_id)?,
                &args.requester,
                &args.label,
                captured_at,
            )?;
            emit_json(serde_json::to_value(&snapshot).context("failed to serialize snapshot")?)
        }
        SnapshotCommand::List(args) => {
            let snapshots =
                api.list_snapshots(parse_repository_id(&args.repository_id)?, &args.requester)?;
            emit_json(serde_json::json!({ "snapshots": snapshots }))
        }
        SnapshotCommand::Restore(args) => {
            let result = api.restore_snapshot(
                parse_snapshot_id(&args.id)?,
                parse_repository_id(&args.repository_id)?,
                &args.requester,
            )?;
            emit_json(serde_json::to_value(&result).context("failed to serialize restore result")?)
        }
        SnapshotCommand::Delete(args) => {
            let deleted = api.delete_snapshot(parse_snapshot_id(&args.id)?, &args.requester)?;
            emit_json(serde_json::json!({
                "snapshot_id": args.id,
                "deleted": deleted
            }))
        }
    }
}

fn run_rule(command: RuleCommand, api: &TestDataApi) -> Result<()> {
    match command {
        RuleCommand::Add(args) => {
            let scope = match args.scope {
                ScopeArg::Global => RuleScope::Global,
                ScopeArg::Repository => {
                    let raw = args.repository_id.as_deref().ok_or_else(|| {
                        anyhow!("--repository-id is required for repository-scoped rules")
                    })?;
                    RuleScope::Repository(parse_repository_id(raw)?)
                }
            };
            let predicate = match args.predicate {
                PredicateArg::MaxAge => RulePredicate::MaxAge {
                    days: args
                        .days
                        .ok_or_else(|| anyhow!("--days is required for the max-age predicate"))?,
                },
                PredicateArg::MaxCount => RulePredicate::MaxCount {
                    keep: args
                        .keep
                        .ok_or_else(|| anyhow!("--keep is required for the max-count predicate"))?,
                },
                PredicateArg::StatusIs => RulePredicate::StatusIs {
                    status: args
                        .status
                        .ok_or_else(|| {
                            anyhow!("--status is required for the status-is predicate")
                        })?
                        .into_status(),
                },
            };

            let rule = api.create_rule(CreateRuleRequest {
                scope,
                predicate,
                action: args.action.into_action(),
                schedule: RuleSchedule::parse(&args.schedule),
                enabled: !args.disabled,
            })?;
            emit_json(serde_json::to_value(&rule).context("failed to serialize rule")?)
        }
        RuleCommand::List => {
            let rules = api.list_rules()?;
            emit_json(serde_json::json!({ "rules": rules }))
        }
        RuleCommand::Evaluate(args) => {
            let now = args.now.as_deref().map(parse_rfc3339).transpose()?;
            let results = api.evaluate_rule(parse_rule_id(&args.id)?, now)?;
            let applied = results
                .iter()
                .filter(|result| result.outcome == testdata_core::ActionOutcome::Applied)
                .count();
            emit_json(serde_json::json!({
                "rule_id": args.id,
                "applied": applied,
                "results": results
            }))
        }
    }
}

fn run_template(command: TemplateCommand, api: &TestDataApi) -> Result<()> {
    match command {
        TemplateCommand::Add(args) => {
            let body = fs::read_to_string(&args.schema_file).with_context(|| {
                format!("failed to read schema file {}", args.schema_file.display())
            })?;
            let schema = serde_json::from_str(&body).with_context(|| {
                format!("schema file is not a valid template schema: {}", args.schema_file.display())
            })?;

            let template = api.create_template(CreateTemplateRequest {
                owner_id: args.owner,
                name: args.name,
                schema,
                output_format: args.format.into_format(),
                created_at: None,
            })?;
            emit_json(serde_json::to_value(&template).context("failed to serialize template")?)
        }
        TemplateCommand::List(args) => {
            let templates = api.list_templates(&args.requester)?;
            emit_json(serde_json::json!({ "templates": templates }))
        }
        TemplateCommand::Preview(args) => {
            let rendered = api.preview_template(
                parse_template_id(&args.id)?,
                &args.requester,
                args.count,
                args.seed,
            )?;
            emit_json(serde_json::json!({
                "template_id": args.id,
                "count": args.count,
                "seed": args.seed,
                "rendered": rendered
            }))
        }
    }
}

fn run_generate(args: &GenerateArgs, api: &TestDataApi) -> Result<()> {
    let report = api.generate(GenerateRequest {
        template_id: parse_template_id(&args.template_id)?,
        repository_id: parse_repository_id(&args.repository_id)?,
        requester: args.requester.clone(),
        count: args.count,
        seed: args.seed,
    })?;
    emit_json(serde_json::to_value(&report).context("failed to serialize generation report")?)
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_repository_id(value: &str) -> Result<RepositoryId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(RepositoryId(parsed))
}

fn parse_snapshot_id(value: &str) -> Result<SnapshotId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(SnapshotId(parsed))
}

fn parse_rule_id(value: &str) -> Result<RuleId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(RuleId(parsed))
}

fn parse_template_id(value: &str) -> Result<TemplateId> {
    let parsed = Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))?;
    Ok(TemplateId(parsed))
}
