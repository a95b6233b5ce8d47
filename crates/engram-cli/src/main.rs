use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use engram_core::{
    allocate_quotas, merge_memories_with_report, remember, score_memory, Category, MemoryCandidate,
    MemoryRecord, MergeOptions, DEFAULT_MAX_MEMORIES,
};
use engram_llm::{
    extract_memories, ConversationMessage, ExtractorConfig, Provider, UreqChatClient,
    DEFAULT_MODEL,
};
use engram_store_sqlite::SqliteStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "engram")]
#[command(about = "Engram memory merge and eviction CLI")]
struct Cli {
    #[arg(long, global = true, env = "ENGRAM_DB", default_value = "./engram.sqlite3")]
    db: PathBuf,

    /// Log at debug level on stderr.
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Merge candidates into existing records and enforce capacity.
    Merge(Box<MergeArgs>),
    /// Show the per-type caps for a budget.
    Quota(QuotaArgs),
    /// Score records without merging.
    Score(Box<ScoreArgs>),
    /// Extract candidates from a conversation with the configured model.
    Extract(Box<ExtractArgs>),
    /// Extract from a conversation and merge into the user's stored records.
    Remember(Box<RememberArgs>),
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct MergeFlags {
    #[arg(long, default_value_t = DEFAULT_MAX_MEMORIES)]
    max_memories: usize,
    /// Per-type cap override, `TYPE=N`. Repeatable.
    #[arg(long = "max-per-type", value_parser = parse_category_value)]
    max_per_type: Vec<(Category, f64)>,
    /// Per-type weight override, `TYPE=W`. Repeatable.
    #[arg(long = "type-weight", value_parser = parse_category_value)]
    type_weight: Vec<(Category, f64)>,
    /// Evaluation time (RFC 3339). Defaults to the current UTC time.
    #[arg(long, value_parser = parse_timestamp)]
    now: Option<OffsetDateTime>,
}

impl MergeFlags {
    fn options(&self) -> MergeOptions {
        let now = self.now.unwrap_or_else(OffsetDateTime::now_utc);
        let options = MergeOptions::new(now).with_max_memories(self.max_memories);
        let options = self
            .max_per_type
            .iter()
            .fold(options, |options, (category, cap)| options.with_max_per_type(*category, *cap));
        self.type_weight.iter().fold(options, |options, (category, weight)| {
            options.with_type_weight(*category, *weight)
        })
    }
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// JSON array of stored memory records.
    #[arg(long)]
    existing: PathBuf,
    /// JSON array of memory candidates.
    #[arg(long)]
    candidates: PathBuf,
    #[command(flatten)]
    merge: MergeFlags,
}

#[derive(Debug, Args)]
struct QuotaArgs {
    #[arg(long, default_value_t = DEFAULT_MAX_MEMORIES)]
    max_memories: usize,
    #[arg(long = "max-per-type", value_parser = parse_category_value)]
    max_per_type: Vec<(Category, f64)>,
}

#[derive(Debug, Args)]
struct ScoreArgs {
    #[arg(long)]
    records: PathBuf,
    #[arg(long, value_parser = parse_timestamp)]
    now: Option<OffsetDateTime>,
    #[arg(long = "type-weight", value_parser = parse_category_value)]
    type_weight: Vec<(Category, f64)>,
}

#[derive(Debug, Args)]
struct LlmFlags {
    /// API key; falls back to `DEEPSEEK_API_KEY`.
    #[arg(long, env = "ENGRAM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Model name; falls back to `DEEPSEEK_MODEL`, then `deepseek-chat`.
    #[arg(long, env = "ENGRAM_MODEL")]
    model: Option<String>,
    /// `deepseek`, `openai` or `openai-compatible`. Unknown values select `deepseek`.
    #[arg(long, env = "ENGRAM_PROVIDER")]
    provider: Option<String>,
    #[arg(long, env = "ENGRAM_BASE_URL")]
    base_url: Option<String>,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

impl LlmFlags {
    fn config(&self) -> Result<ExtractorConfig> {
        let api_key = self
            .api_key
            .clone()
            .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
            .ok_or_else(|| anyhow!("missing API key: pass --api-key or set ENGRAM_API_KEY"))?;
        let model = self
            .model
            .clone()
            .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Ok(ExtractorConfig::new(api_key)
            .with_model(model)
            .with_provider(Provider::resolve(self.provider.as_deref()))
            .with_base_url(self.base_url.clone()))
    }

    fn client(&self) -> UreqChatClient {
        UreqChatClient::new(Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Args)]
struct ExtractArgs {
    /// JSON array of `{ "role": "user"|"assistant", "message": "..." }`.
    #[arg(long)]
    conversation: PathBuf,
    #[command(flatten)]
    llm: LlmFlags,
}

#[derive(Debug, Args)]
struct RememberArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    conversation: PathBuf,
    #[command(flatten)]
    llm: LlmFlags,
    #[command(flatten)]
    merge: MergeFlags,
}

#[derive(Debug, Subcommand)]
enum MemoryCommand {
    List(UserArgs),
    /// Replace the user's records with a JSON array of records.
    Import(UserInputArgs),
    /// Insert or replace one record (a JSON object) by id.
    Upsert(UserInputArgs),
    Users,
}

#[derive(Debug, Args)]
struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
struct UserInputArgs {
    #[arg(long)]
    user: String,
    #[arg(long = "in")]
    input: PathBuf,
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

#[derive(Debug, Serialize)]
struct ScoredEntry<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    category: Category,
    score: f64,
}

fn parse_category_value(raw: &str) -> Result<(Category, f64), String> {
    let (name, value) =
        raw.split_once('=').ok_or_else(|| format!("expected TYPE=VALUE, got `{raw}`"))?;
    let category = name.trim().parse::<Category>().map_err(|err| err.to_string())?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|err| format!("invalid number `{}`: {err}", value.trim()))?;
    Ok((category, value))
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| format!("invalid RFC 3339 timestamp: {err}"))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse JSON in {}", path.display()))
}

fn validate_records(records: &[MemoryRecord]) -> Result<()> {
    for record in records {
        record.validate().with_context(|| format!("invalid memory record {}", record.id))?;
    }
    Ok(())
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

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Command::Merge(args) => run_merge(&args),
        Command::Quota(args) => run_quota(&args),
        Command::Score(args) => run_score(&args),
        Command::Extract(args) => run_extract(&args),
        Command::Remember(args) => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_remember(&args, &mut store)
        }
        Command::Memory { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_memory(command, &mut store)
        }
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(&command, &mut store)
        }
    }
}

fn run_merge(args: &MergeArgs) -> Result<()> {
    let existing: Vec<MemoryRecord> = read_json(&args.existing)?;
    let candidates: Vec<MemoryCandidate> = read_json(&args.candidates)?;
    let outcome = merge_memories_with_report(&existing, &candidates, &args.merge.options());

    emit_json(serde_json::json!({
        "memories": outcome.memories,
        "report": outcome.report
    }))
}

fn run_quota(args: &QuotaArgs) -> Result<()> {
    let overrides = args.max_per_type.iter().copied().collect::<BTreeMap<_, _>>();
    let caps = allocate_quotas(args.max_memories, &overrides);

    emit_json(serde_json::json!({
        "max_memories": args.max_memories,
        "caps": caps,
        "total": caps.total()
    }))
}

fn run_score(args: &ScoreArgs) -> Result<()> {
    let records: Vec<MemoryRecord> = read_json(&args.records)?;
    let now = args.now.unwrap_or_else(OffsetDateTime::now_utc);
    let options = args
        .type_weight
        .iter()
        .fold(MergeOptions::new(now), |options, (category, weight)| {
            options.with_type_weight(*category, *weight)
        });
    let weights = options.weights();

    let scores = records
        .iter()
        .map(|record| ScoredEntry {
            id: record.id.as_str(),
            category: record.category,
            score: score_memory(record, now, &weights),
        })
        .collect::<Vec<_>>();

    emit_json(serde_json::json!({
        "now": now.format(&Rfc3339).context("failed to format evaluation time")?,
        "scores": scores
    }))
}

fn run_extract(args: &ExtractArgs) -> Result<()> {
    let conversation: Vec<ConversationMessage> = read_json(&args.conversation)?;
    let config = args.llm.config()?;
    let candidates = extract_memories(&args.llm.client(), &conversation, &config);

    emit_json(serde_json::json!({
        "extracted": candidates.is_some(),
        "candidates": candidates
    }))
}

fn run_remember(args: &RememberArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let conversation: Vec<ConversationMessage> = read_json(&args.conversation)?;
    let config = args.llm.config()?;

    let Some(candidates) = extract_memories(&args.llm.client(), &conversation, &config) else {
        return emit_json(serde_json::json!({
            "user": args.user,
            "updated": false
        }));
    };

    let outcome = remember(store, &args.user, &candidates, &args.merge.options())
        .with_context(|| format!("failed to remember memories for {}", args.user))?;
    emit_json(serde_json::json!({
        "user": args.user,
        "updated": true,
        "memories": outcome.memories,
        "report": outcome.report
    }))
}

fn run_memory(command: MemoryCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        MemoryCommand::List(args) => {
            let memories = store.load_records(&args.user)?;
            emit_json(serde_json::json!({
                "user": args.user,
                "memories": memories
            }))
        }
        MemoryCommand::Import(args) => {
            let records: Vec<MemoryRecord> = read_json(&args.input)?;
            validate_records(&records)?;
            store.replace_records(&args.user, &records)?;
            emit_json(serde_json::json!({
                "user": args.user,
                "imported": records.len()
            }))
        }
        MemoryCommand::Upsert(args) => {
            let record: MemoryRecord = read_json(&args.input)?;
            validate_records(std::slice::from_ref(&record))?;
            store.upsert_record(&args.user, &record)?;
            emit_json(serde_json::json!({
                "user": args.user,
                "upserted": record.id
            }))
        }
        MemoryCommand::Users => {
            let users = store.list_users()?;
            emit_json(serde_json::json!({ "users": users }))
        }
    }
}

fn run_db(command: &DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(args, store),
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_value_pairs_parse() {
        assert_eq!(parse_category_value("profile=3"), Ok((Category::Profile, 3.0)));
        assert_eq!(parse_category_value(" temp = 0.25 "), Ok((Category::Temp, 0.25)));
        assert!(parse_category_value("profile").is_err());
        assert!(parse_category_value("hobby=1").is_err());
        assert!(parse_category_value("goal=lots").is_err());
    }

    #[test]
    fn merge_flags_build_options() {
        let flags = MergeFlags {
            max_memories: 10,
            max_per_type: vec![(Category::Goal, 2.0)],
            type_weight: vec![(Category::Temp, 0.8)],
            now: Some(OffsetDateTime::UNIX_EPOCH),
        };
        let options = flags.options();

        assert_eq!(options.now, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(options.max_memories, 10);
        assert_eq!(options.max_per_type.get(&Category::Goal), Some(&2.0));
        assert_eq!(options.type_weights.get(&Category::Temp), Some(&0.8));
    }

    #[test]
    fn contract_version_wraps_non_objects() {
        let wrapped = with_contract_version(serde_json::json!([1, 2]));
        assert_eq!(wrapped["contract_version"], CLI_CONTRACT_VERSION);
        assert_eq!(wrapped["payload"], serde_json::json!([1, 2]));
    }
}
