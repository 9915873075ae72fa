use clap::{Parser, Subcommand};
use dotenvy::from_path as dotenv_from_path;
use futures_util::StreamExt;
use nexus_audit_log::{verify_log, AuditAppender};
use nexus_cost::{CostTracker, InMemoryCounterStore};
use nexus_orchestrator::{ChatMessage, NexusConfig, Orchestrator, PromptContext};
use nexus_policy::PolicyConfig;
use nexus_providers::{CredentialStore, ProviderRegistry};
use nexus_router::{Environment, Mode};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const PROVIDER_TAGS: &[&str] = &["openai", "groq", "mistral", "google", "anthropic", "deepseek"];

#[derive(Debug, Error)]
enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("audit error: {0}")]
    Audit(#[from] nexus_audit_log::AuditLogError),
    #[error("nexus error: {0}")]
    Nexus(#[from] nexus_orchestrator::NexusError),
    #[error("invalid mode: {0}")]
    InvalidMode(String),
    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),
}

#[derive(Parser)]
#[command(name = "nexus-ctl", version, about = "NEXUS gateway control-plane utilities")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the PII detector over a text and print entities + redacted text.
    AnalyzePii {
        #[arg(long)]
        text: String,
    },

    /// Run the model router over a prompt and print the selected model ids.
    SelectModels {
        #[arg(long)]
        prompt: String,

        #[arg(long, default_value = "chat")]
        mode: String,

        #[arg(long, default_value_t = 5)]
        max_models: usize,

        #[arg(long, default_value = "production")]
        environment: String,

        /// Provide multiple times: --exclude-provider anthropic
        #[arg(long = "exclude-provider")]
        exclude_providers: Vec<String>,
    },

    /// Verify a hash-chained audit log JSONL and report where it broke, if anywhere.
    VerifyAudit {
        #[arg(long)]
        audit_log: PathBuf,
    },

    /// Record a one-shot spend and report the daily budget decision for it.
    CheckBudget {
        #[arg(long)]
        spend: f64,

        #[arg(long)]
        budget: f64,
    },

    /// Run a full fan-out/synthesis request through the orchestrator.
    Orchestrate {
        /// JSON file describing the request (see `ChatRequestFile`).
        #[arg(long)]
        request_json: PathBuf,

        /// JSON file containing a PolicyConfig.
        #[arg(long)]
        policy_file: PathBuf,

        #[arg(long)]
        audit_log: PathBuf,

        #[arg(long)]
        env_file: Option<PathBuf>,
    },

    /// Like `orchestrate` but streams one model's tokens as SSE frames.
    Stream {
        #[arg(long)]
        request_json: PathBuf,

        #[arg(long)]
        policy_file: PathBuf,

        #[arg(long)]
        env_file: Option<PathBuf>,
    },
}

/// On-disk shape for `orchestrate --request-json` / `stream --request-json`.
#[derive(Debug, serde::Deserialize)]
struct ChatRequestFile {
    prompt: String,
    tenant_id: String,
    actor_id: String,
    plan: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_temperature")]
    temperature: f64,
    #[serde(default = "default_max_tokens")]
    max_tokens: u64,
    #[serde(default)]
    override_models: Vec<String>,
    #[serde(default)]
    system: Option<String>,
}

fn default_mode() -> String {
    "chat".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u64 {
    1024
}

fn load_chat_request(path: &Path) -> Result<ChatRequestFile, CliError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn parse_mode(s: &str) -> Result<Mode, CliError> {
    match s {
        "chat" => Ok(Mode::Chat),
        "code" => Ok(Mode::Code),
        "reasoning" => Ok(Mode::Reasoning),
        "search_rag" => Ok(Mode::SearchRag),
        "multi_model" => Ok(Mode::MultiModel),
        "fast" => Ok(Mode::Fast),
        "creative" => Ok(Mode::Creative),
        other => Err(CliError::InvalidMode(other.to_string())),
    }
}

fn parse_environment(s: &str) -> Result<Environment, CliError> {
    match s {
        "development" => Ok(Environment::Development),
        "staging" => Ok(Environment::Staging),
        "production" => Ok(Environment::Production),
        other => Err(CliError::InvalidEnvironment(other.to_string())),
    }
}

fn load_dotenv(explicit: &Option<PathBuf>) {
    if let Some(path) = explicit {
        if path.exists() {
            let _ = dotenv_from_path(path);
            eprintln!("loaded env from {}", path.display());
            return;
        }
    }
    if Path::new(".env").exists() {
        let _ = dotenv_from_path(".env");
        eprintln!("loaded env from ./.env");
    }
}

fn load_policy(path: &Path) -> Result<PolicyConfig, CliError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let args = Args::parse();
    match args.cmd {
        Command::AnalyzePii { text } => {
            let result = nexus_pii::analyze(&text);
            println!("{}", serde_json::to_string(&json!({
                "has_pii": result.has_pii,
                "has_critical": result.has_critical,
                "entities": result.entities,
                "redacted_text": result.redacted_text,
            }))?);
            Ok(())
        }

        Command::SelectModels { prompt, mode, max_models, environment, exclude_providers } => {
            let mode = parse_mode(&mode)?;
            let environment = parse_environment(&environment)?;
            let creds = CredentialStore::from_env(PROVIDER_TAGS);
            let selected = nexus_router::select_models(&prompt, mode, max_models, &exclude_providers, &creds, environment);
            println!("{}", serde_json::to_string(&selected)?);
            Ok(())
        }

        Command::VerifyAudit { audit_log } => {
            let (ok, bad_index) = verify_log(&audit_log)?;
            println!("{}", serde_json::to_string(&json!({"ok": ok, "bad_index": bad_index}))?);
            Ok(())
        }

        Command::CheckBudget { spend, budget } => {
            let store: Arc<dyn nexus_cost::CounterStore> = Arc::new(InMemoryCounterStore::new());
            let tracker = CostTracker::new(store);
            tracker.record("cli", spend).await;
            let (allowed, recorded_spend, pct) = tracker.check_budget("cli", budget).await;
            println!("{}", serde_json::to_string(&json!({
                "allowed": allowed,
                "spend": recorded_spend,
                "budget": budget,
                "pct": pct,
            }))?);
            Ok(())
        }

        Command::Orchestrate { request_json, policy_file, audit_log, env_file } => {
            load_dotenv(&env_file);
            let req = load_chat_request(&request_json)?;
            let mode = parse_mode(&req.mode)?;
            let orchestrator = build_orchestrator(&policy_file, &audit_log)?;

            let ctx = PromptContext {
                prompt: req.prompt,
                messages: Vec::<ChatMessage>::new(),
                tenant_id: req.tenant_id,
                actor_id: req.actor_id,
                plan: req.plan,
                mode,
                temperature: req.temperature,
                max_tokens: req.max_tokens,
                override_models: if req.override_models.is_empty() { None } else { Some(req.override_models) },
                max_models: None,
                system: req.system,
            };

            let result = orchestrator.orchestrate(ctx).await?;
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }

        Command::Stream { request_json, policy_file, env_file } => {
            load_dotenv(&env_file);
            let req = load_chat_request(&request_json)?;
            let mode = parse_mode(&req.mode)?;

            let audit_log = std::env::temp_dir().join(format!("nexus-ctl-stream-audit-{}.jsonl", uuid::Uuid::new_v4()));
            let orchestrator = build_orchestrator(&policy_file, &audit_log)?;

            let ctx = PromptContext {
                prompt: req.prompt,
                messages: Vec::<ChatMessage>::new(),
                tenant_id: req.tenant_id,
                actor_id: req.actor_id,
                plan: req.plan,
                mode,
                temperature: req.temperature,
                max_tokens: req.max_tokens,
                override_models: if req.override_models.is_empty() { None } else { Some(req.override_models) },
                max_models: None,
                system: req.system,
            };

            let mut events = orchestrator.stream(ctx).await?;
            while let Some(event) = events.next().await {
                print!("{}", event.to_frame());
            }
            Ok(())
        }
    }
}

fn build_orchestrator(policy_file: &Path, audit_log: &Path) -> Result<Orchestrator, CliError> {
    let policy = load_policy(policy_file)?;
    let creds = CredentialStore::from_env(PROVIDER_TAGS);
    let providers = ProviderRegistry::standard(&creds);
    let cost = Arc::new(CostTracker::new(Arc::new(InMemoryCounterStore::new())));
    let audit = Arc::new(AuditAppender::open(audit_log)?);
    let config = NexusConfig::from_env();
    Ok(Orchestrator::new(policy, creds, providers, cost, audit, config))
}
