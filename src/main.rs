use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;

use usher_core::events::TurnEvent;
use usher_core::provider::ModelProvider;
use usher_core::retrieval::Retriever;
use usher_engine::backends::{
    InMemoryAppointmentBook, InMemoryDirectory, InMemoryRoster, Specialist,
};
use usher_engine::runner::{TurnConfig, TurnRunner};
use usher_engine::tools::{create_default_registry, ToolBackends};
use usher_llm::{HttpEmbedder, HttpModel, HttpModelConfig, MockModel, ReliableModel, VectorIndex};
use usher_server::handlers::HandlerState;
use usher_server::{ServerConfig, SessionGateway};
use usher_store::Database;
use usher_telemetry::{init_telemetry, TelemetryConfig};

/// Protocol-gated customer journey agent server.
#[derive(Parser)]
#[command(name = "usher", version)]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 9290)]
    port: u16,

    /// Path to the session database (defaults to ~/.usher/usher.db).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Chat-completions endpoint base URL.
    #[arg(long, default_value = "https://api.openai.com/v1")]
    model_base_url: String,

    /// Model name.
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// File containing the agent persona / journey instructions.
    #[arg(long)]
    system_prompt: Option<PathBuf>,

    /// Directory with case_studies.json, testimonials.json, specialists.json.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run with the scripted mock model (no API key needed; development only).
    #[arg(long, default_value_t = false)]
    mock_model: bool,

    /// Human-readable log lines instead of JSON.
    #[arg(long, default_value_t = false)]
    plain_logs: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let telemetry = Arc::new(init_telemetry(TelemetryConfig {
        json_output: !cli.plain_logs,
        ..Default::default()
    }));

    tracing::info!("starting usher server");

    let db_path = cli
        .db
        .unwrap_or_else(|| home_dir().join(".usher").join("usher.db"));
    let db = Database::open(&db_path).expect("failed to open database");

    let api_key = std::env::var("USHER_API_KEY").ok();
    let provider: Arc<dyn ModelProvider> = if cli.mock_model || api_key.is_none() {
        if !cli.mock_model {
            tracing::warn!("USHER_API_KEY not set, falling back to the mock model");
        }
        Arc::new(MockModel::new(Vec::new()))
    } else {
        let key = api_key.clone().unwrap_or_default();
        let mut config = HttpModelConfig::new(key, cli.model.clone());
        config.base_url = cli.model_base_url.clone();
        config.system_prompt = load_system_prompt(cli.system_prompt.as_deref());
        let http = HttpModel::new(config).expect("failed to build model client");
        Arc::new(ReliableModel::with_defaults(http))
    };

    let retriever = build_retriever(
        cli.data_dir.as_deref(),
        api_key.as_deref(),
        &cli.model_base_url,
    )
    .await;

    let registry = Arc::new(create_default_registry(ToolBackends {
        directory: Arc::new(InMemoryDirectory::new()),
        appointments: Arc::new(InMemoryAppointmentBook::new()),
        roster: Arc::new(InMemoryRoster::new(load_roster(cli.data_dir.as_deref()))),
        retriever,
        provider: Arc::clone(&provider),
    }));

    let (event_tx, _) = broadcast::channel::<TurnEvent>(1024);

    let runner = Arc::new(TurnRunner::new(
        provider,
        registry,
        db.clone(),
        event_tx.clone(),
        TurnConfig::default(),
    ));
    let gateway = Arc::new(SessionGateway::new(runner, db.clone(), event_tx.clone()));

    let handler_state = HandlerState::new(db.clone())
        .with_gateway(Arc::clone(&gateway))
        .with_telemetry(telemetry);

    let config = ServerConfig {
        port: cli.port,
        ..Default::default()
    };
    let handle = usher_server::start(config, db, gateway, handler_state, event_tx)
        .await
        .expect("failed to start server");

    tracing::info!(port = handle.port, "usher server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn load_system_prompt(path: Option<&std::path::Path>) -> String {
    match path {
        Some(p) => std::fs::read_to_string(p).unwrap_or_else(|e| {
            tracing::warn!(path = %p.display(), error = %e, "could not read system prompt");
            String::new()
        }),
        None => String::new(),
    }
}

fn load_json_strings(dir: Option<&std::path::Path>, file: &str) -> Vec<String> {
    let Some(path) = dir.map(|d| d.join(file)) else {
        return Vec::new();
    };
    match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "malformed corpus file");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

fn load_roster(dir: Option<&std::path::Path>) -> Vec<Specialist> {
    if let Some(path) = dir.map(|d| d.join("specialists.json")) {
        if let Ok(raw) = std::fs::read_to_string(&path) {
            match serde_json::from_str(&raw) {
                Ok(roster) => return roster,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "malformed roster file")
                }
            }
        }
    }

    vec![
        Specialist {
            specialist_id: "PS-301".into(),
            name: "Mika Brandt".into(),
            title: "Cloud Migration Architect".into(),
            products: vec!["AWS".into(), "Azure".into()],
            skills: vec!["migration".into(), "landing zones".into(), "modernization".into()],
            industries: vec!["retail".into(), "manufacturing".into()],
        },
        Specialist {
            specialist_id: "PS-302".into(),
            name: "Jo Keller".into(),
            title: "FinOps Consultant".into(),
            products: vec!["GCP".into(), "AWS".into()],
            skills: vec!["cost optimization".into(), "budgeting".into()],
            industries: vec!["logistics".into(), "finance".into()],
        },
    ]
}

/// Build the retrieval index. Corpora embed at startup when an embeddings
/// endpoint is available; otherwise the search tools see empty corpora.
async fn build_retriever(
    data_dir: Option<&std::path::Path>,
    api_key: Option<&str>,
    base_url: &str,
) -> Arc<dyn Retriever> {
    let embedder: Arc<dyn usher_llm::Embedder> = match api_key {
        Some(key) => Arc::new(
            HttpEmbedder::new(base_url, key, "text-embedding-3-small")
                .expect("failed to build embeddings client"),
        ),
        None => Arc::new(NullEmbedder),
    };

    let mut index = VectorIndex::new(embedder);
    for (corpus, file) in [
        ("case_studies", "case_studies.json"),
        ("testimonials", "testimonials.json"),
    ] {
        let texts = load_json_strings(data_dir, file);
        match index.load_corpus(corpus, texts).await {
            Ok(count) => tracing::info!(corpus, count, "corpus loaded"),
            Err(e) => tracing::warn!(corpus, error = %e, "corpus load failed"),
        }
    }
    Arc::new(index)
}

/// Stands in when no embeddings endpoint is configured.
struct NullEmbedder;

#[async_trait::async_trait]
impl usher_llm::Embedder for NullEmbedder {
    async fn embed(
        &self,
        _text: &str,
    ) -> Result<Vec<f32>, usher_core::retrieval::RetrievalError> {
        Ok(vec![0.0])
    }
}
