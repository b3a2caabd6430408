use finance_turn_router::{
    config::OrchestratorConfig,
    gemini::GeminiClient,
    hydration::{MemoryHydrator, NoopHydrator, SnapshotHydrator},
    model::{ModelResponse, ScriptedModel, SharedModel},
    session::{
        spawn_sweeper, Clock, InMemorySessionStore, PgSessionStore, SessionStore, SnapshotCache,
        SystemClock, ThreadRegistry,
    },
    spawn_turn,
    stream::Received,
    tools::{create_default_registry, ServiceApiClient},
    TurnInput, TurnRouter,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let model: SharedModel = if config.model.gemini_api_key.is_empty() {
        warn!("GEMINI_API_KEY not set, using a scripted model");
        Arc::new(ScriptedModel::new().then(ModelResponse::text(
            "Hi! I can look at your spending, help set savings goals or explain financial concepts.",
        )))
    } else {
        Arc::new(GeminiClient::new(
            config.model.gemini_api_key.clone(),
            &config.model.gemini_model,
        )?)
    };

    let tools = create_default_registry(config.model.tools_base_url.as_deref())?;
    info!(tools = ?tools.list(), "Tool registry ready");

    let hydrator: Arc<dyn MemoryHydrator> = match config.model.tools_base_url.as_deref() {
        Some(url) => {
            let cache = Arc::new(SnapshotCache::new("snapshot", config.cache.snapshot_ttl, clock.clone()));
            spawn_sweeper(cache.clone(), config.cache.sweep_interval);
            Arc::new(SnapshotHydrator::new(Arc::new(ServiceApiClient::new(url)?), cache))
        }
        None => Arc::new(NoopHydrator),
    };

    let store: Arc<dyn SessionStore> = match config.database_url.as_deref() {
        Some(url) => Arc::new(PgSessionStore::connect_lazy(url, config.cache.session_ttl, clock.clone())?),
        None => {
            let store = InMemorySessionStore::new(config.cache.session_ttl, clock.clone());
            spawn_sweeper(store.cache(), config.cache.sweep_interval);
            info!("Session store backend: in-memory");
            Arc::new(store)
        }
    };

    let router = Arc::new(TurnRouter::from_config(
        &config,
        model,
        tools,
        hydrator,
        clock.clone(),
    ));
    let threads = Arc::new(ThreadRegistry::new(store, config.cache.session_ttl, clock));
    spawn_sweeper(threads.slots(), config.cache.sweep_interval);

    let text = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let text = if text.trim().is_empty() { "Hello".to_string() } else { text };
    let user_id = std::env::var("USER_ID").ok();
    let thread_id = std::env::var("THREAD_ID").unwrap_or_else(|_| "local-thread".to_string());

    info!(thread_id = %thread_id, "Running turn");

    let (mut events, handle) = spawn_turn(
        router,
        threads,
        thread_id,
        TurnInput::new(user_id, text),
        &config.stream,
    );

    loop {
        match events.next().await {
            Received::Event(event) => println!("{}", serde_json::to_string(&event)?),
            Received::Idle => continue,
            Received::Closed => break,
        }
    }

    match handle.await? {
        Ok(report) => {
            info!(
                handoffs = report.handoffs,
                peak_prompt_tokens = report.peak_prompt_tokens,
                "Turn complete"
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Turn failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
