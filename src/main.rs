use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use geoagent::agent::Agent;
use geoagent::analysis::AnalysisExecutor;
use geoagent::config::Config;
use geoagent::docstore::{DocumentStore, FieldDefinition, SupplementalInfoSection};
use geoagent::geoagent as concrete_agent;
use geoagent::llm::LlmClient;
use geoagent::registry::TableRegistry;
use geoagent::session::{run_session, Session, SessionContext, SessionRegistry};
use geoagent::sql_runner::SqlRunner;
use geoagent::tileserver::TileServerClient;
use geoagent::transport::InboundMessage;
use geoagent::utils::{ScheduledExecutor, ScheduledTask};
use geoagent::AppState;

/// Periodic background job that re-discovers whatever pg_tileserv is
/// publishing, so tables created outside this process (or dropped) show
/// up in the registry without a restart, run on the same recurring
/// `ScheduledExecutor` a metrics collector would use.
struct TileservResyncTask {
    registry: Arc<TableRegistry>,
    tileserver: TileServerClient,
    pool: sqlx::PgPool,
    base_schema: String,
}

impl ScheduledTask for TileservResyncTask {
    fn run(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            self.registry.load_from_tileserv(&self.tileserver, &self.pool, &self.base_schema).await?;
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("geoagent.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        // _guard would be dropped here if not leaked; leak it so the
        // non-blocking writer keeps flushing for the life of the process.
        std::mem::forget(_guard);
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("GeoAgent starting up");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    tracing::info!("database pool created");

    let tileserver_base_url = config.tileserver.base_url.clone();
    let tileserver = TileServerClient::new(reqwest::Client::new(), tileserver_base_url.clone());

    let table_registry = Arc::new(TableRegistry::new());
    table_registry
        .load_from_tileserv(&tileserver, &pool, &config.database.base_schema)
        .await?;
    tracing::info!(tables = table_registry.schemas().len(), "table registry loaded from tile server");

    let llm = LlmClient::new(
        config.llm.api_base.clone(),
        config.llm.api_key.clone(),
        config.llm.inference_model.clone(),
        config.llm.embedding_model.clone(),
        Duration::from_secs(config.llm.request_timeout_secs),
    );

    let fields = DocumentStore::<FieldDefinition>::open(
        config.paths.docstore_root.clone(),
        "fields",
        "v1",
        config.llm.embedding_dims,
    )
    .await?;
    let supplemental = DocumentStore::<SupplementalInfoSection>::open(
        config.paths.docstore_root.clone(),
        "supplemental",
        "v1",
        config.llm.embedding_dims,
    )
    .await?;
    tracing::info!("document stores opened");

    let sql_runner = SqlRunner::new(config.paths.template_dir.clone());
    let executor = AnalysisExecutor::new(
        SqlRunner::new(config.paths.template_dir.clone()),
        config.map.geometry_column.clone(),
        config.map.default_srid,
        config.database.base_schema.clone(),
        config.database.tileserv_role.clone(),
    );

    let app_state = Arc::new(AppState {
        config,
        db: pool.clone(),
        registry: Arc::clone(&table_registry),
        sql_runner,
        executor,
        llm,
        tileserver: TileServerClient::new(reqwest::Client::new(), tileserver_base_url.clone()),
        fields,
        supplemental,
    });

    let resync = TileservResyncTask {
        registry: Arc::clone(&app_state.registry),
        tileserver: TileServerClient::new(reqwest::Client::new(), app_state.config.tileserver.base_url.clone()),
        pool: pool.clone(),
        base_schema: app_state.config.database.base_schema.clone(),
    };
    let resync_executor = ScheduledExecutor::new("tileserv-resync", Duration::from_secs(60));
    let shutdown_handle = resync_executor.shutdown_handle();
    tokio::spawn(async move {
        resync_executor.start(resync).await;
    });

    let agent = Arc::new(concrete_agent::build());
    let sessions = Arc::new(SessionRegistry::new());

    let server_state = ServerState { app: Arc::clone(&app_state), agent, sessions };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_check))
        .with_state(server_state);

    let addr = format!("{}:{}", app_state.config.server.host, app_state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "GeoAgent listening");

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_handle.shutdown();
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    if let Err(e) = table_registry.cleanup(&app_state.sql_runner, &pool).await {
        tracing::warn!(error = %e, "cleanup of temporary analysis tables failed");
    }

    Ok(())
}

#[derive(Clone)]
struct ServerState {
    app: Arc<AppState>,
    agent: Arc<Agent<SessionContext>>,
    sessions: Arc<SessionRegistry>,
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let ctx = Arc::new(SessionContext::new(Arc::clone(&state.app), outbound_tx));
    let session = Session::new(ctx);
    let session_id = session.id();
    state.sessions.register(session_id, inbound_tx);

    let (mut ws_sink, mut ws_stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else { continue };
            if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let reader = tokio::spawn(run_session(session, state.agent.clone(), inbound_rx));

    while let Some(Ok(message)) = ws_stream.next().await {
        if let WsMessage::Text(text) = message {
            match serde_json::from_str::<InboundMessage>(&text) {
                Ok(parsed) => {
                    state.sessions.dispatch(&session_id, parsed);
                }
                Err(e) => tracing::warn!(error = %e, "failed to parse inbound message"),
            }
        }
    }

    state.sessions.unregister(&session_id);
    writer.abort();
    reader.abort();
}
