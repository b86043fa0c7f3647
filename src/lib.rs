//! GeoAgent
//!
//! An LLM-driven assistant that answers spatial questions over a
//! PostGIS/pg_tileserv catalog: it plans and executes SQL analyses,
//! retrieves field documentation, and maintains a live map state per chat
//! session.

pub mod agent;
pub mod analysis;
pub mod config;
pub mod docstore;
pub mod dsl;
pub mod error;
pub mod geoagent;
pub mod llm;
pub mod mapstate;
pub mod registry;
pub mod session;
pub mod sql_runner;
pub mod tileserver;
pub mod transport;
pub mod utils;

use std::sync::Arc;

use sqlx::PgPool;

use analysis::AnalysisExecutor;
use config::Config;
use docstore::{DocumentStore, FieldDefinition, SupplementalInfoSection};
use llm::LlmClient;
use registry::TableRegistry;
use sql_runner::SqlRunner;
use tileserver::TileServerClient;

/// Shared application state: one instance per process, held behind an
/// `Arc` and referenced from every session's
/// [`session::SessionContext`]. Per-session state (message history, map
/// state) lives outside this struct — see [`session::Session`].
pub struct AppState {
    pub config: Config,
    pub db: PgPool,
    pub registry: Arc<TableRegistry>,
    pub sql_runner: SqlRunner,
    pub executor: AnalysisExecutor,
    pub llm: LlmClient,
    pub tileserver: TileServerClient,
    pub fields: DocumentStore<FieldDefinition>,
    pub supplemental: DocumentStore<SupplementalInfoSection>,
}
