mod cache;
mod config;
mod error;
mod model;
mod rag;
mod retrieval;
mod rules;
mod server;
mod store;
mod topics;

use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};
use tracing::info;
use tracing_subscriber::EnvFilter;

use civix_common::completion::{create_provider, CompletionConfig};
use civix_common::embedding::{GeminiEmbedClient, GeminiEmbedConfig};
use civix_common::redis::RedisCache;

use cache::QueryCache;
use config::Config;
use rag::QueryService;
use retrieval::Retriever;
use rules::RulesEngine;
use server::CivixServer;
use store::Store;
use topics::TopicCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing to stderr (stdout is reserved for MCP JSON-RPC)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting civix MCP server");

    // 1. Load config from environment
    let config = Config::from_env()?;
    info!(
        database_path = %config.database_path,
        rules_dir = %config.rules_dir,
        redis = config.redis_url.is_some(),
        "configuration loaded"
    );

    // 2. Connect to Redis (optional; graceful degradation if unavailable)
    let redis_cache = RedisCache::new(config.redis_url.as_deref());
    if redis_cache.is_available().await {
        info!("redis connected");
    } else {
        info!("redis unavailable, running without cache");
    }
    let query_cache = Arc::new(QueryCache::new(redis_cache));

    // 3. Open the data store
    let store = Store::connect(&config.database_path).await?;
    store.migrate().await?;
    info!("store ready");

    // 4. Upstream providers: embeddings and completion
    let embed_config = GeminiEmbedConfig::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(model = %embed_config.model, "embedding client configured");
    let embedder = Arc::new(GeminiEmbedClient::new(embed_config)?);

    let completion_config = CompletionConfig::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(
        provider = %completion_config.provider,
        model = %completion_config.model,
        "completion client configured"
    );
    let completion = create_provider(completion_config)?;

    // 5. Lazily-populated per-jurisdiction rule files
    let topics = Arc::new(TopicCache::new(&config.rules_dir));

    // 6. Assemble services
    let retriever = Retriever::new(store.clone(), embedder, query_cache);
    let query = Arc::new(QueryService::new(
        store.clone(),
        retriever,
        completion,
        Arc::clone(&topics),
    ));
    let engine = Arc::new(RulesEngine::new(store));

    // 7. Serve on stdio
    let server = CivixServer::new(query, engine, topics);
    info!("MCP server ready, serving on stdio");
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!(error = %e, "MCP server error");
    })?;

    service.waiting().await?;
    info!("MCP server shut down");
    Ok(())
}
