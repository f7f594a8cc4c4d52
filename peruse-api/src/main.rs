//! Peruse Server Entry Point
//!
//! Parses configuration, connects to the analytical store, registers feeds,
//! then runs the HTTP server alongside the relay consumer. A closed or failed
//! relay stream ends the process so the supervisor can restart it.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use peruse_api::{
    create_router, AlgorithmTable, ApiError, ApiResult, AppState, AuthVerifier, CloseByFeed,
    ErrorCode, NervanaClient, PlcDirectory, ServerConfig, ServiceInfo, SuggestedFollowsFeed,
    TopicEntity, TopicFeed, UserManager,
};
use peruse_core::{IdentityDirectory, PeruseError};
use peruse_events::{
    ConsumerLoop, EventDispatcher, FeedModule, FeedRegistry, JsonFrameCodec, StreamEnd,
};
use peruse_storage::{ClickHouseStore, FileCursorStore, QueryStore};
use tokio::task::JoinError;

fn startup_error(context: &str, err: impl Display) -> ApiError {
    ApiError::new(ErrorCode::InternalError, format!("{context}: {err}"))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler; run until the stream or server ends.
        std::future::pending::<()>().await;
    }
}

fn stream_outcome(outcome: Result<Result<StreamEnd, PeruseError>, JoinError>) -> ApiResult<()> {
    match outcome {
        Ok(Ok(StreamEnd::Shutdown)) => Ok(()),
        Ok(Ok(StreamEnd::Closed)) => Err(startup_error("Relay stream", "closed by server")),
        Ok(Err(e)) => Err(startup_error("Relay stream failed", e)),
        Err(e) => Err(startup_error("Consumer task failed", e)),
    }
}

#[tokio::main]
async fn main() -> ApiResult<()> {
    let config = ServerConfig::parse();
    peruse_api::telemetry::init_tracing(config.log_format)
        .map_err(|e| startup_error("Telemetry", e))?;
    config
        .validate()
        .map_err(|e| startup_error("Invalid configuration", e))?;

    let clickhouse = ClickHouseStore::new(config.clickhouse())
        .map_err(|e| startup_error("ClickHouse client", e))?;
    clickhouse
        .ping()
        .await
        .map_err(|e| startup_error("ClickHouse unreachable", e))?;
    let store: Arc<dyn QueryStore> = Arc::new(clickhouse);

    let directory: Arc<dyn IdentityDirectory> = Arc::new(
        PlcDirectory::new(config.directory()).map_err(|e| startup_error("Identity directory", e))?,
    );
    let users = Arc::new(UserManager::default());

    let mut feeds: Vec<Arc<dyn FeedModule>> = Vec::new();
    for topic in config
        .topic_feeds()
        .map_err(|e| startup_error("Topic feeds", e))?
    {
        let entities = TopicEntity::load(&topic.entities)
            .map_err(|e| startup_error("Topic feed entities", e))?;
        feeds.push(Arc::new(TopicFeed::new(&topic, entities, Arc::clone(&store))));
    }
    feeds.push(Arc::new(CloseByFeed::new(
        config.chrono_feed_rkey.clone(),
        Arc::clone(&store),
        Arc::clone(&users),
    )));
    feeds.push(Arc::new(SuggestedFollowsFeed::new(
        config.suggested_follows_rkey.clone(),
        Arc::clone(&store),
        Arc::clone(&users),
    )));

    let mut builder = FeedRegistry::builder();
    for feed in feeds {
        builder
            .register(feed)
            .map_err(|e| startup_error("Feed registry", e))?;
    }
    let registry = builder.build();
    tracing::info!(feeds = ?registry, "Feeds registered");

    let mut dispatcher = EventDispatcher::new(Arc::clone(&registry), config.dispatch_concurrency);
    if let Some(nervana) = config.nervana() {
        let client = NervanaClient::new(nervana).map_err(|e| startup_error("Nervana client", e))?;
        dispatcher = dispatcher.with_extractor(Arc::new(client));
    } else {
        tracing::warn!("No entity extractor configured; topic feeds will not ingest");
    }
    let consumer = ConsumerLoop::new(
        config.consumer(),
        Arc::new(JsonFrameCodec::new()),
        Arc::new(FileCursorStore::new(&config.cursor_file)),
        Arc::new(dispatcher),
    );
    // Unreadable cursor files are fatal before anything starts serving.
    consumer
        .restore_cursor()
        .await
        .map_err(|e| startup_error("Cursor file", e))?;

    let verifier = Arc::new(AuthVerifier::new(
        Arc::clone(&directory),
        AlgorithmTable::atproto(),
        config.auth(),
    ));
    let state = AppState {
        registry,
        verifier,
        users,
        store,
        directory,
        service: Arc::new(ServiceInfo {
            service_did: config.service_did.clone(),
            service_endpoint: config.service_endpoint.clone(),
            feed_owner: config
                .feed_owner()
                .map_err(|e| startup_error("Invalid configuration", e))?,
        }),
        start_time: Instant::now(),
    };
    let app = create_router(state);

    let addr = config
        .bind_addr()
        .map_err(|e| startup_error("Invalid configuration", e))?;
    tracing::info!(%addr, "Starting peruse server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| startup_error(&format!("Failed to bind {addr}"), e))?;

    let mut consumer_task = tokio::spawn(async move { consumer.run(shutdown_signal()).await });
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    tokio::select! {
        result = server => {
            result.map_err(|e| startup_error("Server error", e))?;
            tracing::info!("HTTP server stopped");
            stream_outcome((&mut consumer_task).await)?;
        }
        outcome = &mut consumer_task => {
            stream_outcome(outcome)?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
