//! Consume customer events and record suspected duplicate customers.
use std::sync::Arc;

use dedup_common::broker::ConnectionManager;
use dedup_common::health::HealthRegistry;
use dedup_common::metrics::{install_recorder, operator_router, serve};
use dedup_common::suspicion::PgSuspicionStore;
use dedup_worker::config::Config;
use dedup_worker::consumer::EventConsumer;
use dedup_worker::error::WorkerError;
use dedup_worker::pipeline::DuplicateAnalyzer;
use dedup_worker::publisher::AmqpDuplicatePublisher;
use dedup_worker::search::ElasticsearchCandidates;
use dedup_worker::shutdown::ShutdownSignal;
use dedup_worker::similarity::SimilarityEvaluator;
use envconfig::Envconfig;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("consumer");
    let consumer_health = liveness.handle(config.liveness_deadline.0);

    let recorder = install_recorder().expect("failed to install metrics recorder");
    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = operator_router(liveness, recorder);
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let store = PgSuspicionStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to connect to postgres");
    sqlx::migrate!("../migrations")
        .run(store.pool())
        .await
        .expect("failed to run migrations");

    let candidates = ElasticsearchCandidates::new(
        &config.elasticsearch_url,
        config.elasticsearch_index.as_str(),
        config.search_max_hits,
        config.request_timeout.0,
    )
    .expect("failed to construct search client");

    let manager = Arc::new(ConnectionManager::new(
        &config.amqp_url,
        config.topology(),
        config.connect_retry.policy(),
    ));
    // Fail fast when the broker cannot be reached at all.
    manager.connection().await?;

    let analyzer = DuplicateAnalyzer::new(
        Arc::new(candidates),
        Arc::new(store),
        Arc::new(AmqpDuplicatePublisher::new(manager.clone())),
        SimilarityEvaluator::new(config.score_threshold),
        &config.duplicate_event_type,
    );

    let consumer = EventConsumer::new(
        manager.clone(),
        analyzer,
        &config.consumer_tag,
        config.max_delivery_attempts,
        config.liveness_deadline.0 / 3,
        consumer_health,
    );

    let shutdown = ShutdownSignal::install().expect("failed to install SIGTERM handler");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    let result = tokio::select! {
        result = &mut consumer_handle => result,
        _ = shutdown.recv() => {
            info!("finishing the current event");
            if shutdown_tx.send(()).is_err() {
                error!("consumer already stopped");
            }
            consumer_handle.await
        }
    };

    manager.close().await;

    match result {
        Ok(Ok(())) => {
            info!("consumer stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("consumer stopped with error: {}", e);
            Err(e)
        }
        Err(e) => panic!("consumer task panicked: {e}"),
    }
}
