use anyhow::Result;
use common::cache::{RedisConfig, RedisPool};
use common::database::{self, DatabaseConfig};
use common::repositories::PgEntityStore;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use worker::config::WorkerConfig;
use worker::queue::{Queue, RedisQueue, THUMBNAIL_QUEUE, WELCOME_QUEUE};
use worker::thumbnail_generator::ImageThumbnailer;
use worker::{LogNotifier, ThumbnailWorker, WelcomeWorker};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .init();

    info!("Starting job worker");

    let config = WorkerConfig::from_env()?;

    // Initialize database connection
    let db_config = DatabaseConfig::from_env()?;
    let pool = database::init_pool(&db_config).await?;
    if !database::health_check(&pool).await? {
        anyhow::bail!("Failed to connect to database");
    }
    let entities = Arc::new(PgEntityStore::new(pool));

    // Initialize Redis-backed queues
    let redis_config = RedisConfig::from_env()?;
    let redis_pool = RedisPool::new(&redis_config).await?;
    let backend = RedisQueue::new(redis_pool);
    for queue in [THUMBNAIL_QUEUE, WELCOME_QUEUE] {
        backend.recover(queue).await?;
    }
    let backend = Arc::new(backend);

    let file_queue = Queue::new(THUMBNAIL_QUEUE, backend.clone());
    let user_queue = Queue::new(WELCOME_QUEUE, backend);

    let thumbnail_worker = ThumbnailWorker::new(entities.clone(), Arc::new(ImageThumbnailer::new()));
    let welcome_worker = WelcomeWorker::new(entities, Arc::new(LogNotifier));

    let thumbnail_consumer = file_queue
        .register_consumer(thumbnail_worker, config.retry)?
        .with_poll_interval(config.poll_interval);
    let welcome_consumer = user_queue
        .register_consumer(welcome_worker, config.retry)?
        .with_poll_interval(config.poll_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumers = [
        tokio::spawn(thumbnail_consumer.run(shutdown_rx.clone())),
        tokio::spawn(welcome_consumer.run(shutdown_rx)),
    ];

    info!("Job worker started successfully");

    // Keep the service running
    tokio::signal::ctrl_c().await?;
    info!("Shutting down job worker");

    shutdown_tx.send(true)?;
    for consumer in consumers {
        consumer.await?;
    }

    Ok(())
}
