use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer};
use chrono::Utc;
use experiment_service::cache::{AssignmentCache, RealtimeCounters, ResultsCache};
use experiment_service::db::{rollup_repo, ClickHouseClient};
use experiment_service::handlers;
use experiment_service::jobs::rollup::RollupConsumerConfig;
use experiment_service::jobs::{EventDeduplicator, PartitionManager, RollupConsumer};
use experiment_service::middleware::BearerAuthMiddleware;
use experiment_service::services::{
    AnalyticsService, AssignmentService, BulkService, EventsService, LifecycleService,
};
use experiment_service::Config;
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use redis::aio::ConnectionManager;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transactional_outbox::{
    KafkaOutboxPublisher, OutboxDrainer, OutboxMetrics, SqlxOutboxRepository,
};

struct HealthState {
    db_pool: sqlx::Pool<sqlx::Postgres>,
    redis: ConnectionManager,
    clickhouse: Arc<ClickHouseClient>,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "lowercase")]
enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Serialize)]
struct ComponentCheck {
    status: ComponentStatus,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    checks: HashMap<String, ComponentCheck>,
    timestamp: String,
}

impl HealthState {
    async fn check_postgres(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(&self.db_pool).await.map(|_| ())
    }

    async fn check_redis(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(redis::RedisError::from((
                redis::ErrorKind::ResponseError,
                "unexpected PING response",
            )))
        }
    }
}

async fn health_summary(state: web::Data<HealthState>) -> HttpResponse {
    match state.check_postgres().await {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "experiment-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
        Err(e) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "unhealthy",
            "error": format!("PostgreSQL connection failed: {}", e),
            "service": "experiment-service"
        })),
    }
}

async fn readiness_summary(state: web::Data<HealthState>) -> HttpResponse {
    let mut checks = HashMap::new();
    let mut ready = true;

    let start = Instant::now();
    let postgres_check = match state.check_postgres().await {
        Ok(_) => ComponentCheck {
            status: ComponentStatus::Healthy,
            message: "PostgreSQL connection successful".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            ready = false;
            ComponentCheck {
                status: ComponentStatus::Unhealthy,
                message: format!("PostgreSQL connection failed: {}", e),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            }
        }
    };
    checks.insert("postgresql".to_string(), postgres_check);

    let start = Instant::now();
    let redis_check = match state.check_redis().await {
        Ok(_) => ComponentCheck {
            status: ComponentStatus::Healthy,
            message: "Redis ping successful".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            // The cache is best-effort: reads degrade to the store.
            ComponentCheck {
                status: ComponentStatus::Degraded,
                message: format!("Redis ping failed: {}", e),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            }
        }
    };
    checks.insert("redis".to_string(), redis_check);

    let start = Instant::now();
    let clickhouse_check = match state.clickhouse.health_check().await {
        Ok(_) => ComponentCheck {
            status: ComponentStatus::Healthy,
            message: "ClickHouse query successful".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => ComponentCheck {
            status: ComponentStatus::Degraded,
            message: format!("ClickHouse health check failed: {}", e),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
    };
    checks.insert("clickhouse".to_string(), clickhouse_check);

    let response = ReadinessResponse {
        ready,
        checks,
        timestamp: Utc::now().to_rfc3339(),
    };

    if ready {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

async fn liveness_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"alive": true}))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration loading failed: {:#}", e);
            eprintln!("ERROR: Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("Starting experiment-service v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.app.env);

    // Database pool + schema
    let db_pool = match PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.database.url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Database pool creation failed: {:#}", e);
            eprintln!("ERROR: Failed to create database pool: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = sqlx::migrate!("./migrations").run(&db_pool).await {
        tracing::error!("Migration failed: {:#}", e);
        eprintln!("ERROR: Failed to run migrations: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Connected to PostgreSQL, migrations applied");

    // Redis
    let redis_client = redis::Client::open(config.cache.url.as_str()).map_err(|e| {
        io::Error::new(io::ErrorKind::Other, format!("Invalid REDIS_URL: {e}"))
    })?;
    let redis_manager = ConnectionManager::new(redis_client).await.map_err(|e| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Failed to initialize Redis connection: {e}"),
        )
    })?;
    tracing::info!("Connected to Redis");

    // ClickHouse; the analytical path degrades while it is down
    let ch_cfg = &config.clickhouse;
    let ch_client = Arc::new(ClickHouseClient::new(
        &ch_cfg.url,
        &ch_cfg.database,
        &ch_cfg.username,
        &ch_cfg.password,
        ch_cfg.query_timeout_ms,
    ));
    match rollup_repo::ensure_analytics_schema(&ch_client).await {
        Ok(()) => tracing::info!("ClickHouse analytics schema ensured"),
        Err(e) => tracing::warn!("ClickHouse unavailable, analytical path degraded: {}", e),
    }

    // Kafka producer for the outbox drainer
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka.brokers)
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("max.in.flight.requests.per.connection", "5")
        .set("compression.type", "lz4")
        .set("linger.ms", "10")
        .create()
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to create Kafka producer: {e}"),
            )
        })?;

    // Wiring
    let outbox_repo = Arc::new(SqlxOutboxRepository::new(db_pool.clone()));
    let assignment_cache = AssignmentCache::new(
        redis_manager.clone(),
        config.assignment.cache_ttl_secs,
    );
    let results_cache = ResultsCache::new(
        redis_manager.clone(),
        config.analytics.results_cache_ttl_secs,
    );
    let realtime = RealtimeCounters::new(redis_manager.clone());

    let assignment_service = Arc::new(AssignmentService::new(
        db_pool.clone(),
        assignment_cache.clone(),
        outbox_repo.clone(),
        config.assignment.hash_seed.clone(),
        config.assignment.bucket_size,
    ));
    let events_service = EventsService::new(
        db_pool.clone(),
        assignment_service.clone(),
        outbox_repo.clone(),
        realtime,
    );
    let lifecycle_service = LifecycleService::new(db_pool.clone(), assignment_cache.clone());
    let bulk_service = BulkService::new(db_pool.clone(), outbox_repo.clone());
    let analytics_service = AnalyticsService::new(
        db_pool.clone(),
        ch_client.clone(),
        results_cache,
        config.analytics.recent_window_secs,
        config.analytics.max_operational_span_days,
        config.analytics.default_min_sample,
        config.analytics.confidence,
    );

    let partition_manager = Arc::new(PartitionManager::new(
        db_pool.clone(),
        outbox_repo.clone(),
        config.retention.events_retention_days,
        config.retention.partitions_ahead,
    ));
    if let Err(e) = partition_manager.ensure_partitions().await {
        tracing::error!("Initial partition creation failed: {:#}", e);
        eprintln!("ERROR: Failed to create event partitions: {}", e);
        std::process::exit(1);
    }

    let publisher = Arc::new(KafkaOutboxPublisher::new(
        producer,
        config.kafka.topic_prefix.clone(),
    ));
    let drainer = Arc::new(
        OutboxDrainer::new(
            db_pool.clone(),
            outbox_repo.clone(),
            publisher,
            config.outbox.batch_size,
            Duration::from_millis(config.outbox.poll_interval_ms),
        )
        .with_metrics(OutboxMetrics::new("experiment-service")),
    );

    let rollup_consumer = RollupConsumer::new(
        RollupConsumerConfig {
            brokers: config.kafka.brokers.clone(),
            group_id: config.kafka.rollup_group_id.clone(),
            topic: format!("{}.event.events", config.kafka.topic_prefix),
            batch_size: 100,
        },
        ch_client.clone(),
        EventDeduplicator::new(redis_manager.clone(), 7 * 24 * 60 * 60),
    );

    // Shared handler state
    let assignment_data = web::Data::from(assignment_service.clone());
    let events_data = web::Data::new(events_service);
    let lifecycle_data = web::Data::new(lifecycle_service);
    let bulk_data = web::Data::new(bulk_service);
    let analytics_data = web::Data::new(analytics_service);
    let partitions_data = web::Data::new(partition_manager.clone());
    let health_state = web::Data::new(HealthState {
        db_pool: db_pool.clone(),
        redis: redis_manager.clone(),
        clickhouse: ch_client.clone(),
    });

    let http_bind_address = format!("{}:{}", config.app.host, config.app.port);
    tracing::info!("Starting HTTP server at {}", http_bind_address);

    let auth_pool = db_pool.clone();
    let workers = config.app.workers;
    let allowed_origins = config.cors.allowed_origins.clone();
    let server = HttpServer::new(move || {
        let mut cors = Cors::default();
        for origin in allowed_origins.split(',') {
            let origin = origin.trim();
            if origin == "*" {
                cors = cors.allow_any_origin();
            } else {
                cors = cors.allowed_origin(origin);
            }
        }
        cors = cors.allow_any_method().allow_any_header().max_age(3600);

        App::new()
            .app_data(assignment_data.clone())
            .app_data(events_data.clone())
            .app_data(lifecycle_data.clone())
            .app_data(bulk_data.clone())
            .app_data(analytics_data.clone())
            .app_data(partitions_data.clone())
            .app_data(health_state.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(tracing_actix_web::TracingLogger::default())
            .route(
                "/metrics",
                web::get().to(experiment_service::metrics::serve_metrics),
            )
            .route("/api/v1/health", web::get().to(health_summary))
            .route("/api/v1/health/ready", web::get().to(readiness_summary))
            .route("/api/v1/health/live", web::get().to(liveness_check))
            .service(
                web::scope("/api/v1")
                    .wrap(BearerAuthMiddleware::new(auth_pool.clone()))
                    .service(
                        web::scope("/experiments")
                            .service(
                                web::resource("")
                                    .route(web::post().to(handlers::create_experiment))
                                    .route(web::get().to(handlers::list_experiments)),
                            )
                            .service(
                                web::resource("/{experiment_id}")
                                    .route(web::get().to(handlers::get_experiment))
                                    .route(web::patch().to(handlers::update_experiment))
                                    .route(web::delete().to(handlers::archive_experiment)),
                            )
                            .route(
                                "/{experiment_id}/activate",
                                web::post().to(handlers::activate_experiment),
                            )
                            .route(
                                "/{experiment_id}/pause",
                                web::post().to(handlers::pause_experiment),
                            )
                            .route(
                                "/{experiment_id}/hard",
                                web::delete().to(handlers::hard_delete_experiment),
                            )
                            .route(
                                "/{experiment_id}/variants",
                                web::patch().to(handlers::update_allocations),
                            )
                            .route(
                                "/{experiment_id}/assignment/{user_id}",
                                web::get().to(handlers::get_assignment),
                            )
                            .route(
                                "/{experiment_id}/results",
                                web::get().to(handlers::get_results),
                            )
                            .route(
                                "/{experiment_id}/funnel",
                                web::get().to(handlers::get_funnel),
                            ),
                    )
                    .route(
                        "/assignments/bulk",
                        web::post().to(handlers::bulk_assignments),
                    )
                    .service(
                        web::scope("/events")
                            .route("", web::post().to(handlers::record_event))
                            .route("/batch", web::post().to(handlers::record_event_batch)),
                    )
                    .service(
                        web::scope("/admin")
                            .route(
                                "/experiments/bulk",
                                web::post().to(handlers::bulk_create_experiments),
                            )
                            .service(
                                web::resource("/assignments/bulk")
                                    .route(web::post().to(handlers::bulk_upsert_assignments))
                                    .route(web::patch().to(handlers::bulk_update_assignments))
                                    .route(web::delete().to(handlers::bulk_delete_assignments)),
                            )
                            .route(
                                "/events/bulk",
                                web::post().to(handlers::bulk_record_events),
                            )
                            .route("/retention/run", web::post().to(handlers::run_retention)),
                    ),
            )
    })
    .bind(&http_bind_address)?
    .workers(workers)
    .run();

    let server_handle = server.handle();

    let mut tasks: JoinSet<io::Result<()>> = JoinSet::new();

    tasks.spawn(async move {
        tracing::info!("HTTP server is running");
        server.await
    });

    // Outbox drainer
    tasks.spawn(async move {
        drainer.start().await;
        Ok(())
    });

    // Partition manager daily tick
    let partition_job = partition_manager.clone();
    tasks.spawn(async move {
        partition_job.run().await;
        Ok(())
    });

    // Rollup consumer feeding ClickHouse
    match rollup_consumer {
        Ok(consumer) => {
            tasks.spawn(async move {
                consumer.run().await;
                Ok(())
            });
        }
        Err(e) => {
            tracing::warn!("Rollup consumer not started: {}", e);
        }
    }

    let mut first_error: Option<io::Error> = None;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = tasks.join_next() => {
                match result {
                    Some(Ok(Ok(_))) => {
                        tracing::info!("Background task completed");
                    }
                    Some(Ok(Err(e))) => {
                        tracing::error!("Task returned error: {}", e);
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        server_handle.stop(true).await;
                        tasks.shutdown().await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("Task join error: {}", e);
                        if first_error.is_none() {
                            first_error = Some(io::Error::new(io::ErrorKind::Other, e.to_string()));
                        }
                        server_handle.stop(true).await;
                        tasks.shutdown().await;
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                server_handle.stop(true).await;
                tasks.shutdown().await;
                break;
            }
        }
    }

    tracing::info!("experiment-service shutting down");

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
