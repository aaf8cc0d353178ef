use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wrench_api::{app, AppState, Backends, DomainSettings};
use wrench_booking::HttpPaymentGateway;
use wrench_store::{
    DbClient, EventNotifier, EventProducer, PgBookingRepository, PgCustomerRepository, PgHistoryRepository,
    PgReferralRepository, RedisClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wrench_api=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = wrench_store::app_config::Config::load().context("Failed to load config")?;
    tracing::info!("Starting Wrench API on port {}", config.server.port);

    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    // Redis in-flight guard
    let redis = RedisClient::new(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;

    // Kafka
    let producer = Arc::new(EventProducer::new(&config.kafka).context("Failed to create Kafka producer")?);
    let notifier = EventNotifier::new(producer.clone(), config.kafka.notification_topic.clone());

    let gateway = HttpPaymentGateway::new(
        &config.gateway.api_base,
        &config.gateway.secret_key,
        config.gateway.timeout_seconds,
    );

    let backends = Backends {
        bookings: Arc::new(PgBookingRepository::new(db.pool.clone())),
        history: Arc::new(PgHistoryRepository::new(db.pool.clone())),
        customers: Arc::new(PgCustomerRepository::new(db.pool.clone())),
        referrals: Arc::new(PgReferralRepository::new(db.pool.clone())),
        guard: Arc::new(redis),
        events: producer,
        notifier: Arc::new(notifier),
        gateway: Arc::new(gateway),
    };

    let settings = DomainSettings {
        reconciliation: config.reconciliation.clone(),
        referral: config.referral.clone(),
        maintenance: config.maintenance.clone(),
        booking_topic: config.kafka.booking_topic.clone(),
    };

    let state = AppState::build(backends, settings).context("Failed to register metrics")?;
    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
