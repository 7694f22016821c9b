use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::net::TcpListener;
use tower_http::{compression::CompressionLayer, limit::RequestBodyLimitLayer, validate_request::ValidateRequestHeaderLayer};
use tracing_subscriber::{fmt::{writer::BoxMakeWriter, Layer}, layer::SubscriberExt, EnvFilter, Registry};

use db::inbox::InboxStore;
use db::wallet::WalletStore;
use lifecycle::{LifecycleController, LifecyclePolicy};
use routes::session::SessionService;
use sync::RideFeed;

mod db;
mod dispatch;
mod error;
mod lifecycle;
mod otp;
mod routes;
mod sync;

#[tokio::main]
async fn main() {

    // mandatory fields
    let db_url = dotenv::var("DATABASE_URL").unwrap_or("sqlite://ride2school.db?mode=rwc".to_string());
    let jwt_secret = dotenv::var("JWT_SECRET").unwrap_or("your-jwt-secret".to_string());
    // optional fields
    let max_connection_pooling = dotenv::var("MAX_CONNECTION_POOLING").unwrap_or("5".to_string()).parse::<u32>().unwrap();
    let port = dotenv::var("PORT").unwrap_or("3000".to_string()).parse::<u16>().unwrap();
    let log_file = dotenv::var("LOG_FILE").unwrap_or("app.log".to_string());
    let feed_refresh_secs = dotenv::var("FEED_REFRESH_SECS")
        .unwrap_or(sync::DEFAULT_REFRESH_SECS.to_string())
        .parse::<u64>()
        .unwrap();

    // add tracing layer
    let file_appender = tracing_appender::rolling::never(".", &log_file);
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, _guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = Layer::new().json().with_writer(BoxMakeWriter::new(move || file_writer.clone()));
    let stdout_layer = Layer::new().with_writer(BoxMakeWriter::new(move || stdout_writer.clone()));

    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env())
        .with(file_layer)
        .with(stdout_layer);

    tracing::subscriber::set_global_default(subscriber).expect("Unable to set global subscriber");

    let database_pool = match process_database(&db_url, max_connection_pooling).await {
        Ok(db) => {
            tracing::info!("Connected to database");
            db
        },
        Err(err) => {
            tracing::error!("Failed to connect to database: {}", err);
            process::exit(1);
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(port) => {
            tracing::info!("Listening on port: {}", port.local_addr().unwrap().port());
            port
        }
        Err(err) => {
            tracing::error!("Failed to bind to port: {}", err);
            process::exit(1);
        }
    };

    let router = process_begin(database_pool, jwt_secret, feed_refresh_secs);
    tracing::info!("Routes constructed successfully");

    //start the http service
    let http_service = axum::serve(listener, router);
    if let Err(err) = http_service.await {
        tracing::error!("Failed to start server: {}", err);
        process::exit(1);
    }
}

fn process_begin(db_pool: SqlitePool, jwt_secret: String, feed_refresh_secs: u64) -> Router {
    let head_route = Router::new();

    let sessions = Arc::new(SessionService::new(jwt_secret));
    let policy = LifecyclePolicy::from_env();
    tracing::info!(?policy, "lifecycle policy loaded");

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let controller = LifecycleController::new(db_pool.clone(), policy, event_tx);
    let wallet = WalletStore::new(db_pool.clone());
    let inbox = InboxStore::new(db_pool.clone());

    // side effects run off the critical path
    dispatch::spawn(inbox.clone(), event_rx);

    let feed = RideFeed::new();
    sync::spawn_refresh(
        controller.store().clone(),
        feed.clone(),
        Duration::from_secs(feed_refresh_secs),
    );

    let ride_routes = routes::rides::ride_routes(routes::rides::RideRoutesState {
        sessions: sessions.clone(),
        controller,
        feed,
    })
    .route_layer(ValidateRequestHeaderLayer::accept("Authorization"));
    let wallet_routes = routes::wallet::wallet_routes(routes::wallet::WalletRoutesState {
        sessions,
        wallet,
        inbox,
    })
    .route_layer(ValidateRequestHeaderLayer::accept("Authorization"))
    .route_layer(CompressionLayer::new().gzip(true));

    head_route
        .nest("/v1", ride_routes)
        .nest("/v1", wallet_routes)
        .route_layer(RequestBodyLimitLayer::new(1024 * 1024 * 10))
}

async fn process_database(url: &str, max_conn_pool: u32) -> Result<SqlitePool, String> {
    // create a connection pool
    let db_pool = SqlitePoolOptions::new()
        .max_connections(max_conn_pool)
        .connect(url)
        .await
        .map_err(|err| format!("Failed to connect to database: {}", err))?;

    match sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .map_err(|err| format!("Failed to run migrations: {}", err))
    {
        Ok(_) => {
            tracing::info!("Migrations run successfully");
        },
        Err(err) => {
            // if it fails we assume to continue believing that the database is already migrated
            tracing::warn!("Failed to run migrations: {err}");
        },
    }

    Ok(db_pool)
}
