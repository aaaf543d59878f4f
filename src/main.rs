mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod notify;
mod payment;
mod services;
mod storage;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::notify::{LogNotifier, Notifier, SendGridNotifier};
use crate::payment::{PaymentGateway, StripeGateway};
use crate::services::{IdentityVerifier, JwtIdentity};
use crate::storage::{LocalObjectStore, ObjectStore, UrlSigner};

// Headroom for multipart form framing around a direct upload
const FORM_OVERHEAD: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub store: Arc<dyn ObjectStore>,
    pub signer: UrlSigner,
    pub payments: Arc<dyn PaymentGateway>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub notifier: Arc<dyn Notifier>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudpool=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CloudPool...");

    // Load configuration
    let config = Config::load()?;
    let config = Arc::new(config);
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database.path).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    // Object store and link signer
    let signer = UrlSigner::new(
        &config.storage.presign_secret,
        &config.storage.public_base_url,
    );
    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
        &config.storage.local_path,
        signer.clone(),
    ));
    tracing::info!(
        "Object store: {} at {}",
        store.storage_type(),
        config.storage.local_path
    );

    let payments: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(&config.stripe)?);
    if config.stripe.secret_key.is_empty() {
        tracing::warn!("Stripe secret key not configured; purchases will fail");
    }

    let identity: Arc<dyn IdentityVerifier> = Arc::new(JwtIdentity::new(db.clone(), &config.jwt));

    let notifier: Arc<dyn Notifier> = if config.mail.sendgrid_api_key.is_empty() {
        tracing::warn!("SendGrid API key not configured; verification codes are only logged");
        Arc::new(LogNotifier)
    } else {
        Arc::new(SendGridNotifier::new(&config.mail)?)
    };

    // Create app state
    let state = AppState {
        db,
        config: config.clone(),
        store,
        signer,
        payments,
        identity,
        notifier,
    };

    // Build router
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let direct_limit = state.config.upload.max_direct_bytes as usize + FORM_OVERHEAD;
    let part_limit = state.config.upload.chunk_size as usize + FORM_OVERHEAD;

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/mail/code", post(handlers::auth::send_code))
        .route("/mail/code/verify", post(handlers::auth::verify_code))
        .route("/shares/:id", get(handlers::share::get_public_share))
        .route("/storage/webhook", post(handlers::storage::payment_webhook))
        .route("/objects/*key", get(handlers::object::get_object));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        // Auth
        .route("/auth/logout", post(handlers::auth::logout))
        // Uploads
        .route(
            "/files/upload",
            post(handlers::upload::upload_file).layer(DefaultBodyLimit::max(direct_limit)),
        )
        .route("/files/upload/prepare", post(handlers::upload::prepare_upload))
        .route(
            "/files/upload/part",
            post(handlers::upload::upload_part).layer(DefaultBodyLimit::max(part_limit)),
        )
        .route("/files/upload/complete", post(handlers::upload::complete_upload))
        .route("/files/upload/abort", post(handlers::upload::abort_upload))
        // File tree
        .route("/files", get(handlers::file::list_files))
        .route("/files/search", get(handlers::file::search_files))
        .route("/files/attach", post(handlers::file::attach_file))
        .route("/folders", post(handlers::file::create_folder))
        .route(
            "/files/:id",
            get(handlers::file::get_file)
                .patch(handlers::file::rename_file)
                .delete(handlers::file::delete_file),
        )
        .route("/files/:id/parent", put(handlers::file::move_file))
        .route("/files/:id/download", get(handlers::file::download_file))
        .route("/files/:id/url", get(handlers::file::download_url))
        // Quota and purchases
        .route("/quota", get(handlers::storage::get_quota))
        .route("/storage/purchase", post(handlers::storage::create_purchase))
        .route("/storage/purchase/sync", post(handlers::storage::sync_purchase))
        .route("/storage/orders", get(handlers::storage::list_orders))
        // Shares
        .route("/shares", post(handlers::share::create_share))
        .route("/shares/:id/save", post(handlers::share::save_share))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    // Combine all routes under /api/v1
    Router::new()
        .nest("/api/v1", public_routes.merge(protected_routes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
