mod config;
mod maintenance;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use krishi_api::blobs::{BlobStore, LocalBlobStore};
use krishi_api::otp::{LogOtpSender, OtpSender, WebhookOtpSender};
use krishi_api::{AppState, AppStateInner, AuthSettings};
use krishi_db::Database;
use krishi_gateway::{Gateway, HandshakeError, connection};
use krishi_types::api::ApiResponse;
use krishi_types::auth::TokenSigner;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "krishi=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    let signer = TokenSigner::new(
        config.jwt_secret.clone(),
        config.jwt_refresh_secret.clone(),
        chrono::Duration::seconds(config.access_token_ttl_secs),
        chrono::Duration::seconds(config.refresh_token_ttl_secs),
    );
    let gateway = Gateway::new(db.clone(), signer.clone());

    let otp: Arc<dyn OtpSender> = match &config.sms_webhook_url {
        Some(url) => {
            info!("OTPs are delivered via SMS webhook");
            Arc::new(WebhookOtpSender::new(url.clone())?)
        }
        None => {
            warn!("KRISHI_SMS_WEBHOOK_URL is unset; OTPs will only be logged");
            Arc::new(LogOtpSender)
        }
    };
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(
        config.upload_dir.clone(),
        config.public_upload_url.clone(),
    ));

    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        gateway: gateway.clone(),
        signer,
        auth: AuthSettings {
            otp_ttl: chrono::Duration::seconds(config.otp_ttl_secs),
            otp_max_attempts: config.otp_max_attempts,
            pending_registration_ttl: chrono::Duration::seconds(config.pending_registration_ttl_secs),
        },
        otp,
        blobs,
    });

    // Background counter reconciliation and expiry sweep
    tokio::spawn(maintenance::run_maintenance_loop(
        db.clone(),
        config.maintenance_interval_secs,
    ));

    let realtime = Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(gateway);

    let app = krishi_api::router(state)
        .merge(realtime)
        .nest_service("/uploads", ServeDir::new(&config.upload_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Krishi server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

#[derive(Deserialize)]
struct HandshakeQuery {
    token: Option<String>,
}

/// Authenticate the handshake before upgrading. The token comes from
/// `?token=` or, failing that, an `Authorization: Bearer` header.
async fn ws_upgrade(
    State(gateway): State<Gateway>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let token = query.token.as_deref().or(bearer);

    match gateway.authenticate(token).await {
        Ok(user_id) => ws.on_upgrade(move |socket| connection::handle_connection(socket, gateway, user_id)),
        Err(e) => {
            warn!("Gateway handshake rejected: {}", e);
            let (status, message) = match e {
                HandshakeError::Disabled => (StatusCode::FORBIDDEN, e.to_string()),
                HandshakeError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into()),
                _ => (StatusCode::UNAUTHORIZED, e.to_string()),
            };
            let body = ApiResponse::failure(status.as_u16(), message, Vec::new());
            (status, Json(body)).into_response()
        }
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
}

async fn health(State(gateway): State<Gateway>) -> Json<ApiResponse<Health>> {
    let health = Health {
        status: "ok",
        connections: gateway.rooms().connection_count().await,
    };
    Json(ApiResponse::new(200, health, "OK"))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
