mod amount;
mod commitment;
mod config;
mod conversation;
mod crypto;
mod error;
mod fund;
mod ledger;
mod nl_mapper;
mod notification;
mod parser;
mod payment;
mod queue;
mod retry;
mod router;
mod split;
mod store;
mod ticket;
mod wallet;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use commitment::CommitmentService;
use config::AppConfig;
use conversation::ConversationStateManager;
use crypto::CryptoService;
use fund::FundService;
use ledger::HttpLedgerAdapter;
use notification::{LoggingNotificationDispatcher, NotificationDispatcher};
use payment::PaymentService;
use queue::{PersistentQueue, Priority};
use router::Router;
use split::SplitService;
use store::{build_store, InMemoryStore};
use ticket::TicketService;
use wallet::WalletService;

type Services = Router<InMemoryStore, HttpLedgerAdapter>;

struct AppState {
    router: Services,
    queue: Arc<PersistentQueue>,
}

#[derive(Debug, Deserialize)]
struct WebhookRequest {
    from: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    reply: String,
}

#[derive(Debug, Deserialize)]
struct QueuePaymentRequest {
    sender_phone: String,
    receiver_phone: String,
    amount: Decimal,
    #[serde(default)]
    note: String,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueuePaymentResponse {
    queue_id: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "chatpay_core=info,tower_http=info".into()))
        .init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let store = build_store(&config);
    store.spawn_eviction_task();

    let crypto = Arc::new(CryptoService::new(&config.encryption_key));
    let ledger = Arc::new(HttpLedgerAdapter::new(
        config.ledger_node_url.clone(),
        config.ledger_node_token.clone(),
        Vec::new(),
    ));

    let queue = Arc::new(PersistentQueue::new());
    queue.spawn_maintenance_loop();

    let conversations = Arc::new(ConversationStateManager::new());
    conversations.spawn_sweep_loop();

    let dispatcher: Arc<dyn NotificationDispatcher> = Arc::new(LoggingNotificationDispatcher);

    let wallet = Arc::new(WalletService::new(store.clone(), ledger.clone(), crypto.clone()));
    let payment = Arc::new(PaymentService::new(store.clone(), ledger.clone(), wallet.clone()));
    queue.spawn_payment_worker(payment.clone());
    let split = Arc::new(SplitService::new(store.clone(), ledger.clone(), wallet.clone()));
    let ticket = Arc::new(TicketService::new(store.clone(), ledger.clone(), wallet.clone()));
    let fund = Arc::new(FundService::new(store.clone(), ledger.clone(), wallet.clone()));
    let commitment = Arc::new(CommitmentService::new(store.clone(), ledger.clone(), wallet.clone(), crypto.clone()));

    let router = Router::new(conversations, dispatcher, wallet, payment, split, ticket, fund, commitment);
    let state = Arc::new(AppState { router, queue });

    let cors = if config.debug {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(Vec::<HeaderValue>::new()))
            .allow_methods([Method::GET, Method::POST])
    };

    let app = AxumRouter::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/webhook", post(webhook))
        .route("/queue/payments", post(queue_payment))
        .layer(RequestBodyLimitLayer::new(100 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

    tracing::info!(%addr, environment = %config.environment, "chatpay-core listening");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|err| {
        eprintln!("failed to bind {addr}: {err}");
        std::process::exit(1);
    });

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .unwrap_or_else(|err| {
            eprintln!("server error: {err}");
            std::process::exit(1);
        });
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "chatpay-core",
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.queue.stats().await;
    Json(json!({
        "queue": {
            "high": stats.high,
            "normal": stats.normal,
            "low": stats.low,
            "delayed": stats.delayed,
            "dead_letter": stats.dead_letter,
        },
    }))
}

async fn webhook(State(state): State<Arc<AppState>>, Json(body): Json<WebhookRequest>) -> impl IntoResponse {
    if body.from.trim().is_empty() || body.text.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "from and text are required"}))).into_response();
    }
    let reply = state.router.handle(&body.from, &body.text).await;
    (StatusCode::OK, Json(WebhookResponse { reply })).into_response()
}

/// Submits a payment to the Persistent Queue's background worker instead of
/// executing it inline, for callers that want priority tiering and
/// retry/dead-letter handling rather than an immediate synchronous result.
async fn queue_payment(State(state): State<Arc<AppState>>, Json(body): Json<QueuePaymentRequest>) -> impl IntoResponse {
    if body.sender_phone.trim().is_empty() || body.receiver_phone.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "sender_phone and receiver_phone are required"}))).into_response();
    }
    let priority = match body.priority.as_deref() {
        Some("high") => Priority::High,
        Some("low") => Priority::Low,
        _ => Priority::Normal,
    };
    let queue_id = state
        .queue
        .enqueue(body.sender_phone, body.receiver_phone, body.amount, body.note, priority)
        .await;
    (StatusCode::ACCEPTED, Json(QueuePaymentResponse { queue_id })).into_response()
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let stats = state.queue.stats().await;
    tracing::info!(
        high = stats.high,
        normal = stats.normal,
        low = stats.low,
        delayed = stats.delayed,
        dead_letter = stats.dead_letter,
        "shutting down, queue state at exit"
    );
}
