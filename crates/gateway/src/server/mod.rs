//! Authenticated REST surface over the orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::chain::SharedChain;
use crate::invoke::Orchestrator;

use errors::ApiError;

pub(crate) mod errors;
mod handlers;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub chain: SharedChain,
    pub auth_token: String,
    /// Asset attached to data-purchase orders.
    pub transfer_asset: String,
}

/// Builds the full route table. Every route sits behind the bearer-token
/// gate.
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/identity/tx/:tx_hash", get(handlers::find_transaction))
        .route(
            "/identity/records",
            get(handlers::list_records).post(handlers::create_record),
        )
        .route("/identity/records/count", get(handlers::record_count))
        .route(
            "/identity/records/:usr_adr",
            get(handlers::get_record).delete(handlers::delete_record),
        )
        .route("/identity/users", get(handlers::list_users))
        .route("/identity/orders", post(handlers::create_order))
        .route("/identity/orders/:order_id", get(handlers::get_order))
        .route("/identity/gas/claim", post(handlers::claim_gas))
        .route("/identity/status", get(handlers::status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer_token,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_bearer_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(header_value) = request.headers().get(header::AUTHORIZATION) else {
        return ApiError::Unauthorized {
            reason: "missing Authorization header",
        }
        .into_response();
    };
    let expected = format!("Bearer {}", state.auth_token);
    let presented = header_value.to_str().unwrap_or_default();
    if presented != expected {
        return ApiError::Unauthorized {
            reason: "wrong auth token",
        }
        .into_response();
    }
    next.run(request).await
}

pub async fn serve(socket: SocketAddr, router: Router) -> anyhow::Result<()> {
    tracing::info!(%socket, "identity gateway listening");
    let listener = tokio::net::TcpListener::bind(socket).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::chain::StackValue;
    use crate::invoke::{
        ConfirmationTracker, NotificationRelay, RelayPolicy, WalletSession,
    };
    use crate::test_utils::{MockChain, MockWalletProvider};

    const TOKEN: &str = "test-token";

    fn test_router(chain: MockChain) -> Router {
        let provider = MockWalletProvider::new();
        provider.set_height(100);
        chain.set_height(100);

        let session = Arc::new(WalletSession::new(
            Arc::new(provider),
            PathBuf::from("/tmp/wallet.db3"),
            "pwd".into(),
            "NEOGas".into(),
        ));
        let tracker = Arc::new(ConfirmationTracker::with_limits(
            Duration::from_secs(5),
            Duration::from_secs(120),
            64,
        ));
        let (relay, _directives) = NotificationRelay::channel(RelayPolicy::CommittedOnly, "neo");
        let shared: SharedChain = Arc::new(chain);
        let orchestrator = Arc::new(Orchestrator::new(
            shared.clone(),
            session,
            tracker,
            relay,
            "d63a0b437a16579288361ccb593570e5c5f71149".parse().unwrap(),
        ));
        router(AppState {
            orchestrator,
            chain: shared,
            auth_token: TOKEN.into(),
            transfer_asset: "neo".into(),
        })
    }

    fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
        request.header("Authorization", format!("Bearer {TOKEN}"))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_token_is_rejected_with_auth_code() {
        let app = test_router(MockChain::new());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/identity/users")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["errorCode"], 1);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let app = test_router(MockChain::new());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/identity/users")
                    .header("Authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn get_record_returns_the_envelope() {
        let chain = MockChain::new();
        chain.set_stack(vec![StackValue::Bytes(b"record-data".to_vec())]);
        let app = test_router(chain);

        let response = app
            .oneshot(
                authed(Request::builder().uri("/identity/records/ABC"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"], "record-data");
        assert!(body["tx_unconfirmed"].as_array().unwrap().is_empty());
        assert!(body.get("tx_hash").is_none());
    }

    #[tokio::test]
    async fn create_record_commits_and_reports_the_hash() {
        let chain = MockChain::new();
        chain.set_stack(vec![StackValue::Integer(1)]);
        let app = test_router(chain.clone());

        let payload = serde_json::json!({
            "usr_adr": "ABC",
            "data_store_adr": "store-1",
            "doc_pub": "pub-key",
            "doc_key": "enc-key",
        });
        let response = app
            .oneshot(
                authed(Request::builder().method("POST").uri("/identity/records"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let tx_hash = body["tx_hash"].as_str().unwrap().to_owned();
        assert_eq!(chain.submitted(), vec![tx_hash]);
    }

    #[tokio::test]
    async fn malformed_json_maps_to_bad_request_code() {
        let app = test_router(MockChain::new());
        let response = app
            .oneshot(
                authed(Request::builder().method("POST").uri("/identity/records"))
                    .header("Content-Type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["errorCode"], 2);
    }

    #[tokio::test]
    async fn contract_rejection_maps_to_bad_request() {
        let chain = MockChain::new();
        chain.set_stack(vec![StackValue::Bytes(vec![0])]);
        let app = test_router(chain);

        let response = app
            .oneshot(
                authed(Request::builder().uri("/identity/records/ABC"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["errorCode"], 3);
    }

    #[tokio::test]
    async fn invalid_claim_address_is_a_bad_request() {
        let app = test_router(MockChain::new());
        let response = app
            .oneshot(
                authed(Request::builder().method("POST").uri("/identity/gas/claim"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"address": "not-an-address"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["errorCode"], 2);
    }

    #[tokio::test]
    async fn status_reports_heights_and_tracker() {
        let chain = MockChain::new();
        let app = test_router(chain.clone());
        // after test_router's own height setup
        chain.set_height(123);

        let response = app
            .oneshot(
                authed(Request::builder().uri("/identity/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["height"], 123);
        assert!(body["tx_unconfirmed"].as_array().unwrap().is_empty());
    }
}
