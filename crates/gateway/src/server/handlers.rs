//! Request handlers: thin glue translating HTTP payloads into orchestrator
//! calls and invocation results into JSON envelopes.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::chain::Address;
use crate::invoke::{
    AttachedAsset, InvocationRequest, InvocationResult, InvokeArg, InvokeOptions,
};

use super::errors::ApiError;
use super::AppState;

/// The envelope every invocation-backed route responds with.
fn envelope(result: InvocationResult) -> serde_json::Value {
    let returned = match result.returned.as_slice() {
        [single] => single.to_json(),
        many => serde_json::Value::Array(many.iter().map(|v| v.to_json()).collect()),
    };
    let mut body = serde_json::json!({
        "result": returned,
        "tx_unconfirmed": result.unconfirmed,
        "tx_failed": result.failed,
    });
    if let Some(tx_hash) = result.committed_tx {
        body["tx_hash"] = serde_json::Value::String(tx_hash);
    }
    body
}

/// Unwraps a JSON body, mapping extractor rejections onto the stable
/// bad-request error code.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::BadRequest {
            error_cause: rejection.body_text(),
        }),
    }
}

pub(super) async fn find_transaction(
    State(state): State<Arc<AppState>>,
    Path(tx_hash): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let height = state.orchestrator.find_transaction(&tx_hash).await?;
    Ok(Json(serde_json::json!({ "result": height })))
}

pub(super) async fn list_records(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    read(&state, "getRecordList", vec![]).await
}

pub(super) async fn record_count(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    read(&state, "getRecordCount", vec![]).await
}

pub(super) async fn get_record(
    State(state): State<Arc<AppState>>,
    Path(usr_adr): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    read(&state, "getRecord", vec![InvokeArg::String(usr_adr)]).await
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateRecordRequest {
    usr_adr: String,
    data_store_adr: String,
    doc_pub: String,
    doc_key: String,
}

pub(super) async fn create_record(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateRecordRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = json_body(body)?;
    let result = state
        .orchestrator
        .invoke_single(
            InvocationRequest::new(
                "createRecord",
                vec![
                    InvokeArg::String(record.usr_adr),
                    InvokeArg::String(record.data_store_adr),
                    InvokeArg::String(record.doc_pub),
                    InvokeArg::String(record.doc_key),
                ],
            ),
            InvokeOptions::committing(),
        )
        .await?;
    Ok(Json(envelope(result)))
}

pub(super) async fn delete_record(
    State(state): State<Arc<AppState>>,
    Path(usr_adr): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state
        .orchestrator
        .invoke_single(
            InvocationRequest::new("deleteRecord", vec![InvokeArg::String(usr_adr)]),
            InvokeOptions::committing(),
        )
        .await?;
    Ok(Json(envelope(result)))
}

pub(super) async fn list_users(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    read(&state, "getUserList", vec![]).await
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateOrderRequest {
    order_id: String,
    /// Fixed-8 units of the transfer asset attached as payment.
    price: u64,
}

pub(super) async fn create_order(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let order = json_body(body)?;
    let attach = (order.price > 0).then(|| AttachedAsset {
        asset: state.transfer_asset.clone(),
        amount: order.price,
    });
    let result = state
        .orchestrator
        .invoke_single(
            InvocationRequest::new("createOrder", vec![InvokeArg::String(order.order_id)]),
            InvokeOptions {
                commit: true,
                attach,
            },
        )
        .await?;
    Ok(Json(envelope(result)))
}

pub(super) async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    read(&state, "getOrder", vec![InvokeArg::String(order_id)]).await
}

#[derive(Debug, Deserialize)]
pub(super) struct ClaimGasRequest {
    address: String,
}

pub(super) async fn claim_gas(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ClaimGasRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claim = json_body(body)?;
    let to: Address = claim.address.parse().map_err(|_| ApiError::BadRequest {
        error_cause: format!("invalid address: {}", claim.address),
    })?;
    let tx_hash = state.orchestrator.claim_gas(&to).await?;
    Ok(Json(serde_json::json!({ "result": tx_hash })))
}

pub(super) async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let height = state.chain.height().await.map_err(crate::invoke::InvokeError::from)?;
    let header_height = state
        .chain
        .header_height()
        .await
        .map_err(crate::invoke::InvokeError::from)?;
    let snapshot = state.orchestrator.tracker().snapshot();
    Ok(Json(serde_json::json!({
        "height": height,
        "header_height": header_height,
        "tx_unconfirmed": snapshot.pending,
        "tx_failed": snapshot.failed,
    })))
}

async fn read(
    state: &AppState,
    method: &str,
    args: Vec<InvokeArg>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state
        .orchestrator
        .invoke_single(
            InvocationRequest::new(method, args),
            InvokeOptions::read_only(),
        )
        .await?;
    Ok(Json(envelope(result)))
}
