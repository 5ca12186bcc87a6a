//! The HTTP registration/ack surface (spec §6.1). Out of the CORE's scope per spec §1 — "a thin
//! validation layer over the persistent store" — but implemented here so the service is
//! actually runnable: it only validates input and forwards to [`crate::store::Store`] and
//! [`crate::commitment`].

use crate::commitment::{self, CommitmentError};
use crate::networks::NetworkId;
use crate::store::{Store, StoreError, VaultRegistration};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bitcoin::Txid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct AppState {
    stores: Arc<HashMap<NetworkId, Mutex<Store>>>,
    db_folder: PathBuf,
    with_commitments: bool,
}

impl AppState {
    pub fn new(
        stores: HashMap<NetworkId, Mutex<Store>>,
        db_folder: PathBuf,
        with_commitments: bool,
    ) -> Self {
        AppState {
            stores: Arc::new(stores),
            db_folder,
            with_commitments,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug)]
enum ApiError {
    Validation(String),
    Unauthorized(String),
    CommitmentReused(String),
    AuthorizationUnavailable,
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Validation(m) => (StatusCode::BAD_REQUEST, "validation_error", Some(m)),
            ApiError::Unauthorized(m) => (StatusCode::FORBIDDEN, "unauthorized", Some(m)),
            ApiError::CommitmentReused(m) => {
                (StatusCode::FORBIDDEN, "commitment_reused", Some(m))
            }
            ApiError::AuthorizationUnavailable => (
                StatusCode::FORBIDDEN,
                "authorization_unavailable",
                Some("the authorized-addresses database is unavailable".to_string()),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", None),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", Some(m)),
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CommitmentReused(txid) => {
                ApiError::CommitmentReused(format!("commitment '{}' already bound", txid))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CommitmentError> for ApiError {
    fn from(e: CommitmentError) -> Self {
        match e {
            CommitmentError::Malformed(m) => ApiError::Validation(m),
            CommitmentError::Reused(txid) => {
                ApiError::CommitmentReused(format!("commitment '{}' already bound", txid))
            }
            CommitmentError::AuthorizationUnavailable => ApiError::AuthorizationUnavailable,
            CommitmentError::Unauthorized(txid) => {
                ApiError::Unauthorized(format!("commitment '{}' is not authorized", txid))
            }
            CommitmentError::Store(e) => e.into(),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct VaultPayload {
    vault_id: String,
    vault_number: i64,
    trigger_tx_ids: Vec<String>,
    commitment: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    push_token: String,
    wallet_id: String,
    wallet_name: String,
    watchtower_id: String,
    locale: Option<String>,
    vaults: Vec<VaultPayload>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckRequest {
    push_token: String,
    vault_id: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationsRequest {
    push_token: String,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationView {
    vault_id: String,
    wallet_id: String,
    wallet_name: String,
    vault_number: i64,
    watchtower_id: String,
    attempt_count: i64,
    first_attempt_at: Option<i64>,
    last_attempt_at: Option<i64>,
}

fn parse_network(raw: Option<&str>) -> Result<NetworkId, ApiError> {
    match raw {
        None => Ok(NetworkId::Bitcoin),
        Some(s) => s
            .parse()
            .map_err(|_| ApiError::Validation(format!("unknown network id '{}'", s))),
    }
}

fn lock_store<'a>(
    state: &'a AppState,
    network: NetworkId,
) -> Result<std::sync::MutexGuard<'a, Store>, ApiError> {
    state
        .stores
        .get(&network)
        .ok_or_else(|| ApiError::Validation(format!("network '{}' is not enabled", network)))?
        .lock()
        .map_err(|_| ApiError::Internal("store lock poisoned".to_string()))
}

async fn handle_register(
    state: AppState,
    network: NetworkId,
    req: RegisterRequest,
) -> Result<StatusCode, ApiError> {
    if req.push_token.is_empty() {
        return Err(ApiError::Validation("pushToken must not be empty".into()));
    }
    if req.vaults.is_empty() {
        return Err(ApiError::Validation("vaults must not be empty".into()));
    }

    for vault in &req.vaults {
        if vault.vault_id.is_empty() {
            return Err(ApiError::Validation("vaultId must not be empty".into()));
        }
        if vault.vault_number < 0 {
            return Err(ApiError::Validation("vaultNumber must be >= 0".into()));
        }
        if vault.trigger_tx_ids.is_empty() {
            return Err(ApiError::Validation(
                "triggerTxIds must contain at least one txid".into(),
            ));
        }
        let trigger_txids: Vec<Txid> = vault
            .trigger_tx_ids
            .iter()
            .map(|s| {
                Txid::from_str(s)
                    .map_err(|_| ApiError::Validation(format!("'{}' is not a valid txid", s)))
            })
            .collect::<Result<_, _>>()?;

        if state.with_commitments && vault.commitment.is_none() {
            return Err(ApiError::Validation(
                "commitment is required when --with-commitments is enabled".into(),
            ));
        }

        let mut store = lock_store(&state, network)?;

        let commitment_txid = match &vault.commitment {
            Some(hex) if state.with_commitments => Some(commitment::authorize(
                hex,
                network,
                &state.db_folder,
                &vault.vault_id,
                &store,
            )?),
            _ => None,
        };

        if store.vault_already_spent_and_notified(&vault.vault_id)? {
            log::warn!(
                "vault '{}' was already spent and notified; registering it again cannot undo \
                 that state transition",
                vault.vault_id
            );
        }

        let registration = VaultRegistration {
            push_token: req.push_token.clone(),
            wallet_id: req.wallet_id.clone(),
            wallet_name: req.wallet_name.clone(),
            watchtower_id: req.watchtower_id.clone(),
            locale: req.locale.clone(),
            vault_id: vault.vault_id.clone(),
            vault_number: vault.vault_number,
            trigger_txids,
            commitment_txid,
        };

        store.register_vault(&registration)?;
    }

    Ok(StatusCode::OK)
}

async fn register_default(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<StatusCode, ApiError> {
    handle_register(state, NetworkId::Bitcoin, req).await
}

async fn register_with_network(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
    Json(req): Json<RegisterRequest>,
) -> Result<StatusCode, ApiError> {
    let network = parse_network(Some(&network_id))?;
    handle_register(state, network, req).await
}

async fn handle_ack(
    state: AppState,
    network: NetworkId,
    req: AckRequest,
) -> Result<StatusCode, ApiError> {
    if req.push_token.is_empty() || req.vault_id.is_empty() {
        return Err(ApiError::Validation(
            "pushToken and vaultId are required".into(),
        ));
    }
    let store = lock_store(&state, network)?;
    if store.set_acknowledged(&req.push_token, &req.vault_id)? {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound)
    }
}

async fn ack_default(
    State(state): State<AppState>,
    Json(req): Json<AckRequest>,
) -> Result<StatusCode, ApiError> {
    handle_ack(state, NetworkId::Bitcoin, req).await
}

async fn ack_with_network(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
    Json(req): Json<AckRequest>,
) -> Result<StatusCode, ApiError> {
    let network = parse_network(Some(&network_id))?;
    handle_ack(state, network, req).await
}

fn view_of(reg: crate::store::NotificationRegistration) -> NotificationView {
    NotificationView {
        vault_id: reg.vault_id,
        wallet_id: reg.wallet_id,
        wallet_name: reg.wallet_name,
        vault_number: reg.vault_number,
        watchtower_id: reg.watchtower_id,
        attempt_count: reg.attempt_count,
        first_attempt_at: reg.first_attempt_at,
        last_attempt_at: reg.last_attempt_at,
    }
}

async fn handle_notifications(
    state: AppState,
    network: NetworkId,
    req: NotificationsRequest,
) -> Result<Json<Vec<NotificationView>>, ApiError> {
    let store = lock_store(&state, network)?;
    let notifications = store.notifications_for_token(&req.push_token)?;
    Ok(Json(notifications.into_iter().map(view_of).collect()))
}

async fn notifications_default(
    State(state): State<AppState>,
    Json(req): Json<NotificationsRequest>,
) -> Result<Json<Vec<NotificationView>>, ApiError> {
    handle_notifications(state, NetworkId::Bitcoin, req).await
}

async fn notifications_with_network(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
    Json(req): Json<NotificationsRequest>,
) -> Result<Json<Vec<NotificationView>>, ApiError> {
    let network = parse_network(Some(&network_id))?;
    handle_notifications(state, network, req).await
}

async fn generate_204() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/watchtower/register", post(register_default))
        .route("/:network_id/watchtower/register", post(register_with_network))
        .route("/watchtower/ack", post(ack_default))
        .route("/:network_id/watchtower/ack", post(ack_with_network))
        .route("/watchtower/notifications", post(notifications_default))
        .route(
            "/:network_id/watchtower/notifications",
            post(notifications_with_network),
        )
        .route("/generate_204", get(generate_204))
        .with_state(state)
}
