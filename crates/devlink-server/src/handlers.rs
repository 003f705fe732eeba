//! HTTP handlers for devlink.
//!
//! Each device endpoint authorizes first and upgrades second, so a request
//! that is not allowed in never gets a connection.

use crate::auth::{DeviceBindings, StaticBindings};
use crate::config::Config;
use crate::error::RelayError;
use crate::session::{self, SessionContext};
use anyhow::Result;
use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use devlink_core::{AccountId, ChannelKey, MainDeviceId, RegistryConfig, RoomRegistry, SubDeviceId};
use devlink_transport::WebSocketConnection;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Route of the main device endpoint.
pub const MAIN_DEVICE_PATH: &str = "/api/v1/communication/main";

/// Route of the sub device endpoint.
pub const SUB_DEVICE_PATH: &str = "/api/v1/communication/sub";

/// Shared server state.
pub struct AppState {
    /// The room registry.
    pub registry: Arc<RoomRegistry>,
    /// Device binding lookups.
    pub bindings: Arc<dyn DeviceBindings>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state backed by the bindings listed in `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let bindings = Arc::new(StaticBindings::from_config(&config.bindings));
        Self::with_bindings(config, bindings)
    }

    /// Create app state with a custom binding store.
    #[must_use]
    pub fn with_bindings(config: Config, bindings: Arc<dyn DeviceBindings>) -> Self {
        let registry_config = RegistryConfig {
            max_rooms: config.limits.max_rooms,
            max_sub_devices: config.limits.max_sub_devices,
        };

        Self {
            registry: Arc::new(RoomRegistry::with_config(registry_config)),
            bindings,
            config,
        }
    }

    /// Context handed to each session.
    #[must_use]
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: Arc::clone(&self.registry),
            outbound_buffer: self.config.limits.outbound_buffer,
            main_idle_timeout: self.config.session.main_idle_timeout(),
        }
    }
}

/// Query of the main device endpoint.
#[derive(Debug, Deserialize)]
pub struct MainDeviceQuery {
    /// Main device ID.
    pub main_device_id: u64,
}

/// Query of the sub device endpoint.
#[derive(Debug, Deserialize)]
pub struct SubDeviceQuery {
    /// Main device whose room to join.
    pub main_device_id: u64,
    /// Sub device ID.
    pub sub_device_id: u64,
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(MAIN_DEVICE_PATH, get(main_device_handler))
        .route(SUB_DEVICE_PATH, get(sub_device_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    let state = Arc::new(AppState::new(config));

    info!("devlink server listening on {}", addr);
    info!("Main device endpoint: ws://{}{}", addr, MAIN_DEVICE_PATH);
    info!("Sub device endpoint: ws://{}{}", addr, SUB_DEVICE_PATH);

    serve(listener, state).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops on an I/O failure.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": stats.room_count,
        "sub_devices": stats.sub_count,
    }))
}

/// Read the authenticated account from the configured header.
fn account_from_headers(headers: &HeaderMap, header: &str) -> Result<AccountId, RelayError> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(AccountId)
        .ok_or(RelayError::NotLoggedIn)
}

/// Main device endpoint.
async fn main_device_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Result<Query<MainDeviceQuery>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, RelayError> {
    let account = account_from_headers(&headers, &state.config.session.account_header)?;
    let Query(query) = query.map_err(|e| RelayError::BadRequest(e.body_text()))?;
    let key = ChannelKey::new(account, MainDeviceId(query.main_device_id));

    // Authorizing
    let bound = state
        .bindings
        .is_main_device_bound(key.account, key.main_device)
        .await
        .map_err(RelayError::Unavailable)?;
    if !bound {
        debug!(room = %key, "Main device not bound");
        return Err(RelayError::NotBound);
    }

    // Upgrading
    let ws = ws.map_err(|e| RelayError::UpgradeFailed(e.body_text()))?;
    let max_message_size = state.config.limits.max_message_size;
    let ctx = state.session_context();

    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = WebSocketConnection::new(socket, max_message_size).with_remote_addr(remote);
            session::run_main_session(conn, key, &ctx).await;
        }))
}

/// Sub device endpoint.
async fn sub_device_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Result<Query<SubDeviceQuery>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, RelayError> {
    let account = account_from_headers(&headers, &state.config.session.account_header)?;
    let Query(query) = query.map_err(|e| RelayError::BadRequest(e.body_text()))?;
    let key = ChannelKey::new(account, MainDeviceId(query.main_device_id));
    let sub = SubDeviceId(query.sub_device_id);

    // Authorizing
    let bound = state
        .bindings
        .is_sub_device_bound(key.account, key.main_device, sub)
        .await
        .map_err(RelayError::Unavailable)?;
    if !bound {
        debug!(room = %key, sub_device = %sub, "Sub device not bound");
        return Err(RelayError::NotBound);
    }

    // Upgrading
    let ws = ws.map_err(|e| RelayError::UpgradeFailed(e.body_text()))?;
    let max_message_size = state.config.limits.max_message_size;
    let ctx = state.session_context();

    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = WebSocketConnection::new(socket, max_message_size).with_remote_addr(remote);
            session::run_sub_session(conn, key, sub, &ctx).await;
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_account_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            account_from_headers(&headers, "x-account-id"),
            Err(RelayError::NotLoggedIn)
        ));

        headers.insert("x-account-id", HeaderValue::from_static("abc"));
        assert!(account_from_headers(&headers, "x-account-id").is_err());

        headers.insert("x-account-id", HeaderValue::from_static(" 7 "));
        assert_eq!(
            account_from_headers(&headers, "x-account-id").unwrap(),
            AccountId(7)
        );
    }

    #[test]
    fn test_session_context_from_config() {
        let mut config = Config::default();
        config.limits.outbound_buffer = 8;
        config.session.main_idle_timeout_secs = 5;
        let state = AppState::new(config);

        let ctx = state.session_context();
        assert_eq!(ctx.outbound_buffer, 8);
        assert_eq!(ctx.main_idle_timeout, std::time::Duration::from_secs(5));
        assert_eq!(ctx.registry.config().max_sub_devices, 1);
    }
}
