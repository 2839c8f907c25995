//! HTTP surface: provisioning endpoint, admin REST API, metrics
//!
//! One axum listener serves three audiences: phones fetching
//! `/provision/{mac}.cfg` (unauthenticated by necessity), admin tooling
//! under `/api/*` (bearer tokens, HMAC-signed), and scrapers on
//! `/metrics`.

pub mod auth;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ApiConfig;
use crate::protocols::sip::{generate_call_id, generate_tag, SipMessage, SipMethod};
use crate::services::alarms::AlarmManager;
use crate::services::b2bua::{B2buaService, LocalIdentity};
use crate::services::notifications::{NotificationDispatcher, NotificationEvent};
use crate::services::provisioning::ProvisioningService;
use crate::services::qos::QosRegistry;
use crate::services::registrar::Registrar;
use crate::signaling::SipSender;
use crate::store::{verify_credential, ExtensionStore, Registration};
use crate::utils::normalize_mac;
use crate::{Error, Result};

pub use auth::{Claims, TokenService};

/// Gateway-level Prometheus gauges, refreshed on every scrape.
pub struct Metrics {
    registry: Registry,
    active_calls: IntGauge,
    active_registrations: IntGauge,
    active_alarms: IntGauge,
    free_rtp_ports: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let active_calls = IntGauge::new("pbx_active_calls", "Calls currently in progress")
            .map_err(|e| Error::internal(e.to_string()))?;
        let active_registrations =
            IntGauge::new("pbx_active_registrations", "Live SIP registrations")
                .map_err(|e| Error::internal(e.to_string()))?;
        let active_alarms = IntGauge::new("pbx_active_alarms", "Uncleared alarms")
            .map_err(|e| Error::internal(e.to_string()))?;
        let free_rtp_ports = IntGauge::new("pbx_free_rtp_ports", "Unallocated RTP port pairs")
            .map_err(|e| Error::internal(e.to_string()))?;
        registry
            .register(Box::new(active_calls.clone()))
            .map_err(|e| Error::internal(e.to_string()))?;
        registry
            .register(Box::new(active_registrations.clone()))
            .map_err(|e| Error::internal(e.to_string()))?;
        registry
            .register(Box::new(active_alarms.clone()))
            .map_err(|e| Error::internal(e.to_string()))?;
        registry
            .register(Box::new(free_rtp_ports.clone()))
            .map_err(|e| Error::internal(e.to_string()))?;
        Ok(Self {
            registry,
            active_calls,
            active_registrations,
            active_alarms,
            free_rtp_ports,
        })
    }
}

pub struct ApiState {
    pub registrar: Arc<Registrar>,
    pub provisioning: Arc<ProvisioningService>,
    pub qos: Arc<QosRegistry>,
    pub b2bua: Arc<B2buaService>,
    pub alarms: Arc<AlarmManager>,
    pub extensions: Arc<dyn ExtensionStore>,
    pub notifier: Arc<dyn NotificationDispatcher>,
    pub tokens: TokenService,
    pub sip: SipSender,
    pub identity: LocalIdentity,
    pub metrics: Metrics,
    pub allocator: Arc<crate::services::media_relay::RtpPortAllocator>,
}

/// API error → JSON body with the right status; never a stack trace.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn internal(e: impl std::fmt::Display) -> ApiError {
    warn!("API internal error: {}", e);
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

fn not_found(what: &str) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("{} not found", what))
}

impl ApiState {
    fn authorize(&self, headers: &HeaderMap) -> ApiResult<Claims> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError(
                StatusCode::UNAUTHORIZED,
                "missing bearer token".to_string(),
            ))?;
        self.tokens
            .verify(token)
            .map_err(|e| ApiError(StatusCode::UNAUTHORIZED, e.to_string()))
    }

    fn authorize_admin(&self, headers: &HeaderMap) -> ApiResult<Claims> {
        let claims = self.authorize(headers)?;
        if !claims.is_admin {
            return Err(ApiError(
                StatusCode::FORBIDDEN,
                "admin required".to_string(),
            ));
        }
        Ok(claims)
    }
}

pub fn router(state: Arc<ApiState>, config: &ApiConfig) -> Router {
    let mut router = Router::new()
        .route("/provision/:filename", get(provision_config))
        .route("/api/login", post(login))
        .route("/api/registered-phones", get(registered_phones))
        .route("/api/registered-phones/with-mac", get(registered_phones_with_mac))
        .route("/api/phone-lookup/:key", get(phone_lookup))
        .route(
            "/api/provisioning/devices",
            get(list_devices).post(create_device),
        )
        .route(
            "/api/provisioning/devices/:mac",
            get(get_device).delete(delete_device),
        )
        .route("/api/qos/metrics", get(qos_metrics))
        .route("/api/qos/call/:id", get(qos_call))
        .route("/api/qos/history", get(qos_history))
        .route("/api/qos/alerts", get(qos_alerts))
        .route("/api/calls", get(active_calls))
        .route("/api/calls/:id/hangup", post(hangup_call))
        .route("/api/phones/:extension/reboot", post(reboot_phone))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if config.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<ApiState>, config: ApiConfig) -> Result<()> {
    let addr = SocketAddr::new(config.bind_address, config.port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::network(format!("Failed to bind API listener {}: {}", addr, e)))?;
    info!("HTTP API listening on http://{}", addr);
    let app = router(state, &config);
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::network(format!("API server failed: {}", e)))
}

// ---------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------

async fn provision_config(
    State(state): State<Arc<ApiState>>,
    Path(filename): Path<String>,
) -> Response {
    let Some(mac) = filename.strip_suffix(".cfg") else {
        return ApiError(StatusCode::BAD_REQUEST, "expected {mac}.cfg".to_string())
            .into_response();
    };
    match state.provisioning.render(mac).await {
        Ok(rendered) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, rendered.content_type)],
            rendered.body,
        )
            .into_response(),
        Err(e) => {
            warn!("Provisioning request for {} failed: {}", mac, e);
            not_found("device").into_response()
        }
    }
}

// ---------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginRequest {
    extension: String,
    password: String,
}

async fn login(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let rejected = || ApiError(StatusCode::UNAUTHORIZED, "invalid credentials".to_string());

    let extension = state
        .extensions
        .lookup(&request.extension)
        .await
        .map_err(internal)?
        .ok_or_else(rejected)?;

    if extension.credential_hash.is_empty()
        || !verify_credential(&request.password, &extension.credential_hash).map_err(internal)?
    {
        return Err(rejected());
    }

    let is_admin = extension.is_admin();
    let token = state
        .tokens
        .issue(&extension.id, is_admin)
        .map_err(internal)?;
    Ok(Json(json!({
        "token": token,
        "extension": extension.id,
        "is_admin": is_admin,
    })))
}

// ---------------------------------------------------------------------
// Registered phones and correlation
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RegisteredPhone {
    extension: String,
    contact: String,
    ip: String,
    port: u16,
    transport: String,
    mac: Option<String>,
    user_agent: Option<String>,
    first_seen: chrono::DateTime<Utc>,
    last_seen: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
}

impl From<Registration> for RegisteredPhone {
    fn from(r: Registration) -> Self {
        Self {
            extension: r.extension,
            contact: r.contact_uri,
            ip: r.contact_host,
            port: r.contact_port,
            transport: r.transport,
            mac: r.mac,
            user_agent: r.user_agent,
            first_seen: r.first_registered,
            last_seen: r.last_registered,
            expires_at: r.expires_at,
        }
    }
}

async fn registered_phones(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<RegisteredPhone>>> {
    state.authorize(&headers)?;
    let phones: Vec<RegisteredPhone> = state
        .registrar
        .all_active()
        .into_iter()
        .map(RegisteredPhone::from)
        .collect();
    Ok(Json(phones))
}

async fn registered_phones_with_mac(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    state.authorize(&headers)?;
    let devices = state.provisioning.list_devices().await.map_err(internal)?;

    let rows = state
        .registrar
        .all_active()
        .into_iter()
        .map(|registration| {
            // A MAC learned from SIP wins; the provisioning record fills
            // the gap for phones that do not advertise one.
            let provisioned = devices
                .iter()
                .find(|d| d.extension == registration.extension);
            let (mac, mac_source) = match (&registration.mac, provisioned) {
                (Some(mac), _) => (Some(mac.clone()), Some("sip_registration")),
                (None, Some(device)) => (Some(device.mac.clone()), Some("provisioning")),
                (None, None) => (None, None),
            };
            json!({
                "phone": RegisteredPhone::from(registration),
                "mac": mac,
                "mac_source": mac_source,
            })
        })
        .collect();
    Ok(Json(rows))
}

async fn phone_lookup(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.authorize(&headers)?;

    let registrations = state.registrar.all_active();
    let devices = state.provisioning.list_devices().await.map_err(internal)?;

    // The key is either a MAC (any separator style) or an IP address.
    let normalized_mac = normalize_mac(&key);
    let registration = registrations.iter().find(|r| {
        normalized_mac
            .as_ref()
            .map(|mac| r.mac.as_ref() == Some(mac))
            .unwrap_or(false)
            || r.contact_host == key
    });
    let device = devices.iter().find(|d| {
        normalized_mac
            .as_ref()
            .map(|mac| &d.mac == mac)
            .unwrap_or(false)
            || registration.map(|r| r.extension == d.extension).unwrap_or(false)
    });

    let correlation = match (registration, device) {
        (Some(registration), Some(device)) => json!({
            "matched": true,
            "extension": registration.extension,
            "mac": device.mac,
            "ip": registration.contact_host,
        }),
        _ => json!({ "matched": false }),
    };

    if registration.is_none() && device.is_none() {
        return Err(not_found("phone"));
    }

    Ok(Json(json!({
        "registration": registration.cloned().map(RegisteredPhone::from),
        "provisioned_device": device,
        "correlation": correlation,
    })))
}

// ---------------------------------------------------------------------
// Provisioned device CRUD
// ---------------------------------------------------------------------

async fn list_devices(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    state.authorize(&headers)?;
    let devices = state.provisioning.list_devices().await.map_err(internal)?;
    Ok(Json(json!({ "devices": devices })))
}

#[derive(Debug, Deserialize)]
struct CreateDeviceRequest {
    mac: String,
    extension: String,
    vendor: String,
    model: String,
}

async fn create_device(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<CreateDeviceRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    state.authorize_admin(&headers)?;
    let device = state
        .provisioning
        .declare_device(&request.mac, &request.extension, &request.vendor, &request.model)
        .await
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok((StatusCode::CREATED, Json(json!({ "device": device }))))
}

async fn get_device(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(mac): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.authorize(&headers)?;
    let device = state
        .provisioning
        .get_device(&mac)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found("device"))?;
    Ok(Json(json!({ "device": device })))
}

async fn delete_device(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(mac): Path<String>,
) -> ApiResult<StatusCode> {
    state.authorize_admin(&headers)?;
    if state.provisioning.remove_device(&mac).await.map_err(internal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("device"))
    }
}

// ---------------------------------------------------------------------
// QoS
// ---------------------------------------------------------------------

async fn qos_metrics(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    state.authorize(&headers)?;
    Ok(Json(json!({ "calls": state.qos.all_reports() })))
}

async fn qos_call(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.authorize(&headers)?;
    let report = state.qos.report(&id).ok_or_else(|| not_found("call"))?;
    Ok(Json(json!(report)))
}

async fn qos_history(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    state.authorize(&headers)?;
    Ok(Json(json!({ "history": state.qos.history() })))
}

async fn qos_alerts(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    state.authorize(&headers)?;
    let alarms = state.alarms.active_alarms().await;
    Ok(Json(json!({
        "qos_alerts": state.qos.alerts(),
        "alarms": alarms,
    })))
}

// ---------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------

async fn active_calls(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    state.authorize(&headers)?;
    Ok(Json(json!({ "calls": state.b2bua.active_calls() })))
}

async fn hangup_call(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.authorize_admin(&headers)?;
    if state.b2bua.hangup(&id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(not_found("call"))
    }
}

/// Reboot a registered phone with a `check-sync` NOTIFY.
async fn reboot_phone(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(extension): Path<String>,
) -> ApiResult<StatusCode> {
    state.authorize_admin(&headers)?;
    let (target, transport, registration) = state
        .registrar
        .contact_addr(&extension)
        .ok_or_else(|| not_found("registration"))?;

    let mut notify = SipMessage::request(SipMethod::Notify, registration.contact_uri.clone());
    notify.add_header(
        "Via",
        format!(
            "SIP/2.0/{} {}:{};branch={}",
            transport,
            state.identity.server_ip,
            state.identity.sip_port,
            crate::protocols::sip::generate_branch()
        ),
    );
    notify.add_header("Max-Forwards", "70");
    notify.add_header(
        "From",
        format!("<{}>;tag={}", state.identity.contact(), generate_tag()),
    );
    notify.add_header("To", format!("<{}>", registration.contact_uri));
    notify.add_header("Call-ID", generate_call_id(&state.identity.domain));
    notify.add_header("CSeq", "1 NOTIFY");
    notify.add_header("Event", "check-sync");
    notify.add_header("Subscription-State", "terminated;reason=noresource");
    notify.add_header("Contact", format!("<{}>", state.identity.contact()));

    state.sip.request(notify, target, transport);
    state.notifier.fire(NotificationEvent::PhoneRebootRequested {
        extension,
        at: Utc::now(),
    });
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------
// Prometheus
// ---------------------------------------------------------------------

async fn prometheus_metrics(State(state): State<Arc<ApiState>>) -> Response {
    let metrics = &state.metrics;
    metrics
        .active_calls
        .set(state.b2bua.active_call_count() as i64);
    metrics
        .active_registrations
        .set(state.registrar.all_active().len() as i64);
    metrics
        .active_alarms
        .set(state.alarms.active_count().await as i64);
    metrics
        .free_rtp_ports
        .set(state.allocator.available() as i64);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metrics.registry.gather(), &mut buffer) {
        return internal(e).into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
