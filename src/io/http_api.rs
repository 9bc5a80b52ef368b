//! JSON HTTP API
//!
//! hyper 1 server, one task per connection. Routes map onto `AlertPipeline`
//! operations; `AlertError` maps to status codes in `error_response`:
//! - Validation / InvalidArgument -> 400 `{error, field}`
//! - NotFound -> 404
//! - DirectoryUnavailable / StoreUnavailable -> 503 with a generic message
//!   and `Retry-After`

use crate::domain::error::AlertError;
use crate::domain::event::{DetectionInput, PositionInput};
use crate::domain::types::{AlertLevel, NotificationId, SubscriberId, TimeWindow, ZoneId};
use crate::domain::zone::ZoneSpec;
use crate::io::prometheus::{format_prometheus_metrics, PROMETHEUS_CONTENT_TYPE};
use crate::services::detections::{DetectionFilter, TimeFilter};
use crate::services::ingestion::validate_point;
use crate::services::notifier::OperatorMessage;
use crate::services::pipeline::AlertPipeline;
use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, RETRY_AFTER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Inline base64 images make detection bodies large
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;
const UNAVAILABLE_MESSAGE: &str = "service temporarily unavailable, try again";
const RETRY_AFTER_SECS: &str = "5";

type HttpResponse = Response<Full<Bytes>>;

pub struct ApiState {
    pipeline: Arc<AlertPipeline>,
    site_id: String,
    version: String,
}

impl ApiState {
    pub fn new(pipeline: Arc<AlertPipeline>, site_id: &str, version: &str) -> Self {
        Self { pipeline, site_id: site_id.to_string(), version: version.to_string() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateZoneBody {
    name: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(alias = "radiusMeters")]
    radius: Option<f64>,
    alert_level: Option<String>,
    beach_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionsBody {
    #[serde(default)]
    zone_ids: Vec<ZoneId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyBody {
    #[serde(default = "default_verified")]
    is_verified: bool,
}

fn default_verified() -> bool {
    true
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("Access-Control-Allow-Origin", "*")
            .body(Full::new(Bytes::from(bytes)))
            .expect("static response should not fail"),
        Err(e) => {
            error!(error = %e, "response_serialize_failed");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::from_static(b"{\"error\":\"internal error\"}")))
                .expect("static response should not fail")
        }
    }
}

fn error_response(err: &AlertError) -> HttpResponse {
    debug!(kind = %err.kind(), error = %err, "request_failed");
    let (status, body) = match err {
        AlertError::Validation { field, .. } => {
            (StatusCode::BAD_REQUEST, ErrorBody { error: err.to_string(), field: Some(*field) })
        }
        AlertError::InvalidArgument(_) => {
            (StatusCode::BAD_REQUEST, ErrorBody { error: err.to_string(), field: None })
        }
        AlertError::NotFound(_) => {
            (StatusCode::NOT_FOUND, ErrorBody { error: err.to_string(), field: None })
        }
        AlertError::DirectoryUnavailable(_) | AlertError::StoreUnavailable(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorBody { error: UNAVAILABLE_MESSAGE.to_string(), field: None },
        ),
    };
    let mut resp = json_response(status, &body);
    if err.is_retryable() {
        resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
    }
    resp
}

fn bad_request(message: String) -> HttpResponse {
    json_response(StatusCode::BAD_REQUEST, &ErrorBody { error: message, field: None })
}

fn not_found() -> HttpResponse {
    json_response(StatusCode::NOT_FOUND, &ErrorBody { error: "not found".into(), field: None })
}

fn respond<T: Serialize>(result: Result<T, AlertError>) -> HttpResponse {
    match result {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(e) => error_response(&e),
    }
}

/// Read and parse a JSON request body
async fn read_json<B, T>(body: B) -> Result<T, HttpResponse>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: DeserializeOwned,
{
    let bytes = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "request_body_rejected");
            return Err(json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &ErrorBody { error: "request body too large or unreadable".into(), field: None },
            ));
        }
    };
    serde_json::from_slice(&bytes).map_err(|e| bad_request(format!("invalid JSON body: {}", e)))
}

fn query_params(req_query: Option<&str>) -> FxHashMap<String, String> {
    req_query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn parse_limit(params: &FxHashMap<String, String>) -> Result<usize, AlertError> {
    match params.get("limit") {
        None => Ok(DEFAULT_LIMIT),
        Some(raw) => raw
            .parse::<usize>()
            .map(|n| n.min(MAX_LIMIT))
            .map_err(|_| AlertError::validation("limit", "must be a non-negative integer")),
    }
}

fn parse_time(
    params: &FxHashMap<String, String>,
    key: &'static str,
) -> Result<Option<DateTime<Utc>>, AlertError> {
    params
        .get(key)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| AlertError::validation(key, "must be an RFC 3339 timestamp"))
        })
        .transpose()
}

fn zone_spec_from(body: CreateZoneBody) -> Result<ZoneSpec, AlertError> {
    let name = body.name.ok_or_else(|| AlertError::missing("name"))?;
    let center = validate_point(body.latitude, body.longitude)?;
    let radius = body.radius.ok_or_else(|| AlertError::missing("radius"))?;

    let mut spec = ZoneSpec::new(name, center, radius);
    if let Some(level) = body.alert_level.as_deref() {
        spec = spec.with_alert_level(level.parse::<AlertLevel>()?);
    }
    if let Some(beach_id) = body.beach_id {
        spec = spec.with_beach_id(beach_id);
    }
    if let Some(expires_at) = body.expires_at {
        spec = spec.expiring_at(expires_at);
    }
    Ok(spec)
}

/// Route one request
///
/// Generic over the body so tests can drive it without a socket.
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<ApiState>,
) -> Result<HttpResponse, Infallible>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let params = query_params(req.uri().query());
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let pipeline = &state.pipeline;

    debug!(method = %method, path = %path, "http_request");

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_response(
            StatusCode::OK,
            &json!({ "status": "OK", "service": "sharkwatch", "version": state.version }),
        ),
        (&Method::GET, ["metrics"]) => {
            let body = format_prometheus_metrics(&pipeline.metrics_summary(), &state.site_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", PROMETHEUS_CONTENT_TYPE)
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }

        // Detections
        (&Method::POST, ["api", "sharks", "report"]) => {
            match read_json::<_, DetectionInput>(req.into_body()).await {
                Ok(input) => match pipeline.report_detection(input).await {
                    Ok(receipt) => json_response(StatusCode::CREATED, &receipt),
                    Err(e) => error_response(&e),
                },
                Err(resp) => resp,
            }
        }
        (&Method::GET, ["api", "sharks", "detections"]) => {
            let filter = DetectionFilter {
                time: params.get("timeFilter").map_or(TimeFilter::default(), |t| TimeFilter::parse(t)),
                zone_name: params.get("zoneName").cloned(),
                source: params.get("source").cloned(),
                category: params.get("category").cloned(),
            };
            respond(parse_limit(&params).map(|limit| {
                let detections = pipeline.detections(&filter, limit);
                json!({
                    "detections": detections,
                    "count": detections.len(),
                    "timeFilter": filter.time.label(),
                })
            }))
        }
        (&Method::GET, ["api", "sharks", "detections", id]) => match pipeline.detection(id) {
            Some(record) => json_response(StatusCode::OK, &record),
            None => error_response(&AlertError::NotFound(format!("detection {}", id))),
        },
        (&Method::PUT, ["api", "sharks", "detections", id, "verify"]) => {
            let id = id.to_string();
            match read_json::<_, VerifyBody>(req.into_body()).await {
                Ok(body) => respond(pipeline.verify_detection(&id, body.is_verified)),
                Err(resp) => resp,
            }
        }
        (&Method::GET, ["api", "sharks", "stats"]) => {
            let time = params.get("timeFilter").map_or(TimeFilter::All, |t| TimeFilter::parse(t));
            json_response(StatusCode::OK, &pipeline.detection_stats(time))
        }

        // Geofences
        (&Method::POST, ["api", "geofences", "check-location"]) => {
            match read_json::<_, PositionInput>(req.into_body()).await {
                Ok(input) => respond(pipeline.report_position(input).await),
                Err(resp) => resp,
            }
        }
        (&Method::GET, ["api", "geofences", "device", subject, "locations"]) => {
            let subject = subject.to_string();
            respond(parse_limit(&params).map(|limit| {
                json!({
                    "deviceId": subject,
                    "locations": pipeline.location_history(&subject, limit),
                })
            }))
        }
        (&Method::GET, ["api", "geofences", "stats"]) => {
            json_response(StatusCode::OK, &pipeline.zone_stats())
        }
        (&Method::GET, ["api", "geofences"]) => json_response(StatusCode::OK, &pipeline.list_zones()),
        (&Method::POST, ["api", "geofences"]) => {
            match read_json::<_, CreateZoneBody>(req.into_body()).await {
                Ok(body) => match zone_spec_from(body).and_then(|spec| pipeline.create_zone(spec)) {
                    Ok(zone) => json_response(
                        StatusCode::CREATED,
                        &json!({ "message": "Geofence created successfully", "geofence": zone }),
                    ),
                    Err(e) => error_response(&e),
                },
                Err(resp) => resp,
            }
        }
        (&Method::PUT, ["api", "geofences", id, "deactivate"]) => {
            match id.parse::<ZoneId>().and_then(|id| pipeline.deactivate_zone(id).map(|_| id)) {
                Ok(id) => json_response(
                    StatusCode::OK,
                    &json!({ "message": "Geofence deactivated", "id": id }),
                ),
                Err(e) => error_response(&e),
            }
        }

        // Notifications and subscriptions
        (&Method::PUT, ["api", "notifications", "device", subscriber, "subscriptions"]) => {
            let subscriber = SubscriberId(subscriber.to_string());
            match read_json::<_, SubscriptionsBody>(req.into_body()).await {
                Ok(body) => respond(pipeline.set_subscriptions(&subscriber, &body.zone_ids).map(
                    |zone_ids| json!({ "subscriberId": subscriber, "zoneIds": zone_ids }),
                )),
                Err(resp) => resp,
            }
        }
        (&Method::GET, ["api", "notifications", "device", subscriber, "subscriptions"]) => {
            let subscriber = SubscriberId(subscriber.to_string());
            let zone_ids = pipeline.subscriptions_for(&subscriber);
            json_response(StatusCode::OK, &json!({ "subscriberId": subscriber, "zoneIds": zone_ids }))
        }
        (&Method::POST, ["api", "notifications", "send"]) => {
            match read_json::<_, OperatorMessage>(req.into_body()).await {
                Ok(message) => match pipeline.send_message(message).await {
                    Ok(receipt) => json_response(
                        StatusCode::CREATED,
                        &json!({
                            "message": "Notification sent successfully",
                            "notification": receipt.notification,
                            "recipients": receipt.recipients,
                            "deliveredCount": receipt.delivered_count,
                        }),
                    ),
                    Err(e) => error_response(&e),
                },
                Err(resp) => resp,
            }
        }
        (&Method::GET, ["api", "notifications", "user", subscriber]) => {
            let subscriber = SubscriberId(subscriber.to_string());
            let unread_only = params.get("unreadOnly").is_some_and(|v| v == "true");
            match parse_limit(&params) {
                Ok(limit) => respond(pipeline.notifications_for(&subscriber, unread_only, limit).await),
                Err(e) => error_response(&e),
            }
        }
        (&Method::GET, ["api", "notifications", "stats"]) => {
            respond(pipeline.notification_stats().await)
        }
        (&Method::GET, ["api", "notifications"]) => {
            let window = parse_time(&params, "since").and_then(|since| {
                Ok(TimeWindow { since, until: parse_time(&params, "until")? })
            });
            match window.and_then(|w| parse_limit(&params).map(|limit| (w, limit))) {
                Ok((window, limit)) => respond(pipeline.notifications(window, limit).await.map(
                    |notifications| {
                        json!({ "notifications": notifications, "count": notifications.len() })
                    },
                )),
                Err(e) => error_response(&e),
            }
        }
        (&Method::PUT, ["api", "notifications", id, "read"]) => {
            respond(pipeline.mark_read(&NotificationId(id.to_string())).await)
        }

        (&Method::OPTIONS, _) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(Full::new(Bytes::new()))
            .expect("static response should not fail"),
        _ => not_found(),
    };

    Ok(response)
}

/// Start the HTTP API server
pub async fn start_http_server(
    addr: SocketAddr,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener =
        TcpListener::bind(addr).await.with_context(|| format!("Failed to bind HTTP API on {}", addr))?;

    info!(addr = %addr, site = %state.site_id, "http_api_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _peer)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_api_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::Config;
    use crate::infra::metrics::Metrics;
    use crate::services::notifier::InMemoryNotificationStore;
    use crate::services::zone_directory::ZoneDirectory;
    use serde_json::Value;

    fn state() -> Arc<ApiState> {
        let config = Config::default().with_journal_file("");
        let zones = Arc::new(ZoneDirectory::new(None));
        let store = Arc::new(InMemoryNotificationStore::new(None));
        let (pipeline, _worker) =
            AlertPipeline::new(&config, zones, store, None, Arc::new(Metrics::new()));
        Arc::new(ApiState::new(Arc::new(pipeline), "bondi", "test"))
    }

    async fn call(state: &Arc<ApiState>, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let body = if body.is_null() { Bytes::new() } else { Bytes::from(body.to_string()) };
        let req = Request::builder().method(method).uri(uri).body(Full::new(body)).unwrap();
        let resp = handle_request(req, state.clone()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn create_bondi(state: &Arc<ApiState>) -> u64 {
        let (status, body) = call(
            state,
            Method::POST,
            "/api/geofences",
            json!({
                "name": "Bondi Beach",
                "latitude": -33.8915,
                "longitude": 151.2767,
                "radius": 500,
                "alertLevel": "high"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["geofence"]["id"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_report_detection_flow() {
        let state = state();
        let zone_id = create_bondi(&state).await;

        let (status, receipt) = call(
            &state,
            Method::POST,
            "/api/sharks/report",
            json!({
                "droneName": "Drone-7",
                "sharkType": "Great White",
                "latitude": -33.8915,
                "longitude": 151.2767,
                "accuracy": 95
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(receipt["zoneId"], zone_id);
        assert_eq!(receipt["alertLevel"], "high");
        assert_eq!(receipt["deliveredCount"], 0);

        let id = receipt["detectionId"].as_str().unwrap().to_string();
        let (status, record) =
            call(&state, Method::GET, &format!("/api/sharks/detections/{}", id), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["zoneName"], "Bondi Beach");
        assert_eq!(record["source"], "Drone-7");

        let (_, list) = call(
            &state,
            Method::GET,
            "/api/sharks/detections?timeFilter=12h&zoneName=Bondi%20Beach",
            Value::Null,
        )
        .await;
        assert_eq!(list["count"], 1);
        assert_eq!(list["timeFilter"], "12h");

        let (status, verified) = call(
            &state,
            Method::PUT,
            &format!("/api/sharks/detections/{}/verify", id),
            json!({ "isVerified": true }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verified["isVerified"], true);

        let (_, notes) = call(&state, Method::GET, "/api/notifications?limit=5", Value::Null).await;
        assert_eq!(notes["count"], 1);
        assert_eq!(notes["notifications"][0]["title"], "SHARK DETECTED: Great White");
    }

    #[tokio::test]
    async fn test_validation_error_names_field() {
        let state = state();
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/sharks/report",
            json!({ "latitude": -33.8915, "longitude": 151.2767, "accuracy": 50 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "category");

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/sharks/report")
            .body(Full::new(Bytes::from_static(b"{not json")))
            .unwrap();
        let resp = handle_request(req, state.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_geofence_endpoints() {
        let state = state();
        let zone_id = create_bondi(&state).await;

        let (status, answer) = call(
            &state,
            Method::POST,
            "/api/geofences/check-location",
            json!({ "deviceId": "watch-1", "latitude": -33.8915, "longitude": 151.2767 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(answer["isInGeofence"], true);
        assert_eq!(answer["currentGeofence"], zone_id);

        let (_, zones) = call(&state, Method::GET, "/api/geofences", Value::Null).await;
        assert_eq!(zones.as_array().unwrap().len(), 1);

        let (_, stats) = call(&state, Method::GET, "/api/geofences/stats", Value::Null).await;
        assert_eq!(stats["activeGeofences"], 1);

        let path = format!("/api/geofences/{}/deactivate", zone_id);
        let (status, _) = call(&state, Method::PUT, &path, Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, Method::PUT, &path, Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, zones) = call(&state, Method::GET, "/api/geofences", Value::Null).await;
        assert!(zones.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscriptions_endpoint() {
        let state = state();
        let zone_id = create_bondi(&state).await;
        let path = "/api/notifications/device/device-1/subscriptions";

        let (status, body) = call(&state, Method::PUT, path, json!({ "zoneIds": [zone_id] })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["zoneIds"], json!([zone_id]));

        let (status, _) = call(&state, Method::PUT, path, json!({ "zoneIds": [999] })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&state, Method::GET, path, Value::Null).await;
        assert_eq!(body["zoneIds"], json!([zone_id]));
    }

    #[tokio::test]
    async fn test_health_metrics_and_unknown_route() {
        let state = state();
        let (status, body) = call(&state, Method::GET, "/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");

        let req = Request::builder().uri("/metrics").body(Full::new(Bytes::new())).unwrap();
        let resp = handle_request(req, state.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&text).contains("sharkwatch_detections_total{site=\"bondi\"}"));

        let (status, _) = call(&state, Method::GET, "/api/unknown", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_geofence_coordinate_errors_name_field() {
        let state = state();
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/geofences",
            json!({ "name": "Bondi Beach", "latitude": -33.8915, "longitude": 200.0, "radius": 500 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "longitude");

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/geofences",
            json!({ "name": "Bondi Beach", "latitude": 95.0, "longitude": 151.2767, "radius": 500 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "latitude");
    }

    #[tokio::test]
    async fn test_send_and_list_user_notifications() {
        let state = state();
        let zone_id = create_bondi(&state).await;
        let (status, _) = call(
            &state,
            Method::PUT,
            "/api/notifications/device/device-1/subscriptions",
            json!({ "zoneIds": [zone_id] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, sent) = call(
            &state,
            Method::POST,
            "/api/notifications/send",
            json!({ "title": "Beach closed", "message": "Lifeguards closed the beach", "geofenceId": zone_id }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sent["message"], "Notification sent successfully");
        assert_eq!(sent["recipients"], 1);
        assert_eq!(sent["deliveredCount"], 0);
        assert_eq!(sent["notification"]["zoneId"], zone_id);

        let (status, direct) = call(
            &state,
            Method::POST,
            "/api/notifications/send",
            json!({ "title": "Check in", "message": "Reply when ashore", "userId": "device-2",
                    "latitude": -33.8915, "longitude": 151.2767 }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(direct["notification"]["recipient"], "device-2");

        let (status, listed) =
            call(&state, Method::GET, "/api/notifications/user/device-1", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["title"], "Beach closed");

        let id = listed[0]["id"].as_str().unwrap().to_string();
        call(&state, Method::PUT, &format!("/api/notifications/{}/read", id), Value::Null).await;
        let (_, unread) = call(
            &state,
            Method::GET,
            "/api/notifications/user/device-1?unreadOnly=true",
            Value::Null,
        )
        .await;
        assert!(unread.as_array().unwrap().is_empty());

        let (_, other) =
            call(&state, Method::GET, "/api/notifications/user/device-2", Value::Null).await;
        assert_eq!(other.as_array().unwrap().len(), 1);

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/notifications/send",
            json!({ "message": "No title", "geofenceId": zone_id }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "title");
    }

    #[test]
    fn test_unavailable_maps_to_503() {
        let resp = error_response(&AlertError::StoreUnavailable("pool exhausted".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get(RETRY_AFTER).unwrap(), RETRY_AFTER_SECS);
        let resp = error_response(&AlertError::missing("name"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.headers().get(RETRY_AFTER).is_none());
    }
}

