use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use private_datasets_api::{
    AccessOutcome, AccessRequest, AcquisitionRequest, AcquisitionWarnings, AuthFunction,
    DatasetDeleteResult, DatasetUpsertRequest, DatasetUpsertResult, MigrateResult, PackageView,
    PluginConfig, PluginManifest, PrivateDatasetsPlugin, API_CONTRACT_VERSION,
};
use private_datasets_core::{before_index, Actor, CallContext, PrivacyError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    plugin: PrivateDatasetsPlugin,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    notices: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Caller identity for read-only routes, passed as query parameters.
#[derive(Debug, Clone, Default, Deserialize)]
struct ShowQuery {
    user_name: Option<String>,
    user_id: Option<String>,
    #[serde(default)]
    sysadmin: bool,
    request_path: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "private-datasets-service")]
#[command(about = "Local HTTP service for per-dataset access control")]
struct Args {
    #[arg(long, default_value = "./private_datasets.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// YAML plugin configuration. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            notices: Vec::new(),
        }
    }

    fn api_error(err: &anyhow::Error) -> ServiceError {
        let status = match err.downcast_ref::<PrivacyError>() {
            Some(PrivacyError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(PrivacyError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::error(status, err.to_string())
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/plugin", get(plugin_manifest))
        .route("/v1/datasets", post(dataset_upsert))
        .route("/v1/datasets/:package_id", get(dataset_show).delete(dataset_delete))
        .route("/v1/auth/:function", post(auth_check))
        .route("/v1/actions/package_adquired", post(package_adquired))
        .route("/v1/users/:user_name/adquired", get(user_adquired))
        .route("/v1/index/before", post(index_before))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PluginConfig::load(path)?,
        None => PluginConfig::default(),
    };
    let state = ServiceState { plugin: PrivateDatasetsPlugin::new(args.db, config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "private datasets service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<private_datasets_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.plugin.schema_status().map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result =
        state.plugin.migrate(request.dry_run).map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn plugin_manifest(State(state): State<ServiceState>) -> Json<ServiceEnvelope<PluginManifest>> {
    Json(envelope(state.plugin.manifest()))
}

async fn dataset_upsert(
    State(state): State<ServiceState>,
    Json(request): Json<DatasetUpsertRequest>,
) -> Result<Json<ServiceEnvelope<DatasetUpsertResult>>, ServiceError> {
    let result =
        state.plugin.upsert_dataset(request).map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn dataset_show(
    State(state): State<ServiceState>,
    Path(package_id): Path<String>,
    Query(query): Query<ShowQuery>,
) -> Result<Json<ServiceEnvelope<PackageView>>, ServiceError> {
    let request = AccessRequest {
        context: CallContext::for_actor(Actor {
            user_name: query.user_name,
            user_id: query.user_id,
            sysadmin: query.sysadmin,
        }),
        id: Some(package_id),
        request_path: query.request_path,
    };
    let view = state.plugin.package_show(&request).map_err(|err| ServiceState::api_error(&err))?;
    if !view.result.success {
        let mut error = ServiceState::error(
            StatusCode::FORBIDDEN,
            view.result.msg.unwrap_or_else(|| "not authorized".to_string()),
        );
        error.notices = view.notices;
        return Err(error);
    }
    Ok(Json(envelope(view)))
}

async fn dataset_delete(
    State(state): State<ServiceState>,
    Path(package_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DatasetDeleteResult>>, ServiceError> {
    let result =
        state.plugin.delete_dataset(&package_id).map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn auth_check(
    State(state): State<ServiceState>,
    Path(function): Path<String>,
    Json(request): Json<AccessRequest>,
) -> Result<Json<ServiceEnvelope<AccessOutcome>>, ServiceError> {
    let Some(function) = AuthFunction::parse(&function) else {
        return Err(ServiceState::error(
            StatusCode::NOT_FOUND,
            format!("unknown auth function: {function}"),
        ));
    };
    let outcome = state
        .plugin
        .check_access(function, &request)
        .map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(outcome)))
}

async fn package_adquired(
    State(state): State<ServiceState>,
    Json(request): Json<AcquisitionRequest>,
) -> Result<Json<ServiceEnvelope<Option<AcquisitionWarnings>>>, ServiceError> {
    let warnings =
        state.plugin.package_adquired(&request).map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(warnings)))
}

async fn user_adquired(
    State(state): State<ServiceState>,
    Path(user_name): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<String>>>, ServiceError> {
    let datasets = state
        .plugin
        .user_adquired_datasets(&user_name)
        .map_err(|err| ServiceState::api_error(&err))?;
    Ok(Json(envelope(datasets)))
}

async fn index_before(
    Json(pkg_dict): Json<Map<String, Value>>,
) -> Json<ServiceEnvelope<Map<String, Value>>> {
    Json(envelope(before_index(pkg_dict)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("private-datasets-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn router(db_path: &std::path::Path) -> Router {
        app(ServiceState {
            plugin: PrivateDatasetsPlugin::new(db_path.to_path_buf(), PluginConfig::default()),
        })
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn private_dataset_payload() -> Value {
        serde_json::json!({
            "context": {"actor": {"user_name": "creator", "user_id": "creator-id"}},
            "package": {
                "id": "ds1",
                "name": "weather-stations",
                "private": true,
                "adquire_url": "https://store.example.org/offering/7",
                "allowed_users": ["alice"],
                "resources": [{"id": "res-1"}],
            },
        })
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = router(&unique_temp_db_path());
        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("api_contract_version").and_then(Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = router(&unique_temp_db_path());
        let response = send(&router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/actions/package_adquired"));
        assert!(body.contains("/v1/auth/{function}"));
    }

    #[tokio::test]
    async fn dataset_show_filters_by_caller() {
        let db_path = unique_temp_db_path();
        let router = router(&db_path);

        let stored = send(&router, "POST", "/v1/datasets", Some(private_dataset_payload())).await;
        assert_eq!(stored.status(), StatusCode::OK);
        let stored = response_json(stored).await;
        assert_eq!(stored.pointer("/data/created"), Some(&Value::Bool(true)));

        let creator =
            send(&router, "GET", "/v1/datasets/ds1?user_name=creator&user_id=creator-id", None)
                .await;
        assert_eq!(creator.status(), StatusCode::OK);
        let creator = response_json(creator).await;
        assert_eq!(
            creator.pointer("/data/package/allowed_users"),
            Some(&serde_json::json!(["alice"]))
        );

        let alice =
            send(&router, "GET", "/v1/datasets/ds1?user_name=alice&user_id=alice-id", None).await;
        assert_eq!(alice.status(), StatusCode::OK);
        let alice = response_json(alice).await;
        assert_eq!(alice.pointer("/data/package/allowed_users"), None);

        let stranger = send(
            &router,
            "GET",
            "/v1/datasets/ds1?user_name=mallory&user_id=m&request_path=/dataset/ds1",
            None,
        )
        .await;
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);
        let stranger = response_json(stranger).await;
        assert_eq!(
            stranger.get("error").and_then(Value::as_str),
            Some("User mallory not authorized to read package ds1")
        );
        assert_eq!(stranger.pointer("/notices").and_then(Value::as_array).map(Vec::len), Some(1));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let db_path = unique_temp_db_path();
        let router = router(&db_path);

        let unknown_function = send(
            &router,
            "POST",
            "/v1/auth/package_delete",
            Some(serde_json::json!({"id": "ds1"})),
        )
        .await;
        assert_eq!(unknown_function.status(), StatusCode::NOT_FOUND);

        let unknown_resource = send(
            &router,
            "POST",
            "/v1/auth/resource_show",
            Some(serde_json::json!({"id": "missing"})),
        )
        .await;
        assert_eq!(unknown_resource.status(), StatusCode::NOT_FOUND);

        let invalid = send(
            &router,
            "POST",
            "/v1/datasets",
            Some(serde_json::json!({"package": {"id": "ds1", "adquire_url": "http://a.b"}})),
        )
        .await;
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let bad_notification = send(
            &router,
            "POST",
            "/v1/actions/package_adquired",
            Some(serde_json::json!({"notification": {"customer_name": "carol"}})),
        )
        .await;
        assert_eq!(bad_notification.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn acquisition_and_delete_flow_round_trip() {
        let db_path = unique_temp_db_path();
        let router = router(&db_path);
        let stored = send(&router, "POST", "/v1/datasets", Some(private_dataset_payload())).await;
        assert_eq!(stored.status(), StatusCode::OK);

        let notification = serde_json::json!({
            "notification": {
                "customer_name": "carol",
                "resources": [
                    {"url": "http://localhost:5000/dataset/weather-stations"},
                    {"url": "http://localhost:5000/dataset/unknown"},
                ],
            },
        });
        let acquired =
            send(&router, "POST", "/v1/actions/package_adquired", Some(notification)).await;
        assert_eq!(acquired.status(), StatusCode::OK);
        let acquired = response_json(acquired).await;
        assert_eq!(
            acquired.pointer("/data/warns"),
            Some(&serde_json::json!(["Dataset unknown was not found in this instance"]))
        );

        let listing = response_json(send(&router, "GET", "/v1/users/carol/adquired", None).await).await;
        assert_eq!(listing.get("data"), Some(&serde_json::json!(["ds1"])));

        let resource = send(
            &router,
            "POST",
            "/v1/auth/resource_show",
            Some(serde_json::json!({
                "context": {"actor": {"user_name": "carol", "user_id": "carol-id"}},
                "id": "res-1",
            })),
        )
        .await;
        let resource = response_json(resource).await;
        assert_eq!(resource.pointer("/data/result/success"), Some(&Value::Bool(true)));

        let deleted = send(&router, "DELETE", "/v1/datasets/ds1", None).await;
        assert_eq!(deleted.status(), StatusCode::OK);
        let deleted = response_json(deleted).await;
        assert_eq!(deleted.pointer("/data/purged"), Some(&serde_json::json!(2)));

        let listing = response_json(send(&router, "GET", "/v1/users/carol/adquired", None).await).await;
        assert_eq!(listing.get("data"), Some(&serde_json::json!([])));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn before_index_and_plugin_manifest() {
        let router = router(&unique_temp_db_path());

        let indexed = send(
            &router,
            "POST",
            "/v1/index/before",
            Some(serde_json::json!({"capacity": "public", "extras_searchable": "False"})),
        )
        .await;
        let indexed = response_json(indexed).await;
        assert_eq!(indexed.pointer("/data/capacity").and_then(Value::as_str), Some("private"));

        let manifest = response_json(send(&router, "GET", "/v1/plugin", None).await).await;
        assert_eq!(manifest.pointer("/data/is_fallback"), Some(&Value::Bool(true)));
        assert_eq!(
            manifest.pointer("/data/actions"),
            Some(&serde_json::json!(["package_adquired"]))
        );
    }
}
