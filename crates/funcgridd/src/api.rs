//! Admin REST API.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/instances` | List local instances |
//! | POST | `/api/v1/instances` | Create an instance |
//! | GET | `/api/v1/instances/{id}` | Get one instance |
//! | POST | `/api/v1/instances/{id}/kill` | Send a signal |
//! | POST | `/api/v1/agents/{id}/evict` | Evict every instance on an agent |
//! | GET | `/api/v1/routes` | Routing entries known to this node |
//! | POST | `/api/v1/groups` | Schedule a group |
//! | GET | `/api/v1/groups/{id}` | Get a group |
//! | DELETE | `/api/v1/groups/{id}` | Kill a group |

use axum::extract::{Path, State};
use axum::http::StatusCode as HttpStatus;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use funcgrid_control::{GroupCtrl, GroupScheduleRequest, InstanceCtrl};
use funcgrid_core::{EvictAgentRequest, KillRequest, ScheduleRequest, Signal, StatusCode};
use funcgrid_routing::RoutingDirectory;
use serde::Deserialize;

#[derive(Clone)]
pub struct ApiState {
    pub ctrl: InstanceCtrl,
    pub groups: GroupCtrl,
    pub directory: RoutingDirectory,
}

pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/{id}", get(get_instance))
        .route("/instances/{id}/kill", post(kill_instance))
        .route("/agents/{id}/evict", post(evict_agent))
        .route("/routes", get(list_routes))
        .route("/groups", post(schedule_group))
        .route("/groups/{id}", get(get_group).delete(kill_group))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<StatusCode>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        })
    }
}

fn error_response(msg: &str, status: HttpStatus) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            code: None,
        }),
    )
        .into_response()
}

/// Failure carrying the control-plane code alongside the message.
fn failure(code: StatusCode, msg: &str) -> axum::response::Response {
    (
        http_status(code),
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            code: Some(code),
        }),
    )
        .into_response()
}

fn http_status(code: StatusCode) -> HttpStatus {
    match code {
        StatusCode::Ok => HttpStatus::OK,
        StatusCode::ErrParamInvalid => HttpStatus::BAD_REQUEST,
        StatusCode::ErrAuthorizeFailed => HttpStatus::FORBIDDEN,
        StatusCode::ErrInstanceNotFound | StatusCode::ErrFunctionMetaNotFound => {
            HttpStatus::NOT_FOUND
        }
        StatusCode::ErrInstanceDuplicated => HttpStatus::CONFLICT,
        StatusCode::ErrInstanceExited | StatusCode::ErrInstanceEvicted => HttpStatus::GONE,
        StatusCode::ErrResourceNotEnough => HttpStatus::SERVICE_UNAVAILABLE,
        _ => HttpStatus::INTERNAL_SERVER_ERROR,
    }
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances
async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.ctrl.instances().await)
}

/// GET /api/v1/instances/{id}
async fn get_instance(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let record = match state.ctrl.instance(&id).await {
        Some(record) => Some(record),
        None => state.directory.record(&id).await,
    };
    match record {
        Some(record) => ApiResponse::ok(record).into_response(),
        None => error_response("instance not found", HttpStatus::NOT_FOUND),
    }
}

/// POST /api/v1/instances
///
/// Returns once the instance answered its init call or creation failed.
async fn create_instance(
    State(state): State<ApiState>,
    Json(request): Json<ScheduleRequest>,
) -> impl IntoResponse {
    let result = state.ctrl.create_instance(request).await;
    if result.code.is_ok() {
        (HttpStatus::CREATED, ApiResponse::ok(result)).into_response()
    } else {
        failure(result.code, &result.message)
    }
}

#[derive(Deserialize)]
struct KillBody {
    #[serde(default = "default_signal")]
    signal: i32,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    force: bool,
}

fn default_signal() -> i32 {
    Signal::ShutDown.as_raw()
}

/// POST /api/v1/instances/{id}/kill
async fn kill_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<KillBody>,
) -> impl IntoResponse {
    let request = KillRequest {
        instance_id: id,
        signal: body.signal,
        payload: body.payload,
        request_id: uuid::Uuid::new_v4().to_string(),
        is_force: body.force,
        is_synchronized: false,
    };
    let response = state.ctrl.kill("", request).await;
    if response.code.is_ok() {
        ApiResponse::ok(response).into_response()
    } else {
        failure(response.code, &response.message)
    }
}

// ── Agents and routes ──────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(default)]
struct EvictBody {
    timeout_sec: u64,
}

/// POST /api/v1/agents/{id}/evict
async fn evict_agent(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<EvictBody>,
) -> impl IntoResponse {
    let request = EvictAgentRequest {
        request_id: uuid::Uuid::new_v4().to_string(),
        agent_id: id,
        timeout_sec: body.timeout_sec,
    };
    let status = state.ctrl.evict_instance_on_agent(&request).await;
    if status.is_ok() {
        ApiResponse::ok("evicted").into_response()
    } else {
        failure(status.code, &status.message)
    }
}

/// GET /api/v1/routes
async fn list_routes(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.directory.entries().await)
}

// ── Groups ─────────────────────────────────────────────────────

/// POST /api/v1/groups
async fn schedule_group(
    State(state): State<ApiState>,
    Json(request): Json<GroupScheduleRequest>,
) -> impl IntoResponse {
    let response = state.groups.schedule_group(request).await;
    if response.code.is_ok() {
        (HttpStatus::CREATED, ApiResponse::ok(response)).into_response()
    } else {
        failure(response.code, &response.message)
    }
}

/// GET /api/v1/groups/{id}
async fn get_group(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.groups.group(&id).await {
        Some(group) => ApiResponse::ok(group).into_response(),
        None => error_response("group not found", HttpStatus::NOT_FOUND),
    }
}

/// DELETE /api/v1/groups/{id}
async fn kill_group(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let status = state.groups.kill_group(&id).await;
    if status.is_ok() {
        ApiResponse::ok("deleted").into_response()
    } else {
        failure(status.code, &status.message)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use funcgrid_control::{AllowAll, Collaborators};
    use funcgrid_core::ControlConfig;
    use funcgrid_state::MetaStore;
    use tower::ServiceExt;

    use super::*;
    use crate::loopback::{self, AnyFunction, LoopbackNode, LoopbackRuntime, StandaloneCluster};

    fn test_router() -> Router {
        let config = ControlConfig {
            node_id: "n1".to_string(),
            ..Default::default()
        };
        let store = MetaStore::open_in_memory().unwrap();
        let directory = RoutingDirectory::spawn(&config.node_id);
        let node = Arc::new(LoopbackNode::new(&config.node_id));
        let (runtime, init_calls) = LoopbackRuntime::new();
        let deps = Collaborators {
            scheduler: node.clone(),
            agent: node.clone(),
            runtime: Arc::new(runtime),
            cluster: Arc::new(StandaloneCluster),
            meta_store: Arc::new(store.clone()),
            function_meta: Arc::new(AnyFunction),
            resource_view: node,
            authorizer: Arc::new(AllowAll),
        };
        let ctrl = InstanceCtrl::new(config, deps, directory.clone());
        loopback::ack_init_calls(ctrl.clone(), init_calls);
        let groups = GroupCtrl::new(ctrl.clone(), Arc::new(store));
        build_router(ApiState {
            ctrl,
            groups,
            directory,
        })
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (HttpStatus, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        let resp = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn create_body(instance_id: &str) -> serde_json::Value {
        serde_json::json!({
            "request_id": format!("req-{instance_id}"),
            "instance_id": instance_id,
            "function_key": "demo/echo",
            "resources": { "cpu_millis": 500, "memory_mb": 128 }
        })
    }

    #[tokio::test]
    async fn list_instances_starts_empty() {
        let router = test_router();
        let (status, json) = call(&router, "GET", "/api/v1/instances", None).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn create_get_and_kill_instance() {
        let router = test_router();
        let (status, json) = call(&router, "POST", "/api/v1/instances", Some(create_body("i1"))).await;
        assert_eq!(status, HttpStatus::CREATED);
        assert_eq!(json["data"]["instance_id"], "i1");

        let (status, json) = call(&router, "GET", "/api/v1/instances/i1", None).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["data"]["state"], "RUNNING");

        let (status, _) = call(&router, "POST", "/api/v1/instances/i1/kill", Some(serde_json::json!({}))).await;
        assert_eq!(status, HttpStatus::OK);

        let (status, _) = call(&router, "GET", "/api/v1/instances/i1", None).await;
        assert_eq!(status, HttpStatus::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_instance_is_a_conflict() {
        let router = test_router();
        call(&router, "POST", "/api/v1/instances", Some(create_body("i1"))).await;
        let mut body = create_body("i1");
        body["request_id"] = "req-other".into();
        let (status, json) = call(&router, "POST", "/api/v1/instances", Some(body)).await;
        assert_eq!(status, HttpStatus::CONFLICT);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn invalid_signal_is_a_bad_request() {
        let router = test_router();
        let (status, json) = call(
            &router,
            "POST",
            "/api/v1/instances/i1/kill",
            Some(serde_json::json!({ "signal": 42 })),
        )
        .await;
        assert_eq!(status, HttpStatus::BAD_REQUEST);
        assert_eq!(json["error"], "invalid signal num");
    }

    #[tokio::test]
    async fn evicting_an_agent_evicts_its_instances() {
        let router = test_router();
        call(&router, "POST", "/api/v1/instances", Some(create_body("i1"))).await;
        let (status, _) = call(&router, "POST", "/api/v1/agents/n1-agent-0/evict", Some(serde_json::json!({}))).await;
        assert_eq!(status, HttpStatus::OK);

        let (_, json) = call(&router, "GET", "/api/v1/instances/i1", None).await;
        assert_eq!(json["data"]["state"], "EVICTED");
    }

    #[tokio::test]
    async fn routes_list_running_instances() {
        let router = test_router();
        call(&router, "POST", "/api/v1/instances", Some(create_body("i1"))).await;
        let (status, json) = call(&router, "GET", "/api/v1/routes", None).await;
        assert_eq!(status, HttpStatus::OK);
        let entries = json["data"].as_array().unwrap();
        assert!(entries.iter().any(|e| e["instance_id"] == "i1"));
    }
}
