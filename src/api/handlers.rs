use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::BusinessScope;
use crate::error::CoreError;
use crate::logic::{
    search_mainline_instance_topo, ForceSyncReconciler, InterruptedRuns, ModelTopologyOverlay,
    RemoteCall, ServiceDifferenceClassifier, ServiceInstanceLocks, ServiceInstanceOperations,
    SyncPlan, SyncReport,
};
use crate::model::{
    CreateServiceInstancesInput, DifferenceReport, Id, ModelTopologyNode, Page, ServiceInstance,
    TopoInstanceNode,
};
use crate::store::traits::Store;

/// Everything a handler needs besides the request itself.
pub struct AppContext<S: ?Sized> {
    pub remote: RemoteCall,
    pub locks: ServiceInstanceLocks,
    /// Plans of force syncs that stopped part way, for the resume route
    pub interrupted_runs: InterruptedRuns,
    /// Upper bound applied to caller-supplied page limits
    pub list_page_limit: usize,
    pub store: Arc<S>,
}

impl<S> AppContext<S> {
    pub fn new(store: Arc<S>, remote: RemoteCall, list_page_limit: usize) -> Self {
        Self {
            remote,
            locks: ServiceInstanceLocks::new(),
            interrupted_runs: InterruptedRuns::new(),
            list_page_limit,
            store,
        }
    }
}

pub type AppState<S> = Arc<AppContext<S>>;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// The same request may succeed later without changes
    #[serde(default)]
    pub retryable: bool,
    /// Set when a force sync stopped part way
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<usize>,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
            retryable: false,
            run_id: None,
            resume_from: None,
        }
    }
}

pub fn status_of(error: &CoreError) -> StatusCode {
    match error {
        CoreError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        CoreError::NotFound { .. } | CoreError::RunNotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        CoreError::SyncInterrupted { .. } => StatusCode::CONFLICT,
        CoreError::Topology { source, .. } => match source.as_ref() {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        CoreError::RemoteRead { .. } | CoreError::RemoteWrite { .. } | CoreError::Integrity { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<CoreError> for (StatusCode, Json<ErrorResponse>) {
    fn from(error: CoreError) -> Self {
        let status = status_of(&error);
        if status.is_server_error() {
            log::error!("request failed: {}", error);
        }
        let mut body = ErrorResponse::new(&error.to_string());
        body.retryable = error.is_retryable();
        if let CoreError::SyncInterrupted { run_id, applied, .. } = &error {
            body.run_id = Some(*run_id);
            body.resume_from = Some(*applied);
        }
        (status, Json(body))
    }
}

#[derive(Debug, Deserialize)]
pub struct TopoQuery {
    pub with_detail: Option<bool>,
}

pub async fn get_model_topology<S: Store>(
    State(ctx): State<AppState<S>>,
) -> ApiResult<ModelTopologyNode> {
    let model = ModelTopologyOverlay::new(ctx.store.as_ref(), ctx.remote)
        .search_model_topology()
        .await?;
    Ok(Json(model))
}

pub async fn get_instance_topology<S: Store>(
    State(ctx): State<AppState<S>>,
    BusinessScope(business_id): BusinessScope,
    Query(query): Query<TopoQuery>,
) -> ApiResult<TopoInstanceNode> {
    let tree = search_mainline_instance_topo(
        ctx.store.as_ref(),
        ctx.remote,
        business_id,
        query.with_detail.unwrap_or(false),
    )
    .await?;
    Ok(Json(tree))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedServiceInstances {
    pub service_instance_ids: Vec<Id>,
}

pub async fn create_service_instances<S: Store>(
    State(ctx): State<AppState<S>>,
    BusinessScope(business_id): BusinessScope,
    RequestJson(input): RequestJson<CreateServiceInstancesInput>,
) -> ApiResult<CreatedServiceInstances> {
    let ids = ServiceInstanceOperations::new(ctx.store.as_ref(), ctx.remote, &ctx.locks)
        .create_service_instances(business_id, input)
        .await?;
    Ok(Json(CreatedServiceInstances {
        service_instance_ids: ids,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub start: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

pub async fn list_service_instances_in_module<S: Store>(
    State(ctx): State<AppState<S>>,
    BusinessScope(business_id): BusinessScope,
    Path(module_id): Path<Id>,
    Query(query): Query<PageQuery>,
) -> ApiResult<ListResponse<ServiceInstance>> {
    let page = Page {
        start: query.start.unwrap_or(0),
        limit: query
            .limit
            .unwrap_or(ctx.list_page_limit)
            .min(ctx.list_page_limit),
    };
    let items = ServiceInstanceOperations::new(ctx.store.as_ref(), ctx.remote, &ctx.locks)
        .list_service_instances_in_module(business_id, module_id, page)
        .await?;
    let total = items.len();
    Ok(Json(ListResponse { items, total }))
}

pub async fn delete_service_instance<S: Store>(
    State(ctx): State<AppState<S>>,
    BusinessScope(business_id): BusinessScope,
    Path(service_instance_id): Path<Id>,
) -> ApiResult<serde_json::Value> {
    ServiceInstanceOperations::new(ctx.store.as_ref(), ctx.remote, &ctx.locks)
        .delete_service_instance(business_id, service_instance_id)
        .await?;
    Ok(Json(serde_json::json!({
        "message": "Service instance deleted",
        "service_instance_id": service_instance_id
    })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteProcessInstancesRequest {
    pub process_instance_ids: Vec<Id>,
}

pub async fn delete_process_instances<S: Store>(
    State(ctx): State<AppState<S>>,
    BusinessScope(business_id): BusinessScope,
    RequestJson(request): RequestJson<DeleteProcessInstancesRequest>,
) -> ApiResult<serde_json::Value> {
    ServiceInstanceOperations::new(ctx.store.as_ref(), ctx.remote, &ctx.locks)
        .delete_process_instances(business_id, &request.process_instance_ids)
        .await?;
    Ok(Json(serde_json::json!({
        "message": "Process instances deleted",
        "deleted": request.process_instance_ids.len()
    })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DifferencesRequest {
    #[serde(alias = "bk_module_id")]
    pub module_id: Id,
}

pub async fn find_differences<S: Store>(
    State(ctx): State<AppState<S>>,
    BusinessScope(business_id): BusinessScope,
    Path(service_template_id): Path<Id>,
    RequestJson(request): RequestJson<DifferencesRequest>,
) -> ApiResult<DifferenceReport> {
    let report = ServiceDifferenceClassifier::new(ctx.store.as_ref(), ctx.remote)
        .classify(business_id, service_template_id, request.module_id)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForceSyncRequest {
    pub service_instances: Vec<Id>,
}

pub async fn force_sync<S: Store>(
    State(ctx): State<AppState<S>>,
    BusinessScope(business_id): BusinessScope,
    Path(service_template_id): Path<Id>,
    RequestJson(request): RequestJson<ForceSyncRequest>,
) -> ApiResult<SyncReport> {
    let report = ForceSyncReconciler::new(ctx.store.as_ref(), ctx.remote, &ctx.locks)
        .with_interrupted_runs(&ctx.interrupted_runs)
        .force_sync(business_id, service_template_id, &request.service_instances)
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResumeForceSyncRequest {
    pub run_id: Uuid,
    /// Defaults to the first mutation the run did not apply
    #[serde(default)]
    pub from: Option<usize>,
}

pub async fn resume_force_sync<S: Store>(
    State(ctx): State<AppState<S>>,
    BusinessScope(business_id): BusinessScope,
    Path(service_template_id): Path<Id>,
    RequestJson(request): RequestJson<ResumeForceSyncRequest>,
) -> ApiResult<SyncReport> {
    let report = ForceSyncReconciler::new(ctx.store.as_ref(), ctx.remote, &ctx.locks)
        .with_interrupted_runs(&ctx.interrupted_runs)
        .resume_run(business_id, service_template_id, request.run_id, request.from)
        .await?;
    Ok(Json(report))
}

/// Dry run: the mutations a force sync would apply right now.
pub async fn plan_force_sync<S: Store>(
    State(ctx): State<AppState<S>>,
    BusinessScope(business_id): BusinessScope,
    Path(service_template_id): Path<Id>,
    RequestJson(request): RequestJson<ForceSyncRequest>,
) -> ApiResult<SyncPlan> {
    let plan = ForceSyncReconciler::new(ctx.store.as_ref(), ctx.remote, &ctx.locks)
        .plan(business_id, service_template_id, &request.service_instances)
        .await?;
    Ok(Json(plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TopologyStage;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(&CoreError::invalid_input("bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&CoreError::NotFound {
                kind: "service template",
                id: 3
            }),
            StatusCode::NOT_FOUND
        );
        let missing_business = CoreError::NotFound {
            kind: "business",
            id: 9,
        }
        .at_stage(
            TopologyStage::InstanceLoad {
                object_id: "biz".to_string(),
            },
            9,
        );
        assert_eq!(status_of(&missing_business), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(&CoreError::integrity("dangling")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_interrupted_sync_carries_resume_point() {
        let run_id = Uuid::new_v4();
        let error = CoreError::SyncInterrupted {
            run_id,
            applied: 4,
            total: 9,
            source: Box::new(CoreError::Timeout {
                op: "update process instance",
                key: "process 12".to_string(),
                after_ms: 50,
            }),
        };
        let (status, Json(body)) = <(StatusCode, Json<ErrorResponse>)>::from(error);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.run_id, Some(run_id));
        assert_eq!(body.resume_from, Some(4));
        assert!(body.retryable);

        let (status, Json(body)) =
            <(StatusCode, Json<ErrorResponse>)>::from(CoreError::RunNotFound { run_id });
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!body.retryable);
    }
}
