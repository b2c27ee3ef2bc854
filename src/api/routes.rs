use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::api::{handlers, AppState};
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Mainline topology
        .route("/topo/model", get(handlers::get_model_topology::<S>))
        .route("/topo/instance", get(handlers::get_instance_topology::<S>))
        // Service instances
        .route(
            "/service_instances",
            post(handlers::create_service_instances::<S>),
        )
        .route(
            "/service_instances/:service_instance_id",
            delete(handlers::delete_service_instance::<S>),
        )
        .route(
            "/modules/:module_id/service_instances",
            get(handlers::list_service_instances_in_module::<S>),
        )
        .route(
            "/process_instances",
            delete(handlers::delete_process_instances::<S>),
        )
        // Service template reconciliation
        .route(
            "/service_templates/:service_template_id/differences",
            post(handlers::find_differences::<S>),
        )
        .route(
            "/service_templates/:service_template_id/force_sync",
            post(handlers::force_sync::<S>),
        )
        .route(
            "/service_templates/:service_template_id/force_sync/plan",
            post(handlers::plan_force_sync::<S>),
        )
        .route(
            "/service_templates/:service_template_id/force_sync/resume",
            post(handlers::resume_force_sync::<S>),
        )
}
