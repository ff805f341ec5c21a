use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod edge_async;
mod edge_configurations;
mod edge_groups;
mod edge_jobs;
mod edge_stacks;
mod edge_status;
mod edge_update_schedules;
mod endpoints;
pub mod routes_state;

use edge_async::async_check_in;
use edge_configurations::{
    create_edge_configuration,
    delete_edge_configuration,
    get_edge_configuration,
    get_edge_configuration_files,
    list_edge_configurations,
    transition_edge_configuration,
    update_edge_configuration,
};
use edge_groups::{
    create_edge_group,
    delete_edge_group,
    get_edge_group,
    list_edge_groups,
    update_edge_group,
};
use edge_jobs::{
    create_edge_job,
    delete_edge_job,
    get_edge_job,
    get_job_logs,
    list_edge_jobs,
    request_job_logs,
};
use edge_stacks::{
    create_edge_stack,
    delete_edge_stack,
    get_edge_stack,
    list_edge_stacks,
    update_edge_stack,
};
use edge_status::{get_stack_file, status_check_in, update_stack_status, upload_job_logs};
use edge_update_schedules::{
    create_update_schedule,
    delete_update_schedule,
    get_update_schedule,
    list_update_schedules,
    update_update_schedule,
};
use endpoints::{
    append_command,
    create_endpoint,
    delete_endpoint,
    get_endpoint,
    get_snapshot,
    list_endpoints,
    open_tunnel,
    update_endpoint,
};
use routes_state::RouteState;

use crate::{http_objects, middleware::InstanceRequestSpan};

#[derive(OpenApi)]
#[openapi(
        paths(
            edge_async::async_check_in,
            edge_status::status_check_in,
            edge_status::get_stack_file,
            edge_status::update_stack_status,
            edge_status::upload_job_logs,
            edge_configurations::create_edge_configuration,
            edge_configurations::update_edge_configuration,
            edge_configurations::delete_edge_configuration,
            edge_configurations::list_edge_configurations,
            edge_configurations::get_edge_configuration,
            edge_configurations::get_edge_configuration_files,
            edge_configurations::transition_edge_configuration,
            edge_update_schedules::create_update_schedule,
            edge_update_schedules::update_update_schedule,
            edge_update_schedules::delete_update_schedule,
            edge_update_schedules::list_update_schedules,
            edge_update_schedules::get_update_schedule,
            endpoints::create_endpoint,
            endpoints::list_endpoints,
            endpoints::get_endpoint,
            endpoints::update_endpoint,
            endpoints::delete_endpoint,
            endpoints::get_snapshot,
            endpoints::append_command,
            endpoints::open_tunnel,
            edge_groups::create_edge_group,
            edge_groups::list_edge_groups,
            edge_groups::get_edge_group,
            edge_groups::update_edge_group,
            edge_groups::delete_edge_group,
            edge_stacks::create_edge_stack,
            edge_stacks::list_edge_stacks,
            edge_stacks::get_edge_stack,
            edge_stacks::update_edge_stack,
            edge_stacks::delete_edge_stack,
            edge_jobs::create_edge_job,
            edge_jobs::list_edge_jobs,
            edge_jobs::get_edge_job,
            edge_jobs::delete_edge_job,
            edge_jobs::request_job_logs,
            edge_jobs::get_job_logs,
        ),
        components(
            schemas(
                http_objects::EdgeAPIError,
                http_objects::SnapshotPartBody,
                http_objects::SnapshotBody,
                http_objects::StackStatusBody,
                http_objects::JobStatusBody,
                http_objects::AsyncCheckInBody,
                http_objects::AgentCommand,
                http_objects::AsyncCheckInResponse,
                http_objects::EdgeJobSchedule,
                http_objects::EdgeStatusStack,
                http_objects::EdgeStatusResponse,
                http_objects::EdgeStackFileResponse,
                http_objects::StackStatusUpdate,
                http_objects::ConfigFile,
                http_objects::EdgeConfigFilesResponse,
                http_objects::CreateEndpoint,
                http_objects::UpdateEndpoint,
                http_objects::EndpointBody,
                http_objects::EndpointList,
                http_objects::EndpointSnapshot,
                http_objects::AppendCommand,
                http_objects::TunnelDetails,
                http_objects::EdgeGroupBody,
                http_objects::EdgeGroupResponse,
                http_objects::EdgeGroupList,
                http_objects::CreateEdgeStack,
                http_objects::UpdateEdgeStack,
                http_objects::StackStatusEntry,
                http_objects::EndpointStackStatus,
                http_objects::EdgeStackResponse,
                http_objects::EdgeStackList,
                http_objects::CreateEdgeJob,
                http_objects::EdgeJobTarget,
                http_objects::EdgeJobResponse,
                http_objects::EdgeJobList,
                http_objects::EdgeConfigMetadata,
                http_objects::EdgeConfigProgressBody,
                http_objects::EdgeConfigurationResponse,
                http_objects::EdgeConfigurationList,
                http_objects::UpdateScheduleBody,
                http_objects::UpdateScheduleStatus,
                http_objects::UpdateScheduleResponse,
                http_objects::UpdateScheduleList,
                http_objects::CreatedResponse,
            )
        ),
        tags(
            (name = "edge", description = "Edge agent API"),
            (name = "endpoints", description = "Endpoint administration"),
            (name = "edge_groups", description = "Edge group administration"),
            (name = "edge_stacks", description = "Edge stack administration"),
            (name = "edge_jobs", description = "Edge job administration"),
            (name = "edge_configurations", description = "Edge configuration administration"),
            (name = "edge_update_schedules", description = "Agent update schedules"),
        )
    )]
struct ApiDoc;

/// Largest request body, and the most a configuration archive may expand to.
pub(crate) const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    let make_span = InstanceRequestSpan::new(
        &route_state.config.env,
        &route_state.config.instance_id(),
    );

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(index))
        .route(
            "/endpoints/edge/async",
            post(async_check_in).with_state(route_state.clone()),
        )
        .route(
            "/endpoints/{id}/edge/status",
            get(status_check_in).with_state(route_state.clone()),
        )
        .route(
            "/endpoints/{id}/edge/stacks/{stack_id}",
            get(get_stack_file).with_state(route_state.clone()),
        )
        .route(
            "/endpoints/{id}/edge/stacks/{stack_id}/status",
            put(update_stack_status).with_state(route_state.clone()),
        )
        .route(
            "/endpoints/{id}/edge/jobs/{job_id}/logs",
            post(upload_job_logs).with_state(route_state.clone()),
        )
        .route(
            "/endpoints",
            post(create_endpoint)
                .get(list_endpoints)
                .with_state(route_state.clone()),
        )
        .route(
            "/endpoints/{id}",
            get(get_endpoint)
                .put(update_endpoint)
                .delete(delete_endpoint)
                .with_state(route_state.clone()),
        )
        .route(
            "/endpoints/{id}/snapshot",
            get(get_snapshot).with_state(route_state.clone()),
        )
        .route(
            "/endpoints/{id}/edge/commands",
            post(append_command).with_state(route_state.clone()),
        )
        .route(
            "/endpoints/{id}/edge/tunnel",
            post(open_tunnel).with_state(route_state.clone()),
        )
        .route(
            "/edge_groups",
            post(create_edge_group)
                .get(list_edge_groups)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_groups/{id}",
            get(get_edge_group)
                .put(update_edge_group)
                .delete(delete_edge_group)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_stacks",
            post(create_edge_stack)
                .get(list_edge_stacks)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_stacks/{id}",
            get(get_edge_stack)
                .put(update_edge_stack)
                .delete(delete_edge_stack)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_jobs",
            post(create_edge_job)
                .get(list_edge_jobs)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_jobs/{id}",
            get(get_edge_job)
                .delete(delete_edge_job)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_jobs/{id}/tasks/{endpoint_id}/logs",
            post(request_job_logs)
                .get(get_job_logs)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_configurations",
            post(create_edge_configuration)
                .get(list_edge_configurations)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_configurations/{id}",
            get(get_edge_configuration)
                .put(update_edge_configuration)
                .delete(delete_edge_configuration)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_configurations/{id}/files",
            get(get_edge_configuration_files).with_state(route_state.clone()),
        )
        .route(
            "/edge_configurations/{id}/{state}",
            put(transition_edge_configuration).with_state(route_state.clone()),
        )
        .route(
            "/edge_update_schedules",
            post(create_update_schedule)
                .get(list_update_schedules)
                .with_state(route_state.clone()),
        )
        .route(
            "/edge_update_schedules/{id}",
            get(get_update_schedule)
                .put(update_update_schedule)
                .delete(delete_update_schedule)
                .with_state(route_state.clone()),
        )
        .layer(TraceLayer::new_for_http().make_span_with(make_span))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

async fn index() -> &'static str {
    "Edge Server"
}
