use actix_cors::Cors;
use actix_web::{
    get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use cadencecore::{DeploymentSpec, OrchestratorError, Value};
use cadenceruntime::{Manifest, Orchestrator};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Application state shared across handlers
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

/// Request body for a manual trigger
#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    parameters: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    run_id: Uuid,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    run_id: Uuid,
    previous_state: cadencecore::RunState,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(e: &OrchestratorError) -> HttpResponse {
    let body = ErrorResponse {
        error: e.to_string(),
    };
    match e {
        OrchestratorError::Validation(_) => HttpResponse::BadRequest().json(body),
        OrchestratorError::NotFound(_) => HttpResponse::NotFound().json(body),
        OrchestratorError::DeploymentDisabled(_) => HttpResponse::Conflict().json(body),
        _ => {
            error!("Request failed: {}", e);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "cadence"
    }))
}

/// List all deployments with their next fire time
#[get("/api/deployments")]
async fn list_deployments(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let orchestrator = &data.orchestrator;
    let upcoming: HashMap<_, _> = orchestrator.upcoming(Utc::now()).await.into_iter().collect();
    let deployments: Vec<_> = orchestrator
        .list_deployments()
        .await
        .iter()
        .map(|d| {
            serde_json::json!({
                "id": d.id,
                "name": d.name,
                "flow": d.flow.name(),
                "cron": d.trigger.schedule.expression(),
                "enabled": d.trigger.enabled,
                "tags": d.metadata.tags,
                "next_run": upcoming.get(&d.name),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(deployments))
}

/// Create or replace a deployment
#[post("/api/deployments")]
async fn create_deployment(
    data: web::Data<AppState>,
    spec: web::Json<DeploymentSpec>,
) -> ActixResult<impl Responder> {
    let spec = spec.into_inner();
    info!("Deploying: {}", spec.name);

    match data.orchestrator.deploy(spec).await {
        Ok(deployment) => Ok(HttpResponse::Created().json(deployment.as_ref())),
        Err(e) => Ok(error_response(&e)),
    }
}

#[get("/api/deployments/{name}")]
async fn get_deployment(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    match data.orchestrator.get_deployment(&path.into_inner()).await {
        Ok(deployment) => Ok(HttpResponse::Ok().json(deployment.as_ref())),
        Err(e) => Ok(error_response(&e)),
    }
}

#[actix_web::delete("/api/deployments/{name}")]
async fn delete_deployment(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let name = path.into_inner();
    match data.orchestrator.remove_deployment(&name).await {
        Ok(()) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "message": format!("Deployment {} removed", name)
        }))),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Manually trigger a deployment; the run executes in the background
#[post("/api/deployments/{name}/runs")]
async fn trigger_deployment(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: Option<web::Json<TriggerRequest>>,
) -> ActixResult<impl Responder> {
    let name = path.into_inner();
    let overrides = req.map(|r| r.into_inner().parameters).unwrap_or_default();

    match data.orchestrator.trigger(&name, overrides).await {
        Ok(run_id) => {
            info!("Triggered {}: run {}", name, run_id);
            Ok(HttpResponse::Accepted().json(TriggerResponse { run_id }))
        }
        Err(e) => Ok(error_response(&e)),
    }
}

/// Finished runs of a deployment
#[get("/api/deployments/{name}/runs")]
async fn deployment_history(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let name = path.into_inner();
    if let Err(e) = data.orchestrator.get_deployment(&name).await {
        return Ok(error_response(&e));
    }
    Ok(HttpResponse::Ok().json(data.orchestrator.history(&name).await))
}

#[get("/api/runs/{id}")]
async fn run_status(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    match data.orchestrator.status(path.into_inner()).await {
        Ok(status) => Ok(HttpResponse::Ok().json(status)),
        Err(e) => Ok(error_response(&e)),
    }
}

#[post("/api/runs/{id}/cancel")]
async fn cancel_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.orchestrator.cancel(run_id).await {
        Ok(previous_state) => Ok(HttpResponse::Ok().json(CancelResponse {
            run_id,
            previous_state,
        })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// WebSocket endpoint for real-time run events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.orchestrator.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client lagged, skipped {} events", skipped);
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List registered tasks
#[get("/api/tasks")]
async fn list_tasks(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.orchestrator.registry();
    let tasks: Vec<_> = registry
        .list_tasks()
        .iter()
        .filter_map(|id| registry.resolve(id).ok())
        .map(|spec| {
            let metadata = spec.factory.metadata();
            serde_json::json!({
                "id": spec.id,
                "description": metadata.description,
                "category": metadata.category,
                "signature": spec.signature(),
                "max_retries": spec.max_retries,
                "retry_delay_ms": spec.retry_delay.as_millis() as u64,
                "timeout_ms": spec.timeout.map(|t| t.as_millis() as u64),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(tasks))
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_deployments)
        .service(create_deployment)
        .service(get_deployment)
        .service(delete_deployment)
        .service(trigger_deployment)
        .service(deployment_history)
        .service(run_status)
        .service(cancel_run)
        .service(websocket_events)
        .service(list_tasks);
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Cadence server");

    let manifest = match std::env::var("CADENCE_MANIFEST") {
        Ok(path) => {
            info!("Loading manifest {}", path);
            Manifest::load(&path)?
        }
        Err(_) => Manifest::default(),
    };

    let registry = cadencetasks::standard_registry()?;
    let orchestrator = Arc::new(Orchestrator::new(Arc::new(registry), manifest.runtime.clone()));
    let deployed = orchestrator.deploy_all(manifest.deployments).await?;
    info!("Runtime initialized with {} deployments", deployed.len());

    let workers = orchestrator.start_workers();
    let clock = orchestrator.spawn_clock();

    let app_state = web::Data::new(AppState {
        orchestrator: orchestrator.clone(),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    info!("Server stopped, draining workers");
    orchestrator.shutdown();
    clock.await?;
    for worker in workers {
        worker.await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};
    use cadenceruntime::RuntimeConfig;

    async fn app_state() -> web::Data<AppState> {
        let registry = cadencetasks::standard_registry().unwrap();
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(registry), RuntimeConfig::default()));
        orchestrator
            .deploy(cadencetasks::buy_securities_deployment())
            .await
            .unwrap();
        orchestrator.start_workers();
        web::Data::new(AppState { orchestrator })
    }

    #[actix_web::test]
    async fn test_health() {
        let app = test::init_service(App::new().configure(routes)).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn test_trigger_and_status() {
        let state = app_state().await;
        let orchestrator = state.orchestrator.clone();
        let app = test::init_service(App::new().app_data(state).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/deployments/buy-securities-deployment/runs")
            .set_json(serde_json::json!({ "parameters": { "quantity": 5 } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = test::read_body_json(resp).await;
        let run_id: Uuid = body["run_id"].as_str().unwrap().parse().unwrap();

        orchestrator.wait(run_id).await.unwrap();
        let req = test::TestRequest::get()
            .uri(&format!("/api/runs/{}", run_id))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "completed");
        assert_eq!(body["outputs"]["buy"]["status"], "submitted");
    }

    #[actix_web::test]
    async fn test_unknown_deployment_is_not_found() {
        let app = test::init_service(App::new().app_data(app_state().await).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/deployments/missing/runs")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get()
            .uri(&format!("/api/runs/{}", Uuid::new_v4()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
