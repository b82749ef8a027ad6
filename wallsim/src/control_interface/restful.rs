use std::{convert::Infallible, sync::Arc};

use anyhow::{Context as _, Result};
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use http::{HeaderValue, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;

use crate::config::Endpoint;
use crate::error::ErrorResponse;
use crate::topology::Role;
use crate::HTTP_RESPONSE_SERVER_HEADER;

use super::ControlInterfaceCore;

pub struct RestfulControlInterface {
    address: Endpoint,
    core: Arc<ControlInterfaceCore>,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    test_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    role: Role,
    cmd: String,
}

impl RestfulControlInterface {
    pub fn new(address: Endpoint, core: Arc<ControlInterfaceCore>) -> Self {
        Self { address, core }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = (
            self.address.host.as_deref().unwrap_or("0.0.0.0"),
            self.address.port,
        );
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {}:{}", addr.0, addr.1))?;
        tracing::info!(
            "Restful control interface listening on http://{}",
            listener.local_addr()?
        );
        Ok(listener)
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        axum::serve(listener, router(self.core.clone())).await?;

        tracing::info!("Restful control interface stopping");
        Ok(())
    }
}

pub fn router(core: Arc<ControlInterfaceCore>) -> Router {
    Router::new()
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .route("/exec", post(exec))
        .route("/tests", get(tests))
        .layer(ServiceBuilder::new().layer(axum::middleware::from_fn(add_server_header)))
        .with_state(core)
}

async fn livez(State(core): State<Arc<ControlInterfaceCore>>) -> impl IntoResponse {
    if core.livez().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ok")
    }
}

async fn readyz(State(core): State<Arc<ControlInterfaceCore>>) -> impl IntoResponse {
    if core.readyz().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ok")
    }
}

async fn start(
    State(core): State<Arc<ControlInterfaceCore>>,
    Json(request): Json<StartRequest>,
) -> Response {
    let Some(test_name) = request.test_name.filter(|name| !name.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                message: "test_name is required".to_owned(),
            }),
        )
            .into_response();
    };

    match core.start(&test_name).await {
        Ok(summary) => Json(json!({
            "status": "started",
            "details": summary.nodes,
            "containment": summary.containment,
            "preparation": summary.preparation,
            "hardening": summary.hardening,
            "bootstrap": summary.bootstrap,
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(test = %test_name, error = %e, "Failed to start topology");
            e.into_response()
        }
    }
}

async fn stop(State(core): State<Arc<ControlInterfaceCore>>) -> impl IntoResponse {
    let report = core.stop().await;
    Json(json!({
        "status": "stopped",
        "failures": report.failures(),
    }))
}

async fn status(State(core): State<Arc<ControlInterfaceCore>>) -> impl IntoResponse {
    Json(core.status().await)
}

async fn exec(
    State(core): State<Arc<ControlInterfaceCore>>,
    Json(request): Json<ExecRequest>,
) -> impl IntoResponse {
    Json(core.exec(request.role, &request.cmd).await)
}

async fn tests(State(core): State<Arc<ControlInterfaceCore>>) -> Response {
    match core.tests().await {
        Ok(tests) => Json(json!({ "tests": tests })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn add_server_header(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<axum::response::Response, Infallible> {
    let mut res = next.run(req).await;
    res.headers_mut().insert(
        "Server",
        HeaderValue::from_static(HTTP_RESPONSE_SERVER_HEADER),
    );
    Ok(res)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use axum::body::Body;
    use http::Request;
    use http_body_util::BodyExt as _;
    use serde_json::Value;
    use tower::ServiceExt as _;

    use super::*;
    use crate::config::tests::write_default_test;
    use crate::config::TopologyArgs;
    use crate::engine::mock::MockEngine;
    use crate::engine::ContainerEngine;
    use crate::state::WallsimState;
    use crate::topology::orchestrator::Orchestrator;

    fn app(base: &Path, engine: Arc<MockEngine>) -> (Router, Arc<WallsimState>) {
        let orchestrator = Arc::new(Orchestrator::new(
            engine as Arc<dyn ContainerEngine>,
            base.to_path_buf(),
            TopologyArgs::default(),
        ));
        let state = Arc::new(WallsimState::new());
        let core = Arc::new(ControlInterfaceCore::new(orchestrator, state.clone()));
        (router(core), state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => request.body(Body::empty())?,
        };
        let response = app.clone().oneshot(request).await?;
        assert_eq!(
            response.headers().get("Server").map(|v| v.as_bytes()),
            Some(HTTP_RESPONSE_SERVER_HEADER.as_bytes())
        );
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Ok((status, value))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_probes() -> Result<()> {
        let base = tempfile::tempdir()?;
        let (app, state) = app(base.path(), Arc::new(MockEngine::new()));

        assert_eq!(call(&app, "GET", "/livez", None).await?.0, StatusCode::OK);
        assert_eq!(
            call(&app, "GET", "/readyz", None).await?.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        let _ = state.ready.0.send(true);
        assert_eq!(call(&app, "GET", "/readyz", None).await?.0, StatusCode::OK);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_lifecycle_over_http() -> Result<()> {
        let base = tempfile::tempdir()?;
        write_default_test(base.path(), "demo")?;
        let engine = Arc::new(MockEngine::new());
        let (app, _) = app(base.path(), engine.clone());

        let (code, body) = call(&app, "GET", "/tests", None).await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, json!({ "tests": ["demo"] }));

        let (code, body) = call(&app, "POST", "/start", Some(json!({}))).await?;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "test_name is required");

        let (code, body) = call(&app, "POST", "/start", Some(json!({ "test_name": "demo" }))).await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "started");
        assert_eq!(
            body["details"],
            json!({ "W": "running", "A": "running", "B": "running" })
        );
        assert_eq!(body["containment"]["state"], "enforced");
        assert!(body["preparation"]["failures"].as_array().is_some_and(|f| f.is_empty()));

        let (code, body) = call(&app, "GET", "/status", None).await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["A"], "running");

        let (code, body) = call(
            &app,
            "POST",
            "/exec",
            Some(json!({ "role": "A", "cmd": "echo hi" })),
        )
        .await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["exit_code"], 0);
        assert_eq!(body["output"], "ran: echo hi\n");

        let (code, body) = call(&app, "POST", "/stop", None).await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, json!({ "status": "stopped", "failures": [] }));
        assert!(engine.node_names().is_empty());

        let (code, body) = call(
            &app,
            "POST",
            "/exec",
            Some(json!({ "role": "B", "cmd": "true" })),
        )
        .await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["exit_code"], 1);
        assert_eq!(body["output"], "Node B is not running");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_start_failure_is_500() -> Result<()> {
        let base = tempfile::tempdir()?;
        let (app, _) = app(base.path(), Arc::new(MockEngine::new()));

        let (code, body) = call(&app, "POST", "/start", Some(json!({ "test_name": "absent" }))).await?;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["message"]
            .as_str()
            .is_some_and(|m| m.contains("absent")));

        // A missing testee directory is an error too.
        let (code, _) = call(&app, "GET", "/tests", None).await?;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        Ok(())
    }
}
