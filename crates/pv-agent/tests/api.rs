//! HTTP API tests against an in-process router

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use pv_agent::{api, AgentState, TunnelReconciler};
use pv_core::error::SessionError;
use pv_core::traits::TunnelSession;
use pv_core::types::{ContainerService, Tunnel, TunnelResult};
use pv_protocol::{AccessLevel, MachineStatusCommand};

/// Publishes one URL per service port, or fails every update
struct EchoSession {
    fail: bool,
}

#[async_trait]
impl TunnelSession for EchoSession {
    async fn update_tunnels(
        &self,
        _generation: u64,
        services: &[ContainerService],
    ) -> Result<TunnelResult, SessionError> {
        if self.fail {
            return Err(SessionError::Hello("server went away".to_string()));
        }
        Ok(TunnelResult {
            client_id: Some("client-1".to_string()),
            tunnels: services
                .iter()
                .map(|s| Tunnel {
                    project: s.project.clone(),
                    service: s.name.clone(),
                    ports: s
                        .ports
                        .iter()
                        .map(|p| (*p, vec![format!("https://{}-{}.example.test", s.name, p)]))
                        .collect::<BTreeMap<_, _>>(),
                })
                .collect(),
        })
    }
}

fn service(name: &str, port: u16) -> ContainerService {
    ContainerService {
        name: name.to_string(),
        project: "demo".to_string(),
        ports: vec![port],
        access: AccessLevel::Public,
        host: name.to_string(),
    }
}

fn app(
    fail: bool,
    machine_status: Option<MachineStatusCommand>,
) -> (TunnelReconciler<EchoSession>, Router) {
    let reconciler = TunnelReconciler::new(Arc::new(EchoSession { fail }));
    let state = AgentState::new("env1", reconciler.reader(), machine_status);
    (reconciler, api::router(Arc::new(state)))
}

async fn get(router: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, body.to_vec())
}

#[tokio::test]
async fn test_healthz() {
    let (_reconciler, router) = app(false, None);
    let (status, _, body) = get(router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn test_tunnels_returns_latest_result() {
    let (reconciler, router) = app(false, None);
    reconciler.on_services_changed(vec![service("web", 80), service("api", 3000)]);

    let (status, _, body) = get(router, "/tunnels").await;
    assert_eq!(status, StatusCode::OK);

    let result: TunnelResult = serde_json::from_slice(&body).unwrap();
    assert_eq!(result.client_id.as_deref(), Some("client-1"));
    assert_eq!(result.tunnels.len(), 2);
}

#[tokio::test]
async fn test_tunnels_filters_by_service() {
    let (reconciler, router) = app(false, None);
    reconciler.on_services_changed(vec![service("web", 80), service("api", 3000)]);

    let (status, _, body) = get(router, "/tunnels?services=api").await;
    assert_eq!(status, StatusCode::OK);

    let result: TunnelResult = serde_json::from_slice(&body).unwrap();
    assert_eq!(result.tunnels.len(), 1);
    assert_eq!(result.tunnels[0].service, "api");
    assert_eq!(
        result.tunnels[0].ports[&3000],
        vec!["https://api-3000.example.test".to_string()]
    );
}

#[tokio::test]
async fn test_tunnels_reports_failed_update() {
    let (reconciler, router) = app(true, None);
    reconciler.on_services_changed(vec![service("web", 80)]);

    let (status, _, body) = get(router, "/tunnels").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(String::from_utf8_lossy(&body).contains("server went away"));
}

#[tokio::test]
async fn test_machine_status_not_configured() {
    let (_reconciler, router) = app(false, None);
    let (status, _, _) = get(router, "/machine-status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[cfg(unix)]
#[tokio::test]
async fn test_machine_status_runs_command() {
    let command = MachineStatusCommand {
        command: vec!["echo".to_string(), "{\"load\":1}".to_string()],
        content_type: "application/json".to_string(),
    };
    let (_reconciler, router) = app(false, Some(command));

    let (status, content_type, body) = get(router, "/machine-status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    assert_eq!(String::from_utf8_lossy(&body).trim(), "{\"load\":1}");
}
