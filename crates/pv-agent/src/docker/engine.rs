//! Docker engine source

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use bollard::models::ContainerSummary;
use bollard::query_parameters::{EventsOptions, ListContainersOptions};
use bollard::Docker;
use futures::stream::{BoxStream, StreamExt};

use pv_core::types::ContainerService;
use pv_protocol::AccessLevel;

use super::{ContainerSource, WatchError};

/// Compose project label
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Compose service label
pub const SERVICE_LABEL: &str = "com.docker.compose.service";
/// Per-service access level override
pub const ACCESS_LABEL: &str = "preview.access";
/// Marks the agent's own container, which is never published
pub const AGENT_LABEL: &str = "preview.agent";

/// Container lifecycle events that can change the published service set.
/// Exec, attach and health events are left out; they never do.
const LIFECYCLE_EVENTS: &[&str] = &[
    "create", "start", "stop", "die", "destroy", "pause", "unpause", "rename", "update",
];

/// Services of one compose project on the local Docker engine
pub struct DockerSource {
    docker: Docker,
    project: String,
    default_access: AccessLevel,
}

impl DockerSource {
    /// Connect to the local engine
    pub async fn connect(project: &str, default_access: AccessLevel) -> Result<Self, WatchError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| WatchError::Engine(format!("connecting to Docker: {}", e)))?;
        docker
            .ping()
            .await
            .map_err(|e| WatchError::Engine(format!("Docker is not responding: {}", e)))?;

        Ok(Self {
            docker,
            project: project.to_string(),
            default_access,
        })
    }

    fn project_filter(&self) -> HashMap<String, Vec<String>> {
        project_filter(&self.project)
    }
}

fn project_filter(project: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "label".to_string(),
        vec![format!("{}={}", PROJECT_LABEL, project)],
    )])
}

/// Lifecycle events of the project's containers
fn event_filters(project: &str) -> HashMap<String, Vec<String>> {
    let mut filters = project_filter(project);
    filters.insert("type".to_string(), vec!["container".to_string()]);
    filters.insert(
        "event".to_string(),
        LIFECYCLE_EVENTS.iter().map(|e| e.to_string()).collect(),
    );
    filters
}

#[async_trait]
impl ContainerSource for DockerSource {
    async fn list_services(&self) -> Result<Vec<ContainerService>, WatchError> {
        let options = ListContainersOptions {
            all: false,
            filters: Some(self.project_filter()),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| WatchError::Engine(format!("listing containers: {}", e)))?;

        Ok(services_from_containers(
            &containers,
            &self.project,
            self.default_access,
        ))
    }

    fn events(&self) -> BoxStream<'_, Result<(), WatchError>> {
        let options = EventsOptions {
            filters: Some(event_filters(&self.project)),
            ..Default::default()
        };

        self.docker
            .events(Some(options))
            .map(|event| {
                event
                    .map(|e| {
                        tracing::trace!(
                            "Container event {:?} for {:?}",
                            e.action,
                            e.actor.as_ref().and_then(|a| a.id.as_ref())
                        );
                    })
                    .map_err(|e| WatchError::Engine(format!("event stream: {}", e)))
            })
            .boxed()
    }
}

/// Group running containers by compose service and collect their TCP ports
fn services_from_containers(
    containers: &[ContainerSummary],
    project: &str,
    default_access: AccessLevel,
) -> Vec<ContainerService> {
    let mut ports: BTreeMap<String, BTreeSet<u16>> = BTreeMap::new();
    let mut access: BTreeMap<String, AccessLevel> = BTreeMap::new();

    for container in containers {
        let labels = match &container.labels {
            Some(labels) => labels,
            None => continue,
        };
        if labels.get(PROJECT_LABEL).map(String::as_str) != Some(project)
            || labels.contains_key(AGENT_LABEL)
        {
            continue;
        }
        let service = match labels.get(SERVICE_LABEL) {
            Some(service) => service.clone(),
            None => continue,
        };

        let level = match labels.get(ACCESS_LABEL) {
            Some(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    "Ignoring invalid {} label '{}' on service {}",
                    ACCESS_LABEL,
                    value,
                    service
                );
                default_access
            }),
            None => default_access,
        };
        access.entry(service.clone()).or_insert(level);

        let tcp_ports = container
            .ports
            .iter()
            .flatten()
            .filter(|p| {
                p.typ
                    .as_ref()
                    .map_or(true, |t| t.to_string().eq_ignore_ascii_case("tcp"))
            })
            .map(|p| p.private_port);
        ports.entry(service).or_default().extend(tcp_ports);
    }

    ports
        .into_iter()
        .filter(|(_, ports)| !ports.is_empty())
        .map(|(name, ports)| ContainerService {
            access: access.get(&name).copied().unwrap_or(default_access),
            host: name.clone(),
            name,
            project: project.to_string(),
            ports: ports.into_iter().collect(),
        })
        .collect()
}
