// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker Engine client backed by bollard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions as BollardCreateOptions, InspectContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, HostConfig as BollardHostConfig, HostConfigLogConfig,
    PortBinding as BollardPortBinding, RestartPolicy as BollardRestartPolicy,
    RestartPolicyNameEnum,
};
use futures::StreamExt;
use tracing::debug;

use super::traits::*;

/// Connector producing bollard clients over HTTP.
#[derive(Debug, Clone, Default)]
pub struct EngineConnector;

impl DockerConnector for EngineConnector {
    fn connect(&self, endpoint: &str, timeout: Duration) -> DockerResult<Arc<dyn DockerClient>> {
        Ok(Arc::new(EngineClient::connect(endpoint, timeout)?))
    }
}

/// Client for one Docker Engine endpoint.
pub struct EngineClient {
    endpoint: String,
    docker: Docker,
}

impl EngineClient {
    /// Connect to `endpoint` (`http://host:port` or `tcp://host:port`).
    pub fn connect(endpoint: &str, timeout: Duration) -> DockerResult<Self> {
        let addr = endpoint.replacen("tcp://", "http://", 1);
        let docker = Docker::connect_with_http(&addr, timeout.as_secs().max(1), bollard::API_DEFAULT_VERSION)
            .map_err(|e| DockerError::Network(format!("{}: {}", endpoint, e)))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            docker,
        })
    }
}

/// Op-specific reading of engine replies.
#[derive(Clone, Copy)]
enum Op {
    Create,
    Start,
    Stop,
    Other,
}

fn map_error(endpoint: &str, target: &str, op: Op, err: BollardError) -> DockerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match (status_code, op) {
            (404, Op::Create) => DockerError::NoSuchImage(target.to_string()),
            (404, _) => DockerError::NoSuchContainer(target.to_string()),
            (409, Op::Create) => DockerError::AlreadyExists(target.to_string()),
            (304, Op::Start) => DockerError::AlreadyRunning(target.to_string()),
            (304, Op::Stop) => DockerError::NotRunning(target.to_string()),
            (status, _) => DockerError::Api {
                status,
                message,
            },
        },
        BollardError::RequestTimeoutError => DockerError::Timeout(endpoint.to_string()),
        other => {
            let message = other.to_string();
            if message.contains("Connection refused") {
                DockerError::ConnectionRefused(endpoint.to_string())
            } else {
                DockerError::Network(format!("{}: {}", endpoint, message))
            }
        }
    }
}

fn restart_policy(policy: &RestartPolicy) -> Option<BollardRestartPolicy> {
    let name = match policy.name.as_str() {
        "" => return None,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        _ => RestartPolicyNameEnum::EMPTY,
    };
    Some(BollardRestartPolicy {
        name: Some(name),
        maximum_retry_count: Some(policy.maximum_retry_count),
    })
}

fn non_empty<T>(items: &[T]) -> Option<Vec<T>>
where
    T: Clone,
{
    (!items.is_empty()).then(|| items.to_vec())
}

fn non_empty_str(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn host_config(hc: &HostConfig) -> BollardHostConfig {
    let port_bindings = (!hc.port_bindings.is_empty()).then(|| {
        hc.port_bindings
            .iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .iter()
                    .map(|b| BollardPortBinding {
                        host_ip: non_empty_str(&b.host_ip),
                        host_port: non_empty_str(&b.host_port),
                    })
                    .collect();
                (port.clone(), Some(bindings))
            })
            .collect::<HashMap<_, _>>()
    });
    let log_config = (!hc.log_config.kind.is_empty()).then(|| HostConfigLogConfig {
        typ: Some(hc.log_config.kind.clone()),
        config: Some(
            hc.log_config
                .config
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
    });
    BollardHostConfig {
        binds: non_empty(&hc.binds),
        port_bindings,
        restart_policy: restart_policy(&hc.restart_policy),
        privileged: hc.privileged.then_some(true),
        network_mode: non_empty_str(&hc.network_mode),
        pid_mode: non_empty_str(&hc.pid_mode),
        log_config,
        ..Default::default()
    }
}

fn container_config(opts: &CreateContainerOptions) -> Config<String> {
    let c = &opts.config;
    Config {
        image: non_empty_str(&c.image),
        env: non_empty(&c.env),
        cmd: non_empty(&c.cmd),
        entrypoint: non_empty(&c.entrypoint),
        labels: (!c.labels.is_empty())
            .then(|| c.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        exposed_ports: (!c.exposed_ports.is_empty()).then(|| {
            c.exposed_ports
                .iter()
                .map(|p| (p.clone(), HashMap::new()))
                .collect()
        }),
        user: non_empty_str(&c.user),
        working_dir: non_empty_str(&c.working_dir),
        host_config: Some(host_config(&opts.host_config)),
        ..Default::default()
    }
}

#[async_trait]
impl DockerClient for EngineClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> DockerResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_error(&self.endpoint, "", Op::Other, e))
    }

    async fn pull_image(&self, opts: &PullOptions, auth: Option<&RegistryAuth>) -> DockerResult<String> {
        let options = CreateImageOptions {
            from_image: opts.repository.clone(),
            tag: opts.tag.clone(),
            ..Default::default()
        };
        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password.clone()),
            serveraddress: Some(a.server_address.clone()),
            ..Default::default()
        });
        let reference = opts.reference();
        let mut stream = self.docker.create_image(Some(options), None, credentials);
        let mut output = String::new();
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| match map_error(&self.endpoint, &reference, Op::Other, e) {
                DockerError::NoSuchContainer(r) => DockerError::NoSuchImage(r),
                other => other,
            })?;
            if let Some(status) = info.status {
                output.push_str(&status);
                output.push('\n');
            }
        }
        debug!(endpoint = %self.endpoint, image = %reference, "Image pulled");
        Ok(output)
    }

    async fn create_container(&self, opts: &CreateContainerOptions) -> DockerResult<String> {
        let options = (!opts.name.is_empty()).then(|| BollardCreateOptions {
            name: opts.name.clone(),
            platform: None,
        });
        let target = if opts.name.is_empty() {
            opts.config.image.as_str()
        } else {
            opts.name.as_str()
        };
        let created = self
            .docker
            .create_container(options, container_config(opts))
            .await
            .map_err(|e| map_error(&self.endpoint, target, Op::Create, e))?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> DockerResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error(&self.endpoint, id, Op::Start, e))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> DockerResult<()> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(|e| map_error(&self.endpoint, id, Op::Stop, e))
    }

    async fn remove_container(&self, id: &str, force: bool) -> DockerResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: false,
                    link: false,
                }),
            )
            .await
            .map_err(|e| map_error(&self.endpoint, id, Op::Other, e))
    }

    async fn inspect_container(&self, id: &str) -> DockerResult<ContainerInspect> {
        let inspected = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(&self.endpoint, id, Op::Other, e))?;
        let state = inspected.state.unwrap_or_default();
        Ok(ContainerInspect {
            id: inspected.id.unwrap_or_default(),
            name: inspected
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: inspected.image.unwrap_or_default(),
            running: state.running.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
            dead: state.dead.unwrap_or(false),
            removal_in_progress: state.status == Some(ContainerStateStatusEnum::REMOVING),
        })
    }

    async fn list_containers(&self) -> DockerResult<Vec<ContainerSummary>> {
        let listed = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_error(&self.endpoint, "", Op::Other, e))?;
        Ok(listed
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_error_by_operation() {
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "Conflict".into(),
        };
        assert!(matches!(
            map_error("http://n1:2375", "bs", Op::Create, conflict),
            DockerError::AlreadyExists(_)
        ));
        let not_modified = BollardError::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        };
        assert!(matches!(
            map_error("http://n1:2375", "bs", Op::Start, not_modified),
            DockerError::AlreadyRunning(_)
        ));
        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(map_error("http://n1:2375", "bs", Op::Stop, missing).is_not_found());
    }

    #[test]
    fn test_container_config_translation() {
        let mut opts = CreateContainerOptions {
            name: "big-sibling".into(),
            ..Default::default()
        };
        opts.config.image = "tsuru/bs:v1".into();
        opts.config.env = vec!["A=1".into()];
        opts.host_config.restart_policy = RestartPolicy::always();
        opts.host_config.privileged = true;
        opts.host_config.network_mode = "host".into();

        let config = container_config(&opts);
        assert_eq!(config.image.as_deref(), Some("tsuru/bs:v1"));
        assert_eq!(config.env, Some(vec!["A=1".to_string()]));
        assert!(config.cmd.is_none());
        let hc = config.host_config.unwrap();
        assert_eq!(hc.privileged, Some(true));
        assert_eq!(hc.network_mode.as_deref(), Some("host"));
        assert_eq!(
            hc.restart_policy.and_then(|p| p.name),
            Some(RestartPolicyNameEnum::ALWAYS)
        );
    }
}
