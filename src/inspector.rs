use crate::error::{Error, Result};
use anyhow::Context;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

static KUBECTL_ROLLOUT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
static FIELD_MANAGER: &str = "kube-digest-sync";

/// Reads what a deployment is actually running and forces it to re-pull.
pub trait DeploymentInspector {
    /// Image identifier (`registry/repo@digest`) reported by a ready, running pod of the deployment.
    async fn current_running_digest(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<String>;

    /// Stamps the restart annotation on the pod template. The container image is left untouched.
    async fn rollout_restart(&self, namespace: &str, name: &str) -> Result<()>;
}

pub async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };
    let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
    let api_server_info = client
        .apiserver_version()
        .await
        .context("Failed to reach Kubernetes API server")?;
    info!(
        "Connected to Kubernetes API server with version {}.{}, default namespace {}",
        api_server_info.major,
        api_server_info.minor,
        client.default_namespace()
    );
    Ok(client)
}

#[derive(Clone)]
pub struct KubeInspector {
    client: Client,
}

impl KubeInspector {
    pub fn new(client: Client) -> Self {
        KubeInspector { client }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        deployments.get(name).await.map_err(|source| match source {
            kube::Error::Api(response) if response.code == 404 => Error::DeploymentNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            source => Error::KubeRead {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            },
        })
    }
}

impl DeploymentInspector for KubeInspector {
    async fn current_running_digest(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<String> {
        let container_not_found = || Error::ContainerNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
            container: container.to_string(),
        };

        let deployment = self.get_deployment(namespace, name).await?;
        warn_misconfigured_image_pull_policy(&deployment, container);

        let label_selector = deployment
            .spec
            .as_ref()
            .map(|spec| format_label_selector(&spec.selector))
            .filter(|selector| !selector.is_empty())
            .ok_or_else(container_not_found)?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut pod_list = pods
            .list(&ListParams::default().labels(&label_selector))
            .await
            .map_err(|source| Error::KubeRead {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source,
            })?;

        debug!(
            "Found {} pods for deployment {}/{} with selector {}",
            pod_list.items.len(),
            namespace,
            name,
            label_selector
        );

        pod_list.items.sort_by(sort_pods_by_creation_timestamp);
        pod_list
            .items
            .iter()
            .find_map(|pod| running_image_id(pod, container))
            .map(str::to_owned)
            .ok_or_else(container_not_found)
    }

    async fn rollout_restart(&self, namespace: &str, name: &str) -> Result<()> {
        let restart_failed = |source| Error::RestartFailed {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        };

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let mut deployment = match self.get_deployment(namespace, name).await {
            Ok(deployment) => deployment,
            Err(Error::KubeRead { source, .. }) => return Err(restart_failed(source)),
            Err(err) => return Err(err),
        };

        stamp_restart_annotation(&mut deployment, &Utc::now().to_rfc3339());
        debug!(
            "Writing restart annotation {} to deployment {}/{}",
            KUBECTL_ROLLOUT_ANNOTATION, namespace, name
        );

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        deployments
            .replace(name, &params, &deployment)
            .await
            .map_err(restart_failed)?;
        Ok(())
    }
}

fn stamp_restart_annotation(deployment: &mut Deployment, timestamp: &str) {
    deployment
        .spec
        .get_or_insert_with(Default::default)
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            KUBECTL_ROLLOUT_ANNOTATION.to_string(),
            timestamp.to_string(),
        );
}

/// Renders a selector in the `key=value,key in (a,b),!key` form accepted by list calls.
pub fn format_label_selector(selector: &LabelSelector) -> String {
    let labels = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(key, value)| format!("{}={}", key, value));

    let expressions = selector
        .match_expressions
        .iter()
        .flatten()
        .filter_map(|requirement| {
            let values = requirement.values.as_deref().unwrap_or_default().join(",");
            match requirement.operator.as_str() {
                "In" => Some(format!("{} in ({})", requirement.key, values)),
                "NotIn" => Some(format!("{} notin ({})", requirement.key, values)),
                "Exists" => Some(requirement.key.clone()),
                "DoesNotExist" => Some(format!("!{}", requirement.key)),
                operator => {
                    warn!(
                        "Ignoring label selector requirement on {} with unknown operator {}",
                        requirement.key, operator
                    );
                    None
                }
            }
        });

    labels.chain(expressions).collect::<Vec<_>>().join(",")
}

/// Image identifier of `container` if the pod is running, ready and not terminating.
fn running_image_id<'a>(pod: &'a Pod, container: &str) -> Option<&'a str> {
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }
    let status = pod.status.as_ref()?;
    if status.phase.as_deref() != Some("Running") {
        return None;
    }
    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|condition| condition.type_ == "Ready" && condition.status == "True");
    if !ready {
        return None;
    }

    status
        .container_statuses
        .iter()
        .flatten()
        .find(|container_status| {
            container_status.name == container
                && container_status.ready
                && !container_status.image_id.is_empty()
        })
        .map(|container_status| container_status.image_id.as_str())
}

fn sort_pods_by_creation_timestamp(a: &Pod, b: &Pod) -> Ordering {
    let a = &a.metadata.creation_timestamp;
    let b = &b.metadata.creation_timestamp;

    b.cmp(a)
}

fn warn_misconfigured_image_pull_policy(deployment: &Deployment, container: &str) {
    let containers = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod_spec| pod_spec.containers.as_slice())
        .unwrap_or_default();

    containers
        .iter()
        .filter(|c| c.name == container)
        .filter(|c| c.image_pull_policy.as_deref() != Some("Always"))
        .for_each(|c| {
            warn!(
                "Container {} in deployment {} has imagePullPolicy {:?}. Should be 'Always', otherwise a restart will not pull the new digest",
                c.name,
                deployment.metadata.name.as_deref().unwrap_or_default(),
                c.image_pull_policy
            )
        });
}
