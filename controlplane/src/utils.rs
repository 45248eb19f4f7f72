/*
Copyright 2025 The vxgate Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;

use crate::relation::TunnelRelation;
use crate::{Error, Result};

pub async fn ensure_finalizer(
    api: &Api<TunnelRelation>,
    relation: &TunnelRelation,
    finalizer: &str,
) -> Result<()> {
    if relation.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let mut finalizers = relation.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = Patch::Merge(json!({ "metadata": { "finalizers": finalizers } }));
    api.patch(&relation.name_any(), &PatchParams::default(), &patch)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

pub async fn remove_finalizer(
    api: &Api<TunnelRelation>,
    relation: &TunnelRelation,
    finalizer: &str,
) -> Result<()> {
    if !relation.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = relation
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    let patch = Patch::Merge(json!({ "metadata": { "finalizers": finalizers } }));
    api.patch(&relation.name_any(), &PatchParams::default(), &patch)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Whether any live, non-terminating pod of the deployment reports the
/// named container ready.
pub async fn agent_ready(
    client: Client,
    namespace: &str,
    deployment: &Deployment,
    container: &str,
) -> Result<bool> {
    let selector = match selector_string(deployment) {
        Some(selector) => selector,
        None => return Ok(false),
    };
    let pod_api: Api<Pod> = Api::namespaced(client, namespace);
    let pods = pod_api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?;
    Ok(pods
        .items
        .iter()
        .any(|pod| container_ready(pod, container)))
}

fn selector_string(deployment: &Deployment) -> Option<String> {
    let labels = deployment
        .spec
        .as_ref()?
        .selector
        .match_labels
        .as_ref()?;
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn container_ready(pod: &Pod, container: &str) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .any(|status| status.name == container && status.ready)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use kube::core::ObjectMeta;

    fn pod_with_ready(name: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta::default(),
            spec: None,
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: name.to_string(),
                    ready,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn readiness_requires_the_named_container() {
        assert!(container_ready(&pod_with_ready("vxgate-agent", true), "vxgate-agent"));
        assert!(!container_ready(&pod_with_ready("vxgate-agent", false), "vxgate-agent"));
        assert!(!container_ready(&pod_with_ready("other", true), "vxgate-agent"));
    }

    #[test]
    fn terminating_pods_never_count_as_ready() {
        let mut pod = pod_with_ready("vxgate-agent", true);
        pod.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            ));
        assert!(!container_ready(&pod, "vxgate-agent"));
    }
}
