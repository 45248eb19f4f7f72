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

//! Computation and merge of the container set each reconciler injects into
//! the workload it owns. The patch is computed deterministically from the
//! relation, merged without disturbing sibling containers, and recognized
//! on a live spec purely by the reserved container names plus the relation
//! marker environment variable.

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, ExecAction, PodSpec, Probe,
    SecurityContext, Volume, VolumeMount,
};
use serde_json::{json, Value};

use crate::consts::{
    CONSUMER_AGENT_CONTAINER, CONSUMER_INIT_CONTAINER, GATEWAY_AGENT_CONTAINER,
    GATEWAY_INIT_CONTAINER, KILLSWITCH_MOUNT_PATH, KILLSWITCH_VOLUME, RELATION_ENV,
};

/// How a live workload spec relates to the desired patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchState {
    /// No owned containers present; the workload is at its unpatched
    /// baseline.
    Absent,
    /// Owned containers present and identical to the desired content.
    Current,
    /// Owned containers present but stale (e.g. the disallowed CIDR list
    /// grew); a re-patch is needed.
    Stale,
    /// A container bearing a reserved name is not marked as ours. Touching
    /// it would cross an ownership boundary.
    Conflict(String),
}

#[derive(Debug, Clone)]
pub struct WorkloadPatch {
    init: Container,
    agent: Container,
    volumes: Vec<Volume>,
}

impl WorkloadPatch {
    /// The container set for the consumer side: a privileged-enough init
    /// step that programs the overlay and routes, and the probing sidecar.
    pub fn consumer(
        relation_name: &str,
        agent_image: &str,
        endpoint: &str,
        overlay_id: u32,
        disallowed_cidrs: &[String],
    ) -> WorkloadPatch {
        let shared_args = vec![
            format!("--endpoint={endpoint}"),
            format!("--vni={overlay_id}"),
            format!("--disallowed-cidrs={}", disallowed_cidrs.join(",")),
        ];
        let mut init_args = vec!["consumer-init".to_string()];
        init_args.extend(shared_args.iter().cloned());
        let mut run_args = vec!["consumer-run".to_string()];
        run_args.extend(shared_args);

        WorkloadPatch {
            init: agent_container(
                CONSUMER_INIT_CONTAINER,
                agent_image,
                init_args,
                relation_name,
                false,
            ),
            agent: with_readiness(agent_container(
                CONSUMER_AGENT_CONTAINER,
                agent_image,
                run_args,
                relation_name,
                false,
            )),
            volumes: vec![],
        }
    }

    /// The container set for the gateway side: the overlay/forwarding init
    /// step (privileged; it flips kernel forwarding state) and the lease
    /// service sidecar. Carries the shared volume the kill-switch fragment
    /// is written into for the tunnel container.
    pub fn gateway(
        relation_name: &str,
        agent_image: &str,
        overlay_id: u32,
        disallowed_cidrs: &[String],
    ) -> WorkloadPatch {
        let shared_args = vec![
            format!("--vni={overlay_id}"),
            format!("--disallowed-cidrs={}", disallowed_cidrs.join(",")),
        ];
        let mut init_args = vec!["gateway-init".to_string()];
        init_args.extend(shared_args.iter().cloned());
        let mut run_args = vec!["gateway-run".to_string()];
        run_args.extend(shared_args);

        let mut init = agent_container(
            GATEWAY_INIT_CONTAINER,
            agent_image,
            init_args,
            relation_name,
            true,
        );
        init.volume_mounts = Some(vec![VolumeMount {
            name: KILLSWITCH_VOLUME.to_string(),
            mount_path: KILLSWITCH_MOUNT_PATH.to_string(),
            ..Default::default()
        }]);

        WorkloadPatch {
            init,
            agent: with_readiness(agent_container(
                GATEWAY_AGENT_CONTAINER,
                agent_image,
                run_args,
                relation_name,
                false,
            )),
            volumes: vec![Volume {
                name: KILLSWITCH_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }],
        }
    }

    /// Merges the owned entries into a pod spec: replace-by-name when
    /// present, append when absent. Sibling containers and volumes are
    /// never removed or reordered. Applying twice is the same as applying
    /// once.
    pub fn apply_to(&self, spec: &mut PodSpec) {
        upsert(
            spec.init_containers.get_or_insert_with(Vec::new),
            self.init.clone(),
            |c| c.name.clone(),
        );
        upsert(&mut spec.containers, self.agent.clone(), |c| c.name.clone());
        for volume in &self.volumes {
            upsert(
                spec.volumes.get_or_insert_with(Vec::new),
                volume.clone(),
                |v| v.name.clone(),
            );
        }
    }

    /// Classifies a live pod spec against this patch.
    pub fn classify(&self, spec: &PodSpec, relation_name: &str) -> PatchState {
        let live_init = spec
            .init_containers
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .find(|c| c.name == self.init.name);
        let live_agent = spec.containers.iter().find(|c| c.name == self.agent.name);

        for live in [live_init, live_agent].into_iter().flatten() {
            if !is_marked(live, relation_name) {
                return PatchState::Conflict(format!(
                    "container `{}` carries a reserved name but is not owned by relation `{}`",
                    live.name, relation_name
                ));
            }
        }

        match (live_init, live_agent) {
            (None, None) => PatchState::Absent,
            (Some(live_init), Some(live_agent))
                if owned_content_equal(live_init, &self.init)
                    && owned_content_equal(live_agent, &self.agent) =>
            {
                PatchState::Current
            }
            _ => PatchState::Stale,
        }
    }

    /// Serialized form of the desired owned containers; two computations
    /// from the same relation are byte-identical.
    pub fn render(&self) -> String {
        serde_json::to_string(&json!({
            "initContainers": [self.init],
            "containers": [self.agent],
            "volumes": self.volumes,
        }))
        .expect("workload patch must serialize")
    }
}

/// Strategic-merge body removing the consumer-side owned containers and
/// nothing else.
pub fn consumer_retract_body() -> Value {
    json!({
        "spec": { "template": { "spec": {
            "initContainers": [{ "name": CONSUMER_INIT_CONTAINER, "$patch": "delete" }],
            "containers": [{ "name": CONSUMER_AGENT_CONTAINER, "$patch": "delete" }],
        }}}
    })
}

/// Strategic-merge body removing the gateway-side owned containers and the
/// kill-switch volume.
pub fn gateway_retract_body() -> Value {
    json!({
        "spec": { "template": { "spec": {
            "initContainers": [{ "name": GATEWAY_INIT_CONTAINER, "$patch": "delete" }],
            "containers": [{ "name": GATEWAY_AGENT_CONTAINER, "$patch": "delete" }],
            "volumes": [{ "name": KILLSWITCH_VOLUME, "$patch": "delete" }],
        }}}
    })
}

/// Whether either reserved consumer container name is present at all,
/// regardless of who owns it. Used to distinguish "not yet configured"
/// from "configured and self-healing" when the gateway is unhealthy.
pub fn consumer_marker_present(spec: &PodSpec) -> bool {
    named_container_present(spec, CONSUMER_INIT_CONTAINER, CONSUMER_AGENT_CONTAINER)
}

/// Whether the consumer-side reserved containers are present AND marked as
/// owned by the given relation. Retraction only ever touches owned entries.
pub fn consumer_owned_by(spec: &PodSpec, relation_name: &str) -> bool {
    named_owned_by(
        spec,
        CONSUMER_INIT_CONTAINER,
        CONSUMER_AGENT_CONTAINER,
        relation_name,
    )
}

pub fn gateway_owned_by(spec: &PodSpec, relation_name: &str) -> bool {
    named_owned_by(
        spec,
        GATEWAY_INIT_CONTAINER,
        GATEWAY_AGENT_CONTAINER,
        relation_name,
    )
}

fn named_container_present(spec: &PodSpec, init_name: &str, agent_name: &str) -> bool {
    spec.containers.iter().any(|c| c.name == agent_name)
        || spec
            .init_containers
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .any(|c| c.name == init_name)
}

fn named_owned_by(spec: &PodSpec, init_name: &str, agent_name: &str, relation_name: &str) -> bool {
    let owned = |c: &Container| {
        (c.name == init_name || c.name == agent_name) && is_marked(c, relation_name)
    };
    spec.containers.iter().any(|c| owned(c))
        || spec
            .init_containers
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .any(|c| owned(c))
}

fn agent_container(
    name: &str,
    image: &str,
    args: Vec<String>,
    relation_name: &str,
    privileged: bool,
) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        args: Some(args),
        env: Some(vec![EnvVar {
            name: RELATION_ENV.to_string(),
            value: Some(relation_name.to_string()),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            privileged: privileged.then_some(true),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn with_readiness(mut container: Container) -> Container {
    container.readiness_probe = Some(Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "test".to_string(),
                "-f".to_string(),
                common::READY_FILE.to_string(),
            ]),
        }),
        initial_delay_seconds: Some(2),
        period_seconds: Some(5),
        ..Default::default()
    });
    container
}

fn upsert<T, K: PartialEq>(list: &mut Vec<T>, item: T, key: impl Fn(&T) -> K) {
    let item_key = key(&item);
    if let Some(existing) = list.iter_mut().find(|existing| key(existing) == item_key) {
        *existing = item;
    } else {
        list.push(item);
    }
}

fn is_marked(container: &Container, relation_name: &str) -> bool {
    container
        .env
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .any(|env| env.name == RELATION_ENV && env.value.as_deref() == Some(relation_name))
}

// Compares only the fields this subsystem owns and sets; the API server
// defaults others (imagePullPolicy, terminationMessagePath, ...) and those
// must not read as drift.
fn owned_content_equal(live: &Container, desired: &Container) -> bool {
    live.image == desired.image && live.args == desired.args && live.env == desired.env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_patch() -> WorkloadPatch {
        WorkloadPatch::consumer(
            "scraper-via-vpn",
            "ghcr.io/vxgate/agent:latest",
            "vpn-gateway.default.svc.cluster.local",
            42,
            &["10.0.0.0/8".to_string(), "10.96.0.0/12".to_string()],
        )
    }

    fn base_spec_with_sibling() -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some("registry.example.com/app:v3".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn retract_from(spec: &mut PodSpec, patch: &WorkloadPatch) {
        if let Some(init_containers) = spec.init_containers.as_mut() {
            init_containers.retain(|c| c.name != patch.init.name);
        }
        spec.containers.retain(|c| c.name != patch.agent.name);
        if let Some(volumes) = spec.volumes.as_mut() {
            volumes.retain(|v| !patch.volumes.iter().any(|owned| owned.name == v.name));
        }
    }

    #[test]
    fn computation_is_deterministic() {
        assert_eq!(consumer_patch().render(), consumer_patch().render());
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let patch = consumer_patch();
        let mut once = base_spec_with_sibling();
        patch.apply_to(&mut once);
        let mut twice = once.clone();
        patch.apply_to(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn siblings_survive_and_keep_their_position() {
        let patch = consumer_patch();
        let mut spec = base_spec_with_sibling();
        patch.apply_to(&mut spec);
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[0].name, "app");
        assert_eq!(spec.containers[1].name, CONSUMER_AGENT_CONTAINER);
        assert_eq!(
            spec.init_containers.as_ref().unwrap()[0].name,
            CONSUMER_INIT_CONTAINER
        );
    }

    #[test]
    fn classify_recognizes_absent_current_and_stale() {
        let patch = consumer_patch();
        let mut spec = base_spec_with_sibling();
        assert_eq!(patch.classify(&spec, "scraper-via-vpn"), PatchState::Absent);

        patch.apply_to(&mut spec);
        assert_eq!(patch.classify(&spec, "scraper-via-vpn"), PatchState::Current);

        // the relation's CIDR list grew: same marker, different content
        let grown = WorkloadPatch::consumer(
            "scraper-via-vpn",
            "ghcr.io/vxgate/agent:latest",
            "vpn-gateway.default.svc.cluster.local",
            42,
            &[
                "10.0.0.0/8".to_string(),
                "10.96.0.0/12".to_string(),
                "192.168.0.0/16".to_string(),
            ],
        );
        assert_eq!(grown.classify(&spec, "scraper-via-vpn"), PatchState::Stale);
    }

    #[test]
    fn foreign_container_with_reserved_name_is_a_conflict() {
        let patch = consumer_patch();
        let mut spec = base_spec_with_sibling();
        spec.containers.push(Container {
            name: CONSUMER_AGENT_CONTAINER.to_string(),
            image: Some("somebody-elses:agent".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            patch.classify(&spec, "scraper-via-vpn"),
            PatchState::Conflict(_)
        ));
    }

    #[test]
    fn retract_then_reestablish_reproduces_the_patch() {
        let patch = consumer_patch();
        let mut spec = base_spec_with_sibling();
        patch.apply_to(&mut spec);
        let established = spec.clone();

        retract_from(&mut spec, &patch);
        assert_eq!(patch.classify(&spec, "scraper-via-vpn"), PatchState::Absent);
        assert_eq!(spec.containers.len(), 1);

        let identical = consumer_patch();
        identical.apply_to(&mut spec);
        assert_eq!(spec, established);
    }

    #[test]
    fn gateway_patch_carries_the_killswitch_volume() {
        let patch = WorkloadPatch::gateway(
            "scraper-via-vpn",
            "ghcr.io/vxgate/agent:latest",
            42,
            &["10.0.0.0/8".to_string()],
        );
        let mut spec = PodSpec::default();
        patch.apply_to(&mut spec);
        let volumes = spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, KILLSWITCH_VOLUME);
        let init = &spec.init_containers.as_ref().unwrap()[0];
        assert_eq!(
            init.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
        assert_eq!(
            init.volume_mounts.as_ref().unwrap()[0].mount_path,
            KILLSWITCH_MOUNT_PATH
        );
    }
}
