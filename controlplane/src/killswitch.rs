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

//! The consumer-side kill switch: a platform-enforced NetworkPolicy that
//! denies all egress except the allow-listed cluster ranges. It is derived
//! from the same list the routing agent programs its exception routes
//! from, so enforcement and routing cannot drift apart. If the overlay
//! route disappears, traffic falls back to the default path — where this
//! policy blocks it outside the pod, beyond the reach of anything that
//! might have gone wrong inside it.
//!
//! The gateway-side layer of the kill switch is not here: it is the rule
//! fragment the agent writes for the tunnel container (see the agent's
//! firewall module); both layers derive from `common::effective_allow_list`.

use std::collections::BTreeMap;

use ipnet::Ipv4Net;
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyPeer, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::ObjectMeta,
    Client,
};
use serde_json::json;
use tracing::{debug, info};

use crate::consts::{FIELD_MANAGER, OWNED_BY_RELATION_LABEL};
use crate::{Error, Result};

pub fn policy_name(relation_name: &str) -> String {
    format!("vxgate-killswitch-{relation_name}")
}

/// Builds the consumer-side policy for a relation. `pod_selector` is the
/// consumer Deployment's own selector, so the policy tracks exactly the
/// pods the deployment manages.
pub fn build(
    relation_name: &str,
    namespace: &str,
    pod_selector: LabelSelector,
    allow_list: &[Ipv4Net],
) -> NetworkPolicy {
    let peers: Vec<NetworkPolicyPeer> = allow_list
        .iter()
        .map(|net| NetworkPolicyPeer {
            ip_block: Some(IPBlock {
                cidr: net.to_string(),
                except: None,
            }),
            ..Default::default()
        })
        .collect();

    let mut labels = BTreeMap::new();
    labels.insert(
        OWNED_BY_RELATION_LABEL.to_string(),
        relation_name.to_string(),
    );

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(policy_name(relation_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector,
            policy_types: Some(vec!["Egress".to_string()]),
            egress: Some(vec![NetworkPolicyEgressRule {
                to: Some(peers),
                ports: None,
            }]),
            ingress: None,
        }),
    }
}

/// The CIDRs a live policy allows, in rule order. Used for drift checks
/// and for asserting set-equality with the routing agent's exception set.
pub fn allow_list_of(policy: &NetworkPolicy) -> Vec<String> {
    policy
        .spec
        .iter()
        .flat_map(|spec| spec.egress.iter().flatten())
        .flat_map(|rule| rule.to.iter().flatten())
        .filter_map(|peer| peer.ip_block.as_ref().map(|block| block.cidr.clone()))
        .collect()
}

pub fn is_current(live: &NetworkPolicy, desired: &NetworkPolicy) -> bool {
    allow_list_of(live) == allow_list_of(desired)
        && live.spec.as_ref().map(|s| &s.pod_selector)
            == desired.spec.as_ref().map(|s| &s.pod_selector)
}

/// Applies the policy via server-side apply. Failure here must keep the
/// consumer out of `Ready`: reporting ready without the kill switch would
/// claim a safety property that does not hold.
pub async fn apply(client: Client, policy: &NetworkPolicy) -> Result<()> {
    let namespace = policy
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::PolicyApplyFailure("policy has no namespace".to_string()))?;
    let name = policy
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::PolicyApplyFailure("policy has no name".to_string()))?;

    let policy_api: Api<NetworkPolicy> = Api::namespaced(client, namespace);
    let body = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": policy.metadata,
        "spec": policy.spec,
    });
    let params = PatchParams::apply(FIELD_MANAGER).force();
    policy_api
        .patch(name, &params, &Patch::Apply(&body))
        .await
        .map_err(|e| Error::PolicyApplyFailure(e.to_string()))?;
    debug!(policy = name, "kill-switch policy applied");
    Ok(())
}

pub async fn get(client: Client, namespace: &str, relation_name: &str) -> Result<Option<NetworkPolicy>> {
    let policy_api: Api<NetworkPolicy> = Api::namespaced(client, namespace);
    policy_api
        .get_opt(&policy_name(relation_name))
        .await
        .map_err(Error::KubeError)
}

/// Removes the consumer-side policy. Removal is what stops enforcement, so
/// callers must tear routing down first; this function never reorders that.
pub async fn remove(client: Client, namespace: &str, relation_name: &str) -> Result<()> {
    let policy_api: Api<NetworkPolicy> = Api::namespaced(client, namespace);
    let name = policy_name(relation_name);
    match policy_api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(policy = %name, "kill-switch policy removed");
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(Error::KubeError(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_list() -> Vec<Ipv4Net> {
        common::effective_allow_list(&[
            "10.0.0.0/8".to_string(),
            "10.96.0.0/12".to_string(),
        ])
        .unwrap()
    }

    #[test]
    fn policy_allow_list_matches_route_exception_set() {
        // Both enforcement layers and the route program derive from the
        // same list; the policy must reproduce it exactly, order included.
        let list = allow_list();
        let policy = build("scraper-via-vpn", "default", LabelSelector::default(), &list);
        let from_policy = allow_list_of(&policy);
        let from_routes: Vec<String> = list.iter().map(|net| net.to_string()).collect();
        assert_eq!(from_policy, from_routes);
    }

    #[test]
    fn policy_is_egress_only_deny_by_default() {
        let policy = build("scraper-via-vpn", "default", LabelSelector::default(), &allow_list());
        let spec = policy.spec.as_ref().unwrap();
        assert_eq!(spec.policy_types, Some(vec!["Egress".to_string()]));
        assert!(spec.ingress.is_none());
        // a single rule listing only ipBlocks: anything outside them is
        // denied by the platform once the pod is selected
        let egress = spec.egress.as_ref().unwrap();
        assert_eq!(egress.len(), 1);
        assert!(egress[0].ports.is_none());
        assert!(egress[0]
            .to
            .as_ref()
            .unwrap()
            .iter()
            .all(|peer| peer.ip_block.is_some()
                && peer.pod_selector.is_none()
                && peer.namespace_selector.is_none()));
    }

    #[test]
    fn drift_in_the_live_policy_is_detected() {
        let list = allow_list();
        let desired = build("scraper-via-vpn", "default", LabelSelector::default(), &list);
        let mut live = desired.clone();
        live.spec
            .as_mut()
            .unwrap()
            .egress
            .as_mut()
            .unwrap()[0]
            .to
            .as_mut()
            .unwrap()
            .pop();
        assert!(!is_current(&live, &desired));
        assert!(is_current(&desired.clone(), &desired));
    }

    #[test]
    fn policy_name_is_stable_per_relation() {
        assert_eq!(
            policy_name("scraper-via-vpn"),
            "vxgate-killswitch-scraper-via-vpn"
        );
    }
}
