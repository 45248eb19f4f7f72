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

//! The relation contract between one gateway and one consumer. The spec is
//! authored by whoever links the two workloads and is read-only to the
//! consumer side; the status carries the gateway-published data (endpoint
//! identity, tunnel health) and each side's own reconciliation phase.
//! Everything a side acts on or publishes passes through [`validate_spec`]
//! first, so malformed data is rejected before it propagates.

use chrono::Utc;
use kube::{
    api::{Api, Patch, PatchParams},
    CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{Error, Result};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "vxgate.dev",
    version = "v1alpha1",
    kind = "TunnelRelation",
    namespaced,
    status = "TunnelRelationStatus",
    shortname = "tunrel"
)]
pub struct TunnelRelationSpec {
    pub gateway: GatewayRef,
    pub consumer: ConsumerRef,
    /// VXLAN network identifier of the overlay segment. Identical on both
    /// sides and immutable for the lifetime of the relation; renumbering a
    /// live overlay is unsupported, so changing it means recreating the
    /// relation. Collisions between unrelated relations are an operator
    /// configuration invariant and are not detected here.
    pub overlay_id: u32,
    pub routing_method: RoutingMethod,
    /// Ordered CIDR blocks that must never be routed through the overlay.
    /// At minimum the cluster's own pod, service and node ranges — without
    /// them the agent would route its own control traffic into the tunnel
    /// and deadlock.
    pub disallowed_cidrs: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRef {
    /// The gateway Deployment this relation's gateway side owns.
    pub deployment: String,
    /// Stable Service name consumers resolve to reach the gateway. This is
    /// the endpoint identity: a name, never an address.
    pub service: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    /// The consumer Deployment this relation's consumer side owns.
    pub deployment: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RoutingMethod {
    Vxlan,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRelationStatus {
    /// Health indicator published by the gateway side once its tunnel and
    /// overlay are verified. Consumers must not route through a gateway
    /// that has not set this.
    #[serde(default)]
    pub tunnel_ready: bool,
    /// Resolvable endpoint name published by the gateway side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<SideStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer: Option<SideStatus>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SideStatus {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// RFC 3339 timestamp of the last phase transition; used to bound
    /// verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Unconfigured,
    Patching,
    Verifying,
    Ready,
    Retracting,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Gateway,
    Consumer,
}

impl Side {
    fn key(&self) -> &'static str {
        match self {
            Side::Gateway => "gateway",
            Side::Consumer => "consumer",
        }
    }

    fn of<'a>(&self, status: Option<&'a TunnelRelationStatus>) -> Option<&'a SideStatus> {
        match self {
            Side::Gateway => status.and_then(|s| s.gateway.as_ref()),
            Side::Consumer => status.and_then(|s| s.consumer.as_ref()),
        }
    }
}

/// Validates a relation spec. Every reconciliation pass and every status
/// publication starts here; a violation is terminal until the relation is
/// corrected.
pub fn validate_spec(spec: &TunnelRelationSpec) -> Result<()> {
    if spec.gateway.deployment.is_empty() {
        return Err(Error::SchemaViolation(
            "gateway.deployment must not be empty".to_string(),
        ));
    }
    if spec.gateway.service.is_empty() {
        return Err(Error::SchemaViolation(
            "gateway.service must not be empty".to_string(),
        ));
    }
    if spec.consumer.deployment.is_empty() {
        return Err(Error::SchemaViolation(
            "consumer.deployment must not be empty".to_string(),
        ));
    }
    if !(common::VNI_MIN..=common::VNI_MAX).contains(&spec.overlay_id) {
        return Err(Error::SchemaViolation(format!(
            "overlayId {} outside the valid VXLAN range {}..={}",
            spec.overlay_id,
            common::VNI_MIN,
            common::VNI_MAX
        )));
    }
    if spec.disallowed_cidrs.is_empty() {
        return Err(Error::SchemaViolation(
            "disallowedCidrs must not be empty; it must carry at least the cluster's own address ranges"
                .to_string(),
        ));
    }
    common::effective_allow_list(&spec.disallowed_cidrs)
        .map_err(|e| Error::SchemaViolation(e.to_string()))?;
    Ok(())
}

/// Records one side's phase on the relation status. A no-op when nothing
/// changed, so steady-state reconcile passes do not generate watch churn;
/// `since` is only rewritten on an actual phase transition.
pub async fn set_side_phase(
    api: &Api<TunnelRelation>,
    relation: &TunnelRelation,
    side: Side,
    phase: Phase,
    reason: Option<String>,
) -> Result<()> {
    let current = side.of(relation.status.as_ref());
    if let Some(current) = current {
        if current.phase == phase && current.reason == reason {
            return Ok(());
        }
    }
    let since = match current {
        Some(current) if current.phase == phase => current.since.clone(),
        _ => Some(Utc::now().to_rfc3339()),
    };

    let name = relation.name_any();
    debug!(relation = %name, side = side.key(), ?phase, "recording phase");
    let side_status = SideStatus { phase, reason, since };
    let body = match side {
        Side::Gateway => json!({ "status": { "gateway": side_status } }),
        Side::Consumer => json!({ "status": { "consumer": side_status } }),
    };
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(body))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Publishes the gateway-side relation data (endpoint identity and tunnel
/// health). Validation runs again here: an invalid record is rejected
/// before publication, never published-then-logged.
pub async fn publish_gateway_data(
    api: &Api<TunnelRelation>,
    relation: &TunnelRelation,
    endpoint: &str,
    tunnel_ready: bool,
) -> Result<()> {
    validate_spec(&relation.spec)?;
    if endpoint.is_empty() {
        return Err(Error::SchemaViolation(
            "endpoint must not be empty".to_string(),
        ));
    }

    let unchanged = relation
        .status
        .as_ref()
        .map(|s| s.tunnel_ready == tunnel_ready && s.endpoint.as_deref() == Some(endpoint))
        .unwrap_or(false);
    if unchanged {
        return Ok(());
    }

    let name = relation.name_any();
    debug!(relation = %name, endpoint, tunnel_ready, "publishing gateway data");
    let patch = Patch::Merge(json!({
        "status": {
            "tunnelReady": tunnel_ready,
            "endpoint": endpoint,
        }
    }));
    api.patch_status(&name, &PatchParams::default(), &patch)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Age of the given side's current phase, for bounding verification.
pub fn phase_age(relation: &TunnelRelation, side: Side) -> Option<chrono::Duration> {
    let side_status = side.of(relation.status.as_ref())?;
    let since = side_status.since.as_deref()?;
    let since = chrono::DateTime::parse_from_rfc3339(since).ok()?;
    Some(Utc::now().signed_duration_since(since))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> TunnelRelationSpec {
        TunnelRelationSpec {
            gateway: GatewayRef {
                deployment: "vpn-gateway".to_string(),
                service: "vpn-gateway".to_string(),
            },
            consumer: ConsumerRef {
                deployment: "scraper".to_string(),
            },
            overlay_id: 42,
            routing_method: RoutingMethod::Vxlan,
            disallowed_cidrs: vec!["10.0.0.0/8".to_string(), "10.96.0.0/12".to_string()],
        }
    }

    #[test]
    fn valid_record_passes() {
        assert!(validate_spec(&valid_spec()).is_ok());
    }

    #[test]
    fn empty_disallowed_cidrs_is_a_schema_violation() {
        let mut spec = valid_spec();
        spec.disallowed_cidrs.clear();
        match validate_spec(&spec) {
            Err(Error::SchemaViolation(reason)) => {
                assert!(reason.contains("disallowedCidrs"))
            }
            other => panic!("expected SchemaViolation, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_cidr_is_a_schema_violation() {
        let mut spec = valid_spec();
        spec.disallowed_cidrs.push("10.0.0.0/33".to_string());
        assert!(matches!(
            validate_spec(&spec),
            Err(Error::SchemaViolation(_))
        ));
    }

    #[test]
    fn overlay_id_out_of_range_is_a_schema_violation() {
        let mut spec = valid_spec();
        spec.overlay_id = 1 << 24;
        assert!(matches!(
            validate_spec(&spec),
            Err(Error::SchemaViolation(_))
        ));
        spec.overlay_id = 0;
        assert!(matches!(
            validate_spec(&spec),
            Err(Error::SchemaViolation(_))
        ));
    }

    #[test]
    fn colliding_overlay_ids_are_not_cross_checked() {
        // Two relations sharing a VNI with different endpoints validate
        // independently: collision detection across relations is an
        // accepted operational gap, upheld by the operator.
        let first = valid_spec();
        let mut second = valid_spec();
        second.gateway.service = "other-gateway".to_string();
        assert!(validate_spec(&first).is_ok());
        assert!(validate_spec(&second).is_ok());
    }
}
