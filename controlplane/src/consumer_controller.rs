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

//! The consumer-side reconciler. Owns exactly one resource per relation:
//! the consumer Deployment named in the relation spec (plus the derived
//! kill-switch policy). It never touches the gateway's workload.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{controller::Action, watcher::Config, Controller},
    Client, ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::consts::{CONSUMER_AGENT_CONTAINER, CONSUMER_FINALIZER, VERIFY_TIMEOUT_SECONDS};
use crate::patch::{self, PatchState, WorkloadPatch};
use crate::relation::{Phase, Side, TunnelRelation, TunnelRelationStatus};
use crate::{killswitch, relation, utils, Context, Error, Result};

/// What the gateway's published data allows this pass to do.
#[derive(Debug, PartialEq, Eq)]
enum Gate {
    /// Gateway verified and endpoint known: configuration may proceed.
    Proceed(String),
    /// Gateway not (or no longer) healthy, but the consumer is already
    /// configured: its agent self-heals, the workload is left alone.
    SelfHeal,
    /// Gateway not healthy and the consumer unconfigured: do not start
    /// routing toward a tunnel that is not demonstrably up.
    Wait,
}

fn gateway_gate(status: Option<&TunnelRelationStatus>, marker_present: bool) -> Gate {
    let endpoint = status.and_then(|status| {
        status
            .tunnel_ready
            .then(|| status.endpoint.clone())
            .flatten()
    });
    match endpoint {
        Some(endpoint) => Gate::Proceed(endpoint),
        None if marker_present => Gate::SelfHeal,
        None => Gate::Wait,
    }
}

/// The lost-update guard: a patch may only be committed if its triggering
/// relation still exists and is not being deleted.
fn commit_allowed(current: Option<&TunnelRelation>) -> bool {
    matches!(current, Some(current) if current.metadata.deletion_timestamp.is_none())
}

pub async fn reconcile(rel: Arc<TunnelRelation>, ctx: Arc<Context>) -> Result<Action> {
    let client = ctx.client.clone();
    let rel = rel.as_ref();

    let name = rel
        .metadata
        .name
        .clone()
        .ok_or(Error::InvalidConfigError("invalid name".to_string()))?;
    let ns = rel
        .metadata
        .namespace
        .clone()
        .ok_or(Error::InvalidConfigError("invalid namespace".to_string()))?;

    let relation_api: Api<TunnelRelation> = Api::namespaced(client.clone(), &ns);
    let deployment_api: Api<Deployment> = Api::namespaced(client.clone(), &ns);

    if rel.metadata.deletion_timestamp.is_some() {
        return retract(&relation_api, &deployment_api, client, &rel, &name, &ns).await;
    }

    if let Err(error) = relation::validate_spec(&rel.spec) {
        warn!(relation = %name, %error, "rejecting invalid relation");
        relation::set_side_phase(
            &relation_api,
            &rel,
            Side::Consumer,
            Phase::Error,
            Some(error.to_string()),
        )
        .await?;
        return Ok(Action::await_change());
    }

    utils::ensure_finalizer(&relation_api, &rel, CONSUMER_FINALIZER).await?;

    let deployment_name = rel.spec.consumer.deployment.clone();
    let deployment = match deployment_api
        .get_opt(&deployment_name)
        .await
        .map_err(Error::KubeError)?
    {
        Some(deployment) => deployment,
        None => {
            relation::set_side_phase(
                &relation_api,
                &rel,
                Side::Consumer,
                Phase::Error,
                Some(format!("consumer deployment {deployment_name} not found")),
            )
            .await?;
            return Ok(Action::await_change());
        }
    };
    let pod_spec = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .ok_or(Error::InvalidConfigError(
            "consumer deployment has no pod template spec".to_string(),
        ))?;

    // Gate on the gateway's published data. Before configuration this is a
    // hard stop: never start routing toward a tunnel that is not
    // demonstrably up. Once the workload is patched, a transient false
    // indicator is the agent's problem to ride out, not a reason to churn
    // the workload.
    let endpoint = match gateway_gate(
        rel.status.as_ref(),
        patch::consumer_marker_present(pod_spec),
    ) {
        Gate::Proceed(endpoint) => endpoint,
        Gate::SelfHeal => {
            debug!(relation = %name, "gateway unhealthy; leaving established consumer to self-heal");
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
        Gate::Wait => {
            relation::set_side_phase(
                &relation_api,
                &rel,
                Side::Consumer,
                Phase::Unconfigured,
                Some("waiting for gateway tunnel".to_string()),
            )
            .await?;
            return Ok(Action::requeue(Duration::from_secs(10)));
        }
    };

    // The kill switch is applied (and healed on drift) before the workload
    // itself: it is independent of restart timing, and a consumer must
    // never run in its routed configuration without it.
    let allow_list = common::effective_allow_list(&rel.spec.disallowed_cidrs)
        .map_err(|e| Error::SchemaViolation(e.to_string()))?;
    let selector = deployment
        .spec
        .as_ref()
        .map(|spec| spec.selector.clone())
        .unwrap_or_default();
    let desired_policy = killswitch::build(&name, &ns, selector, &allow_list);
    let policy_current = killswitch::get(client.clone(), &ns, &name)
        .await?
        .map(|live| killswitch::is_current(&live, &desired_policy))
        .unwrap_or(false);
    if !policy_current {
        info!(relation = %name, "applying kill-switch policy");
        killswitch::apply(client.clone(), &desired_policy).await?;
    }

    let desired = WorkloadPatch::consumer(
        &name,
        &ctx.agent_image,
        &endpoint,
        rel.spec.overlay_id,
        &rel.spec.disallowed_cidrs,
    );

    match desired.classify(pod_spec, &name) {
        PatchState::Conflict(reason) => {
            let error = Error::PatchConflict(reason);
            error!(relation = %name, %error, "refusing to reconcile");
            relation::set_side_phase(
                &relation_api,
                &rel,
                Side::Consumer,
                Phase::Error,
                Some(error.to_string()),
            )
            .await?;
            Ok(Action::await_change())
        }
        PatchState::Absent | PatchState::Stale => {
            // Re-check the relation immediately before committing. An
            // in-flight pass must not re-assert a patch whose triggering
            // relation is already gone.
            let current = relation_api.get_opt(&name).await.map_err(Error::KubeError)?;
            if !commit_allowed(current.as_ref()) {
                debug!(relation = %name, "relation removed mid-reconcile; dropping stale patch");
                return Ok(Action::await_change());
            }

            info!(relation = %name, deployment = %deployment_name, "patching consumer workload");
            let mut desired_deployment = deployment.clone();
            if let Some(spec) = desired_deployment
                .spec
                .as_mut()
                .and_then(|spec| spec.template.spec.as_mut())
            {
                desired.apply_to(spec);
            }
            deployment_api
                .patch(
                    &deployment_name,
                    &PatchParams::default(),
                    &Patch::Strategic(&desired_deployment),
                )
                .await
                .map_err(Error::KubeError)?;
            relation::set_side_phase(&relation_api, &rel, Side::Consumer, Phase::Patching, None)
                .await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        PatchState::Current => {
            if utils::agent_ready(client, &ns, &deployment, CONSUMER_AGENT_CONTAINER).await? {
                relation::set_side_phase(&relation_api, &rel, Side::Consumer, Phase::Ready, None)
                    .await?;
                return Ok(Action::requeue(Duration::from_secs(60)));
            }

            let verifying_expired = rel
                .status
                .as_ref()
                .and_then(|status| status.consumer.as_ref())
                .map(|side| side.phase == Phase::Verifying)
                .unwrap_or(false)
                && relation::phase_age(&rel, Side::Consumer)
                    .map(|age| age.num_seconds() > VERIFY_TIMEOUT_SECONDS)
                    .unwrap_or(false);
            if verifying_expired {
                let error = Error::VerificationTimeout(format!(
                    "routing agent not ready within {VERIFY_TIMEOUT_SECONDS}s"
                ));
                warn!(relation = %name, %error, "giving up on verification");
                relation::set_side_phase(
                    &relation_api,
                    &rel,
                    Side::Consumer,
                    Phase::Error,
                    Some(error.to_string()),
                )
                .await?;
                return Ok(Action::await_change());
            }

            relation::set_side_phase(&relation_api, &rel, Side::Consumer, Phase::Verifying, None)
                .await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
    }
}

// Removes the owned containers first and only then the kill-switch policy:
// dropping enforcement while the overlay route program is still in place
// would open a window of unprotected egress.
async fn retract(
    relation_api: &Api<TunnelRelation>,
    deployment_api: &Api<Deployment>,
    client: Client,
    rel: &TunnelRelation,
    name: &str,
    ns: &str,
) -> Result<Action> {
    if !rel.finalizers().iter().any(|f| f == CONSUMER_FINALIZER) {
        return Ok(Action::await_change());
    }
    info!(relation = %name, "relation removed; retracting consumer patch");
    relation::set_side_phase(relation_api, rel, Side::Consumer, Phase::Retracting, None).await?;

    let deployment_name = &rel.spec.consumer.deployment;
    if let Some(deployment) = deployment_api
        .get_opt(deployment_name)
        .await
        .map_err(Error::KubeError)?
    {
        let owned = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .map(|spec| patch::consumer_owned_by(spec, name))
            .unwrap_or(false);
        if owned {
            deployment_api
                .patch(
                    deployment_name,
                    &PatchParams::default(),
                    &Patch::Strategic(patch::consumer_retract_body()),
                )
                .await
                .map_err(Error::KubeError)?;
        }
    }

    killswitch::remove(client, ns, name).await?;
    utils::remove_finalizer(relation_api, rel, CONSUMER_FINALIZER).await?;
    Ok(Action::await_change())
}

pub async fn controller(ctx: Context) -> Result<()> {
    let relation_api = Api::<TunnelRelation>::all(ctx.client.clone());
    relation_api
        .list(&ListParams::default().limit(1))
        .await
        .map_err(Error::CRDNotFoundError)?;

    Controller::new(relation_api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(ctx))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

fn error_policy(_: Arc<TunnelRelation>, error: &Error, _: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    Action::requeue(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::{ConsumerRef, GatewayRef, RoutingMethod, TunnelRelationSpec};

    fn status(tunnel_ready: bool, endpoint: Option<&str>) -> TunnelRelationStatus {
        TunnelRelationStatus {
            tunnel_ready,
            endpoint: endpoint.map(str::to_string),
            gateway: None,
            consumer: None,
        }
    }

    #[test]
    fn unhealthy_gateway_blocks_an_unconfigured_consumer() {
        // the gateway has not confirmed its tunnel: no patch may go forward
        let status = status(false, Some("gw.default.svc.cluster.local"));
        assert_eq!(gateway_gate(Some(&status), false), Gate::Wait);
        assert_eq!(gateway_gate(None, false), Gate::Wait);
    }

    #[test]
    fn unhealthy_gateway_leaves_a_configured_consumer_alone() {
        // gateway replacement is recovered by the agent in place; the
        // reconciler neither retracts nor re-patches
        let status = status(false, Some("gw.default.svc.cluster.local"));
        assert_eq!(gateway_gate(Some(&status), true), Gate::SelfHeal);
    }

    #[test]
    fn healthy_gateway_with_endpoint_proceeds() {
        let status = status(true, Some("gw.default.svc.cluster.local"));
        assert_eq!(
            gateway_gate(Some(&status), false),
            Gate::Proceed("gw.default.svc.cluster.local".to_string())
        );
    }

    #[test]
    fn health_without_an_endpoint_is_not_enough() {
        let status = status(true, None);
        assert_eq!(gateway_gate(Some(&status), false), Gate::Wait);
    }

    #[test]
    fn commit_is_refused_once_the_relation_is_gone_or_deleting() {
        assert!(!commit_allowed(None));

        let mut rel = TunnelRelation::new(
            "scraper-via-vpn",
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
                disallowed_cidrs: vec!["10.0.0.0/8".to_string()],
            },
        );
        assert!(commit_allowed(Some(&rel)));

        rel.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert!(!commit_allowed(Some(&rel)));
    }
}
