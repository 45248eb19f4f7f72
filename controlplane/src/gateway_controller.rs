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

//! The gateway-side reconciler. Owns exactly one resource per relation:
//! the gateway Deployment named in the relation spec. It publishes the
//! endpoint identity and the tunnel health indicator on the relation and
//! never touches any consumer's workload.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{controller::Action, watcher::Config, Controller},
    ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::consts::{GATEWAY_AGENT_CONTAINER, GATEWAY_FINALIZER, VERIFY_TIMEOUT_SECONDS};
use crate::patch::{self, PatchState, WorkloadPatch};
use crate::relation::{Phase, Side, TunnelRelation};
use crate::{relation, utils, Context, Error, Result};

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
        return retract(&relation_api, &deployment_api, &rel, &name).await;
    }

    if let Err(error) = relation::validate_spec(&rel.spec) {
        warn!(relation = %name, %error, "rejecting invalid relation");
        relation::set_side_phase(
            &relation_api,
            &rel,
            Side::Gateway,
            Phase::Error,
            Some(error.to_string()),
        )
        .await?;
        return Ok(Action::await_change());
    }

    utils::ensure_finalizer(&relation_api, &rel, GATEWAY_FINALIZER).await?;

    // The endpoint identity consumers will resolve: the stable Service
    // name, never an address.
    let endpoint = format!("{}.{}.svc.cluster.local", rel.spec.gateway.service, ns);

    let deployment_name = rel.spec.gateway.deployment.clone();
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
                Side::Gateway,
                Phase::Error,
                Some(format!("gateway deployment {deployment_name} not found")),
            )
            .await?;
            return Ok(Action::await_change());
        }
    };

    // Single active gateway. Two live gateways sharing one overlay segment
    // corrupt routing, so a scaled-up Deployment is refused outright.
    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    if replicas > 1 {
        let reason = format!(
            "gateway deployment {deployment_name} is scaled to {replicas} replicas; \
             only one gateway instance may serve overlay {}",
            rel.spec.overlay_id
        );
        error!(relation = %name, %reason, "refusing to reconcile");
        relation::publish_gateway_data(&relation_api, &rel, &endpoint, false).await?;
        relation::set_side_phase(&relation_api, &rel, Side::Gateway, Phase::Error, Some(reason))
            .await?;
        return Ok(Action::await_change());
    }

    let pod_spec = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .ok_or(Error::InvalidConfigError(
            "gateway deployment has no pod template spec".to_string(),
        ))?;

    let desired = WorkloadPatch::gateway(
        &name,
        &ctx.agent_image,
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
                Side::Gateway,
                Phase::Error,
                Some(error.to_string()),
            )
            .await?;
            Ok(Action::await_change())
        }
        PatchState::Absent | PatchState::Stale => {
            // Lost-update guard: never commit a patch for a relation that
            // was removed while this pass was in flight.
            match relation_api.get_opt(&name).await.map_err(Error::KubeError)? {
                Some(current) if current.metadata.deletion_timestamp.is_none() => {}
                _ => {
                    debug!(relation = %name, "relation removed mid-reconcile; dropping stale patch");
                    return Ok(Action::await_change());
                }
            }

            info!(relation = %name, deployment = %deployment_name, "patching gateway workload");
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

            // The workload is restarting; health cannot be claimed until
            // the new instance verifies.
            relation::publish_gateway_data(&relation_api, &rel, &endpoint, false).await?;
            relation::set_side_phase(&relation_api, &rel, Side::Gateway, Phase::Patching, None)
                .await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        PatchState::Current => {
            if utils::agent_ready(client, &ns, &deployment, GATEWAY_AGENT_CONTAINER).await? {
                relation::publish_gateway_data(&relation_api, &rel, &endpoint, true).await?;
                relation::set_side_phase(&relation_api, &rel, Side::Gateway, Phase::Ready, None)
                    .await?;
                return Ok(Action::requeue(Duration::from_secs(60)));
            }

            relation::publish_gateway_data(&relation_api, &rel, &endpoint, false).await?;

            let verifying_expired = rel
                .status
                .as_ref()
                .and_then(|status| status.gateway.as_ref())
                .map(|side| side.phase == Phase::Verifying)
                .unwrap_or(false)
                && relation::phase_age(&rel, Side::Gateway)
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
                    Side::Gateway,
                    Phase::Error,
                    Some(error.to_string()),
                )
                .await?;
                return Ok(Action::await_change());
            }

            relation::set_side_phase(&relation_api, &rel, Side::Gateway, Phase::Verifying, None)
                .await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
    }
}

async fn retract(
    relation_api: &Api<TunnelRelation>,
    deployment_api: &Api<Deployment>,
    rel: &TunnelRelation,
    name: &str,
) -> Result<Action> {
    if !rel.finalizers().iter().any(|f| f == GATEWAY_FINALIZER) {
        return Ok(Action::await_change());
    }
    info!(relation = %name, "relation removed; retracting gateway patch");
    relation::set_side_phase(relation_api, rel, Side::Gateway, Phase::Retracting, None).await?;

    let deployment_name = &rel.spec.gateway.deployment;
    if let Some(deployment) = deployment_api
        .get_opt(deployment_name)
        .await
        .map_err(Error::KubeError)?
    {
        let owned = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .map(|spec| patch::gateway_owned_by(spec, name))
            .unwrap_or(false);
        if owned {
            deployment_api
                .patch(
                    deployment_name,
                    &PatchParams::default(),
                    &Patch::Strategic(patch::gateway_retract_body()),
                )
                .await
                .map_err(Error::KubeError)?;
        }
    }

    utils::remove_finalizer(relation_api, rel, GATEWAY_FINALIZER).await?;
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
