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

use kube::Client;
use thiserror::Error;

pub use consumer_controller::controller as consumer_controller;
pub use gateway_controller::controller as gateway_controller;

pub mod consts;
mod consumer_controller;
mod gateway_controller;
pub mod killswitch;
pub mod patch;
pub mod relation;
mod utils;

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Image the injected routing-agent containers run.
    pub agent_image: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[source] kube::Error),
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("relation schema violation: {0}")]
    SchemaViolation(String),
    #[error("patch conflict: {0}")]
    PatchConflict(String),
    #[error("verification timeout: {0}")]
    VerificationTimeout(String),
    #[error("kill-switch policy apply failed: {0}")]
    PolicyApplyFailure(String),
    #[error("error querying TunnelRelation CRD: `{0}`; are the CRDs installed?")]
    CRDNotFoundError(#[source] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
