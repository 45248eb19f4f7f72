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

// Field manager for vxgate.
pub const FIELD_MANAGER: &str = "vxgate-field-manager";

// Reserved names of the injected containers. Their presence on a live
// workload spec is the ownership marker and the idempotency test; there is
// no separate ledger to drift from reality.
pub const CONSUMER_INIT_CONTAINER: &str = "vxgate-route-init";
pub const CONSUMER_AGENT_CONTAINER: &str = "vxgate-agent";
pub const GATEWAY_INIT_CONTAINER: &str = "vxgate-overlay-init";
pub const GATEWAY_AGENT_CONTAINER: &str = "vxgate-lease";

// Environment variable marking an injected container with the relation
// that owns it. A reserved container name without this marker belongs to a
// sibling subsystem and is a conflict, never something to overwrite.
pub const RELATION_ENV: &str = "VXGATE_RELATION";

// Volume shared with the external tunnel container for the gateway-side
// kill-switch rule fragment.
pub const KILLSWITCH_VOLUME: &str = "vxgate-killswitch";
pub const KILLSWITCH_MOUNT_PATH: &str = "/killswitch";

// Label used to indicate that an object is owned by a vxgate relation.
pub const OWNED_BY_RELATION_LABEL: &str = "vxgate.dev/owned-by-relation";

// Finalizers for each side's cleanup. Each side removes only its own.
pub const GATEWAY_FINALIZER: &str = "vxgate.dev/gateway-cleanup";
pub const CONSUMER_FINALIZER: &str = "vxgate.dev/consumer-cleanup";

// Image the injected agent containers run unless overridden via the
// VXGATE_AGENT_IMAGE environment variable on the controller.
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/vxgate/agent:latest";

// Bound on how long a patched workload gets to report its routing agent
// ready before reconciliation gives up and surfaces the failure.
pub const VERIFY_TIMEOUT_SECONDS: i64 = 180;
