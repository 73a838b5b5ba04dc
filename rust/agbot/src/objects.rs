/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Model-store (MMS) object placement and the node-search hook. Both are
//! external collaborators of the agreement engine, consumed through
//! capability interfaces.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::exchange::{get_org, ExchangeClient};
use crate::policy::constraints_satisfied;
use crate::store::Agreement;
use crate::AgbotError;

/// Change notification for one object's placement policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ObjectPolicyChangeEvent {
    pub org: String,
    pub object_id: String,
    pub object_type: String,
    pub service_id: String,
}

/// One object's placement policy on the object-store side.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ObjectPolicy {
    pub org: String,
    pub object_id: String,
    pub object_type: String,
    pub service_id: String,
    pub constraints: Vec<String>,
}

/// Capability interface over the object-store's policy and destination
/// APIs.
#[async_trait::async_trait]
pub trait ObjectPolicyManager: Send + Sync {
    async fn object_policies_for_service(
        &self,
        org: &str,
        service_id: &str,
    ) -> Result<Vec<ObjectPolicy>, AgbotError>;

    async fn add_node_destination(
        &self,
        policy: &ObjectPolicy,
        node_id: &str,
    ) -> Result<(), AgbotError>;

    async fn remove_node_destination(
        &self,
        policy: &ObjectPolicy,
        node_id: &str,
    ) -> Result<(), AgbotError>;
}

/// Re-evaluate object placement for one agreement: walk each service,
/// fetch its object policies, and add or remove the node as a destination
/// depending on whether the node's properties still satisfy them.
pub async fn agreement_handle_mms_object_policy(
    exchange: &dyn ExchangeClient,
    obj_mgr: &dyn ObjectPolicyManager,
    agreement: &Agreement,
) -> Result<(), AgbotError> {
    let node_pol = exchange.get_node_policy(&agreement.device_id).await?;

    for service_id in &agreement.service_ids {
        let policies = obj_mgr
            .object_policies_for_service(get_org(service_id), service_id)
            .await?;
        for pol in &policies {
            if constraints_satisfied(&pol.constraints, &node_pol.properties) {
                debug!(
                    object_id = %pol.object_id,
                    node_id = %agreement.device_id,
                    "node satisfies object policy, adding destination"
                );
                obj_mgr
                    .add_node_destination(pol, &agreement.device_id)
                    .await?;
            } else {
                debug!(
                    object_id = %pol.object_id,
                    node_id = %agreement.device_id,
                    "node no longer satisfies object policy, removing destination"
                );
                obj_mgr
                    .remove_node_destination(pol, &agreement.device_id)
                    .await?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Object-store HTTP client
// ---------------------------------------------------------------------------

pub struct CssObjectPolicyManager {
    base_url: String,
    agbot_id: String,
    token: String,
    client: reqwest::Client,
}

impl CssObjectPolicyManager {
    /// # Errors
    ///
    /// Returns `AgbotError::Config` if the HTTP client cannot be built.
    pub fn new(base_url: &str, agbot_id: &str, token: &str) -> Result<Self, AgbotError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AgbotError::Config(format!("failed to create HTTP client: {e}")))?;
        let base_url = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            base_url,
            agbot_id: agbot_id.to_string(),
            token: token.to_string(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl ObjectPolicyManager for CssObjectPolicyManager {
    async fn object_policies_for_service(
        &self,
        org: &str,
        service_id: &str,
    ) -> Result<Vec<ObjectPolicy>, AgbotError> {
        let url = format!(
            "{}/api/v1/objects/{org}?service={service_id}&policy=true",
            self.base_url
        );
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.agbot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| AgbotError::TransportTransient(format!("object store unreachable: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(AgbotError::TransportFatal(format!(
                "object store returned {}",
                resp.status()
            )));
        }
        resp.json::<Vec<ObjectPolicy>>()
            .await
            .map_err(|e| AgbotError::Decode(format!("bad object policy list: {e}")))
    }

    async fn add_node_destination(
        &self,
        policy: &ObjectPolicy,
        node_id: &str,
    ) -> Result<(), AgbotError> {
        let url = format!(
            "{}/api/v1/objects/{}/{}/{}/destinations/{node_id}",
            self.base_url, policy.org, policy.object_type, policy.object_id
        );
        let resp = self
            .client
            .put(&url)
            .basic_auth(&self.agbot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| AgbotError::TransportTransient(format!("object store unreachable: {e}")))?;
        if !resp.status().is_success() {
            warn!(object_id = %policy.object_id, status = %resp.status(), "destination add rejected");
        }
        Ok(())
    }

    async fn remove_node_destination(
        &self,
        policy: &ObjectPolicy,
        node_id: &str,
    ) -> Result<(), AgbotError> {
        let url = format!(
            "{}/api/v1/objects/{}/{}/{}/destinations/{node_id}",
            self.base_url, policy.org, policy.object_type, policy.object_id
        );
        let resp = self
            .client
            .delete(&url)
            .basic_auth(&self.agbot_id, Some(&self.token))
            .send()
            .await
            .map_err(|e| AgbotError::TransportTransient(format!("object store unreachable: {e}")))?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            warn!(object_id = %policy.object_id, status = %resp.status(), "destination remove rejected");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Node search hook
// ---------------------------------------------------------------------------

/// Asks the node-search subsystem to revisit a policy so replacement
/// agreements can form after an upgrade cancel.
#[async_trait::async_trait]
pub trait NodeSearch: Send + Sync {
    async fn schedule_rescan(&self, org: &str, policy_name: &str);
}

/// Queue of pending rescans, drained by the search subsystem on its next
/// pass.
#[derive(Default)]
pub struct RescanQueue {
    pending: tokio::sync::Mutex<Vec<(String, String)>>,
}

impl RescanQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<(String, String)> {
        let mut pending = self.pending.lock().await;
        std::mem::take(&mut *pending)
    }
}

#[async_trait::async_trait]
impl NodeSearch for RescanQueue {
    async fn schedule_rescan(&self, org: &str, policy_name: &str) {
        let mut pending = self.pending.lock().await;
        let key = (org.to_string(), policy_name.to_string());
        if !pending.contains(&key) {
            info!(org = %org, policy_name = %policy_name, "scheduled policy rescan");
            pending.push(key);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rescan_queue_dedupes() {
        let q = RescanQueue::new();
        q.schedule_rescan("e2edev", "e2edev/weather").await;
        q.schedule_rescan("e2edev", "e2edev/weather").await;
        q.schedule_rescan("e2edev", "e2edev/other").await;

        let drained = q.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(q.drain().await.is_empty(), "drain clears the queue");
    }

    #[test]
    fn test_object_policy_event_roundtrip() {
        let ev = ObjectPolicyChangeEvent {
            org: "e2edev".to_string(),
            object_id: "model-7".to_string(),
            object_type: "model".to_string(),
            service_id: "e2edev/svc1".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: ObjectPolicyChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.object_id, "model-7");
        assert_eq!(back.service_id, "e2edev/svc1");
    }
}
