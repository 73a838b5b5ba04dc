/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! Client for the directory/exchange: the authoritative store for nodes,
//! policies, services, agreement state, and each node's encrypted mailbox.
//! Every call authenticates with the agbot id and token. 401/403 and 4xx
//! are non-transient; 5xx and network failures are transient and left to
//! the caller's retry policy.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::policy::{ExternalPolicy, Policy, Property};
use crate::AgbotError;

/// Key under `softwareVersions` carrying the agent version.
pub const AGENT_VERSION: &str = "agent";

// ---------------------------------------------------------------------------
// Org-qualified id helpers
// ---------------------------------------------------------------------------

/// The org part of an `org/id` qualified identifier.
#[must_use]
pub fn get_org(qualified: &str) -> &str {
    qualified.split_once('/').map_or("", |(org, _)| org)
}

/// The id part of an `org/id` qualified identifier. An unqualified input
/// is returned unchanged.
#[must_use]
pub fn get_id(qualified: &str) -> &str {
    qualified.split_once('/').map_or(qualified, |(_, id)| id)
}

/// Qualify an id with an org: `org/id`.
#[must_use]
pub fn form_org_spec_url(id: &str, org: &str) -> String {
    if org.is_empty() {
        id.to_string()
    } else {
        format!("{org}/{id}")
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize, Clone, Debug, Default)]
pub struct HeartbeatIntervals {
    #[serde(default, rename = "maxInterval")]
    pub max_interval: u64,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Device {
    #[serde(default, rename = "publicKey")]
    pub public_key: String,
    #[serde(default, rename = "msgEndPoint")]
    pub msg_end_point: String,
    #[serde(default, rename = "heartbeatIntv")]
    pub heartbeat_intv: HeartbeatIntervals,
    #[serde(default)]
    pub arch: String,
    #[serde(default, rename = "softwareVersions")]
    pub software_versions: HashMap<String, String>,
    #[serde(default, rename = "HAGroup")]
    pub ha_group: String,
    #[serde(default, rename = "nodeType")]
    pub node_type: String,
    #[serde(default, rename = "clusterNamespace")]
    pub cluster_namespace: String,
    #[serde(default, rename = "isNamespaceScoped")]
    pub is_namespace_scoped: bool,
}

impl Device {
    /// Node type, defaulting to `device` for records that predate the field.
    #[must_use]
    pub fn node_type(&self) -> &str {
        if self.node_type.is_empty() {
            crate::policy::DEVICE_TYPE_DEVICE
        } else {
            &self.node_type
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct GetDevicesResponse {
    #[serde(default)]
    devices: HashMap<String, Device>,
}

#[derive(Deserialize, Debug, Default)]
struct Org {
    #[serde(default, rename = "heartbeatIntv")]
    heartbeat_intv: HeartbeatIntervals,
}

#[derive(Deserialize, Debug, Default)]
struct GetOrgsResponse {
    #[serde(default)]
    orgs: HashMap<String, Org>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct ServiceDefinition {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub deployment: String,
    #[serde(default, rename = "deploymentSignature")]
    pub deployment_signature: String,
    #[serde(default, rename = "clusterDeployment")]
    pub cluster_deployment: String,
    #[serde(default, rename = "clusterDeploymentSignature")]
    pub cluster_deployment_signature: String,
}

#[derive(Deserialize, Debug, Default)]
struct GetServicesResponse {
    #[serde(default)]
    services: HashMap<String, ServiceDefinition>,
}

#[derive(Deserialize, Debug, Default)]
struct GetBusinessPoliciesResponse {
    #[serde(default, rename = "businessPolicy")]
    business_policy: HashMap<String, Policy>,
}

#[derive(Serialize, Debug)]
pub struct WorkloadAgreement {
    pub org: String,
    pub pattern: String,
    pub url: String,
}

#[derive(Serialize, Debug)]
pub struct PutAgbotAgreementState {
    pub service: WorkloadAgreement,
    pub state: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PostMessageBody {
    pub message: String,
    pub ttl: u64,
}

// ---------------------------------------------------------------------------
// Capability interface
// ---------------------------------------------------------------------------

/// What the agreement engine needs from the exchange. Pure contract; the
/// HTTP implementation lives below, tests substitute their own.
#[async_trait::async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_device(&self, device_id: &str) -> Result<Device, AgbotError>;
    async fn get_org_max_heartbeat(&self, org: &str) -> Result<u64, AgbotError>;
    async fn post_node_message(
        &self,
        device_id: &str,
        body: &PostMessageBody,
    ) -> Result<(), AgbotError>;
    async fn put_agbot_agreement_state(
        &self,
        agreement_id: &str,
        state: &PutAgbotAgreementState,
    ) -> Result<(), AgbotError>;
    async fn delete_agbot_message(&self, msg_id: i64) -> Result<(), AgbotError>;
    async fn get_service_by_id(
        &self,
        service_id: &str,
    ) -> Result<Option<ServiceDefinition>, AgbotError>;
    async fn get_service(
        &self,
        url: &str,
        org: &str,
        version: &str,
        arch: &str,
    ) -> Result<Option<ServiceDefinition>, AgbotError>;
    async fn get_merged_service_policy(
        &self,
        service_id: &str,
    ) -> Result<Option<ExternalPolicy>, AgbotError>;
    async fn get_business_policy(&self, policy_name: &str) -> Result<Policy, AgbotError>;
    async fn get_node_policy(&self, device_id: &str) -> Result<ExternalPolicy, AgbotError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpExchangeClient {
    base_url: String,
    agbot_id: String,
    token: String,
    client: reqwest::Client,
}

impl HttpExchangeClient {
    /// Build a client against `base_url` (trailing slash added if absent).
    ///
    /// # Errors
    ///
    /// Returns `AgbotError::Config` if the underlying HTTP client cannot
    /// be constructed.
    pub fn new(
        base_url: &str,
        agbot_id: &str,
        token: &str,
        request_timeout: Duration,
    ) -> Result<Self, AgbotError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AgbotError::Config(format!("failed to create HTTP client: {e}")))?;
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        Ok(Self {
            base_url,
            agbot_id: agbot_id.to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.agbot_id, Some(&self.token))
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, AgbotError> {
        let resp = req.send().await.map_err(classify_reqwest_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    /// GET returning `Ok(None)` on 404.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, AgbotError> {
        let resp = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let parsed = resp
            .json::<T>()
            .await
            .map_err(|e| AgbotError::Decode(format!("bad exchange response for {path}: {e}")))?;
        Ok(Some(parsed))
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> AgbotError {
    if status.is_server_error() {
        AgbotError::TransportTransient(format!("exchange returned {status}: {body}"))
    } else if status == reqwest::StatusCode::NOT_FOUND {
        AgbotError::NotFound(format!("exchange returned 404: {body}"))
    } else {
        // 400/401/403 and the rest of 4xx: retrying will not help.
        AgbotError::TransportFatal(format!("exchange returned {status}: {body}"))
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> AgbotError {
    AgbotError::TransportTransient(format!("exchange unreachable: {e}"))
}

#[async_trait::async_trait]
impl ExchangeClient for HttpExchangeClient {
    async fn get_device(&self, device_id: &str) -> Result<Device, AgbotError> {
        let path = format!("orgs/{}/nodes/{}", get_org(device_id), get_id(device_id));
        let resp: Option<GetDevicesResponse> = self.get_json(&path).await?;
        resp.and_then(|mut r| r.devices.remove(device_id))
            .ok_or_else(|| AgbotError::NotFound(format!("device {device_id} not in exchange")))
    }

    async fn get_org_max_heartbeat(&self, org: &str) -> Result<u64, AgbotError> {
        let resp: Option<GetOrgsResponse> = self.get_json(&format!("orgs/{org}")).await?;
        Ok(resp
            .and_then(|r| r.orgs.get(org).map(|o| o.heartbeat_intv.max_interval))
            .unwrap_or(0))
    }

    async fn post_node_message(
        &self,
        device_id: &str,
        body: &PostMessageBody,
    ) -> Result<(), AgbotError> {
        let path = format!("orgs/{}/nodes/{}/msgs", get_org(device_id), get_id(device_id));
        self.send(self.request(reqwest::Method::POST, &path).json(body))
            .await?;
        debug!(device_id = %device_id, "posted exchange message");
        Ok(())
    }

    async fn put_agbot_agreement_state(
        &self,
        agreement_id: &str,
        state: &PutAgbotAgreementState,
    ) -> Result<(), AgbotError> {
        let path = format!(
            "orgs/{}/agbots/{}/agreements/{agreement_id}",
            get_org(&self.agbot_id),
            get_id(&self.agbot_id)
        );
        self.send(self.request(reqwest::Method::PUT, &path).json(state))
            .await?;
        Ok(())
    }

    async fn delete_agbot_message(&self, msg_id: i64) -> Result<(), AgbotError> {
        let path = format!(
            "orgs/{}/agbots/{}/msgs/{msg_id}",
            get_org(&self.agbot_id),
            get_id(&self.agbot_id)
        );
        self.send(self.request(reqwest::Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn get_service_by_id(
        &self,
        service_id: &str,
    ) -> Result<Option<ServiceDefinition>, AgbotError> {
        let path = format!(
            "orgs/{}/services/{}",
            get_org(service_id),
            get_id(service_id)
        );
        let resp: Option<GetServicesResponse> = self.get_json(&path).await?;
        Ok(resp.and_then(|mut r| r.services.remove(service_id)))
    }

    async fn get_service(
        &self,
        url: &str,
        org: &str,
        version: &str,
        arch: &str,
    ) -> Result<Option<ServiceDefinition>, AgbotError> {
        let path = format!("orgs/{org}/services?url={url}&version={version}&arch={arch}");
        let resp: Option<GetServicesResponse> = self.get_json(&path).await?;
        Ok(resp.and_then(|r| r.services.into_values().next()))
    }

    async fn get_merged_service_policy(
        &self,
        service_id: &str,
    ) -> Result<Option<ExternalPolicy>, AgbotError> {
        let Some(svc) = self.get_service_by_id(service_id).await? else {
            return Ok(None);
        };
        let path = format!(
            "orgs/{}/services/{}/policy",
            get_org(service_id),
            get_id(service_id)
        );
        let mut pol: ExternalPolicy = self
            .get_json::<ExternalPolicy>(&path)
            .await?
            .unwrap_or_default();

        // Append the built-in service properties unless the publisher
        // already set them.
        let builtins = [
            ("covenant.service.url", serde_json::json!(svc.url)),
            ("covenant.service.org", serde_json::json!(get_org(service_id))),
            ("covenant.service.version", serde_json::json!(svc.version)),
            ("covenant.service.arch", serde_json::json!(svc.arch)),
        ];
        for (name, value) in builtins {
            if pol.find_property(name).is_none() {
                pol.properties.push(Property::new(name, value));
            }
        }
        Ok(Some(pol))
    }

    async fn get_business_policy(&self, policy_name: &str) -> Result<Policy, AgbotError> {
        let path = format!(
            "orgs/{}/business/policies/{}",
            get_org(policy_name),
            get_id(policy_name)
        );
        let resp: Option<GetBusinessPoliciesResponse> = self.get_json(&path).await?;
        resp.and_then(|mut r| r.business_policy.remove(policy_name))
            .ok_or_else(|| {
                AgbotError::NotFound(format!("business policy {policy_name} not in exchange"))
            })
    }

    async fn get_node_policy(&self, device_id: &str) -> Result<ExternalPolicy, AgbotError> {
        let path = format!(
            "orgs/{}/nodes/{}/policy",
            get_org(device_id),
            get_id(device_id)
        );
        let resp: Option<ExternalPolicy> = self.get_json(&path).await?;
        resp.ok_or_else(|| {
            AgbotError::NotFound(format!("node policy for {device_id} not in exchange"))
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
