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

//! Policy documents and the operations the agreement engine performs on
//! them: workload priority selection, property merging, constraint
//! evaluation, and terms-and-conditions construction.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::AgbotError;

pub const DEVICE_TYPE_DEVICE: &str = "device";
pub const DEVICE_TYPE_CLUSTER: &str = "cluster";

/// Namespace a cluster workload lands in when neither the deployment
/// policy nor the node names one.
pub const DEFAULT_CLUSTER_NAMESPACE: &str = "covenant-agent";

// Built-in node property names. A node republishes its policy with these
// after registration; until then re-evaluation is skipped.
pub const PROP_NODE_ARCH: &str = "covenant.arch";
pub const PROP_NODE_CPU: &str = "covenant.cpu";
pub const PROP_NODE_MEMORY: &str = "covenant.memory";
pub const PROP_NODE_PRIVILEGED: &str = "covenant.allowPrivileged";
pub const PROP_NODE_K8S_VERSION: &str = "covenant.kubernetesVersion";

// ---------------------------------------------------------------------------
// Document types
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct PolicyHeader {
    pub name: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct WorkloadPriority {
    pub priority_value: i32,
    pub retries: i32,
    pub retry_duration_s: u64,
    pub verified_duration_s: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct Workload {
    pub priority: WorkloadPriority,
    pub deployment: String,
    pub deployment_signature: String,
    pub cluster_deployment: String,
    pub cluster_deployment_signature: String,
    pub workload_password: String,
    pub arch: String,
    pub service_url: String,
    pub org: String,
    pub version: String,
}

impl Workload {
    /// Same workload from the negotiation point of view. Deployment
    /// strings are hydrated lazily from the exchange and are excluded.
    #[must_use]
    pub fn is_same(&self, other: &Workload) -> bool {
        self.service_url == other.service_url
            && self.org == other.org
            && self.version == other.version
            && self.arch == other.arch
            && self.priority.priority_value == other.priority.priority_value
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct DataVerification {
    pub enabled: bool,
    pub interval: u64,
    pub check_rate: u64,
    pub no_data_interval: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: serde_json::Value,
}

impl Property {
    #[must_use]
    pub fn new(name: &str, value: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// A bare property/constraint document, as published for nodes and
/// services. Deployment policies extend this shape in [`Policy`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct ExternalPolicy {
    pub properties: Vec<Property>,
    pub constraints: Vec<String>,
}

impl ExternalPolicy {
    #[must_use]
    pub fn find_property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Pointwise property merge. Existing properties win unless
    /// `replace_existing` is set; constraints are unioned.
    pub fn merge_with(&mut self, other: &ExternalPolicy, replace_existing: bool) {
        for prop in &other.properties {
            match self.properties.iter_mut().find(|p| p.name == prop.name) {
                Some(existing) => {
                    if replace_existing {
                        existing.value = prop.value.clone();
                    }
                }
                None => self.properties.push(prop.clone()),
            }
        }
        for c in &other.constraints {
            if !self.constraints.contains(c) {
                self.constraints.push(c.clone());
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct AgreementProtocol {
    pub name: String,
    pub protocol_version: i32,
}

/// A deployment (business) policy, a node producer policy, or a negotiated
/// terms-and-conditions document. One shape serves all three, the way a
/// single row shape serves every lifecycle stage.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct Policy {
    pub header: PolicyHeader,
    pub pattern_id: String,
    pub workloads: Vec<Workload>,
    pub properties: Vec<Property>,
    pub constraints: Vec<String>,
    pub cluster_namespace: String,
    pub data_verify: DataVerification,
    pub agreement_protocols: Vec<AgreementProtocol>,
}

/// Parse a serialized policy snapshot.
///
/// # Errors
///
/// Returns `AgbotError::Decode` when the snapshot is not valid JSON for
/// the policy shape.
pub fn demarshal_policy(s: &str) -> Result<Policy, AgbotError> {
    serde_json::from_str(s).map_err(|e| AgbotError::Decode(format!("invalid policy: {e}")))
}

/// Serialize a policy for storage or the wire.
///
/// # Errors
///
/// Returns `AgbotError::Decode` when serialization fails.
pub fn marshal_policy(p: &Policy) -> Result<String, AgbotError> {
    serde_json::to_string(p).map_err(|e| AgbotError::Decode(format!("cannot marshal policy: {e}")))
}

// ---------------------------------------------------------------------------
// Workload priority selection
// ---------------------------------------------------------------------------

/// The workload carrying exactly the given priority value. Priority 0
/// matches a policy with no priority section.
#[must_use]
pub fn get_workload_with_priority(workloads: &[Workload], priority: i32) -> Option<&Workload> {
    workloads
        .iter()
        .find(|w| w.priority.priority_value == priority)
}

/// The next workload to try after `current`: the lowest priority value
/// strictly greater than `current`. Lower values are preferred choices.
#[must_use]
pub fn get_next_workload_choice(workloads: &[Workload], current: i32) -> Option<&Workload> {
    workloads
        .iter()
        .filter(|w| w.priority.priority_value > current)
        .min_by_key(|w| w.priority.priority_value)
}

// ---------------------------------------------------------------------------
// Built-in node properties
// ---------------------------------------------------------------------------

/// True when the node policy carries every built-in property expected for
/// this node type and agent software version. A freshly registered node
/// publishes its user policy before the agent appends the built-ins; the
/// caller skips re-evaluation until the republish arrives.
#[must_use]
pub fn contains_all_builtin_node_props(
    pol: &ExternalPolicy,
    sw_version: &str,
    node_type: &str,
) -> bool {
    let mut expected = vec![PROP_NODE_ARCH, PROP_NODE_MEMORY];
    if node_type == DEVICE_TYPE_CLUSTER {
        expected.push(PROP_NODE_K8S_VERSION);
    } else {
        expected.push(PROP_NODE_CPU);
        // Agents that have never reported a version predate this property.
        if sw_version != "0.0.0" {
            expected.push(PROP_NODE_PRIVILEGED);
        }
    }
    expected.iter().all(|name| pol.find_property(name).is_some())
}

// ---------------------------------------------------------------------------
// Constraint evaluation
// ---------------------------------------------------------------------------

/// Evaluate one constraint expression against a property list.
///
/// Supports `name == value`, `name != value`, numeric `>=`, `<=`, `>`, `<`,
/// and `name exists`, joined by `AND` / `OR` (left to right). Unknown
/// expressions evaluate to false — fail closed.
#[must_use]
pub fn constraint_expression_satisfied(expr: &str, props: &[Property]) -> bool {
    let or_groups: Vec<&str> = expr.split(" OR ").collect();
    or_groups.iter().any(|group| {
        group
            .split(" AND ")
            .all(|clause| clause_satisfied(clause.trim(), props))
    })
}

fn clause_satisfied(clause: &str, props: &[Property]) -> bool {
    if let Some(name) = clause.strip_suffix(" exists") {
        return props.iter().any(|p| p.name == name.trim());
    }

    for op in ["==", "!=", ">=", "<=", ">", "<"] {
        if let Some((name, raw)) = clause.split_once(op) {
            let name = name.trim();
            let raw = raw.trim().trim_matches('"');
            let Some(prop) = props.iter().find(|p| p.name == name) else {
                return false;
            };
            return compare(op, &prop.value, raw);
        }
    }

    warn!(constraint = %clause, "unknown constraint clause, evaluating to false");
    false
}

fn compare(op: &str, value: &serde_json::Value, raw: &str) -> bool {
    match op {
        "==" => value_as_string(value) == raw,
        "!=" => value_as_string(value) != raw,
        _ => {
            let (Some(lhs), Ok(rhs)) = (value.as_f64(), raw.parse::<f64>()) else {
                return false;
            };
            match op {
                ">=" => lhs >= rhs,
                "<=" => lhs <= rhs,
                ">" => lhs > rhs,
                "<" => lhs < rhs,
                _ => false,
            }
        }
    }
}

fn value_as_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// True when every constraint in the list is satisfied by the properties.
#[must_use]
pub fn constraints_satisfied(constraints: &[String], props: &[Property]) -> bool {
    constraints
        .iter()
        .all(|c| constraint_expression_satisfied(c, props))
}

// ---------------------------------------------------------------------------
// Terms and conditions
// ---------------------------------------------------------------------------

/// Build the negotiated terms-and-conditions document: the intersection of
/// producer and consumer policies plus the single chosen workload.
///
/// # Errors
///
/// Returns `AgbotError::Invariant` when the chosen workload has no
/// service URL.
pub fn create_terms_and_conditions(
    producer: &Policy,
    consumer: &Policy,
    workload: &Workload,
    agreement_id: &str,
    default_workload_pw: &str,
    no_data_interval_s: u64,
    protocol_version: i32,
) -> Result<Policy, AgbotError> {
    if workload.service_url.is_empty() {
        return Err(AgbotError::Invariant(format!(
            "workload for agreement {agreement_id} has no service URL"
        )));
    }

    let mut merged = ExternalPolicy {
        properties: producer.properties.clone(),
        constraints: producer.constraints.clone(),
    };
    merged.merge_with(
        &ExternalPolicy {
            properties: consumer.properties.clone(),
            constraints: consumer.constraints.clone(),
        },
        false,
    );

    let mut wl = workload.clone();
    if wl.workload_password.is_empty() {
        wl.workload_password = default_workload_pw.to_string();
    }

    let mut data_verify = consumer.data_verify.clone();
    data_verify.no_data_interval = no_data_interval_s;

    Ok(Policy {
        header: PolicyHeader {
            name: format!("Combined {} {}", producer.header.name, consumer.header.name),
            version: consumer.header.version.clone(),
        },
        pattern_id: consumer.pattern_id.clone(),
        workloads: vec![wl],
        properties: merged.properties,
        constraints: merged.constraints,
        cluster_namespace: consumer.cluster_namespace.clone(),
        data_verify,
        agreement_protocols: vec![AgreementProtocol {
            name: crate::protocol::PROTOCOL_NAME.to_string(),
            protocol_version,
        }],
    })
}

// ---------------------------------------------------------------------------
// Policy manager
// ---------------------------------------------------------------------------

/// In-memory cache of the deployment policies this agbot serves, keyed by
/// org and policy name. Kept current by the dispatcher as change events
/// arrive.
#[derive(Default)]
pub struct PolicyManager {
    policies: RwLock<HashMap<String, HashMap<String, Policy>>>,
}

impl PolicyManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_policy(&self, org: &str, pol: &Policy) {
        if let Ok(mut map) = self.policies.write() {
            map.entry(org.to_string())
                .or_default()
                .insert(pol.header.name.clone(), pol.clone());
        }
    }

    pub fn delete_policy(&self, org: &str, name: &str) {
        if let Ok(mut map) = self.policies.write() {
            if let Some(org_map) = map.get_mut(org) {
                org_map.remove(name);
            }
        }
    }

    #[must_use]
    pub fn get_policy(&self, org: &str, name: &str) -> Option<Policy> {
        self.policies
            .read()
            .ok()
            .and_then(|map| map.get(org).and_then(|m| m.get(name).cloned()))
    }

    /// Compare a policy snapshot against the currently served copy.
    ///
    /// # Errors
    ///
    /// Returns a description of the difference when the served copy is
    /// missing or its content has drifted from the snapshot.
    pub fn matches_mine(&self, org: &str, pol: &Policy) -> Result<(), String> {
        match self.get_policy(org, &pol.header.name) {
            None => Err(format!("policy {}/{} is not served", org, pol.header.name)),
            Some(mine) if mine == *pol => Ok(()),
            Some(_) => Err(format!(
                "policy {}/{} content has changed",
                org, pol.header.name
            )),
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

    pub(crate) fn make_workload(priority: i32, version: &str) -> Workload {
        Workload {
            priority: WorkloadPriority {
                priority_value: priority,
                retries: 2,
                retry_duration_s: 3600,
                verified_duration_s: 52,
            },
            arch: "amd64".to_string(),
            service_url: "weather.example.com".to_string(),
            org: "e2edev".to_string(),
            version: version.to_string(),
            ..Workload::default()
        }
    }

    #[test]
    fn test_workload_priority_lookup() {
        let wls = vec![make_workload(1, "2.0"), make_workload(2, "1.0")];
        assert_eq!(get_workload_with_priority(&wls, 2).unwrap().version, "1.0");
        assert!(get_workload_with_priority(&wls, 3).is_none());
        assert!(get_workload_with_priority(&wls, 0).is_none());
    }

    #[test]
    fn test_next_workload_choice_walks_ascending() {
        let wls = vec![make_workload(3, "1.0"), make_workload(1, "3.0"), make_workload(2, "2.0")];
        assert_eq!(get_next_workload_choice(&wls, -1).unwrap().version, "3.0");
        assert_eq!(get_next_workload_choice(&wls, 1).unwrap().version, "2.0");
        assert_eq!(get_next_workload_choice(&wls, 2).unwrap().version, "1.0");
        assert!(get_next_workload_choice(&wls, 3).is_none());
    }

    #[test]
    fn test_workload_is_same_ignores_deployment() {
        let mut a = make_workload(1, "2.0");
        let mut b = make_workload(1, "2.0");
        b.deployment = "hydrated-later".to_string();
        assert!(a.is_same(&b), "deployment strings are excluded");
        a.version = "2.1".to_string();
        assert!(!a.is_same(&b));
    }

    #[test]
    fn test_merge_keeps_existing_properties() {
        let mut base = ExternalPolicy {
            properties: vec![Property::new("cpu", serde_json::json!(4))],
            constraints: vec!["region == eu".to_string()],
        };
        let other = ExternalPolicy {
            properties: vec![
                Property::new("cpu", serde_json::json!(8)),
                Property::new("gpu", serde_json::json!(true)),
            ],
            constraints: vec!["region == eu".to_string(), "tier == gold".to_string()],
        };
        base.merge_with(&other, false);
        assert_eq!(base.find_property("cpu").unwrap().value, serde_json::json!(4));
        assert!(base.find_property("gpu").is_some());
        assert_eq!(base.constraints.len(), 2, "constraints are unioned");
    }

    #[test]
    fn test_builtin_props_device() {
        let mut pol = ExternalPolicy {
            properties: vec![
                Property::new(PROP_NODE_ARCH, serde_json::json!("amd64")),
                Property::new(PROP_NODE_MEMORY, serde_json::json!(1024)),
                Property::new(PROP_NODE_CPU, serde_json::json!(2)),
            ],
            constraints: vec![],
        };
        assert!(contains_all_builtin_node_props(&pol, "0.0.0", DEVICE_TYPE_DEVICE));
        assert!(
            !contains_all_builtin_node_props(&pol, "2.30.0", DEVICE_TYPE_DEVICE),
            "versioned agents must also publish the privileged property"
        );
        pol.properties
            .push(Property::new(PROP_NODE_PRIVILEGED, serde_json::json!(false)));
        assert!(contains_all_builtin_node_props(&pol, "2.30.0", DEVICE_TYPE_DEVICE));
    }

    #[test]
    fn test_builtin_props_cluster() {
        let pol = ExternalPolicy {
            properties: vec![
                Property::new(PROP_NODE_ARCH, serde_json::json!("amd64")),
                Property::new(PROP_NODE_MEMORY, serde_json::json!(8192)),
                Property::new(PROP_NODE_K8S_VERSION, serde_json::json!("1.29")),
            ],
            constraints: vec![],
        };
        assert!(contains_all_builtin_node_props(&pol, "0.0.0", DEVICE_TYPE_CLUSTER));
    }

    #[test]
    fn test_constraint_equality_and_exists() {
        let props = vec![
            Property::new("region", serde_json::json!("eu-west")),
            Property::new("cpu", serde_json::json!(4)),
        ];
        assert!(constraint_expression_satisfied("region == eu-west", &props));
        assert!(constraint_expression_satisfied("region != us-east", &props));
        assert!(constraint_expression_satisfied("cpu exists", &props));
        assert!(!constraint_expression_satisfied("gpu exists", &props));
    }

    #[test]
    fn test_constraint_numeric_and_boolean_ops() {
        let props = vec![Property::new("cpu", serde_json::json!(4))];
        assert!(constraint_expression_satisfied("cpu >= 2", &props));
        assert!(!constraint_expression_satisfied("cpu > 4", &props));
        assert!(constraint_expression_satisfied("cpu > 8 OR cpu >= 4", &props));
        assert!(!constraint_expression_satisfied("cpu >= 2 AND cpu < 4", &props));
    }

    #[test]
    fn test_constraint_unknown_clause_fails_closed() {
        let props = vec![Property::new("cpu", serde_json::json!(4))];
        assert!(!constraint_expression_satisfied("cpu within [1,8]", &props));
    }

    #[test]
    fn test_constraint_missing_property_fails() {
        assert!(!constraint_expression_satisfied("cpu >= 2", &[]));
    }

    #[test]
    fn test_terms_and_conditions_shape() {
        let producer = Policy {
            header: PolicyHeader {
                name: "Policy for e2edev/node1".to_string(),
                version: "2.0".to_string(),
            },
            properties: vec![Property::new("covenant.arch", serde_json::json!("amd64"))],
            ..Policy::default()
        };
        let consumer = Policy {
            header: PolicyHeader {
                name: "e2edev/weather".to_string(),
                version: "2.0".to_string(),
            },
            properties: vec![Property::new("tier", serde_json::json!("gold"))],
            cluster_namespace: "nsA".to_string(),
            ..Policy::default()
        };
        let wl = make_workload(1, "2.0");

        let tscs =
            create_terms_and_conditions(&producer, &consumer, &wl, "ag1", "pw123", 300, 2).unwrap();

        assert_eq!(tscs.workloads.len(), 1);
        assert_eq!(tscs.workloads[0].workload_password, "pw123");
        assert_eq!(tscs.data_verify.no_data_interval, 300);
        assert_eq!(tscs.cluster_namespace, "nsA");
        assert_eq!(tscs.agreement_protocols[0].protocol_version, 2);
        assert!(tscs.properties.iter().any(|p| p.name == "covenant.arch"));
        assert!(tscs.properties.iter().any(|p| p.name == "tier"));
    }

    #[test]
    fn test_terms_and_conditions_requires_service_url() {
        let wl = Workload::default();
        let err = create_terms_and_conditions(
            &Policy::default(),
            &Policy::default(),
            &wl,
            "ag1",
            "",
            300,
            2,
        )
        .unwrap_err();
        assert!(err.to_string().contains("service URL"));
    }

    #[test]
    fn test_policy_manager_matches_mine() {
        let pm = PolicyManager::new();
        let mut pol = Policy {
            header: PolicyHeader {
                name: "e2edev/weather".to_string(),
                version: "2.0".to_string(),
            },
            ..Policy::default()
        };
        assert!(pm.matches_mine("e2edev", &pol).is_err(), "unknown policy differs");

        pm.upsert_policy("e2edev", &pol);
        assert!(pm.matches_mine("e2edev", &pol).is_ok());

        pol.workloads.push(make_workload(1, "2.0"));
        assert!(pm.matches_mine("e2edev", &pol).is_err(), "content drift detected");

        pm.delete_policy("e2edev", "e2edev/weather");
        assert!(pm.get_policy("e2edev", "e2edev/weather").is_none());
    }

    #[test]
    fn test_policy_snapshot_roundtrip() {
        let pol = Policy {
            header: PolicyHeader {
                name: "e2edev/weather".to_string(),
                version: "2.0".to_string(),
            },
            workloads: vec![make_workload(1, "2.0")],
            cluster_namespace: "nsA".to_string(),
            ..Policy::default()
        };
        let s = marshal_policy(&pol).unwrap();
        let back = demarshal_policy(&s).unwrap();
        assert_eq!(pol, back);
    }

    #[test]
    fn test_demarshal_rejects_garbage() {
        assert!(matches!(
            demarshal_policy("not json"),
            Err(AgbotError::Decode(_))
        ));
    }
}
