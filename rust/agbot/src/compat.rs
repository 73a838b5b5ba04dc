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

//! Re-evaluation of an in-flight agreement against the policies as they
//! stand now: node/deployment compatibility, workload priority drift, and
//! cluster namespace drift.

use tracing::{debug, error, info, trace, warn};

use crate::exchange::AGENT_VERSION;
use crate::handler::ConsumerProtocolHandler;
use crate::policy::{
    constraints_satisfied, contains_all_builtin_node_props, create_terms_and_conditions,
    get_next_workload_choice, get_workload_with_priority, ExternalPolicy, Policy, PolicyHeader,
    DEFAULT_CLUSTER_NAMESPACE, DEVICE_TYPE_CLUSTER,
};
use crate::protocol::{MSG_UPDATE_TYPE_POLICY_CHANGE, PROTOCOL_CURRENT_VERSION};
use crate::store::Agreement;

/// Outcome of the node/policy compatibility check, carrying the producer
/// and consumer policies derived along the way.
pub struct CompatCheck {
    pub compatible: bool,
    pub reason: String,
    pub producer_policy: Policy,
    pub consumer_policy: Policy,
}

/// Check a node against a deployment policy and the merged service
/// policy. Compatibility requires an architecture match plus constraint
/// satisfaction in both directions.
#[must_use]
pub fn check_policy_compatibility(
    node_id: &str,
    node_pol: &ExternalPolicy,
    bus_pol: &Policy,
    svc_pol: &ExternalPolicy,
    node_arch: &str,
) -> CompatCheck {
    let mut consumer = bus_pol.clone();
    let mut merged = ExternalPolicy {
        properties: consumer.properties.clone(),
        constraints: consumer.constraints.clone(),
    };
    merged.merge_with(svc_pol, false);
    consumer.properties = merged.properties;
    consumer.constraints = merged.constraints;

    let producer = Policy {
        header: PolicyHeader {
            name: format!("Policy for {node_id}"),
            version: bus_pol.header.version.clone(),
        },
        properties: node_pol.properties.clone(),
        constraints: node_pol.constraints.clone(),
        ..Policy::default()
    };

    let arch_ok = consumer
        .workloads
        .iter()
        .any(|w| w.arch.is_empty() || w.arch == "*" || w.arch == node_arch);
    if !arch_ok {
        return CompatCheck {
            compatible: false,
            reason: format!("no workload matches node architecture {node_arch}"),
            producer_policy: producer,
            consumer_policy: consumer,
        };
    }

    if !constraints_satisfied(&consumer.constraints, &producer.properties) {
        return CompatCheck {
            compatible: false,
            reason: "node properties do not satisfy policy constraints".to_string(),
            producer_policy: producer,
            consumer_policy: consumer,
        };
    }

    if !constraints_satisfied(&producer.constraints, &consumer.properties) {
        return CompatCheck {
            compatible: false,
            reason: "policy properties do not satisfy node constraints".to_string(),
            producer_policy: producer,
            consumer_policy: consumer,
        };
    }

    CompatCheck {
        compatible: true,
        reason: String::new(),
        producer_policy: producer,
        consumer_policy: consumer,
    }
}

/// Decide the namespace a cluster workload lands in and whether the node
/// can host it. Returns `(compatible, consumer_namespace, reason)`.
#[must_use]
pub fn check_cluster_namespace_compatibility(
    node_type: &str,
    node_namespace: &str,
    is_namespace_scoped: bool,
    bus_pol_namespace: &str,
) -> (bool, String, String) {
    if node_type != DEVICE_TYPE_CLUSTER {
        return (true, String::new(), String::new());
    }

    let consumer_namespace = if !bus_pol_namespace.is_empty() {
        bus_pol_namespace.to_string()
    } else if !node_namespace.is_empty() {
        node_namespace.to_string()
    } else {
        DEFAULT_CLUSTER_NAMESPACE.to_string()
    };

    // A namespace-scoped agent can only deploy into its own namespace.
    if is_namespace_scoped && consumer_namespace != node_namespace {
        return (
            false,
            consumer_namespace.clone(),
            format!(
                "node is scoped to namespace {node_namespace}, policy requires {consumer_namespace}"
            ),
        );
    }

    (true, consumer_namespace, String::new())
}

impl ConsumerProtocolHandler {
    /// Re-evaluate one agreement after a policy change.
    ///
    /// Returns `(policy_matches, no_new_priority, cluster_ns_unchanged)`:
    /// the policy still matches the node, no higher-priority workload was
    /// added or modified, and the cluster namespace is unchanged. The
    /// third value only matters for cluster nodes. Every error path
    /// returns `(false, false, false)`.
    ///
    /// When the derived consumer policy differs from the old snapshot and
    /// the agreement remains valid, an agreement update carrying new
    /// terms and conditions is dispatched as a side effect.
    pub async fn handle_policy_change_for_agreement(
        &self,
        ag: &Agreement,
        old_policy: Option<&Policy>,
    ) -> (bool, bool, bool) {
        trace!(agreement_id = %ag.current_agreement_id, "re-evaluating agreement after policy change");

        // Merged service policy across the agreement's services.
        let mut svc_all_pol = ExternalPolicy::default();
        for service_id in &ag.service_ids {
            match self.exchange().get_service_by_id(service_id).await {
                Err(e) => {
                    error!(service_id = %service_id, error = %e, "failed to get service");
                    return (false, false, false);
                }
                Ok(None) => continue,
                Ok(Some(_)) => match self.exchange().get_merged_service_policy(service_id).await {
                    Err(e) => {
                        error!(service_id = %service_id, error = %e, "failed to get merged service policy");
                        return (false, false, false);
                    }
                    Ok(Some(merged)) => svc_all_pol.merge_with(&merged, false),
                    Ok(None) => {}
                },
            }
        }

        let bus_pol = match self.exchange().get_business_policy(&ag.policy_name).await {
            Ok(p) => p,
            Err(e) => {
                error!(policy_name = %ag.policy_name, error = %e, "failed to get business policy");
                return (false, false, false);
            }
        };

        let node_pol = match self.exchange().get_node_policy(&ag.device_id).await {
            Ok(p) => p,
            Err(e) => {
                error!(device_id = %ag.device_id, error = %e, "failed to get node policy");
                return (false, false, false);
            }
        };

        let device = match self.exchange().get_device(&ag.device_id).await {
            Ok(d) => d,
            Err(e) => {
                error!(device_id = %ag.device_id, error = %e, "failed to get node");
                return (false, false, false);
            }
        };

        let node_arch = self.config().agbot.canonical_arch(&device.arch).to_string();
        let sw_version = device
            .software_versions
            .get(AGENT_VERSION)
            .map_or("0.0.0", String::as_str);

        // The node has not republished its built-in properties yet; this
        // re-evaluation runs again when it does.
        if !contains_all_builtin_node_props(&node_pol, sw_version, device.node_type()) {
            debug!(device_id = %ag.device_id, "node policy missing built-in properties, skipping re-evaluation");
            return (true, true, true);
        }

        let check = check_policy_compatibility(
            &ag.device_id,
            &node_pol,
            &bus_pol,
            &svc_all_pol,
            &node_arch,
        );
        if !check.compatible {
            info!(
                agreement_id = %ag.current_agreement_id,
                reason = %check.reason,
                "agreement is no longer in policy"
            );
            return (false, true, false);
        }

        // No updates mid-negotiation.
        if ag.agreement_finalized_time == 0 {
            return (true, true, true);
        }

        let usage = match self
            .db()
            .find_single_workload_usage(&ag.device_id, &ag.policy_name)
            .await
        {
            Ok(u) => u,
            Err(e) => {
                error!(device_id = %ag.device_id, error = %e, "failed to read workload usage");
                return (false, false, false);
            }
        };
        let usage_priority = usage.map_or(0, |u| u.priority);

        // Priority 0 means the agreement never recorded priority
        // information; additions and removals of priorities cannot
        // invalidate it.
        let chosen = if usage_priority == 0 {
            get_workload_with_priority(&bus_pol.workloads, 0)
                .or_else(|| get_next_workload_choice(&bus_pol.workloads, -1))
        } else {
            let deployed = get_workload_with_priority(&bus_pol.workloads, usage_priority);
            if deployed.is_none() {
                info!(
                    agreement_id = %ag.current_agreement_id,
                    priority = usage_priority,
                    "deployed workload priority is no longer in the policy"
                );
                return (true, false, false);
            }
            deployed
        };
        let Some(chosen) = chosen else {
            // Unreachable past the compatibility check, which requires a
            // workload to have matched.
            return (true, true, true);
        };
        let mut workload = chosen.clone();

        if let Some(old) = old_policy {
            if usage_priority > 0 {
                // Walk every priority, old or new, that outranks or equals
                // the deployed one. An entry added, removed, or modified in
                // that range changes which workload the node should run.
                let mut priorities: Vec<i32> = bus_pol
                    .workloads
                    .iter()
                    .chain(old.workloads.iter())
                    .map(|w| w.priority.priority_value)
                    .filter(|p| *p > 0 && *p <= usage_priority)
                    .collect();
                priorities.sort_unstable();
                priorities.dedup();
                for priority in priorities {
                    let new_wl = get_workload_with_priority(&bus_pol.workloads, priority);
                    let old_wl = get_workload_with_priority(&old.workloads, priority);
                    let same = matches!((new_wl, old_wl), (Some(n), Some(o)) if n.is_same(o));
                    if !same {
                        info!(
                            agreement_id = %ag.current_agreement_id,
                            priority,
                            "workload at or above the deployed priority was added, removed, or modified"
                        );
                        return (true, false, false);
                    }
                }
            }

            if device.node_type() == DEVICE_TYPE_CLUSTER
                && bus_pol.cluster_namespace != old.cluster_namespace
            {
                debug!(
                    agreement_id = %ag.current_agreement_id,
                    old_namespace = %old.cluster_namespace,
                    new_namespace = %bus_pol.cluster_namespace,
                    "cluster namespace changed, checking compatibility"
                );
                let (compatible, consumer_namespace, reason) =
                    check_cluster_namespace_compatibility(
                        device.node_type(),
                        &device.cluster_namespace,
                        device.is_namespace_scoped,
                        &bus_pol.cluster_namespace,
                    );
                if !compatible {
                    info!(
                        agreement_id = %ag.current_agreement_id,
                        reason = %reason,
                        "cluster namespace no longer compatible"
                    );
                    return (true, true, false);
                }
                if consumer_namespace != old.cluster_namespace {
                    info!(
                        agreement_id = %ag.current_agreement_id,
                        old_namespace = %old.cluster_namespace,
                        new_namespace = %consumer_namespace,
                        "cluster namespace changed"
                    );
                    return (true, true, false);
                }
            }
        }

        if workload.arch.is_empty() || workload.arch == "*" {
            workload.arch = node_arch.clone();
        }

        // Hydrate the workload with deployment configuration.
        match self
            .exchange()
            .get_service(
                &workload.service_url,
                &workload.org,
                &workload.version,
                &workload.arch,
            )
            .await
        {
            Err(e) => {
                error!(service_url = %workload.service_url, error = %e, "error getting service from the exchange");
                return (false, false, false);
            }
            Ok(None) => {
                error!(service_url = %workload.service_url, "service not found in the exchange");
                return (false, false, false);
            }
            Ok(Some(svc)) => {
                if device.node_type() == DEVICE_TYPE_CLUSTER {
                    workload.cluster_deployment = svc.cluster_deployment;
                    workload.cluster_deployment_signature = svc.cluster_deployment_signature;
                } else {
                    workload.deployment = svc.deployment;
                    workload.deployment_signature = svc.deployment_signature;
                }
            }
        }

        if let Some(old) = old_policy {
            if check.consumer_policy == *old {
                debug!(
                    agreement_id = %ag.current_agreement_id,
                    policy_name = %ag.policy_name,
                    "policy content unchanged, no update needed"
                );
                return (true, true, true);
            }
            info!(
                agreement_id = %ag.current_agreement_id,
                policy_name = %ag.policy_name,
                "policy content changed, updating agreement"
            );
        }

        let new_ts_cs = match create_terms_and_conditions(
            &check.producer_policy,
            &check.consumer_policy,
            &workload,
            &ag.current_agreement_id,
            &self.config().agbot.default_workload_pw,
            self.config().agbot.no_data_interval_s,
            PROTOCOL_CURRENT_VERSION,
        ) {
            Ok(t) => t,
            Err(e) => {
                error!(agreement_id = %ag.current_agreement_id, error = %e, "error creating new terms and conditions");
                return (false, false, false);
            }
        };

        let update_time = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        if let Err(e) = self
            .db()
            .set_last_policy_update_time(
                &ag.current_agreement_id,
                &ag.agreement_protocol,
                update_time,
            )
            .await
        {
            warn!(agreement_id = %ag.current_agreement_id, error = %e, "unable to stamp policy update time");
        }

        let metadata = match serde_json::to_value(&new_ts_cs) {
            Ok(v) => v,
            Err(e) => {
                error!(agreement_id = %ag.current_agreement_id, error = %e, "cannot marshal new terms and conditions");
                return (false, false, false);
            }
        };
        self.update_agreement(ag, MSG_UPDATE_TYPE_POLICY_CHANGE, metadata)
            .await;

        (true, true, true)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::policy::{Property, Workload, WorkloadPriority, DEVICE_TYPE_DEVICE};

    fn node_policy(cpu: i64) -> ExternalPolicy {
        ExternalPolicy {
            properties: vec![
                Property::new("covenant.arch", serde_json::json!("amd64")),
                Property::new("covenant.cpu", serde_json::json!(cpu)),
            ],
            constraints: vec![],
        }
    }

    fn bus_policy_with_constraint(constraint: &str) -> Policy {
        Policy {
            header: PolicyHeader {
                name: "e2edev/weather".to_string(),
                version: "2.0".to_string(),
            },
            workloads: vec![Workload {
                priority: WorkloadPriority::default(),
                arch: "amd64".to_string(),
                service_url: "weather.example.com".to_string(),
                org: "e2edev".to_string(),
                version: "1.0".to_string(),
                ..Workload::default()
            }],
            constraints: vec![constraint.to_string()],
            ..Policy::default()
        }
    }

    #[test]
    fn test_compatibility_passes_when_constraints_hold() {
        let check = check_policy_compatibility(
            "e2edev/node1",
            &node_policy(4),
            &bus_policy_with_constraint("covenant.cpu >= 2"),
            &ExternalPolicy::default(),
            "amd64",
        );
        assert!(check.compatible, "reason: {}", check.reason);
        assert_eq!(check.producer_policy.header.name, "Policy for e2edev/node1");
    }

    #[test]
    fn test_compatibility_fails_on_unmet_constraint() {
        let check = check_policy_compatibility(
            "e2edev/node1",
            &node_policy(1),
            &bus_policy_with_constraint("covenant.cpu >= 2"),
            &ExternalPolicy::default(),
            "amd64",
        );
        assert!(!check.compatible);
        assert!(check.reason.contains("node properties"));
    }

    #[test]
    fn test_compatibility_fails_on_arch_mismatch() {
        let check = check_policy_compatibility(
            "e2edev/node1",
            &node_policy(4),
            &bus_policy_with_constraint("covenant.cpu >= 2"),
            &ExternalPolicy::default(),
            "arm64",
        );
        assert!(!check.compatible);
        assert!(check.reason.contains("architecture"));
    }

    #[test]
    fn test_compatibility_checks_node_constraints_too() {
        let mut node_pol = node_policy(4);
        node_pol.constraints = vec!["tier == gold".to_string()];
        let check = check_policy_compatibility(
            "e2edev/node1",
            &node_pol,
            &bus_policy_with_constraint("covenant.cpu >= 2"),
            &ExternalPolicy::default(),
            "amd64",
        );
        assert!(!check.compatible, "policy lacks the tier property");
    }

    #[test]
    fn test_service_policy_properties_count_for_node_constraints() {
        let mut node_pol = node_policy(4);
        node_pol.constraints = vec!["tier == gold".to_string()];
        let svc_pol = ExternalPolicy {
            properties: vec![Property::new("tier", serde_json::json!("gold"))],
            constraints: vec![],
        };
        let check = check_policy_compatibility(
            "e2edev/node1",
            &node_pol,
            &bus_policy_with_constraint("covenant.cpu >= 2"),
            &svc_pol,
            "amd64",
        );
        assert!(check.compatible, "reason: {}", check.reason);
    }

    #[test]
    fn test_namespace_non_cluster_is_always_compatible() {
        let (ok, ns, _) =
            check_cluster_namespace_compatibility(DEVICE_TYPE_DEVICE, "", false, "nsB");
        assert!(ok);
        assert!(ns.is_empty());
    }

    #[test]
    fn test_namespace_policy_wins_for_unscoped_agent() {
        let (ok, ns, _) =
            check_cluster_namespace_compatibility(DEVICE_TYPE_CLUSTER, "nsA", false, "nsB");
        assert!(ok);
        assert_eq!(ns, "nsB");
    }

    #[test]
    fn test_namespace_scoped_agent_rejects_other_namespace() {
        let (ok, ns, reason) =
            check_cluster_namespace_compatibility(DEVICE_TYPE_CLUSTER, "nsA", true, "nsB");
        assert!(!ok);
        assert_eq!(ns, "nsB");
        assert!(reason.contains("scoped"));
    }

    #[test]
    fn test_namespace_falls_back_to_node_then_default() {
        let (ok, ns, _) =
            check_cluster_namespace_compatibility(DEVICE_TYPE_CLUSTER, "nsA", true, "");
        assert!(ok);
        assert_eq!(ns, "nsA");

        let (ok, ns, _) = check_cluster_namespace_compatibility(DEVICE_TYPE_CLUSTER, "", false, "");
        assert!(ok);
        assert_eq!(ns, DEFAULT_CLUSTER_NAMESPACE);
    }
}
