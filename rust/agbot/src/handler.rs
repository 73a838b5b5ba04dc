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

//! The consumer protocol handler: a single dispatcher task that consumes
//! typed commands, re-evaluates in-flight agreements against policy
//! changes, coordinates HA upgrades, and feeds the prioritized worker
//! pool. A failing command never stops the event loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use covenant_config::Config;
use covenant_runtime::RetryPolicy;
use covenant_secrets::SecretsProvider;

use crate::commands::{Command, EventMessage, EventSender};
use crate::exchange::{form_org_spec_url, get_org, ExchangeClient};
use crate::objects::{
    agreement_handle_mms_object_policy, NodeSearch, ObjectPolicyChangeEvent, ObjectPolicyManager,
};
use crate::policy::{demarshal_policy, PolicyManager, DEVICE_TYPE_CLUSTER, DEVICE_TYPE_DEVICE};
use crate::protocol::{
    get_termination_code, MessageSender, ProtocolHandler, TERM_REASON_POLICY_CHANGED,
};
use crate::store::{
    agreement_not_kept_wu_filter, in_progress_filter, policy_name_wu_filter, unarchived_filter,
    Agreement, AgreementStore,
};
use crate::work::{AgreementWork, InitiateAgreementArgs, PrioritizedWorkQueue};
use crate::AgbotError;

pub struct ConsumerProtocolHandler {
    name: String,
    config: Arc<Config>,
    db: Arc<dyn AgreementStore>,
    exchange: Arc<dyn ExchangeClient>,
    protocol: Arc<dyn ProtocolHandler>,
    messenger: Arc<dyn MessageSender>,
    pm: Arc<PolicyManager>,
    obj_mgr: Arc<dyn ObjectPolicyManager>,
    node_search: Arc<dyn NodeSearch>,
    secrets: Arc<dyn SecretsProvider>,
    work_queue: PrioritizedWorkQueue,
    // Work items a worker asked to retry later. Drained on governance
    // ticks; growth is a diagnostic signal.
    deferred: Mutex<Vec<AgreementWork>>,
    events: EventSender,
    state_retry: RetryPolicy,
}

impl ConsumerProtocolHandler {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        db: Arc<dyn AgreementStore>,
        exchange: Arc<dyn ExchangeClient>,
        protocol: Arc<dyn ProtocolHandler>,
        messenger: Arc<dyn MessageSender>,
        obj_mgr: Arc<dyn ObjectPolicyManager>,
        node_search: Arc<dyn NodeSearch>,
        secrets: Arc<dyn SecretsProvider>,
        events: EventSender,
    ) -> Self {
        Self {
            name: protocol.name().to_string(),
            config,
            db,
            exchange,
            protocol,
            messenger,
            pm: Arc::new(PolicyManager::new()),
            obj_mgr,
            node_search,
            secrets,
            work_queue: PrioritizedWorkQueue::new(),
            deferred: Mutex::new(Vec::new()),
            events,
            state_retry: RetryPolicy::unbounded(Duration::from_secs(10)),
        }
    }

    // -- accessors shared with the lifecycle/compat/worker impls --------

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn work_queue(&self) -> &PrioritizedWorkQueue {
        &self.work_queue
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn db(&self) -> &dyn AgreementStore {
        self.db.as_ref()
    }

    pub(crate) fn exchange(&self) -> &dyn ExchangeClient {
        self.exchange.as_ref()
    }

    pub(crate) fn protocol(&self) -> &dyn ProtocolHandler {
        self.protocol.as_ref()
    }

    pub(crate) fn messenger(&self) -> &dyn MessageSender {
        self.messenger.as_ref()
    }

    pub(crate) fn obj_mgr(&self) -> &dyn ObjectPolicyManager {
        self.obj_mgr.as_ref()
    }

    pub(crate) fn node_search(&self) -> &dyn NodeSearch {
        self.node_search.as_ref()
    }

    pub(crate) fn secrets(&self) -> &dyn SecretsProvider {
        self.secrets.as_ref()
    }

    pub(crate) fn state_retry(&self) -> &RetryPolicy {
        &self.state_retry
    }

    /// The protocol handler for a ledger coordinate triple. The base
    /// handler ignores the coordinates; ledger-backed families override
    /// the selection.
    #[must_use]
    pub fn agreement_protocol_handler(
        &self,
        _bc_type: &str,
        _bc_name: &str,
        _bc_org: &str,
    ) -> Arc<dyn ProtocolHandler> {
        Arc::clone(&self.protocol)
    }

    /// Ledger coordinates recorded for an agreement. The base handler
    /// has none.
    #[must_use]
    pub fn get_known_blockchain(&self, _ag: &Agreement) -> (String, String, String) {
        (String::new(), String::new(), String::new())
    }

    #[must_use]
    pub fn already_received_reply(&self, ag: &Agreement) -> bool {
        !ag.counter_party_address.is_empty()
    }

    pub fn send_event(&self, event: EventMessage) {
        self.events.send_event(event);
    }

    // -- deferred work ---------------------------------------------------

    pub fn defer_command(&self, work: AgreementWork) {
        if let Ok(mut deferred) = self.deferred.lock() {
            deferred.push(work);
        }
    }

    /// Drain and clear the deferred buffer.
    #[must_use]
    pub fn take_deferred_commands(&self) -> Vec<AgreementWork> {
        self.deferred
            .lock()
            .map(|mut d| std::mem::take(&mut *d))
            .unwrap_or_default()
    }

    /// Re-enqueue deferred work. Initiations go back on the low channel,
    /// everything else ahead of them.
    pub fn handle_deferred_commands(&self) {
        let deferred = self.take_deferred_commands();
        if deferred.is_empty() {
            return;
        }
        info!(count = deferred.len(), "requeueing deferred work");
        for work in deferred {
            match work {
                AgreementWork::InitiateAgreement(_) => self.work_queue.send_low(work),
                other => self.work_queue.send_high(other),
            }
        }
    }

    // -- dispatcher ------------------------------------------------------

    /// The event loop: commands in, work items out. Returns when
    /// `StopProtocol` arrives or the channel closes.
    pub async fn run(self: Arc<Self>, mut commands: mpsc::Receiver<Command>) {
        info!(handler = %self.name, "consumer protocol handler started");
        let mut governance = tokio::time::interval(Duration::from_secs(
            self.config.agbot.process_governance_interval_s.max(1),
        ));
        governance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        None => {
                            warn!(handler = %self.name, "command channel closed");
                            break;
                        }
                        Some(Command::StopProtocol) => {
                            self.handle_stop_protocol();
                            break;
                        }
                        Some(cmd) => self.dispatch(cmd).await,
                    }
                }
                _ = governance.tick() => {
                    self.handle_deferred_commands();
                }
            }
        }
        info!(handler = %self.name, "consumer protocol handler stopped");
    }

    async fn dispatch(&self, cmd: Command) {
        match cmd {
            Command::NewProtocolMessage {
                from,
                pub_key,
                message_id,
                message,
            } => {
                if let Err(e) = self
                    .dispatch_protocol_message(&from, &pub_key, message_id, &message)
                    .await
                {
                    warn!(from = %from, error = %e, "inbound protocol message not dispatched");
                }
            }
            Command::AgreementTimeout {
                agreement_id,
                protocol,
                reason,
            } => self.handle_agreement_timeout(&agreement_id, &protocol, reason),
            Command::PolicyChanged { org, policy } => self.handle_policy_changed(&org, &policy).await,
            Command::PolicyDeleted { org, policy } => self.handle_policy_deleted(&org, &policy).await,
            Command::ServicePolicyChanged {
                policy_org,
                policy_name,
                service_id,
            } => {
                self.handle_service_policy_changed(&policy_org, &policy_name, &service_id)
                    .await;
            }
            Command::ServicePolicyDeleted {
                policy_org,
                policy_name,
                service_id,
            } => {
                self.handle_service_policy_deleted(&policy_org, &policy_name, &service_id)
                    .await;
            }
            Command::NodePolicyChanged {
                node_id,
                node_pol_org,
            } => self.handle_node_policy_changed(&node_id, &node_pol_org).await,
            Command::MmsObjectPolicy { event } => self.handle_mms_object_policy(event),
            Command::WorkloadUpgrade {
                agreement_id,
                protocol,
                device_id,
                policy_name,
            } => {
                self.work_queue.send_high(AgreementWork::HandleWorkloadUpgrade {
                    agreement_id,
                    protocol,
                    device_id,
                    policy_name,
                });
            }
            Command::MakeAgreement {
                producer_policy,
                consumer_policy,
                org,
                node,
                consumer_policy_name,
                service_policies,
            } => {
                self.work_queue
                    .send_low(AgreementWork::InitiateAgreement(Box::new(
                        InitiateAgreementArgs {
                            producer_policy,
                            consumer_policy,
                            org,
                            node,
                            consumer_policy_name,
                            service_policies,
                        },
                    )));
            }
            Command::StopProtocol => unreachable!("handled by the run loop"),
        }
    }

    /// Classify an inbound mailbox message and queue the matching work.
    /// Tried in order: reply, data-received ack, cancel, extension hook.
    ///
    /// # Errors
    ///
    /// Returns `AgbotError::Ignored` for a message no parser accepts.
    pub async fn dispatch_protocol_message(
        &self,
        from: &str,
        _pub_key: &str,
        message_id: i64,
        message: &[u8],
    ) -> Result<(), AgbotError> {
        let text = String::from_utf8_lossy(message);

        if let Ok(reply) = self.protocol.validate_reply(&text) {
            self.work_queue.send_high(AgreementWork::HandleReply {
                reply,
                from: from.to_string(),
                message_id,
            });
            trace!(from = %from, "queued reply message");
            return Ok(());
        }

        if let Ok(ack) = self.protocol.validate_data_received_ack(&text) {
            self.work_queue
                .send_high(AgreementWork::HandleDataReceivedAck {
                    ack,
                    from: from.to_string(),
                    message_id,
                });
            trace!(from = %from, "queued data received ack message");
            return Ok(());
        }

        if let Ok(cancel) = self.protocol.validate_cancel(&text) {
            // Only the agreement's own device may cancel it.
            match self
                .db
                .find_single_agreement_by_id(&cancel.agreement_id, &cancel.protocol, &[])
                .await
            {
                Err(e) => {
                    error!(agreement_id = %cancel.agreement_id, error = %e, "error finding agreement for cancel");
                }
                Ok(None) => {
                    warn!(agreement_id = %cancel.agreement_id, "cancel ignored, agreement not found");
                }
                Ok(Some(ag)) if ag.device_id != from => {
                    warn!(
                        agreement_id = %cancel.agreement_id,
                        from = %from,
                        device_id = %ag.device_id,
                        "cancel ignored, sender is not the agreement device"
                    );
                }
                Ok(Some(_)) => {
                    self.work_queue.send_high(AgreementWork::CancelAgreement {
                        agreement_id: cancel.agreement_id,
                        protocol: cancel.protocol,
                        reason: cancel.reason,
                        message_id,
                    });
                    trace!(from = %from, "queued cancel message");
                }
            }
            return Ok(());
        }

        if self.handle_extension_message(from, message).is_ok() {
            return Ok(());
        }

        warn!(from = %from, "ignoring protocol message of unknown type");
        Err(AgbotError::Ignored(format!(
            "unexpected protocol message from {from}"
        )))
    }

    /// Hook for protocol families with extra message types. The base
    /// handler accepts none.
    #[allow(clippy::unused_self)]
    fn handle_extension_message(&self, _from: &str, _message: &[u8]) -> Result<(), AgbotError> {
        Err(AgbotError::Ignored("no extension messages".to_string()))
    }

    fn handle_agreement_timeout(&self, agreement_id: &str, protocol: &str, reason: u32) {
        debug!(agreement_id = %agreement_id, reason, "received agreement timeout");
        self.work_queue.send_high(AgreementWork::CancelAgreement {
            agreement_id: agreement_id.to_string(),
            protocol: protocol.to_string(),
            reason,
            message_id: 0,
        });
    }

    // -- policy change handling ------------------------------------------

    async fn handle_policy_changed(&self, org: &str, policy: &str) {
        debug!(org = %org, "received policy changed command");
        let event_pol = match demarshal_policy(policy) {
            Ok(p) => p,
            Err(e) => {
                error!(org = %org, error = %e, "error demarshalling changed policy event");
                return;
            }
        };
        self.pm.upsert_policy(org, &event_pol);

        let agreements = match self
            .db
            .find_agreements(&[unarchived_filter(), in_progress_filter()], &self.name)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "error searching database");
                return;
            }
        };

        let mut still_valid: Vec<String> = Vec::new();
        for ag in agreements {
            let pol = match demarshal_policy(&ag.policy) {
                Ok(p) => p,
                Err(e) => {
                    error!(agreement_id = %ag.current_agreement_id, error = %e, "unable to demarshal agreement policy");
                    continue;
                }
            };
            if event_pol.header.name != pol.header.name {
                trace!(agreement_id = %ag.current_agreement_id, "agreement uses a policy that did not change");
                continue;
            }
            match self.pm.matches_mine(org, &pol) {
                Ok(()) => {
                    trace!(agreement_id = %ag.current_agreement_id, "no policy content differences detected");
                }
                Err(difference) => {
                    trace!(agreement_id = %ag.current_agreement_id, difference = %difference, "agreement policy drifted");
                    let mut policy_matches = true;
                    let mut no_new_priority = false;
                    let mut cluster_ns_unchanged = true;
                    let mut ag_still_valid = false;

                    if ag.pattern.is_empty() {
                        (policy_matches, no_new_priority, cluster_ns_unchanged) = self
                            .handle_policy_change_for_agreement(&ag, Some(&pol))
                            .await;
                        ag_still_valid = policy_matches && no_new_priority;
                        if ag.device_type() == DEVICE_TYPE_CLUSTER {
                            ag_still_valid = ag_still_valid && cluster_ns_unchanged;
                        }
                    }

                    if ag_still_valid {
                        debug!(agreement_id = %ag.current_agreement_id, "agreement is still valid");
                        still_valid.push(ag.current_agreement_id.clone());
                    } else {
                        warn!(
                            agreement_id = %ag.current_agreement_id,
                            policy_name = %pol.header.name,
                            "policy changed incompatibly, cancelling agreement"
                        );
                        self.cancel_agreement(&ag, TERM_REASON_POLICY_CHANGED, policy_matches)
                            .await;
                    }
                }
            }
        }

        // Remove workload usages for this policy that no retained
        // agreement references, so the highest priority is tried fresh
        // under the new policy.
        match self
            .db
            .find_workload_usages(&[
                policy_name_wu_filter(&event_pol.header.name),
                agreement_not_kept_wu_filter(still_valid),
            ])
            .await
        {
            Err(e) => {
                error!(policy_name = %event_pol.header.name, error = %e, "failed to get workload usages");
            }
            Ok(usages) => {
                for wu in usages {
                    debug!(device_id = %wu.device_id, policy_name = %wu.policy_name, "deleting workload usage");
                    if let Err(e) = self
                        .db
                        .delete_workload_usage(&wu.device_id, &wu.policy_name)
                        .await
                    {
                        error!(device_id = %wu.device_id, policy_name = %wu.policy_name, error = %e, "failed to delete workload usage");
                    }
                }
            }
        }
    }

    async fn handle_policy_deleted(&self, org: &str, policy: &str) {
        debug!(org = %org, "received policy deleted command");
        let event_pol = match demarshal_policy(policy) {
            Ok(p) => p,
            Err(e) => {
                error!(org = %org, error = %e, "error demarshalling deleted policy event");
                return;
            }
        };
        self.pm.delete_policy(org, &event_pol.header.name);

        // Clear usages first so replacement agreements restart from the
        // highest priority. Usages tied to live agreements disappear with
        // the cancels below.
        match self
            .db
            .find_workload_usages(&[policy_name_wu_filter(&event_pol.header.name)])
            .await
        {
            Err(e) => {
                error!(policy_name = %event_pol.header.name, error = %e, "failed to get workload usages");
            }
            Ok(usages) => {
                for wu in usages {
                    if let Err(e) = self
                        .db
                        .delete_workload_usage(&wu.device_id, &wu.policy_name)
                        .await
                    {
                        error!(device_id = %wu.device_id, error = %e, "failed to delete workload usage");
                    }
                }
            }
        }

        let agreements = match self
            .db
            .find_agreements(&[unarchived_filter(), in_progress_filter()], &self.name)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "error searching database");
                return;
            }
        };
        for ag in agreements {
            let pol = match demarshal_policy(&ag.policy) {
                Ok(p) => p,
                Err(e) => {
                    error!(agreement_id = %ag.current_agreement_id, error = %e, "unable to demarshal agreement policy");
                    continue;
                }
            };
            if org == ag.org && self.pm.get_policy(org, &pol.header.name).is_none() {
                error!(
                    agreement_id = %ag.current_agreement_id,
                    policy_name = %pol.header.name,
                    "agreement references a policy that no longer exists"
                );
                if let Err(e) = self
                    .db
                    .delete_workload_usage(&ag.device_id, &ag.policy_name)
                    .await
                {
                    warn!(device_id = %ag.device_id, error = %e, "error deleting workload usage");
                }
                self.work_queue.send_high(AgreementWork::CancelAgreement {
                    agreement_id: ag.current_agreement_id.clone(),
                    protocol: ag.agreement_protocol.clone(),
                    reason: get_termination_code(TERM_REASON_POLICY_CHANGED),
                    message_id: 0,
                });
            }
        }
    }

    async fn handle_service_policy_changed(
        &self,
        policy_org: &str,
        policy_name: &str,
        service_id: &str,
    ) {
        debug!(service_id = %service_id, "received service policy changed command");
        let qualified = format!("{policy_org}/{policy_name}");
        let agreements = match self
            .db
            .find_agreements(&[unarchived_filter(), in_progress_filter()], &self.name)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "error searching database");
                return;
            }
        };
        for ag in agreements {
            if ag.pattern.is_empty()
                && ag.policy_name == qualified
                && ag.service_ids.first().map(String::as_str) == Some(service_id)
            {
                let (policy_matches, no_new_priority, _) =
                    self.handle_policy_change_for_agreement(&ag, None).await;
                if !(policy_matches && no_new_priority) {
                    warn!(
                        agreement_id = %ag.current_agreement_id,
                        service_id = %service_id,
                        "service policy changed incompatibly, cancelling agreement"
                    );
                    self.cancel_agreement(&ag, TERM_REASON_POLICY_CHANGED, policy_matches)
                        .await;
                }
            }
        }
    }

    // Cancels every matching agreement even if another of its services
    // would still make it valid, the same way a full policy deletion
    // does. TODO: re-evaluate against the remaining services first.
    async fn handle_service_policy_deleted(
        &self,
        policy_org: &str,
        policy_name: &str,
        service_id: &str,
    ) {
        debug!(service_id = %service_id, "received service policy deleted command");
        let qualified = format!("{policy_org}/{policy_name}");
        let agreements = match self
            .db
            .find_agreements(&[unarchived_filter(), in_progress_filter()], &self.name)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "error searching database");
                return;
            }
        };
        for ag in agreements {
            if ag.pattern.is_empty()
                && ag.policy_name == qualified
                && ag.service_ids.first().map(String::as_str) == Some(service_id)
            {
                error!(
                    agreement_id = %ag.current_agreement_id,
                    service_id = %service_id,
                    "agreement references a service policy that no longer exists"
                );
                if let Err(e) = self
                    .db
                    .delete_workload_usage(&ag.device_id, &ag.policy_name)
                    .await
                {
                    warn!(device_id = %ag.device_id, error = %e, "error deleting workload usage");
                }
                self.work_queue.send_high(AgreementWork::CancelAgreement {
                    agreement_id: ag.current_agreement_id.clone(),
                    protocol: ag.agreement_protocol.clone(),
                    reason: get_termination_code(TERM_REASON_POLICY_CHANGED),
                    message_id: 0,
                });
            }
        }
    }

    async fn handle_node_policy_changed(&self, node_id: &str, node_pol_org: &str) {
        debug!(node_id = %node_id, "received node policy changed command");
        let qualified_node = form_org_spec_url(node_id, node_pol_org);
        let agreements = match self
            .db
            .find_agreements(&[unarchived_filter(), in_progress_filter()], &self.name)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "error searching database");
                return;
            }
        };
        for ag in agreements {
            if ag.pattern.is_empty() && ag.device_id == qualified_node {
                let (policy_matches, no_new_priority, _) =
                    self.handle_policy_change_for_agreement(&ag, None).await;
                if policy_matches && no_new_priority {
                    self.handle_policy_change_for_mms_object(&ag).await;
                } else {
                    warn!(
                        agreement_id = %ag.current_agreement_id,
                        node_id = %qualified_node,
                        "node policy changed incompatibly, cancelling agreement"
                    );
                    self.cancel_agreement(&ag, TERM_REASON_POLICY_CHANGED, policy_matches)
                        .await;
                }
            }
        }
    }

    /// Re-evaluate object placement for an agreement that survived a node
    /// policy change. Device nodes under policy only; clusters and
    /// pattern agreements have no object destinations.
    async fn handle_policy_change_for_mms_object(&self, ag: &Agreement) {
        if ag.device_type() != DEVICE_TYPE_DEVICE || !ag.pattern.is_empty() {
            return;
        }
        if self.config.exchange.css_url.is_empty() {
            error!("unable to re-evaluate object placement, no object store URL configured");
            return;
        }
        if let Err(e) =
            agreement_handle_mms_object_policy(self.exchange(), self.obj_mgr(), ag).await
        {
            error!(agreement_id = %ag.current_agreement_id, error = %e, "object placement re-evaluation failed");
        }
    }

    fn handle_mms_object_policy(&self, event: ObjectPolicyChangeEvent) {
        debug!(object_id = %event.object_id, "received object policy change command");
        self.work_queue
            .send_high(AgreementWork::ObjectPolicyChange { event });
    }

    fn handle_stop_protocol(&self) {
        let workers = self.config.agbot.agreement_workers;
        for _ in 0..workers {
            self.work_queue.send_high(AgreementWork::StopWorker);
        }
        debug!(workers, "queued stop work for every worker");
    }

    // -- cancellation with HA coordination -------------------------------

    /// Cancel an agreement, honoring the single-upgrader-per-HA-group
    /// invariant. Multiple agbots can run this concurrently for different
    /// devices in one group; the shared upgrade table arbitrates.
    pub async fn cancel_agreement(&self, ag: &Agreement, reason: &str, policy_matches: bool) {
        debug!(agreement_id = %ag.current_agreement_id, reason = %reason, "cancelling agreement");

        let usage = match self
            .db
            .find_single_workload_usage(&ag.device_id, &ag.policy_name)
            .await
        {
            Ok(u) => u,
            Err(e) => {
                warn!(device_id = %ag.device_id, policy_name = %ag.policy_name, error = %e, "error retrieving workload usage");
                None
            }
        };

        if usage.is_some() && policy_matches {
            let device = match self.exchange.get_device(&ag.device_id).await {
                Ok(d) => d,
                Err(e) => {
                    error!(device_id = %ag.device_id, error = %e, "error getting device");
                    return;
                }
            };

            if !device.ha_group.is_empty() {
                // Keep the governance loop from treating this device as
                // finished while its upgrade is pending.
                if let Err(e) = self
                    .db
                    .update_pending_upgrade(&ag.device_id, &ag.policy_name)
                    .await
                {
                    warn!(device_id = %ag.device_id, error = %e, "unable to mark workload usage pending upgrade");
                }

                let device_org = get_org(&ag.device_id);
                match self
                    .db
                    .get_ha_upgrading_workload(device_org, &device.ha_group, &ag.policy_name)
                    .await
                {
                    Err(e) => {
                        error!(ha_group = %device.ha_group, policy_name = %ag.policy_name, error = %e, "error reading HA upgrading workload");
                        return;
                    }
                    Ok(Some(upgrading)) => {
                        // Another device in the group is mid-upgrade; the
                        // governance loop will come back to this one.
                        debug!(
                            ha_group = %device.ha_group,
                            upgrading_device = %upgrading.device_id,
                            "HA group already has an upgrading workload"
                        );
                        return;
                    }
                    Ok(None) => {}
                }

                match self
                    .db
                    .insert_ha_upgrading_workload(
                        device_org,
                        &device.ha_group,
                        &ag.policy_name,
                        &ag.device_id,
                    )
                    .await
                {
                    Err(e) => {
                        error!(ha_group = %device.ha_group, device_id = %ag.device_id, error = %e, "unable to insert HA upgrading workload");
                    }
                    Ok(winner) if winner == ag.device_id => {
                        debug!(
                            ha_group = %device.ha_group,
                            device_id = %ag.device_id,
                            "holding the HA upgrade slot, cancelling"
                        );
                        if let Err(e) = self
                            .db
                            .delete_workload_usage(&ag.device_id, &ag.policy_name)
                            .await
                        {
                            warn!(device_id = %ag.device_id, error = %e, "error deleting workload usage");
                        }
                        self.work_queue.send_high(AgreementWork::CancelAgreement {
                            agreement_id: ag.current_agreement_id.clone(),
                            protocol: ag.agreement_protocol.clone(),
                            reason: get_termination_code(reason),
                            message_id: 0,
                        });
                    }
                    Ok(winner) => {
                        info!(
                            ha_group = %device.ha_group,
                            device_id = %ag.device_id,
                            upgrading_device = %winner,
                            "another device holds the HA upgrade slot, deferring cancel"
                        );
                    }
                }
                return;
            }
        }

        // Non-HA device, no usage row, or the policy itself went away:
        // clear the usage so a new agreement starts from the highest
        // priority, and cancel.
        if let Err(e) = self
            .db
            .delete_workload_usage(&ag.device_id, &ag.policy_name)
            .await
        {
            warn!(device_id = %ag.device_id, policy_name = %ag.policy_name, error = %e, "error deleting workload usage");
        }
        self.work_queue.send_high(AgreementWork::CancelAgreement {
            agreement_id: ag.current_agreement_id.clone(),
            protocol: ag.agreement_protocol.clone(),
            reason: get_termination_code(reason),
            message_id: 0,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    use crate::exchange::{Device, PostMessageBody, PutAgbotAgreementState, ServiceDefinition};
    use crate::objects::ObjectPolicy;
    use crate::policy::{
        marshal_policy, ExternalPolicy, Policy, PolicyHeader, Property, Workload,
        WorkloadPriority, PROP_NODE_ARCH, PROP_NODE_CPU, PROP_NODE_K8S_VERSION, PROP_NODE_MEMORY,
    };
    use crate::protocol::{BasicProtocol, CancelMsg, MSG_TYPE_CANCEL, PROTOCOL_CURRENT_VERSION};
    use crate::store::MemoryAgreementStore;
    use crate::transport::MessageTarget;
    use covenant_secrets::SecretsError;

    // -- mocks -----------------------------------------------------------

    #[derive(Default)]
    struct MockExchange {
        devices: StdMutex<HashMap<String, Device>>,
        business_policies: StdMutex<HashMap<String, Policy>>,
        node_policies: StdMutex<HashMap<String, ExternalPolicy>>,
        services_by_url: StdMutex<HashMap<String, ServiceDefinition>>,
        recorded_states: StdMutex<Vec<(String, String)>>,
    }

    impl MockExchange {
        fn set_device(&self, id: &str, dev: Device) {
            self.devices.lock().unwrap().insert(id.to_string(), dev);
        }
        fn set_business_policy(&self, name: &str, pol: Policy) {
            self.business_policies
                .lock()
                .unwrap()
                .insert(name.to_string(), pol);
        }
        fn set_node_policy(&self, id: &str, pol: ExternalPolicy) {
            self.node_policies
                .lock()
                .unwrap()
                .insert(id.to_string(), pol);
        }
        fn set_service(&self, url: &str, svc: ServiceDefinition) {
            self.services_by_url
                .lock()
                .unwrap()
                .insert(url.to_string(), svc);
        }
    }

    #[async_trait::async_trait]
    impl ExchangeClient for MockExchange {
        async fn get_device(&self, device_id: &str) -> Result<Device, AgbotError> {
            self.devices
                .lock()
                .unwrap()
                .get(device_id)
                .cloned()
                .ok_or_else(|| AgbotError::NotFound(format!("device {device_id}")))
        }
        async fn get_org_max_heartbeat(&self, _org: &str) -> Result<u64, AgbotError> {
            Ok(120)
        }
        async fn post_node_message(
            &self,
            _device_id: &str,
            _body: &PostMessageBody,
        ) -> Result<(), AgbotError> {
            Ok(())
        }
        async fn put_agbot_agreement_state(
            &self,
            agreement_id: &str,
            state: &PutAgbotAgreementState,
        ) -> Result<(), AgbotError> {
            self.recorded_states
                .lock()
                .unwrap()
                .push((agreement_id.to_string(), state.state.clone()));
            Ok(())
        }
        async fn delete_agbot_message(&self, _msg_id: i64) -> Result<(), AgbotError> {
            Ok(())
        }
        async fn get_service_by_id(
            &self,
            _service_id: &str,
        ) -> Result<Option<ServiceDefinition>, AgbotError> {
            Ok(None)
        }
        async fn get_service(
            &self,
            url: &str,
            _org: &str,
            _version: &str,
            _arch: &str,
        ) -> Result<Option<ServiceDefinition>, AgbotError> {
            Ok(self.services_by_url.lock().unwrap().get(url).cloned())
        }
        async fn get_merged_service_policy(
            &self,
            _service_id: &str,
        ) -> Result<Option<ExternalPolicy>, AgbotError> {
            Ok(None)
        }
        async fn get_business_policy(&self, policy_name: &str) -> Result<Policy, AgbotError> {
            self.business_policies
                .lock()
                .unwrap()
                .get(policy_name)
                .cloned()
                .ok_or_else(|| AgbotError::NotFound(format!("business policy {policy_name}")))
        }
        async fn get_node_policy(&self, device_id: &str) -> Result<ExternalPolicy, AgbotError> {
            self.node_policies
                .lock()
                .unwrap()
                .get(device_id)
                .cloned()
                .ok_or_else(|| AgbotError::NotFound(format!("node policy {device_id}")))
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingSender {
        fn sent_to(&self) -> Vec<(String, String)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(to, bytes)| (to.clone(), String::from_utf8_lossy(bytes).to_string()))
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl MessageSender for RecordingSender {
        async fn send_message(
            &self,
            target: &MessageTarget,
            payload: &[u8],
        ) -> Result<(), AgbotError> {
            self.sent
                .lock()
                .unwrap()
                .push((target.receiver_exchange_id.clone(), payload.to_vec()));
            Ok(())
        }
    }

    struct NoSecrets;

    #[async_trait::async_trait]
    impl SecretsProvider for NoSecrets {
        async fn get(&self, key: &str) -> Result<String, SecretsError> {
            Err(SecretsError::NotFound(key.to_string()))
        }
        async fn list(&self) -> Result<Vec<String>, SecretsError> {
            Ok(Vec::new())
        }
    }

    struct NoObjects;

    #[async_trait::async_trait]
    impl ObjectPolicyManager for NoObjects {
        async fn object_policies_for_service(
            &self,
            _org: &str,
            _service_id: &str,
        ) -> Result<Vec<ObjectPolicy>, AgbotError> {
            Ok(Vec::new())
        }
        async fn add_node_destination(
            &self,
            _policy: &ObjectPolicy,
            _node_id: &str,
        ) -> Result<(), AgbotError> {
            Ok(())
        }
        async fn remove_node_destination(
            &self,
            _policy: &ObjectPolicy,
            _node_id: &str,
        ) -> Result<(), AgbotError> {
            Ok(())
        }
    }

    // -- fixtures --------------------------------------------------------

    const POLICY_NAME: &str = "e2edev/weather";
    const NODE1: &str = "e2edev/node1";

    fn test_config() -> Arc<Config> {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "covenant": {"env": "test", "version": "0.3.0"},
            "exchange": {
                "url": "https://exchange.test/v1/",
                "css_url": "",
                "message_key_path": "/tmp/covenant-keys"
            },
            "agbot": {
                "id": "testorg/agbot1",
                "token_key": "AGBOT_TOKEN",
                "partition": "p1",
                "agreement_workers": 4
            },
            "postgres": {
                "host": "127.0.0.1",
                "port": 5432,
                "database": "covenant",
                "user": "covenant",
                "password_key": "PG_PASSWORD"
            },
            "secrets": {"provider": "env"}
        }))
        .unwrap();
        Arc::new(cfg)
    }

    struct Harness {
        handler: Arc<ConsumerProtocolHandler>,
        exchange: Arc<MockExchange>,
        db: Arc<MemoryAgreementStore>,
        sender: Arc<RecordingSender>,
    }

    fn make_harness() -> Harness {
        let exchange = Arc::new(MockExchange::default());
        let db = Arc::new(MemoryAgreementStore::new());
        let sender = Arc::new(RecordingSender::default());
        let (events, _event_rx) = EventSender::new(32);
        let handler = Arc::new(ConsumerProtocolHandler::new(
            test_config(),
            Arc::clone(&db) as Arc<dyn AgreementStore>,
            Arc::clone(&exchange) as Arc<dyn ExchangeClient>,
            Arc::new(BasicProtocol::new()),
            Arc::clone(&sender) as Arc<dyn MessageSender>,
            Arc::new(NoObjects),
            Arc::new(crate::objects::RescanQueue::new()),
            Arc::new(NoSecrets),
            events,
        ));
        Harness {
            handler,
            exchange,
            db,
            sender,
        }
    }

    fn make_workload(priority: i32, version: &str) -> Workload {
        Workload {
            priority: WorkloadPriority {
                priority_value: priority,
                ..WorkloadPriority::default()
            },
            arch: "amd64".to_string(),
            service_url: "weather.example.com".to_string(),
            org: "e2edev".to_string(),
            version: version.to_string(),
            ..Workload::default()
        }
    }

    fn make_policy(workloads: Vec<Workload>) -> Policy {
        Policy {
            header: PolicyHeader {
                name: POLICY_NAME.to_string(),
                version: "2.0".to_string(),
            },
            workloads,
            ..Policy::default()
        }
    }

    fn device_node_policy() -> ExternalPolicy {
        ExternalPolicy {
            properties: vec![
                Property::new(PROP_NODE_ARCH, serde_json::json!("amd64")),
                Property::new(PROP_NODE_MEMORY, serde_json::json!(1024)),
                Property::new(PROP_NODE_CPU, serde_json::json!(4)),
            ],
            constraints: vec![],
        }
    }

    fn cluster_node_policy() -> ExternalPolicy {
        ExternalPolicy {
            properties: vec![
                Property::new(PROP_NODE_ARCH, serde_json::json!("amd64")),
                Property::new(PROP_NODE_MEMORY, serde_json::json!(8192)),
                Property::new(PROP_NODE_K8S_VERSION, serde_json::json!("1.29")),
            ],
            constraints: vec![],
        }
    }

    fn make_device(node_type: &str, ha_group: &str) -> Device {
        Device {
            public_key: BASE64.encode([1u8; 32]),
            arch: "amd64".to_string(),
            node_type: node_type.to_string(),
            ha_group: ha_group.to_string(),
            ..Device::default()
        }
    }

    fn finalized_agreement(id: &str, device_id: &str, device_type: &str, policy: &Policy) -> Agreement {
        Agreement {
            current_agreement_id: id.to_string(),
            org: "e2edev".to_string(),
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            agreement_protocol: "Basic".to_string(),
            policy_name: POLICY_NAME.to_string(),
            service_ids: vec!["e2edev/svc1".to_string()],
            policy: marshal_policy(policy).unwrap(),
            counter_party_address: device_id.to_string(),
            agreement_creation_time: 100,
            agreement_finalized_time: 500,
            ..Agreement::default()
        }
    }

    /// Drain the high-priority queue: push a sentinel, pull until it
    /// comes back, return everything before it.
    async fn drain_high(handler: &ConsumerProtocolHandler) -> Vec<AgreementWork> {
        handler.work_queue().send_high(AgreementWork::StopWorker);
        let mut drained = Vec::new();
        loop {
            match handler.work_queue().pull().await {
                AgreementWork::StopWorker => break,
                work => drained.push(work),
            }
        }
        drained
    }

    fn cancel_ids(work: &[AgreementWork]) -> Vec<(String, u32)> {
        work.iter()
            .filter_map(|w| match w {
                AgreementWork::CancelAgreement {
                    agreement_id,
                    reason,
                    ..
                } => Some((agreement_id.clone(), *reason)),
                _ => None,
            })
            .collect()
    }

    // -- end-to-end scenarios --------------------------------------------

    #[tokio::test]
    async fn test_priority_demoted_invalidates_agreement() {
        let h = make_harness();
        let old_policy = make_policy(vec![make_workload(1, "2.0"), make_workload(2, "1.0")]);
        let new_policy = make_policy(vec![make_workload(2, "1.0")]);
        let ag = finalized_agreement("ag1", NODE1, "device", &old_policy);

        h.db.seed_agreement(ag.clone()).await;
        h.db.upsert_workload_usage(NODE1, POLICY_NAME, "ag1", 2)
            .await
            .unwrap();
        h.exchange.set_device(NODE1, make_device("device", ""));
        h.exchange.set_node_policy(NODE1, device_node_policy());
        h.exchange.set_business_policy(POLICY_NAME, new_policy);

        let result = h
            .handler
            .handle_policy_change_for_agreement(&ag, Some(&old_policy))
            .await;
        assert_eq!(result, (true, false, false));

        // The dispatcher reacts by cancelling with policy_matches = true.
        h.handler
            .cancel_agreement(&ag, TERM_REASON_POLICY_CHANGED, true)
            .await;
        let cancels = cancel_ids(&drain_high(&h.handler).await);
        assert_eq!(cancels, vec![("ag1".to_string(), 104)]);
        assert!(
            h.db.find_single_workload_usage(NODE1, POLICY_NAME)
                .await
                .unwrap()
                .is_none(),
            "non-HA cancel removes the usage row"
        );
    }

    #[tokio::test]
    async fn test_higher_priority_added_invalidates_agreement() {
        let h = make_harness();
        let old_policy = make_policy(vec![make_workload(2, "1.0")]);
        let new_policy = make_policy(vec![make_workload(1, "2.0"), make_workload(2, "1.0")]);
        let ag = finalized_agreement("ag1", NODE1, "device", &old_policy);

        h.db.seed_agreement(ag.clone()).await;
        h.db.upsert_workload_usage(NODE1, POLICY_NAME, "ag1", 2)
            .await
            .unwrap();
        h.exchange.set_device(NODE1, make_device("device", ""));
        h.exchange.set_node_policy(NODE1, device_node_policy());
        h.exchange.set_business_policy(POLICY_NAME, new_policy);

        let result = h
            .handler
            .handle_policy_change_for_agreement(&ag, Some(&old_policy))
            .await;
        assert_eq!(result, (true, false, false));
    }

    #[tokio::test]
    async fn test_cluster_namespace_change_invalidates_agreement() {
        let h = make_harness();
        let mut old_policy = make_policy(vec![make_workload(2, "1.0")]);
        old_policy.cluster_namespace = "nsA".to_string();
        let mut new_policy = make_policy(vec![make_workload(2, "1.0")]);
        new_policy.cluster_namespace = "nsB".to_string();
        let ag = finalized_agreement("ag1", NODE1, "cluster", &old_policy);

        h.db.seed_agreement(ag.clone()).await;
        h.db.upsert_workload_usage(NODE1, POLICY_NAME, "ag1", 2)
            .await
            .unwrap();
        let mut dev = make_device("cluster", "");
        dev.cluster_namespace = "nsA".to_string();
        h.exchange.set_device(NODE1, dev);
        h.exchange.set_node_policy(NODE1, cluster_node_policy());
        h.exchange.set_business_policy(POLICY_NAME, new_policy);

        let result = h
            .handler
            .handle_policy_change_for_agreement(&ag, Some(&old_policy))
            .await;
        assert_eq!(result, (true, true, false));

        h.handler
            .cancel_agreement(&ag, TERM_REASON_POLICY_CHANGED, true)
            .await;
        let cancels = cancel_ids(&drain_high(&h.handler).await);
        assert_eq!(cancels.len(), 1, "cluster namespace drift cancels");
    }

    #[tokio::test]
    async fn test_ha_race_exactly_one_cancel() {
        let h = make_harness();
        let policy = make_policy(vec![make_workload(2, "1.0")]);

        let devices = ["e2edev/node1", "e2edev/node2", "e2edev/node3"];
        for (i, device_id) in devices.iter().enumerate() {
            let ag = finalized_agreement(&format!("ag{i}"), device_id, "device", &policy);
            h.db.seed_agreement(ag).await;
            h.db.upsert_workload_usage(device_id, POLICY_NAME, &format!("ag{i}"), 2)
                .await
                .unwrap();
            h.exchange.set_device(device_id, make_device("device", "group1"));
            h.exchange.set_node_policy(device_id, device_node_policy());
        }
        h.exchange.set_business_policy(POLICY_NAME, policy.clone());

        let ags: Vec<Agreement> = {
            let mut v = Vec::new();
            for (i, device_id) in devices.iter().enumerate() {
                v.push(finalized_agreement(&format!("ag{i}"), device_id, "device", &policy));
            }
            v
        };

        // Three concurrent cancels for three devices in one HA group.
        tokio::join!(
            h.handler.cancel_agreement(&ags[0], TERM_REASON_POLICY_CHANGED, true),
            h.handler.cancel_agreement(&ags[1], TERM_REASON_POLICY_CHANGED, true),
            h.handler.cancel_agreement(&ags[2], TERM_REASON_POLICY_CHANGED, true),
        );

        let cancels = cancel_ids(&drain_high(&h.handler).await);
        assert_eq!(cancels.len(), 1, "exactly one device wins the upgrade slot");

        let slot = h
            .db
            .get_ha_upgrading_workload("e2edev", "group1", POLICY_NAME)
            .await
            .unwrap()
            .unwrap();
        let winner_idx = devices
            .iter()
            .position(|d| *d == slot.device_id)
            .unwrap();
        assert_eq!(
            cancels[0].0,
            format!("ag{winner_idx}"),
            "the queued cancel belongs to the slot holder"
        );

        // The winner's usage row is gone; the losers' rows remain, marked
        // pending so governance keeps watching them.
        for (i, device_id) in devices.iter().enumerate() {
            let usage = h
                .db
                .find_single_workload_usage(device_id, POLICY_NAME)
                .await
                .unwrap();
            if i == winner_idx {
                assert!(usage.is_none());
            } else {
                assert!(usage.unwrap().pending_upgrade);
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_from_wrong_device_is_ignored() {
        let h = make_harness();
        let policy = make_policy(vec![make_workload(2, "1.0")]);
        let ag = finalized_agreement("agA", "e2edev/D1", "device", &policy);
        h.db.seed_agreement(ag).await;

        let cancel = serde_json::to_vec(&CancelMsg {
            msg_type: MSG_TYPE_CANCEL.to_string(),
            protocol: "Basic".to_string(),
            version: PROTOCOL_CURRENT_VERSION,
            agreement_id: "agA".to_string(),
            reason: 111,
        })
        .unwrap();

        // From the wrong device: swallowed with a warning, nothing queued.
        let result = h
            .handler
            .dispatch_protocol_message("e2edev/D2", "", 7, &cancel)
            .await;
        assert!(result.is_ok());
        assert!(drain_high(&h.handler).await.is_empty(), "no work enqueued");

        // From the right device: queued.
        h.handler
            .dispatch_protocol_message("e2edev/D1", "", 8, &cancel)
            .await
            .unwrap();
        let cancels = cancel_ids(&drain_high(&h.handler).await);
        assert_eq!(cancels, vec![("agA".to_string(), 111)]);
    }

    #[tokio::test]
    async fn test_unknown_message_type_is_rejected() {
        let h = make_harness();
        let result = h
            .handler
            .dispatch_protocol_message(NODE1, "", 0, br#"{"msg_type":"gossip"}"#)
            .await;
        assert!(matches!(result, Err(AgbotError::Ignored(_))));
    }

    #[tokio::test]
    async fn test_stop_protocol_queues_one_stop_per_worker() {
        let h = make_harness();
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = tokio::spawn(Arc::clone(&h.handler).run(rx));

        tx.send(Command::StopProtocol).await.unwrap();
        dispatcher.await.unwrap();

        // Four workers configured, four stop items, nothing else first.
        for _ in 0..4 {
            assert!(matches!(
                h.handler.work_queue().pull().await,
                AgreementWork::StopWorker
            ));
        }
    }

    // -- policy change dispatch ------------------------------------------

    #[tokio::test]
    async fn test_policy_changed_is_idempotent_for_store_state() {
        let h = make_harness();
        let old_policy = make_policy(vec![make_workload(2, "1.0")]);
        // The new policy's constraints exclude the node.
        let mut new_policy = make_policy(vec![make_workload(2, "1.0")]);
        new_policy.constraints = vec![format!("{PROP_NODE_CPU} >= 8")];

        let ag = finalized_agreement("ag1", NODE1, "device", &old_policy);
        h.db.seed_agreement(ag).await;
        h.db.upsert_workload_usage(NODE1, POLICY_NAME, "ag1", 2)
            .await
            .unwrap();
        h.exchange.set_device(NODE1, make_device("device", ""));
        h.exchange.set_node_policy(NODE1, device_node_policy());
        h.exchange
            .set_business_policy(POLICY_NAME, new_policy.clone());

        let event = marshal_policy(&new_policy).unwrap();
        h.handler.handle_policy_changed("e2edev", &event).await;

        let usages_after_first = h.db.find_workload_usages(&[]).await.unwrap().len();
        assert_eq!(usages_after_first, 0, "usage rows for the policy are cleared");
        let first_cancels = cancel_ids(&drain_high(&h.handler).await);
        assert_eq!(first_cancels.len(), 1);

        // Running the same event again leaves the store unchanged.
        h.handler.handle_policy_changed("e2edev", &event).await;
        assert_eq!(h.db.find_workload_usages(&[]).await.unwrap().len(), 0);
        let ag_after = h
            .db
            .find_single_agreement_by_id("ag1", "Basic", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(ag_after.in_progress(), "dispatcher leaves row mutation to workers");
    }

    #[tokio::test]
    async fn test_policy_changed_keeps_usage_rows_of_valid_agreements() {
        let h = make_harness();
        // Old and new differ only in a non-binding property, so the
        // agreement survives and an update is dispatched instead.
        let old_policy = make_policy(vec![make_workload(2, "1.0")]);
        let mut new_policy = old_policy.clone();
        new_policy.properties = vec![Property::new("tier", serde_json::json!("gold"))];

        let ag = finalized_agreement("ag1", NODE1, "device", &old_policy);
        h.db.seed_agreement(ag).await;
        h.db.upsert_workload_usage(NODE1, POLICY_NAME, "ag1", 2)
            .await
            .unwrap();
        h.exchange.set_device(NODE1, make_device("device", ""));
        h.exchange.set_node_policy(NODE1, device_node_policy());
        h.exchange
            .set_business_policy(POLICY_NAME, new_policy.clone());
        h.exchange.set_service(
            "weather.example.com",
            ServiceDefinition {
                url: "weather.example.com".to_string(),
                version: "1.0".to_string(),
                arch: "amd64".to_string(),
                deployment: "deploy-cfg".to_string(),
                ..ServiceDefinition::default()
            },
        );

        let event = marshal_policy(&new_policy).unwrap();
        h.handler.handle_policy_changed("e2edev", &event).await;

        assert!(drain_high(&h.handler).await.is_empty(), "no cancels");
        assert!(
            h.db.find_single_workload_usage(NODE1, POLICY_NAME)
                .await
                .unwrap()
                .is_some(),
            "usage row of a retained agreement survives"
        );
        // The agreement update went out to the node.
        let sent = h.sender.sent_to();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, NODE1);
        assert!(sent[0].1.contains("agreementupdate"));
        assert!(sent[0].1.contains("policychange"));

        let ag_after = h
            .db
            .find_single_agreement_by_id("ag1", "Basic", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(ag_after.last_policy_update_time > 0, "update time stamped");
    }

    #[tokio::test]
    async fn test_missing_builtin_props_skips_reevaluation() {
        let h = make_harness();
        let old_policy = make_policy(vec![make_workload(2, "1.0")]);
        let new_policy = make_policy(vec![make_workload(1, "9.9"), make_workload(2, "1.0")]);
        let ag = finalized_agreement("ag1", NODE1, "device", &old_policy);

        h.db.seed_agreement(ag.clone()).await;
        h.exchange.set_device(NODE1, make_device("device", ""));
        // Node policy lacks the built-in properties entirely.
        h.exchange.set_node_policy(NODE1, ExternalPolicy::default());
        h.exchange.set_business_policy(POLICY_NAME, new_policy);

        let result = h
            .handler
            .handle_policy_change_for_agreement(&ag, Some(&old_policy))
            .await;
        assert_eq!(result, (true, true, true), "wait for the node to republish");
        assert!(h.sender.sent_to().is_empty(), "no update dispatched");
    }

    #[tokio::test]
    async fn test_usage_priority_zero_tolerates_priority_additions() {
        let h = make_harness();
        let old_policy = make_policy(vec![make_workload(0, "1.0")]);
        let new_policy = make_policy(vec![make_workload(1, "2.0"), make_workload(2, "1.0")]);
        let ag = finalized_agreement("ag1", NODE1, "device", &old_policy);

        h.db.seed_agreement(ag.clone()).await;
        // No usage row at all: priority is unknown to this agreement.
        h.exchange.set_device(NODE1, make_device("device", ""));
        h.exchange.set_node_policy(NODE1, device_node_policy());
        h.exchange
            .set_business_policy(POLICY_NAME, new_policy.clone());
        h.exchange.set_service(
            "weather.example.com",
            ServiceDefinition {
                url: "weather.example.com".to_string(),
                version: "2.0".to_string(),
                arch: "amd64".to_string(),
                deployment: "deploy-cfg".to_string(),
                ..ServiceDefinition::default()
            },
        );

        let (policy_matches, no_new_priority, _) = h
            .handler
            .handle_policy_change_for_agreement(&ag, Some(&old_policy))
            .await;
        assert!(policy_matches);
        assert!(
            no_new_priority,
            "an agreement without priority information is not invalidated by additions"
        );
    }

    #[tokio::test]
    async fn test_service_policy_deleted_cancels_unconditionally() {
        let h = make_harness();
        let policy = make_policy(vec![make_workload(2, "1.0")]);
        let ag = finalized_agreement("ag1", NODE1, "device", &policy);
        h.db.seed_agreement(ag).await;
        h.db.upsert_workload_usage(NODE1, POLICY_NAME, "ag1", 2)
            .await
            .unwrap();

        h.handler
            .handle_service_policy_deleted("e2edev", "weather", "e2edev/svc1")
            .await;

        let cancels = cancel_ids(&drain_high(&h.handler).await);
        assert_eq!(cancels, vec![("ag1".to_string(), 104)]);
        assert!(
            h.db.find_single_workload_usage(NODE1, POLICY_NAME)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_agreement_timeout_queues_cancel_with_reason() {
        let h = make_harness();
        h.handler.handle_agreement_timeout("ag9", "Basic", 108);
        let cancels = cancel_ids(&drain_high(&h.handler).await);
        assert_eq!(cancels, vec![("ag9".to_string(), 108)]);
    }

    #[tokio::test]
    async fn test_deferred_commands_requeue_on_governance_tick() {
        let h = make_harness();
        h.handler.defer_command(AgreementWork::CancelAgreement {
            agreement_id: "ag1".to_string(),
            protocol: "Basic".to_string(),
            reason: 104,
            message_id: 0,
        });
        assert!(drain_high(&h.handler).await.is_empty(), "deferred, not queued");

        h.handler.handle_deferred_commands();
        let cancels = cancel_ids(&drain_high(&h.handler).await);
        assert_eq!(cancels.len(), 1);
        assert!(
            h.handler.take_deferred_commands().is_empty(),
            "drain clears the buffer"
        );
    }
}
