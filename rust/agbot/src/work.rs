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

//! The prioritized work queue and the worker pool that drains it. Two
//! channels multiplexed by the workers: an item on the high channel is
//! always delivered before anything on the low channel, so a cancel
//! overtakes every queued make-agreement.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::commands::{EventMessage, NodeCandidate};
use crate::handler::ConsumerProtocolHandler;
use crate::objects::{agreement_handle_mms_object_policy, ObjectPolicyChangeEvent};
use crate::policy::{
    create_terms_and_conditions, get_next_workload_choice, get_workload_with_priority,
    ExternalPolicy, Policy, DEVICE_TYPE_CLUSTER,
};
use crate::protocol::{
    DataReceivedAck, ProposalReply, PROTOCOL_CURRENT_VERSION, TERM_REASON_CANCEL_FORCED_UPGRADE,
    TERM_REASON_NEGATIVE_REPLY,
};
use crate::store::unarchived_filter;
use crate::transport::{hash_payload, load_keypair, MessageTarget};
use crate::AgbotError;

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

/// Everything an InitiateAgreement attempt needs, bundled so a failed
/// attempt can be deferred and retried whole.
#[derive(Clone, Debug)]
pub struct InitiateAgreementArgs {
    pub producer_policy: Policy,
    pub consumer_policy: Policy,
    pub org: String,
    pub node: NodeCandidate,
    pub consumer_policy_name: String,
    pub service_policies: HashMap<String, ExternalPolicy>,
}

/// A unit of work for the pool. Inbound items carry the exchange mailbox
/// message id so the worker can delete the message once consumed.
#[derive(Debug)]
pub enum AgreementWork {
    HandleReply {
        reply: ProposalReply,
        from: String,
        message_id: i64,
    },
    HandleDataReceivedAck {
        ack: DataReceivedAck,
        from: String,
        message_id: i64,
    },
    CancelAgreement {
        agreement_id: String,
        protocol: String,
        reason: u32,
        message_id: i64,
    },
    InitiateAgreement(Box<InitiateAgreementArgs>),
    HandleWorkloadUpgrade {
        agreement_id: String,
        protocol: String,
        device_id: String,
        policy_name: String,
    },
    ObjectPolicyChange {
        event: ObjectPolicyChangeEvent,
    },
    StopWorker,
}

// ---------------------------------------------------------------------------
// Prioritized queue
// ---------------------------------------------------------------------------

pub struct PrioritizedWorkQueue {
    high_tx: mpsc::UnboundedSender<AgreementWork>,
    low_tx: mpsc::UnboundedSender<AgreementWork>,
    high_rx: Mutex<mpsc::UnboundedReceiver<AgreementWork>>,
    low_rx: Mutex<mpsc::UnboundedReceiver<AgreementWork>>,
}

impl Default for PrioritizedWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PrioritizedWorkQueue {
    #[must_use]
    pub fn new() -> Self {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        Self {
            high_tx,
            low_tx,
            high_rx: Mutex::new(high_rx),
            low_rx: Mutex::new(low_rx),
        }
    }

    pub fn send_high(&self, work: AgreementWork) {
        if self.high_tx.send(work).is_err() {
            debug!("work queue closed, dropping high priority item");
        }
    }

    pub fn send_low(&self, work: AgreementWork) {
        if self.low_tx.send(work).is_err() {
            debug!("work queue closed, dropping low priority item");
        }
    }

    /// Next item, high channel first. Holding both receiver locks across
    /// the wait serializes idle workers on the hand-off, which is exactly
    /// the ordering guarantee the queue exists to provide.
    pub async fn pull(&self) -> AgreementWork {
        let mut high = self.high_rx.lock().await;
        if let Ok(work) = high.try_recv() {
            return work;
        }
        let mut low = self.low_rx.lock().await;
        if let Ok(work) = low.try_recv() {
            return work;
        }
        tokio::select! {
            biased;
            work = high.recv() => work.unwrap_or(AgreementWork::StopWorker),
            work = low.recv() => work.unwrap_or(AgreementWork::StopWorker),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// One worker: pull, process, repeat until a `StopWorker` arrives.
pub async fn run_agreement_worker(worker_id: usize, handler: Arc<ConsumerProtocolHandler>) {
    let worker = format!("worker-{worker_id}");
    info!(worker = %worker, "agreement worker started");
    loop {
        let work = handler.work_queue().pull().await;
        if !handler.process_work(&worker, work).await {
            break;
        }
    }
    info!(worker = %worker, "agreement worker stopped");
}

impl ConsumerProtocolHandler {
    /// Process one work item. Returns false when the worker should stop.
    /// Failures are logged here and never stop the pool; the next
    /// external event drives another attempt.
    pub async fn process_work(&self, worker: &str, work: AgreementWork) -> bool {
        match work {
            AgreementWork::HandleReply {
                reply,
                from,
                message_id,
            } => {
                if let Err(e) = self.handle_reply(worker, &reply, &from).await {
                    error!(worker = %worker, agreement_id = %reply.agreement_id, error = %e, "reply handling failed");
                }
                self.consume_message(message_id).await;
            }
            AgreementWork::HandleDataReceivedAck {
                ack, message_id, ..
            } => {
                if let Err(e) = self.handle_data_received_ack(worker, &ack).await {
                    error!(worker = %worker, agreement_id = %ack.agreement_id, error = %e, "data received ack handling failed");
                }
                self.consume_message(message_id).await;
            }
            AgreementWork::CancelAgreement {
                agreement_id,
                protocol,
                reason,
                message_id,
            } => {
                self.handle_cancel_work(worker, &agreement_id, &protocol, reason)
                    .await;
                self.consume_message(message_id).await;
            }
            AgreementWork::InitiateAgreement(args) => {
                if let Err(e) = self.handle_initiate_agreement(worker, &args).await {
                    if e.is_transient() {
                        warn!(worker = %worker, device_id = %args.node.id, error = %e, "initiate failed on transient error, deferring");
                        self.defer_command(AgreementWork::InitiateAgreement(args));
                    } else {
                        error!(worker = %worker, device_id = %args.node.id, error = %e, "initiate agreement failed");
                    }
                }
            }
            AgreementWork::HandleWorkloadUpgrade {
                agreement_id,
                protocol,
                device_id,
                policy_name,
            } => {
                self.handle_workload_upgrade_work(
                    worker,
                    &agreement_id,
                    &protocol,
                    &device_id,
                    &policy_name,
                )
                .await;
            }
            AgreementWork::ObjectPolicyChange { event } => {
                if let Err(e) = self.handle_object_policy_change(worker, &event).await {
                    error!(worker = %worker, object_id = %event.object_id, error = %e, "object policy re-evaluation failed");
                }
            }
            AgreementWork::StopWorker => {
                debug!(worker = %worker, "stop work received");
                return false;
            }
        }
        true
    }

    /// Delete a consumed mailbox message. Zero means the work did not
    /// originate from the mailbox.
    async fn consume_message(&self, message_id: i64) {
        if message_id == 0 {
            return;
        }
        if let Err(e) = self.exchange().delete_agbot_message(message_id).await {
            warn!(message_id, error = %e, "unable to delete exchange message");
        }
    }

    async fn handle_reply(
        &self,
        worker: &str,
        reply: &ProposalReply,
        from: &str,
    ) -> Result<(), AgbotError> {
        let Some(ag) = self
            .db()
            .find_single_agreement_by_id(&reply.agreement_id, self.name(), &[unarchived_filter()])
            .await?
        else {
            warn!(worker = %worker, agreement_id = %reply.agreement_id, "reply for unknown agreement ignored");
            return Ok(());
        };

        if self.already_received_reply(&ag) {
            // Duplicate reply; ask the node to verify the agreement is
            // still in force rather than reprocessing.
            debug!(worker = %worker, agreement_id = %reply.agreement_id, "duplicate reply, verifying agreement");
            self.verify_agreement(&ag).await;
            return Ok(());
        }

        if reply.decision {
            let pol = crate::policy::demarshal_policy(&ag.policy)?;
            self.persist_reply(reply, &pol).await?;
            self.record_consumer_agreement_state(
                &reply.agreement_id,
                &pol,
                &ag.org,
                "Producer agreed",
            )
            .await?;
            self.send_event(EventMessage::AgreementReached {
                agreement_id: reply.agreement_id.clone(),
                device_id: from.to_string(),
            });
        } else {
            info!(worker = %worker, agreement_id = %reply.agreement_id, "producer rejected proposal");
            self.worker_cancel_agreement(
                worker,
                &ag,
                crate::protocol::get_termination_code(TERM_REASON_NEGATIVE_REPLY),
            )
            .await;
        }
        Ok(())
    }

    async fn handle_data_received_ack(
        &self,
        worker: &str,
        ack: &DataReceivedAck,
    ) -> Result<(), AgbotError> {
        let Some(ag) = self
            .db()
            .find_single_agreement_by_id(&ack.agreement_id, self.name(), &[unarchived_filter()])
            .await?
        else {
            warn!(worker = %worker, agreement_id = %ack.agreement_id, "ack for unknown agreement ignored");
            return Ok(());
        };
        if ag.agreement_finalized_time == 0 {
            self.db()
                .agreement_finalized(&ack.agreement_id, self.name())
                .await?;
            info!(worker = %worker, agreement_id = %ack.agreement_id, "agreement finalized");
        }
        Ok(())
    }

    async fn handle_cancel_work(
        &self,
        worker: &str,
        agreement_id: &str,
        protocol: &str,
        reason: u32,
    ) {
        match self
            .db()
            .find_single_agreement_by_id(agreement_id, protocol, &[unarchived_filter()])
            .await
        {
            Err(e) => {
                error!(worker = %worker, agreement_id = %agreement_id, error = %e, "error finding agreement to cancel");
            }
            Ok(None) => {
                // Commonly benign: a governance pass already removed it.
                warn!(worker = %worker, agreement_id = %agreement_id, "cancel for unknown agreement ignored");
            }
            Ok(Some(ag)) => {
                self.worker_cancel_agreement(worker, &ag, reason).await;
            }
        }
    }

    /// Terminate at the protocol level, then retire the row. A failed
    /// protocol send still retires the row; the governance loop retries
    /// stragglers.
    pub(crate) async fn worker_cancel_agreement(
        &self,
        worker: &str,
        ag: &crate::store::Agreement,
        reason: u32,
    ) {
        // A node whose heartbeat stopped is not listening; skip the
        // protocol send and just retire the row.
        if crate::protocol::is_termination_reason_node_shutdown(reason) {
            debug!(worker = %worker, agreement_id = %ag.current_agreement_id, "node is down, skipping protocol terminate");
        } else {
            match self.get_device_message_endpoint(&ag.device_id).await {
                Ok((endpoint, pub_key)) => {
                    let target =
                        MessageTarget::new(&ag.device_id, &pub_key).with_endpoint(&endpoint);
                    self.terminate_agreement(ag, reason, &target).await;
                }
                Err(e) => {
                    warn!(worker = %worker, agreement_id = %ag.current_agreement_id, error = %e, "cannot build message target, cancelling locally only");
                }
            }
        }

        if let Err(e) = self
            .db()
            .agreement_timed_out(&ag.current_agreement_id, &ag.agreement_protocol)
            .await
        {
            error!(worker = %worker, agreement_id = %ag.current_agreement_id, error = %e, "unable to mark agreement timed out");
            return;
        }
        if let Err(e) = self
            .db()
            .archive_agreement(&ag.current_agreement_id, &ag.agreement_protocol)
            .await
        {
            error!(worker = %worker, agreement_id = %ag.current_agreement_id, error = %e, "unable to archive agreement");
        }

        if let Ok(pol) = crate::policy::demarshal_policy(&ag.policy) {
            if let Err(e) = self
                .record_consumer_agreement_state(
                    &ag.current_agreement_id,
                    &pol,
                    &ag.org,
                    "Cancelled",
                )
                .await
            {
                warn!(worker = %worker, agreement_id = %ag.current_agreement_id, error = %e, "unable to record cancelled state");
            }
        }

        self.send_event(EventMessage::AgreementEnded {
            agreement_id: ag.current_agreement_id.clone(),
            reason_code: reason,
        });
        info!(
            worker = %worker,
            agreement_id = %ag.current_agreement_id,
            reason = %crate::protocol::get_termination_reason(reason),
            "agreement cancelled"
        );
    }

    async fn handle_initiate_agreement(
        &self,
        worker: &str,
        args: &InitiateAgreementArgs,
    ) -> Result<(), AgbotError> {
        let usage = self
            .db()
            .find_single_workload_usage(&args.node.id, &args.consumer_policy_name)
            .await?;

        let workload = match &usage {
            Some(u) => get_workload_with_priority(&args.consumer_policy.workloads, u.priority),
            None => get_next_workload_choice(&args.consumer_policy.workloads, -1),
        };
        let Some(workload) = workload else {
            warn!(worker = %worker, policy_name = %args.consumer_policy_name, "no deployable workload in policy");
            return Ok(());
        };
        let mut workload = workload.clone();

        if workload.arch.is_empty() || workload.arch == "*" {
            let device = self.exchange().get_device(&args.node.id).await?;
            workload.arch = self
                .config()
                .agbot
                .canonical_arch(&device.arch)
                .to_string();
        }

        let svc = self
            .exchange()
            .get_service(
                &workload.service_url,
                &workload.org,
                &workload.version,
                &workload.arch,
            )
            .await?
            .ok_or_else(|| {
                AgbotError::NotFound(format!(
                    "service {}/{} {} not in exchange",
                    workload.org, workload.service_url, workload.version
                ))
            })?;
        if args.node.node_type == DEVICE_TYPE_CLUSTER {
            workload.cluster_deployment = svc.cluster_deployment;
            workload.cluster_deployment_signature = svc.cluster_deployment_signature;
        } else {
            workload.deployment = svc.deployment;
            workload.deployment_signature = svc.deployment_signature;
        }

        let workload_pw = match self
            .secrets()
            .get(&format!("workload-pw/{}", args.consumer_policy_name))
            .await
        {
            Ok(pw) => pw,
            Err(_) => self.config().agbot.default_workload_pw.clone(),
        };

        let agreement_id = uuid::Uuid::new_v4().simple().to_string();
        let ts_and_cs = create_terms_and_conditions(
            &args.producer_policy,
            &args.consumer_policy,
            &workload,
            &agreement_id,
            &workload_pw,
            self.config().agbot.no_data_interval_s,
            PROTOCOL_CURRENT_VERSION,
        )?;

        let mut service_ids: Vec<String> = args.service_policies.keys().cloned().collect();
        service_ids.sort();
        self.db()
            .agreement_attempt(
                &agreement_id,
                &args.org,
                &args.node.id,
                &args.node.node_type,
                &args.consumer_policy_name,
                "",
                &service_ids,
                self.name(),
            )
            .await?;

        let proposal = self.protocol().build_proposal(
            &agreement_id,
            &args.producer_policy,
            &ts_and_cs,
            &self.config().agbot.id,
        )?;

        let keypair = load_keypair(&self.config().exchange.message_key_path).await?;
        let hash = hash_payload(proposal.ts_and_cs.as_bytes());
        let sig = keypair.sign(proposal.ts_and_cs.as_bytes());

        self.persist_base_agreement(args, &proposal, &hash, &sig)
            .await?;

        if workload.priority.priority_value > 0 {
            self.db()
                .upsert_workload_usage(
                    &args.node.id,
                    &args.consumer_policy_name,
                    &agreement_id,
                    workload.priority.priority_value,
                )
                .await?;
        }

        let target = MessageTarget::new(&args.node.id, &args.node.public_key);
        self.protocol()
            .initiate_agreement(&proposal, &target, self.messenger())
            .await?;

        info!(worker = %worker, agreement_id = %agreement_id, device_id = %args.node.id, "proposal sent");
        Ok(())
    }

    async fn handle_workload_upgrade_work(
        &self,
        worker: &str,
        agreement_id: &str,
        protocol: &str,
        device_id: &str,
        policy_name: &str,
    ) {
        // An empty agreement id means the agreement is already gone and
        // only the bookkeeping needs clearing.
        if !agreement_id.is_empty() {
            self.handle_cancel_work(
                worker,
                agreement_id,
                protocol,
                crate::protocol::get_termination_code(TERM_REASON_CANCEL_FORCED_UPGRADE),
            )
            .await;
        }

        if let Err(e) = self.db().delete_workload_usage(device_id, policy_name).await {
            warn!(worker = %worker, device_id = %device_id, policy_name = %policy_name, error = %e, "unable to delete workload usage for upgrade");
        }

        self.node_search()
            .schedule_rescan(crate::exchange::get_org(device_id), policy_name)
            .await;
    }

    async fn handle_object_policy_change(
        &self,
        worker: &str,
        event: &ObjectPolicyChangeEvent,
    ) -> Result<(), AgbotError> {
        let agreements = self
            .db()
            .find_agreements(
                &[unarchived_filter(), crate::store::in_progress_filter()],
                self.name(),
            )
            .await?;
        for ag in agreements {
            if ag.pattern.is_empty()
                && ag.device_type() == crate::policy::DEVICE_TYPE_DEVICE
                && ag.service_ids.iter().any(|s| *s == event.service_id)
            {
                debug!(worker = %worker, agreement_id = %ag.current_agreement_id, object_id = %event.object_id, "re-evaluating object placement");
                agreement_handle_mms_object_policy(self.exchange(), self.obj_mgr(), &ag).await?;
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cancel_item(id: &str) -> AgreementWork {
        AgreementWork::CancelAgreement {
            agreement_id: id.to_string(),
            protocol: "Basic".to_string(),
            reason: 104,
            message_id: 0,
        }
    }

    fn initiate_item() -> AgreementWork {
        AgreementWork::InitiateAgreement(Box::new(InitiateAgreementArgs {
            producer_policy: Policy::default(),
            consumer_policy: Policy::default(),
            org: "e2edev".to_string(),
            node: NodeCandidate {
                id: "e2edev/node1".to_string(),
                node_type: "device".to_string(),
                public_key: String::new(),
            },
            consumer_policy_name: "e2edev/weather".to_string(),
            service_policies: HashMap::new(),
        }))
    }

    #[tokio::test]
    async fn test_high_items_overtake_low() {
        let q = PrioritizedWorkQueue::new();
        q.send_low(initiate_item());
        q.send_low(initiate_item());
        q.send_high(cancel_item("ag1"));

        match q.pull().await {
            AgreementWork::CancelAgreement { agreement_id, .. } => {
                assert_eq!(agreement_id, "ag1", "cancel overtakes queued make-agreement");
            }
            other => panic!("expected cancel first, got {other:?}"),
        }
        assert!(matches!(q.pull().await, AgreementWork::InitiateAgreement(_)));
        assert!(matches!(q.pull().await, AgreementWork::InitiateAgreement(_)));
    }

    #[tokio::test]
    async fn test_pull_blocks_until_item_arrives() {
        let q = Arc::new(PrioritizedWorkQueue::new());
        let q2 = Arc::clone(&q);
        let puller = tokio::spawn(async move { q2.pull().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.send_high(AgreementWork::StopWorker);

        assert!(matches!(puller.await.unwrap(), AgreementWork::StopWorker));
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let q = PrioritizedWorkQueue::new();
        q.send_high(cancel_item("ag1"));
        q.send_high(cancel_item("ag2"));
        for expected in ["ag1", "ag2"] {
            match q.pull().await {
                AgreementWork::CancelAgreement { agreement_id, .. } => {
                    assert_eq!(agreement_id, expected);
                }
                other => panic!("unexpected item {other:?}"),
            }
        }
    }
}
