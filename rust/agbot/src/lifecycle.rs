/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Agreement lifecycle: persisting proposals and replies, recording
//! consumer-side agreement state in the exchange, and the protocol-level
//! terminate/verify/update sends.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, error, warn};

use covenant_runtime::Attempt;

use crate::exchange::{get_id, PutAgbotAgreementState, WorkloadAgreement};
use crate::policy::{demarshal_policy, marshal_policy, Policy};
use crate::protocol::{Proposal, ProposalReply};
use crate::store::Agreement;
use crate::transport::MessageTarget;
use crate::work::InitiateAgreementArgs;
use crate::AgbotError;

impl crate::handler::ConsumerProtocolHandler {
    /// Persist the proposal and consumer policy onto the agreement row,
    /// then record "Formed Proposal" in the exchange.
    ///
    /// # Errors
    ///
    /// Returns the underlying store or exchange error; the attempt row is
    /// left for the governance loop to retire.
    pub async fn persist_base_agreement(
        &self,
        args: &InitiateAgreementArgs,
        proposal: &Proposal,
        hash: &str,
        sig: &str,
    ) -> Result<(), AgbotError> {
        let policy_text = marshal_policy(&args.consumer_policy)?;
        let proposal_text = serde_json::to_string(proposal)
            .map_err(|e| AgbotError::Decode(format!("cannot marshal proposal: {e}")))?;

        // The data-verification terms ride inside the proposal's T&Cs.
        let ts_and_cs = demarshal_policy(&proposal.ts_and_cs)?;

        self.db()
            .agreement_update(
                &proposal.agreement_id,
                &proposal_text,
                &policy_text,
                &ts_and_cs.data_verify,
                self.config().agbot.process_governance_interval_s,
                hash,
                sig,
                self.name(),
                proposal.version,
            )
            .await?;

        self.record_consumer_agreement_state(
            &proposal.agreement_id,
            &ts_and_cs,
            &args.org,
            "Formed Proposal",
        )
        .await
    }

    /// Record the producer's affirmative reply.
    ///
    /// # Errors
    ///
    /// Returns the store error when the row cannot be updated.
    pub async fn persist_reply(
        &self,
        reply: &ProposalReply,
        _pol: &Policy,
    ) -> Result<(), AgbotError> {
        self.db()
            .agreement_made(&reply.agreement_id, &reply.device_id, self.name())
            .await
    }

    /// PUT the consumer-side agreement state into the exchange, retrying
    /// transient failures on the handler's retry policy.
    ///
    /// # Errors
    ///
    /// Returns the exchange error on a non-transient failure.
    pub async fn record_consumer_agreement_state(
        &self,
        agreement_id: &str,
        pol: &Policy,
        org: &str,
        state: &str,
    ) -> Result<(), AgbotError> {
        let workload_url = pol
            .workloads
            .first()
            .map(|w| w.service_url.clone())
            .unwrap_or_default();
        debug!(
            agreement_id = %agreement_id,
            org = %org,
            workload = %workload_url,
            state = %state,
            "recording agreement state"
        );

        let body = PutAgbotAgreementState {
            service: WorkloadAgreement {
                org: org.to_string(),
                pattern: get_id(&pol.pattern_id).to_string(),
                url: workload_url,
            },
            state: state.to_string(),
        };

        self.state_retry()
            .run(|| {
                let body = &body;
                async move {
                    match self
                        .exchange()
                        .put_agbot_agreement_state(agreement_id, body)
                        .await
                    {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_transient() => Err(Attempt::Transient(e)),
                        Err(e) => Err(Attempt::Fatal(e)),
                    }
                }
            })
            .await
    }

    /// Terminate at the protocol level. Failures are logged, not
    /// surfaced: the row cleanup proceeds regardless and a governance
    /// pass retries stragglers.
    pub async fn terminate_agreement(&self, ag: &Agreement, reason: u32, target: &MessageTarget) {
        let pol = match demarshal_policy(&ag.policy) {
            Ok(p) => p,
            Err(e) => {
                error!(agreement_id = %ag.current_agreement_id, error = %e, "unable to demarshal policy while cancelling");
                return;
            }
        };
        let (bc_type, bc_name, bc_org) = self.get_known_blockchain(ag);
        let protocol = self.agreement_protocol_handler(&bc_type, &bc_name, &bc_org);
        if let Err(e) = protocol
            .terminate_agreement(
                &[pol],
                &ag.counter_party_address,
                &ag.current_agreement_id,
                &ag.org,
                reason,
                target,
                self.messenger(),
            )
            .await
        {
            error!(agreement_id = %ag.current_agreement_id, error = %e, "error terminating agreement");
        }
    }

    /// Ask the node to confirm the agreement still exists on its side.
    pub async fn verify_agreement(&self, ag: &Agreement) {
        let (bc_type, bc_name, bc_org) = self.get_known_blockchain(ag);
        let protocol = self.agreement_protocol_handler(&bc_type, &bc_name, &bc_org);
        match self.get_device_message_endpoint(&ag.device_id).await {
            Err(e) => {
                error!(agreement_id = %ag.current_agreement_id, error = %e, "error obtaining message target for verify");
            }
            Ok((endpoint, pub_key)) => {
                let target = MessageTarget::new(&ag.device_id, &pub_key).with_endpoint(&endpoint);
                if let Err(e) = protocol
                    .verify_agreement(&ag.current_agreement_id, &target, self.messenger())
                    .await
                {
                    error!(agreement_id = %ag.current_agreement_id, error = %e, "error verifying agreement");
                }
            }
        }
    }

    /// Send an agreement update (new terms, new metadata) to the node.
    pub async fn update_agreement(
        &self,
        ag: &Agreement,
        update_type: &str,
        metadata: serde_json::Value,
    ) {
        let (bc_type, bc_name, bc_org) = self.get_known_blockchain(ag);
        let protocol = self.agreement_protocol_handler(&bc_type, &bc_name, &bc_org);
        match self.get_device_message_endpoint(&ag.device_id).await {
            Err(e) => {
                error!(agreement_id = %ag.current_agreement_id, error = %e, "error obtaining message target for update");
            }
            Ok((endpoint, pub_key)) => {
                let target = MessageTarget::new(&ag.device_id, &pub_key).with_endpoint(&endpoint);
                if let Err(e) = protocol
                    .update_agreement(
                        &ag.current_agreement_id,
                        update_type,
                        metadata,
                        &target,
                        self.messenger(),
                    )
                    .await
                {
                    error!(agreement_id = %ag.current_agreement_id, error = %e, "error updating agreement");
                }
            }
        }
    }

    /// Fetch a device's message endpoint and public key. The key is
    /// decoded once here to catch corrupt records early, then handed on
    /// in its base64 form.
    ///
    /// # Errors
    ///
    /// Returns the exchange error, or `AgbotError::Crypto` for a key that
    /// does not decode.
    pub async fn get_device_message_endpoint(
        &self,
        device_id: &str,
    ) -> Result<(String, String), AgbotError> {
        let device = self.exchange().get_device(device_id).await?;
        if BASE64.decode(&device.public_key).is_err() {
            return Err(AgbotError::Crypto(format!(
                "device {device_id} has an undecodable public key"
            )));
        }
        if device.public_key.is_empty() {
            warn!(device_id = %device_id, "device has no public key registered");
        }
        Ok((device.msg_end_point, device.public_key))
    }
}
