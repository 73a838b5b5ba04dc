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

//! The agreement wire protocol: proposal, reply, data-received ack,
//! cancel, verify, and update framing, behind the [`ProtocolHandler`]
//! capability interface. One protocol family per handler instance; the
//! `Basic` family is the only one registered today.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::policy::{marshal_policy, Policy};
use crate::transport::MessageTarget;
use crate::AgbotError;

pub const PROTOCOL_NAME: &str = "Basic";
pub const PROTOCOL_CURRENT_VERSION: i32 = 2;

pub const MSG_TYPE_PROPOSAL: &str = "proposal";
pub const MSG_TYPE_REPLY: &str = "reply";
pub const MSG_TYPE_DATA_RECEIVED_ACK: &str = "datareceivedack";
pub const MSG_TYPE_CANCEL: &str = "cancel";
pub const MSG_TYPE_VERIFY: &str = "agreementverify";
pub const MSG_TYPE_UPDATE: &str = "agreementupdate";

pub const MSG_UPDATE_TYPE_POLICY_CHANGE: &str = "policychange";

const OBSCURED_PASSWORD: &str = "********";

// ---------------------------------------------------------------------------
// Termination reasons
// ---------------------------------------------------------------------------

pub const TERM_REASON_POLICY_CHANGED: &str = "PolicyChanged";
pub const TERM_REASON_NOT_FINALIZED_TIMEOUT: &str = "NotFinalized";
pub const TERM_REASON_NO_DATA_RECEIVED: &str = "NoData";
pub const TERM_REASON_NO_REPLY: &str = "NoReply";
pub const TERM_REASON_USER_REQUESTED: &str = "UserRequested";
pub const TERM_REASON_DEVICE_REQUESTED: &str = "DeviceRequested";
pub const TERM_REASON_NEGATIVE_REPLY: &str = "NegativeReply";
pub const TERM_REASON_CANCEL_DISCOVERED: &str = "CancelDiscovered";
pub const TERM_REASON_CANCEL_FORCED_UPGRADE: &str = "ForceUpgrade";
pub const TERM_REASON_CANCEL_WRITE_FAILED: &str = "WriteFailed";
pub const TERM_REASON_NODE_HEARTBEAT: &str = "NodeHeartbeat";
pub const TERM_REASON_AG_MISSING: &str = "AgreementMissing";

const TERMINATION_REASONS: &[(&str, u32)] = &[
    (TERM_REASON_NOT_FINALIZED_TIMEOUT, 100),
    (TERM_REASON_NO_REPLY, 101),
    (TERM_REASON_NEGATIVE_REPLY, 102),
    (TERM_REASON_NO_DATA_RECEIVED, 103),
    (TERM_REASON_POLICY_CHANGED, 104),
    (TERM_REASON_CANCEL_DISCOVERED, 105),
    (TERM_REASON_CANCEL_FORCED_UPGRADE, 106),
    (TERM_REASON_CANCEL_WRITE_FAILED, 107),
    (TERM_REASON_NODE_HEARTBEAT, 108),
    (TERM_REASON_AG_MISSING, 109),
    (TERM_REASON_USER_REQUESTED, 110),
    (TERM_REASON_DEVICE_REQUESTED, 111),
];

/// Protocol-level code for a termination reason. Unknown reasons map to
/// the policy-changed code, the most conservative of the set.
#[must_use]
pub fn get_termination_code(reason: &str) -> u32 {
    TERMINATION_REASONS
        .iter()
        .find(|(name, _)| *name == reason)
        .map_or(104, |(_, code)| *code)
}

/// Inverse of [`get_termination_code`].
#[must_use]
pub fn get_termination_reason(code: u32) -> &'static str {
    TERMINATION_REASONS
        .iter()
        .find(|(_, c)| *c == code)
        .map_or(TERM_REASON_POLICY_CHANGED, |(name, _)| name)
}

#[must_use]
pub fn is_termination_reason_node_shutdown(code: u32) -> bool {
    code == get_termination_code(TERM_REASON_NODE_HEARTBEAT)
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Proposal {
    pub msg_type: String,
    pub protocol: String,
    pub version: i32,
    pub agreement_id: String,
    /// Serialized terms-and-conditions policy.
    pub ts_and_cs: String,
    /// Serialized producer policy, for the node's own records.
    pub producer_policy: String,
    pub consumer_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ProposalReply {
    pub msg_type: String,
    pub protocol: String,
    pub version: i32,
    pub agreement_id: String,
    pub device_id: String,
    pub decision: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct DataReceivedAck {
    pub msg_type: String,
    pub protocol: String,
    pub version: i32,
    pub agreement_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct CancelMsg {
    pub msg_type: String,
    pub protocol: String,
    pub version: i32,
    pub agreement_id: String,
    pub reason: u32,
}

fn parse_typed<T: serde::de::DeserializeOwned>(
    msg: &str,
    expected_type: &str,
) -> Result<T, AgbotError> {
    let probe: serde_json::Value = serde_json::from_str(msg)
        .map_err(|e| AgbotError::Decode(format!("message is not JSON: {e}")))?;
    if probe.get("msg_type").and_then(|v| v.as_str()) != Some(expected_type) {
        return Err(AgbotError::Decode(format!(
            "message is not a {expected_type}"
        )));
    }
    if probe.get("protocol").and_then(|v| v.as_str()) != Some(PROTOCOL_NAME) {
        return Err(AgbotError::Decode(format!(
            "message is not for the {PROTOCOL_NAME} protocol"
        )));
    }
    serde_json::from_value(probe)
        .map_err(|e| AgbotError::Decode(format!("malformed {expected_type}: {e}")))
}

/// Replace any secret fields embedded in a serialized proposal before it
/// reaches a log line.
///
/// # Errors
///
/// Returns `AgbotError::Decode` when the proposal or its embedded policy
/// cannot be parsed — callers must then log nothing rather than a partial.
pub fn obscure_proposal_secret(msg: &str) -> Result<String, AgbotError> {
    let mut proposal: Proposal =
        serde_json::from_str(msg).map_err(|e| AgbotError::Decode(format!("not a proposal: {e}")))?;
    let mut tscs = crate::policy::demarshal_policy(&proposal.ts_and_cs)?;
    for wl in &mut tscs.workloads {
        if !wl.workload_password.is_empty() {
            wl.workload_password = OBSCURED_PASSWORD.to_string();
        }
    }
    proposal.ts_and_cs = marshal_policy(&tscs)?;
    serde_json::to_string(&proposal)
        .map_err(|e| AgbotError::Decode(format!("cannot re-marshal proposal: {e}")))
}

// ---------------------------------------------------------------------------
// Capability interfaces
// ---------------------------------------------------------------------------

/// Sends one encrypted payload to one receiver. Implemented by the
/// exchange transport; tests substitute a recorder.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, target: &MessageTarget, payload: &[u8]) -> Result<(), AgbotError>;
}

/// One agreement protocol family: message validation plus the
/// consumer-side sends. Common behavior across families lives in the
/// handler; each family implements this interface fully.
#[async_trait::async_trait]
pub trait ProtocolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn validate_reply(&self, msg: &str) -> Result<ProposalReply, AgbotError>;
    fn validate_data_received_ack(&self, msg: &str) -> Result<DataReceivedAck, AgbotError>;
    fn validate_cancel(&self, msg: &str) -> Result<CancelMsg, AgbotError>;

    fn build_proposal(
        &self,
        agreement_id: &str,
        producer_policy: &Policy,
        ts_and_cs: &Policy,
        consumer_id: &str,
    ) -> Result<Proposal, AgbotError>;

    async fn initiate_agreement(
        &self,
        proposal: &Proposal,
        target: &MessageTarget,
        sender: &dyn MessageSender,
    ) -> Result<(), AgbotError>;

    #[allow(clippy::too_many_arguments)]
    async fn terminate_agreement(
        &self,
        policies: &[Policy],
        counter_party: &str,
        agreement_id: &str,
        org: &str,
        reason: u32,
        target: &MessageTarget,
        sender: &dyn MessageSender,
    ) -> Result<(), AgbotError>;

    async fn verify_agreement(
        &self,
        agreement_id: &str,
        target: &MessageTarget,
        sender: &dyn MessageSender,
    ) -> Result<(), AgbotError>;

    async fn update_agreement(
        &self,
        agreement_id: &str,
        update_type: &str,
        metadata: serde_json::Value,
        target: &MessageTarget,
        sender: &dyn MessageSender,
    ) -> Result<(), AgbotError>;
}

// ---------------------------------------------------------------------------
// Basic protocol
// ---------------------------------------------------------------------------

/// The `Basic` family: JSON framing, no ledger involvement.
#[derive(Default)]
pub struct BasicProtocol;

impl BasicProtocol {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for BasicProtocol {
    fn name(&self) -> &str {
        PROTOCOL_NAME
    }

    fn validate_reply(&self, msg: &str) -> Result<ProposalReply, AgbotError> {
        parse_typed(msg, MSG_TYPE_REPLY)
    }

    fn validate_data_received_ack(&self, msg: &str) -> Result<DataReceivedAck, AgbotError> {
        parse_typed(msg, MSG_TYPE_DATA_RECEIVED_ACK)
    }

    fn validate_cancel(&self, msg: &str) -> Result<CancelMsg, AgbotError> {
        parse_typed(msg, MSG_TYPE_CANCEL)
    }

    fn build_proposal(
        &self,
        agreement_id: &str,
        producer_policy: &Policy,
        ts_and_cs: &Policy,
        consumer_id: &str,
    ) -> Result<Proposal, AgbotError> {
        Ok(Proposal {
            msg_type: MSG_TYPE_PROPOSAL.to_string(),
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_CURRENT_VERSION,
            agreement_id: agreement_id.to_string(),
            ts_and_cs: marshal_policy(ts_and_cs)?,
            producer_policy: marshal_policy(producer_policy)?,
            consumer_id: consumer_id.to_string(),
        })
    }

    async fn initiate_agreement(
        &self,
        proposal: &Proposal,
        target: &MessageTarget,
        sender: &dyn MessageSender,
    ) -> Result<(), AgbotError> {
        let bytes = serde_json::to_vec(proposal)
            .map_err(|e| AgbotError::Decode(format!("cannot marshal proposal: {e}")))?;
        sender.send_message(target, &bytes).await?;
        debug!(agreement_id = %proposal.agreement_id, "sent proposal");
        Ok(())
    }

    async fn terminate_agreement(
        &self,
        _policies: &[Policy],
        _counter_party: &str,
        agreement_id: &str,
        _org: &str,
        reason: u32,
        target: &MessageTarget,
        sender: &dyn MessageSender,
    ) -> Result<(), AgbotError> {
        let cancel = CancelMsg {
            msg_type: MSG_TYPE_CANCEL.to_string(),
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_CURRENT_VERSION,
            agreement_id: agreement_id.to_string(),
            reason,
        };
        let bytes = serde_json::to_vec(&cancel)
            .map_err(|e| AgbotError::Decode(format!("cannot marshal cancel: {e}")))?;
        sender.send_message(target, &bytes).await?;
        debug!(agreement_id = %agreement_id, reason, "sent cancel");
        Ok(())
    }

    async fn verify_agreement(
        &self,
        agreement_id: &str,
        target: &MessageTarget,
        sender: &dyn MessageSender,
    ) -> Result<(), AgbotError> {
        let body = json!({
            "msg_type": MSG_TYPE_VERIFY,
            "protocol": PROTOCOL_NAME,
            "version": PROTOCOL_CURRENT_VERSION,
            "agreement_id": agreement_id,
        });
        let bytes = serde_json::to_vec(&body)
            .map_err(|e| AgbotError::Decode(format!("cannot marshal verify: {e}")))?;
        sender.send_message(target, &bytes).await
    }

    async fn update_agreement(
        &self,
        agreement_id: &str,
        update_type: &str,
        metadata: serde_json::Value,
        target: &MessageTarget,
        sender: &dyn MessageSender,
    ) -> Result<(), AgbotError> {
        let body = json!({
            "msg_type": MSG_TYPE_UPDATE,
            "protocol": PROTOCOL_NAME,
            "version": PROTOCOL_CURRENT_VERSION,
            "agreement_id": agreement_id,
            "update_type": update_type,
            "metadata": metadata,
        });
        let bytes = serde_json::to_vec(&body)
            .map_err(|e| AgbotError::Decode(format!("cannot marshal update: {e}")))?;
        sender.send_message(target, &bytes).await?;
        debug!(agreement_id = %agreement_id, update_type = %update_type, "sent agreement update");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
