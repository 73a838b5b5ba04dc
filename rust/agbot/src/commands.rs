/*
 * Covenant - Workload agreement negotiation fabric
 * Copyright (C) 2025–2026 Covenant Systems <oss@covenantsystems.io>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Typed commands carrying external events into the dispatcher, and the
//! bounded event channel the engine emits progress on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::objects::ObjectPolicyChangeEvent;
use crate::policy::{ExternalPolicy, Policy};

/// A node picked by the search subsystem as an agreement candidate.
#[derive(Clone, Debug)]
pub struct NodeCandidate {
    pub id: String,
    pub node_type: String,
    pub public_key: String,
}

/// External events, one variant per source. The dispatcher consumes these
/// serially; there is no general pub/sub bus.
#[derive(Debug)]
pub enum Command {
    NewProtocolMessage {
        from: String,
        pub_key: String,
        message_id: i64,
        message: Vec<u8>,
    },
    AgreementTimeout {
        agreement_id: String,
        protocol: String,
        reason: u32,
    },
    PolicyChanged {
        org: String,
        policy: String,
    },
    PolicyDeleted {
        org: String,
        policy: String,
    },
    ServicePolicyChanged {
        policy_org: String,
        policy_name: String,
        service_id: String,
    },
    ServicePolicyDeleted {
        policy_org: String,
        policy_name: String,
        service_id: String,
    },
    NodePolicyChanged {
        node_id: String,
        node_pol_org: String,
    },
    MmsObjectPolicy {
        event: ObjectPolicyChangeEvent,
    },
    WorkloadUpgrade {
        agreement_id: String,
        protocol: String,
        device_id: String,
        policy_name: String,
    },
    MakeAgreement {
        producer_policy: Policy,
        consumer_policy: Policy,
        org: String,
        node: NodeCandidate,
        consumer_policy_name: String,
        service_policies: HashMap<String, ExternalPolicy>,
    },
    StopProtocol,
}

/// Progress events for the rest of the system.
#[derive(Clone, Debug)]
pub enum EventMessage {
    AgreementReached {
        agreement_id: String,
        device_id: String,
    },
    AgreementEnded {
        agreement_id: String,
        reason_code: u32,
    },
}

/// Emitter over a bounded channel. A full channel drops the event rather
/// than blocking the engine; consumers learn about gaps only through the
/// dropped counter. This is the intended backpressure policy.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EventMessage>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    #[must_use]
    pub fn new(queue_size: usize) -> (Self, mpsc::Receiver<EventMessage>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn send_event(&self, event: EventMessage) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("event channel full, dropping event");
        }
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
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
    async fn test_event_sender_delivers() {
        let (sender, mut rx) = EventSender::new(4);
        sender.send_event(EventMessage::AgreementReached {
            agreement_id: "ag1".to_string(),
            device_id: "e2edev/node1".to_string(),
        });
        match rx.recv().await.unwrap() {
            EventMessage::AgreementReached { agreement_id, .. } => {
                assert_eq!(agreement_id, "ag1");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(sender.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_event_sender_drops_when_full_without_blocking() {
        let (sender, mut rx) = EventSender::new(2);
        for i in 0..5 {
            sender.send_event(EventMessage::AgreementEnded {
                agreement_id: format!("ag{i}"),
                reason_code: 104,
            });
        }
        assert_eq!(sender.dropped_events(), 3, "overflow is dropped, not queued");

        // The first two made it through in order.
        for expected in ["ag0", "ag1"] {
            match rx.recv().await.unwrap() {
                EventMessage::AgreementEnded { agreement_id, .. } => {
                    assert_eq!(agreement_id, expected);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
