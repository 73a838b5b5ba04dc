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

//! Encrypted, TTL-bounded message delivery into a node's exchange
//! mailbox. Transient POST failures sleep ten seconds and retry without
//! bound — deliberate backpressure against a down exchange. Everything
//! else surfaces immediately.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use ed25519_dalek::{Signer, SigningKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, enabled, Level};

use covenant_config::Config;
use covenant_runtime::{Attempt, RetryPolicy};

use crate::exchange::{get_org, ExchangeClient, PostMessageBody};
use crate::protocol::{obscure_proposal_secret, MessageSender, Proposal};
use crate::AgbotError;

const NONCE_LEN: usize = 12;
const KEY_DERIVATION_INFO: &[u8] = b"covenant:exchange-msgs";
const KEY_FILE: &str = "agbot.priv";

// ---------------------------------------------------------------------------
// Message target
// ---------------------------------------------------------------------------

/// A receiver on the exchange: its id plus the public key the agreement
/// protocol handed us. The key stays base64 until a send actually needs
/// the bytes.
#[derive(Clone, Debug)]
pub struct MessageTarget {
    pub receiver_exchange_id: String,
    /// Direct delivery endpoint, when the node advertises one. Mailbox
    /// delivery ignores it.
    pub msg_endpoint: String,
    receiver_public_key_b64: String,
}

impl MessageTarget {
    #[must_use]
    pub fn new(receiver_exchange_id: &str, public_key_b64: &str) -> Self {
        Self {
            receiver_exchange_id: receiver_exchange_id.to_string(),
            msg_endpoint: String::new(),
            receiver_public_key_b64: public_key_b64.to_string(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, msg_endpoint: &str) -> Self {
        self.msg_endpoint = msg_endpoint.to_string();
        self
    }

    /// Decode the receiver's public key.
    ///
    /// # Errors
    ///
    /// Returns `AgbotError::Crypto` when the stored key is not valid
    /// base64.
    pub fn public_key_bytes(&self) -> Result<Vec<u8>, AgbotError> {
        BASE64.decode(&self.receiver_public_key_b64).map_err(|e| {
            AgbotError::Crypto(format!(
                "unable to decode public key for {}: {e}",
                self.receiver_exchange_id
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Mailbox keypair
// ---------------------------------------------------------------------------

/// The agbot's mailbox keypair. The signing half also signs proposal
/// terms so producers can verify who formed them.
#[derive(Debug)]
pub struct MessageKeypair {
    signing: SigningKey,
}

impl MessageKeypair {
    #[must_use]
    pub fn from_signing_key(signing: SigningKey) -> Self {
        Self { signing }
    }

    #[must_use]
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing.verifying_key().to_bytes())
    }

    fn private_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Sign a payload, returning the base64 signature.
    #[must_use]
    pub fn sign(&self, payload: &[u8]) -> String {
        BASE64.encode(self.signing.sign(payload).to_bytes())
    }
}

/// Load the keypair from `<dir>/agbot.priv` (base64, 32 bytes).
///
/// # Errors
///
/// Returns `AgbotError::Crypto` when the file is unreadable or not a
/// valid key.
pub async fn load_keypair(key_path: &str) -> Result<MessageKeypair, AgbotError> {
    let path = std::path::Path::new(key_path).join(KEY_FILE);
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| AgbotError::Crypto(format!("unable to read {}: {e}", path.display())))?;
    let bytes = BASE64
        .decode(contents.trim())
        .map_err(|e| AgbotError::Crypto(format!("key file is not base64: {e}")))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| AgbotError::Crypto("key file must hold 32 bytes".to_string()))?;
    Ok(MessageKeypair::from_signing_key(SigningKey::from_bytes(&key)))
}

/// Base64 SHA-256 digest of a payload, recorded alongside the signature.
#[must_use]
pub fn hash_payload(payload: &[u8]) -> String {
    BASE64.encode(Sha256::digest(payload))
}

// ---------------------------------------------------------------------------
// Envelope encryption
// ---------------------------------------------------------------------------

/// Wire form of one encrypted mailbox message.
#[derive(Serialize, Deserialize, Debug)]
pub struct EncryptedEnvelope {
    pub sender_public_key: String,
    pub nonce: String,
    pub ciphertext: String,
}

fn derive_message_key(sender_priv: &[u8], receiver_pub: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(receiver_pub), sender_priv);
    let mut derived = [0u8; 32];
    // expand only fails for absurd output lengths; 32 bytes is fine
    let _ = hk.expand(KEY_DERIVATION_INFO, &mut derived);
    derived
}

/// Encrypt a payload for a receiver using a key derived from the sender's
/// private key and the receiver's public key.
///
/// # Errors
///
/// Returns `AgbotError::Crypto` when AEAD sealing fails.
pub fn encrypt_exchange_message(
    payload: &[u8],
    keypair: &MessageKeypair,
    receiver_pub: &[u8],
) -> Result<EncryptedEnvelope, AgbotError> {
    let key = derive_message_key(&keypair.private_bytes(), receiver_pub);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|e| AgbotError::Crypto(format!("encryption failed: {e}")))?;
    Ok(EncryptedEnvelope {
        sender_public_key: keypair.public_key_b64(),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Open an envelope with the same derivation the sender used.
///
/// # Errors
///
/// Returns `AgbotError::Crypto` on malformed fields or a failed auth tag.
pub fn decrypt_exchange_message(
    envelope: &EncryptedEnvelope,
    sender_priv: &[u8],
    receiver_pub: &[u8],
) -> Result<Vec<u8>, AgbotError> {
    let key = derive_message_key(sender_priv, receiver_pub);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let nonce = BASE64
        .decode(&envelope.nonce)
        .map_err(|e| AgbotError::Crypto(format!("bad nonce: {e}")))?;
    let ciphertext = BASE64
        .decode(&envelope.ciphertext)
        .map_err(|e| AgbotError::Crypto(format!("bad ciphertext: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| AgbotError::Crypto("decryption failed".to_string()))
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// [`MessageSender`] over the exchange mailbox API.
pub struct ExchangeMessenger {
    config: Arc<Config>,
    exchange: Arc<dyn ExchangeClient>,
    retry: RetryPolicy,
}

impl ExchangeMessenger {
    #[must_use]
    pub fn new(config: Arc<Config>, exchange: Arc<dyn ExchangeClient>) -> Self {
        Self {
            config,
            exchange,
            retry: RetryPolicy::unbounded(std::time::Duration::from_secs(10)),
        }
    }
}

#[async_trait::async_trait]
impl MessageSender for ExchangeMessenger {
    async fn send_message(&self, target: &MessageTarget, payload: &[u8]) -> Result<(), AgbotError> {
        // At trace level the payload is logged; a proposal's secrets must
        // be obscured first, and an obscuring failure logs nothing at all.
        if enabled!(Level::TRACE) {
            let mut log_msg = String::from_utf8_lossy(payload).to_string();
            if let Ok(prop) = serde_json::from_slice::<Proposal>(payload) {
                if !prop.agreement_id.is_empty() {
                    log_msg = obscure_proposal_secret(&log_msg).unwrap_or_default();
                }
            }
            tracing::trace!(
                receiver = %target.receiver_exchange_id,
                message = %log_msg,
                "sending exchange message"
            );
        }

        let keypair = load_keypair(&self.config.exchange.message_key_path).await?;
        let receiver_pub = target.public_key_bytes()?;

        let device = self.exchange.get_device(&target.receiver_exchange_id).await?;
        let mut max_hb = device.heartbeat_intv.max_interval;
        if max_hb == 0 {
            max_hb = self
                .exchange
                .get_org_max_heartbeat(get_org(&target.receiver_exchange_id))
                .await?;
        }
        let ttl = self.config.exchange.message_ttl(max_hb);

        let envelope = encrypt_exchange_message(payload, &keypair, &receiver_pub)?;
        let envelope_json = serde_json::to_vec(&envelope)
            .map_err(|e| AgbotError::Decode(format!("cannot marshal envelope: {e}")))?;
        let body = PostMessageBody {
            message: BASE64.encode(envelope_json),
            ttl,
        };

        self.retry
            .run(|| {
                let body = body.clone();
                async move {
                    match self
                        .exchange
                        .post_node_message(&target.receiver_exchange_id, &body)
                        .await
                    {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_transient() => Err(Attempt::Transient(e)),
                        Err(e) => Err(Attempt::Fatal(e)),
                    }
                }
            })
            .await?;

        debug!(receiver = %target.receiver_exchange_id, ttl, "sent exchange message");
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

    fn test_keypair() -> MessageKeypair {
        MessageKeypair::from_signing_key(SigningKey::from_bytes(&[7u8; 32]))
    }

    #[test]
    fn test_target_decodes_key_lazily() {
        let target = MessageTarget::new("e2edev/node1", &BASE64.encode([1u8; 32]));
        assert_eq!(target.public_key_bytes().unwrap(), vec![1u8; 32]);

        let bad = MessageTarget::new("e2edev/node1", "!!not-base64!!");
        assert!(bad.public_key_bytes().is_err());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let kp = test_keypair();
        let receiver_pub = [9u8; 32];
        let payload = br#"{"msg_type":"cancel","agreement_id":"ag1"}"#;

        let env = encrypt_exchange_message(payload, &kp, &receiver_pub).unwrap();
        assert_ne!(env.ciphertext, BASE64.encode(payload));

        let opened = decrypt_exchange_message(&env, &kp.private_bytes(), &receiver_pub).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_envelope_tamper_detected() {
        let kp = test_keypair();
        let receiver_pub = [9u8; 32];
        let mut env = encrypt_exchange_message(b"payload", &kp, &receiver_pub).unwrap();
        env.ciphertext = BASE64.encode(b"tampered-bytes-here");
        assert!(decrypt_exchange_message(&env, &kp.private_bytes(), &receiver_pub).is_err());
    }

    #[test]
    fn test_derived_key_depends_on_both_parties() {
        let a = derive_message_key(&[1u8; 32], &[2u8; 32]);
        let b = derive_message_key(&[1u8; 32], &[3u8; 32]);
        let c = derive_message_key(&[4u8; 32], &[2u8; 32]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sign_and_hash_are_stable() {
        let kp = test_keypair();
        let sig1 = kp.sign(b"terms");
        let sig2 = kp.sign(b"terms");
        assert_eq!(sig1, sig2, "ed25519 signatures are deterministic");
        assert_ne!(kp.sign(b"other"), sig1);

        assert_eq!(hash_payload(b"terms"), hash_payload(b"terms"));
        assert_ne!(hash_payload(b"terms"), hash_payload(b"other"));
    }

    #[tokio::test]
    async fn test_load_keypair_from_disk() {
        let dir = std::env::temp_dir().join("covenant-key-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(KEY_FILE), BASE64.encode([7u8; 32]))
            .await
            .unwrap();

        let kp = load_keypair(dir.to_str().unwrap()).await.unwrap();
        assert_eq!(kp.public_key_b64(), test_keypair().public_key_b64());
    }

    #[tokio::test]
    async fn test_load_keypair_missing_file() {
        let err = load_keypair("/definitely/not/a/path").await.unwrap_err();
        assert!(matches!(err, AgbotError::Crypto(_)));
    }
}
