//! Signature policy
//!
//! Signed payloads carry a `"signatures"` array:
//!
//! ```json
//! {"currentTime": "...", "signatures": [{"keyId": "csms-1", "algorithm": "HMAC-SHA256", "value": "9f2c..."}]}
//! ```
//!
//! Each signature covers the canonical form of the payload: the payload
//! without its `"signatures"` member, serialized compactly with object keys
//! sorted at every level.
//!
//! Rules are checked in registration order and the first rule matching the
//! message's direction and action applies. With no matching rule the message
//! is neither signed nor checked.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::ocpp::Payload;

type HmacSha256 = Hmac<Sha256>;

/// Payload member holding the signatures
pub const SIGNATURES_FIELD: &str = "signatures";

/// Which half of an exchange a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

/// How strictly a rule checks signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Enforcement {
    /// At least one valid signature by a configured key
    Required,
    /// Unsigned payloads pass, but signatures by configured keys must verify
    Optional,
    /// Nothing is signed or checked
    #[default]
    Skip,
}

/// Supported signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    HmacSha256,
    Ed25519,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::HmacSha256 => "HMAC-SHA256",
            SignatureAlgorithm::Ed25519 => "Ed25519",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification failures. Inbound calls failing verification are answered
/// with a `SecurityError` and never reach a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("{action}: a valid signature is required")]
    Missing { action: String },

    #[error("{action}: signature by {key_id} is invalid: {reason}")]
    Invalid {
        action: String,
        key_id: String,
        reason: String,
    },

    #[error("{action}: binary payloads cannot carry the required signature")]
    UnsignablePayload { action: String },

    #[error("{action}: malformed signatures: {reason}")]
    Malformed { action: String, reason: String },
}

/// Failures while signing an outgoing payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("{action}: no configured key can sign")]
    NoSigningKey { action: String },

    #[error("{action}: binary payloads cannot be signed")]
    UnsignablePayload { action: String },

    #[error("{action}: payload is not a JSON object")]
    NotAnObject { action: String },

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Key material for one signer
#[derive(Clone)]
pub enum KeyMaterial {
    /// Shared secret, used to both sign and verify
    HmacSha256(Vec<u8>),
    /// Public key, plus the private key when this node signs
    Ed25519 {
        signing: Option<SigningKey>,
        verifying: VerifyingKey,
    },
}

impl KeyMaterial {
    pub fn hmac_sha256(secret: impl Into<Vec<u8>>) -> Self {
        KeyMaterial::HmacSha256(secret.into())
    }

    /// Ed25519 key pair from a 32-byte secret seed
    pub fn ed25519_signer(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        KeyMaterial::Ed25519 {
            verifying: signing.verifying_key(),
            signing: Some(signing),
        }
    }

    /// Verify-only Ed25519 key from a 32-byte public key
    pub fn ed25519_verifier(public: &[u8; 32]) -> Result<Self, SigningError> {
        let verifying =
            VerifyingKey::from_bytes(public).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        Ok(KeyMaterial::Ed25519 {
            signing: None,
            verifying,
        })
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            KeyMaterial::HmacSha256(_) => SignatureAlgorithm::HmacSha256,
            KeyMaterial::Ed25519 { .. } => SignatureAlgorithm::Ed25519,
        }
    }

    pub fn can_sign(&self) -> bool {
        match self {
            KeyMaterial::HmacSha256(_) => true,
            KeyMaterial::Ed25519 { signing, .. } => signing.is_some(),
        }
    }

    fn sign(&self, message: &[u8]) -> Option<Vec<u8>> {
        match self {
            KeyMaterial::HmacSha256(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret).ok()?;
                mac.update(message);
                Some(mac.finalize().into_bytes().to_vec())
            }
            KeyMaterial::Ed25519 { signing, .. } => {
                signing.as_ref().map(|key| key.sign(message).to_bytes().to_vec())
            }
        }
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), String> {
        match self {
            KeyMaterial::HmacSha256(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| e.to_string())?;
                mac.update(message);
                mac.verify_slice(signature).map_err(|_| "MAC mismatch".to_string())
            }
            KeyMaterial::Ed25519 { verifying, .. } => {
                let signature = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|e| e.to_string())?;
                verifying.verify(message, &signature).map_err(|e| e.to_string())
            }
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::HmacSha256(_) => f.write_str("HmacSha256(<secret>)"),
            KeyMaterial::Ed25519 { signing, verifying } => f
                .debug_struct("Ed25519")
                .field("verifying", &hex::encode(verifying.as_bytes()))
                .field("can_sign", &signing.is_some())
                .finish(),
        }
    }
}

/// A configured key and the id it signs under
#[derive(Debug, Clone)]
pub struct SignatureKey {
    pub key_id: String,
    pub material: KeyMaterial,
}

/// One entry of a payload's `"signatures"` array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSignature {
    pub key_id: String,
    pub algorithm: String,
    /// Hex-encoded signature bytes
    pub value: String,
}

/// Matches messages by direction and action, and says how to treat them
#[derive(Debug, Clone, Default)]
pub struct SignatureRule {
    pub direction: Option<Direction>,
    pub action: Option<String>,
    pub enforcement: Enforcement,
    pub keys: Vec<SignatureKey>,
}

impl SignatureRule {
    /// A rule matching every message
    pub fn new(enforcement: Enforcement) -> Self {
        Self {
            enforcement,
            ..Default::default()
        }
    }

    pub fn for_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn for_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_key(mut self, key_id: impl Into<String>, material: KeyMaterial) -> Self {
        self.keys.push(SignatureKey {
            key_id: key_id.into(),
            material,
        });
        self
    }

    pub fn matches(&self, action: &str, direction: Direction) -> bool {
        self.direction.map_or(true, |d| d == direction)
            && self.action.as_deref().map_or(true, |a| a == action)
    }

    fn key(&self, key_id: &str) -> Option<&SignatureKey> {
        self.keys.iter().find(|key| key.key_id == key_id)
    }
}

/// Ordered rule set; the default policy accepts unsigned messages
#[derive(Debug, Clone, Default)]
pub struct SignaturePolicy {
    rules: Vec<SignatureRule>,
}

impl SignaturePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: SignatureRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[SignatureRule] {
        &self.rules
    }

    /// First rule matching the message, if any
    pub fn rule_for(&self, action: &str, direction: Direction) -> Option<&SignatureRule> {
        self.rules.iter().find(|rule| rule.matches(action, direction))
    }

    pub fn enforcement(&self, action: &str, direction: Direction) -> Enforcement {
        self.rule_for(action, direction)
            .map_or(Enforcement::Skip, |rule| rule.enforcement)
    }

    /// Sign an outgoing payload with every key of the matching rule that can sign.
    /// Existing signatures are replaced.
    pub fn sign_outgoing(
        &self,
        action: &str,
        direction: Direction,
        payload: Payload,
    ) -> Result<Payload, SigningError> {
        let Some(rule) = self.rule_for(action, direction) else {
            return Ok(payload);
        };
        if rule.enforcement == Enforcement::Skip {
            return Ok(payload);
        }

        let mut object = match payload {
            Payload::Json(Value::Object(object)) => object,
            Payload::Json(_) => {
                return Err(SigningError::NotAnObject {
                    action: action.to_string(),
                })
            }
            Payload::Binary(bytes) => {
                return match rule.enforcement {
                    Enforcement::Required => Err(SigningError::UnsignablePayload {
                        action: action.to_string(),
                    }),
                    _ => Ok(Payload::Binary(bytes)),
                };
            }
        };

        object.remove(SIGNATURES_FIELD);
        let canonical = canonical_bytes(&Value::Object(object.clone()));

        let signatures: Vec<MessageSignature> = rule
            .keys
            .iter()
            .filter_map(|key| {
                key.material.sign(&canonical).map(|value| MessageSignature {
                    key_id: key.key_id.clone(),
                    algorithm: key.material.algorithm().to_string(),
                    value: hex::encode(value),
                })
            })
            .collect();

        if signatures.is_empty() {
            return match rule.enforcement {
                Enforcement::Required => Err(SigningError::NoSigningKey {
                    action: action.to_string(),
                }),
                _ => Ok(Payload::Json(Value::Object(object))),
            };
        }

        debug!("{} {:?} signed by {} key(s)", action, direction, signatures.len());
        let signatures = serde_json::to_value(signatures)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        object.insert(SIGNATURES_FIELD.to_string(), signatures);
        Ok(Payload::Json(Value::Object(object)))
    }

    /// Check an incoming payload against the matching rule.
    ///
    /// Signatures by keys the rule does not know are ignored; a signature by
    /// a known key that fails to verify rejects the payload.
    pub fn verify_incoming(
        &self,
        action: &str,
        direction: Direction,
        payload: &Payload,
    ) -> Result<(), SignatureError> {
        let Some(rule) = self.rule_for(action, direction) else {
            return Ok(());
        };
        if rule.enforcement == Enforcement::Skip {
            return Ok(());
        }

        let value = match payload {
            Payload::Json(value) => value,
            Payload::Binary(_) => {
                return match rule.enforcement {
                    Enforcement::Required => Err(SignatureError::UnsignablePayload {
                        action: action.to_string(),
                    }),
                    _ => Ok(()),
                };
            }
        };

        let malformed = |reason: String| SignatureError::Malformed {
            action: action.to_string(),
            reason,
        };

        let signatures: Vec<MessageSignature> = match value.get(SIGNATURES_FIELD) {
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| malformed(e.to_string()))?,
            None => Vec::new(),
        };

        let canonical = match value {
            Value::Object(object) => {
                let mut unsigned = object.clone();
                unsigned.remove(SIGNATURES_FIELD);
                canonical_bytes(&Value::Object(unsigned))
            }
            other => canonical_bytes(other),
        };

        let mut valid = 0;
        for signature in &signatures {
            let Some(key) = rule.key(&signature.key_id) else {
                debug!("{}: ignoring signature by unknown key {}", action, signature.key_id);
                continue;
            };

            let invalid = |reason: String| SignatureError::Invalid {
                action: action.to_string(),
                key_id: signature.key_id.clone(),
                reason,
            };

            if signature.algorithm != key.material.algorithm().as_str() {
                return Err(invalid(format!(
                    "algorithm {} does not match key algorithm {}",
                    signature.algorithm,
                    key.material.algorithm()
                )));
            }
            let bytes = hex::decode(&signature.value).map_err(|e| invalid(e.to_string()))?;
            key.material.verify(&canonical, &bytes).map_err(invalid)?;
            valid += 1;
        }

        if valid == 0 && rule.enforcement == Enforcement::Required {
            return Err(SignatureError::Missing {
                action: action.to_string(),
            });
        }
        Ok(())
    }
}

/// Compact JSON with object keys sorted at every level
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<_> = object.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push(b'{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(value, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        // Scalars have a single compact rendering
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hmac_policy(enforcement: Enforcement) -> SignaturePolicy {
        SignaturePolicy::new().with_rule(
            SignatureRule::new(enforcement)
                .for_action("Reset")
                .with_key("csms-1", KeyMaterial::hmac_sha256(b"shared-secret".to_vec())),
        )
    }

    fn signed_reset(policy: &SignaturePolicy) -> Payload {
        policy
            .sign_outgoing("Reset", Direction::Request, Payload::Json(json!({"type": "Immediate"})))
            .unwrap()
    }

    #[test]
    fn test_canonical_form_sorts_keys() {
        let a = json!({"b": 1, "a": {"y": [1, {"d": 2, "c": 3}], "x": "s"}});
        assert_eq!(
            String::from_utf8(canonical_bytes(&a)).unwrap(),
            r#"{"a":{"x":"s","y":[1,{"c":3,"d":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_hmac_sign_then_verify() {
        let policy = hmac_policy(Enforcement::Required);
        let payload = signed_reset(&policy);

        let signatures = &payload.as_json().unwrap()[SIGNATURES_FIELD];
        assert_eq!(signatures[0]["keyId"], "csms-1");
        assert_eq!(signatures[0]["algorithm"], "HMAC-SHA256");
        assert!(policy.verify_incoming("Reset", Direction::Request, &payload).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let policy = hmac_policy(Enforcement::Required);
        let mut payload = signed_reset(&policy);
        if let Payload::Json(value) = &mut payload {
            value["type"] = json!("OnIdle");
        }

        let err = policy
            .verify_incoming("Reset", Direction::Request, &payload)
            .unwrap_err();
        assert!(matches!(err, SignatureError::Invalid { key_id, .. } if key_id == "csms-1"));
    }

    #[test]
    fn test_required_rejects_unsigned() {
        let policy = hmac_policy(Enforcement::Required);
        let err = policy
            .verify_incoming("Reset", Direction::Request, &Payload::empty())
            .unwrap_err();
        assert_eq!(err, SignatureError::Missing { action: "Reset".into() });
    }

    #[test]
    fn test_optional_accepts_unsigned_but_checks_known_keys() {
        let policy = hmac_policy(Enforcement::Optional);
        assert!(policy
            .verify_incoming("Reset", Direction::Request, &Payload::empty())
            .is_ok());

        let forged = Payload::Json(json!({
            "type": "Immediate",
            "signatures": [{"keyId": "csms-1", "algorithm": "HMAC-SHA256", "value": "00ff"}]
        }));
        assert!(policy
            .verify_incoming("Reset", Direction::Request, &forged)
            .is_err());
    }

    #[test]
    fn test_unknown_key_does_not_count() {
        let policy = hmac_policy(Enforcement::Required);
        let payload = Payload::Json(json!({
            "signatures": [{"keyId": "someone-else", "algorithm": "HMAC-SHA256", "value": "00"}]
        }));

        let err = policy
            .verify_incoming("Reset", Direction::Request, &payload)
            .unwrap_err();
        assert!(matches!(err, SignatureError::Missing { .. }));
    }

    #[test]
    fn test_unmatched_action_is_unchecked() {
        let policy = hmac_policy(Enforcement::Required);
        let payload = policy
            .sign_outgoing("Heartbeat", Direction::Request, Payload::empty())
            .unwrap();

        assert_eq!(payload, Payload::empty());
        assert!(policy
            .verify_incoming("Heartbeat", Direction::Request, &payload)
            .is_ok());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = SignaturePolicy::new()
            .with_rule(SignatureRule::new(Enforcement::Skip).for_action("Heartbeat"))
            .with_rule(
                SignatureRule::new(Enforcement::Required)
                    .with_key("k", KeyMaterial::hmac_sha256(b"s".to_vec())),
            );

        assert_eq!(policy.enforcement("Heartbeat", Direction::Request), Enforcement::Skip);
        assert_eq!(policy.enforcement("Reset", Direction::Request), Enforcement::Required);
        assert!(policy
            .verify_incoming("Heartbeat", Direction::Request, &Payload::empty())
            .is_ok());
    }

    #[test]
    fn test_direction_filter() {
        let policy = SignaturePolicy::new().with_rule(
            SignatureRule::new(Enforcement::Required)
                .for_direction(Direction::Response)
                .with_key("k", KeyMaterial::hmac_sha256(b"s".to_vec())),
        );

        assert!(policy
            .verify_incoming("Reset", Direction::Request, &Payload::empty())
            .is_ok());
        assert!(policy
            .verify_incoming("Reset", Direction::Response, &Payload::empty())
            .is_err());
    }

    #[test]
    fn test_binary_payloads() {
        let required = hmac_policy(Enforcement::Required);
        let blob = Payload::Binary(vec![1, 2, 3]);
        assert!(matches!(
            required.verify_incoming("Reset", Direction::Request, &blob),
            Err(SignatureError::UnsignablePayload { .. })
        ));
        assert!(required
            .sign_outgoing("Reset", Direction::Request, blob.clone())
            .is_err());

        let optional = hmac_policy(Enforcement::Optional);
        assert!(optional
            .verify_incoming("Reset", Direction::Request, &blob)
            .is_ok());
        assert_eq!(
            optional
                .sign_outgoing("Reset", Direction::Request, blob.clone())
                .unwrap(),
            blob
        );
    }

    #[test]
    fn test_ed25519_signatures() {
        let seed = [7u8; 32];
        let signer = KeyMaterial::ed25519_signer(&seed);
        let public = match &signer {
            KeyMaterial::Ed25519 { verifying, .. } => verifying.to_bytes(),
            _ => unreachable!(),
        };

        let sending = SignaturePolicy::new()
            .with_rule(SignatureRule::new(Enforcement::Required).with_key("cs-ed", signer));
        let receiving = SignaturePolicy::new().with_rule(
            SignatureRule::new(Enforcement::Required)
                .with_key("cs-ed", KeyMaterial::ed25519_verifier(&public).unwrap()),
        );

        let payload = sending
            .sign_outgoing("DataTransfer", Direction::Request, Payload::Json(json!({"vendorId": "EK"})))
            .unwrap();
        assert!(receiving
            .verify_incoming("DataTransfer", Direction::Request, &payload)
            .is_ok());

        // Verify-only keys cannot sign
        assert_eq!(
            receiving
                .sign_outgoing("DataTransfer", Direction::Request, Payload::empty())
                .unwrap_err(),
            SigningError::NoSigningKey { action: "DataTransfer".into() }
        );
    }

    #[test]
    fn test_debug_hides_secrets() {
        let material = KeyMaterial::hmac_sha256(b"top-secret".to_vec());
        assert!(!format!("{:?}", material).contains("top-secret"));
    }
}
