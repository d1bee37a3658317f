//! Detached-signature token envelope (§4.8). Grounded on
//! `original_source/notary/notary.go`: `header.payload[.signature]`,
//! base64url without padding, trust-on-first-use verify-key rotation.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{OverlayError, OverlayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    None,
    Ed25519,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Ed25519 => "ed25519",
        }
    }

    pub fn parse(s: &str) -> OverlayResult<Self> {
        match s {
            "none" => Ok(Algorithm::None),
            "ed25519" => Ok(Algorithm::Ed25519),
            _ => Err(OverlayError::UnknownAlgorithm),
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct Header {
    #[serde(rename = "A")]
    algorithm: String,
    #[serde(rename = "D", skip_serializing_if = "Option::is_none")]
    domain: Option<String>,
    #[serde(rename = "K", skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

/// Stores one verify key per `(domain, algorithm)`. §9 resolves the
/// external persistence question as out of scope — the in-memory
/// implementation here is sufficient since Non-goals exclude durable
/// state.
pub trait KeyStore: Send + Sync {
    fn get_key(&self, domain: &str) -> OverlayResult<Option<(Algorithm, Vec<u8>)>>;
    fn set_key(&self, domain: &str, algorithm: Algorithm, key: Vec<u8>) -> OverlayResult<()>;
}

#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: Mutex<HashMap<String, (Algorithm, Vec<u8>)>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for InMemoryKeyStore {
    fn get_key(&self, domain: &str) -> OverlayResult<Option<(Algorithm, Vec<u8>)>> {
        Ok(self.keys.lock().unwrap().get(domain).cloned())
    }

    fn set_key(&self, domain: &str, algorithm: Algorithm, key: Vec<u8>) -> OverlayResult<()> {
        self.keys
            .lock()
            .unwrap()
            .insert(domain.to_string(), (algorithm, key));
        Ok(())
    }
}

/// Result of a successful [`Notary::decode_token`] call.
pub struct DecodedToken {
    pub payload: Vec<u8>,
    pub domain: String,
    pub algorithm: Algorithm,
    pub sign: Option<Vec<u8>>,
    pub new_verify_key: Option<Vec<u8>>,
    pub verify_key: Option<Vec<u8>>,
}

pub struct Notary {
    allow_none_sign: bool,
    state: Option<Box<dyn KeyStore>>,
}

impl Notary {
    pub fn new(allow_none_sign: bool, state: Option<Box<dyn KeyStore>>) -> Self {
        Self {
            allow_none_sign,
            state,
        }
    }

    /// `ed25519.GenerateKey` equivalent; `none` takes no key material.
    pub fn generate_keypair(&self, algorithm: Algorithm) -> OverlayResult<(Vec<u8>, Vec<u8>)> {
        match algorithm {
            Algorithm::Ed25519 => {
                let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
                let verify_key = signing_key.verifying_key().to_bytes().to_vec();
                let sign_key = signing_key.to_bytes().to_vec();
                Ok((verify_key, sign_key))
            }
            Algorithm::None => Err(OverlayError::ShouldHaveNoKey),
        }
    }

    fn get_verify_key(&self, domain: &str, algorithm: Algorithm) -> OverlayResult<Option<Vec<u8>>> {
        let Some(state) = &self.state else {
            return Ok(None);
        };
        match state.get_key(domain)? {
            Some((stored_algorithm, key)) => {
                if stored_algorithm != algorithm {
                    return Err(OverlayError::UnknownAlgorithm);
                }
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }

    fn set_verify_key(&self, domain: &str, algorithm: Algorithm, key: Vec<u8>) -> OverlayResult<()> {
        match &self.state {
            Some(state) => state.set_key(domain, algorithm, key),
            None => Ok(()),
        }
    }

    pub fn encode_token(
        &self,
        payload: &[u8],
        domain: &str,
        algorithm: Algorithm,
        sign_key: Option<&[u8]>,
        new_verify_key: Option<&[u8]>,
    ) -> OverlayResult<String> {
        let encoded_payload = URL_SAFE_NO_PAD.encode(payload);

        match algorithm {
            Algorithm::Ed25519 => {
                let sign_key = sign_key.ok_or(OverlayError::SignKeyRequired)?;
                let bytes: [u8; 32] = sign_key
                    .try_into()
                    .map_err(|_| OverlayError::TokenFormat("sign key must be 32 bytes".into()))?;
                let signing_key = SigningKey::from_bytes(&bytes);

                let header = Header {
                    algorithm: Algorithm::Ed25519.as_str().to_string(),
                    domain: (!domain.is_empty()).then(|| domain.to_string()),
                    key: new_verify_key.map(|k| URL_SAFE_NO_PAD.encode(k)),
                };
                let header_bytes = serde_json::to_vec(&header)
                    .map_err(|e| OverlayError::TokenFormat(e.to_string()))?;
                let encoded_header = URL_SAFE_NO_PAD.encode(header_bytes);

                let signing_input = format!("{encoded_header}.{encoded_payload}");
                let signature: Signature = signing_key.sign(signing_input.as_bytes());
                let encoded_sign = URL_SAFE_NO_PAD.encode(signature.to_bytes());

                Ok(format!("{signing_input}.{encoded_sign}"))
            }
            Algorithm::None => {
                if sign_key.is_some() || new_verify_key.is_some() {
                    return Err(OverlayError::ShouldHaveNoKey);
                }
                let encoded_header = URL_SAFE_NO_PAD.encode(br#"{"A":"none"}"#);
                Ok(format!("{encoded_header}.{encoded_payload}"))
            }
            #[allow(unreachable_patterns)]
            _ => Err(OverlayError::UnknownAlgorithm),
        }
    }

    pub fn decode_token(&self, token: &str) -> OverlayResult<DecodedToken> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() < 2 {
            return Err(OverlayError::TokenFormat("fewer than two segments".into()));
        }

        let encoded_header = segments[0];
        let encoded_payload = segments[1];

        let payload = URL_SAFE_NO_PAD
            .decode(encoded_payload)
            .map_err(|e| OverlayError::TokenFormat(e.to_string()))?;
        let header_bytes = URL_SAFE_NO_PAD
            .decode(encoded_header)
            .map_err(|e| OverlayError::TokenFormat(e.to_string()))?;
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|e| OverlayError::TokenFormat(e.to_string()))?;

        let algorithm = Algorithm::parse(&header.algorithm)?;

        match algorithm {
            Algorithm::None => {
                if !self.allow_none_sign {
                    return Err(OverlayError::NoneSignNotAllowed);
                }
                Ok(DecodedToken {
                    payload,
                    domain: String::new(),
                    algorithm,
                    sign: None,
                    new_verify_key: None,
                    verify_key: None,
                })
            }
            Algorithm::Ed25519 => {
                if segments.len() < 3 {
                    return Err(OverlayError::TokenFormat("signature missing".into()));
                }
                let sign = URL_SAFE_NO_PAD
                    .decode(segments[2])
                    .map_err(|e| OverlayError::TokenFormat(e.to_string()))?;

                let signing_input = format!("{encoded_header}.{encoded_payload}");
                let domain = header.domain.clone().unwrap_or_default();

                let mut new_verify_key = match &header.key {
                    Some(k) => Some(
                        URL_SAFE_NO_PAD
                            .decode(k)
                            .map_err(|e| OverlayError::TokenFormat(e.to_string()))?,
                    ),
                    None => None,
                };

                let stored_verify_key = self.get_verify_key(&domain, algorithm)?;

                let verify_key = match stored_verify_key {
                    None => match &new_verify_key {
                        Some(k) => k.clone(),
                        None => return Err(OverlayError::VerifyKeyNotFound),
                    },
                    Some(stored) => {
                        if new_verify_key.as_deref() == Some(stored.as_slice()) {
                            new_verify_key = None;
                        }
                        stored
                    }
                };

                let verify_key_bytes: [u8; 32] = verify_key
                    .as_slice()
                    .try_into()
                    .map_err(|_| OverlayError::TokenFormat("verify key must be 32 bytes".into()))?;
                let verifying_key = VerifyingKey::from_bytes(&verify_key_bytes)
                    .map_err(|e| OverlayError::TokenFormat(e.to_string()))?;
                let sign_bytes: [u8; 64] = sign
                    .as_slice()
                    .try_into()
                    .map_err(|_| OverlayError::TokenFormat("signature must be 64 bytes".into()))?;
                let signature = Signature::from_bytes(&sign_bytes);

                verifying_key
                    .verify(signing_input.as_bytes(), &signature)
                    .map_err(|_| OverlayError::VerifySignFailed)?;

                if let Some(new_key) = &new_verify_key {
                    self.set_verify_key(&domain, algorithm, new_key.clone())?;
                }

                Ok(DecodedToken {
                    payload,
                    domain,
                    algorithm,
                    sign: Some(sign),
                    new_verify_key,
                    verify_key: Some(verify_key),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_algorithm_round_trips_without_keys() {
        let notary = Notary::new(true, None);
        let token = notary
            .encode_token(b"hello", "", Algorithm::None, None, None)
            .unwrap();
        assert_eq!(token.matches('.').count(), 1);
        let decoded = notary.decode_token(&token).unwrap();
        assert_eq!(decoded.payload, b"hello");
        assert!(matches!(decoded.algorithm, Algorithm::None));
    }

    #[test]
    fn none_algorithm_rejected_when_not_allowed() {
        let notary = Notary::new(false, None);
        let token = Notary::new(true, None)
            .encode_token(b"hello", "", Algorithm::None, None, None)
            .unwrap();
        let err = notary.decode_token(&token).unwrap_err();
        assert!(matches!(err, OverlayError::NoneSignNotAllowed));
    }

    #[test]
    fn ed25519_tofu_then_rotation() {
        let notary = Notary::new(false, Some(Box::new(InMemoryKeyStore::new())));
        let (verify1, sign1) = notary.generate_keypair(Algorithm::Ed25519).unwrap();

        let token1 = notary
            .encode_token(b"first", "example.domain", Algorithm::Ed25519, Some(&sign1), Some(&verify1))
            .unwrap();
        let decoded1 = notary.decode_token(&token1).unwrap();
        assert_eq!(decoded1.domain, "example.domain");
        assert_eq!(decoded1.verify_key.as_deref(), Some(verify1.as_slice()));

        // Second token signed with the same (now-stored) key carries no
        // new key and must decode without re-announcing it.
        let token2 = notary
            .encode_token(b"second", "example.domain", Algorithm::Ed25519, Some(&sign1), None)
            .unwrap();
        let decoded2 = notary.decode_token(&token2).unwrap();
        assert_eq!(decoded2.payload, b"second");

        // Rotation: sign with the still-trusted key while announcing a
        // fresh verify key.
        let (verify2, _sign2) = notary.generate_keypair(Algorithm::Ed25519).unwrap();
        let token3 = notary
            .encode_token(b"third", "example.domain", Algorithm::Ed25519, Some(&sign1), Some(&verify2))
            .unwrap();
        let decoded3 = notary.decode_token(&token3).unwrap();
        assert_eq!(decoded3.new_verify_key.as_deref(), Some(verify2.as_slice()));

        let token4 = notary
            .encode_token(b"fourth", "example.domain", Algorithm::Ed25519, Some(&sign1), None)
            .unwrap();
        // The old sign key's signature no longer matches the now-stored
        // (rotated) verify key.
        let err = notary.decode_token(&token4).unwrap_err();
        assert!(matches!(err, OverlayError::VerifySignFailed));
    }

    #[test]
    fn unknown_verify_key_without_announcement_fails() {
        let notary = Notary::new(false, Some(Box::new(InMemoryKeyStore::new())));
        let (_verify, sign1) = notary.generate_keypair(Algorithm::Ed25519).unwrap();
        let token = notary
            .encode_token(b"x", "nobody", Algorithm::Ed25519, Some(&sign1), None)
            .unwrap();
        let err = notary.decode_token(&token).unwrap_err();
        assert!(matches!(err, OverlayError::VerifyKeyNotFound));
    }
}
