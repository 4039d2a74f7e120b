//! Derived-secret management.
//!
//! One process-wide master key is loaded at startup and injected into every
//! consumer; it is the only secret this system stores. Everything a tenant
//! runtime needs (gateway token, hook token, age identity) is a pure function
//! of `(master_key, tenant_id)`, so there is nothing to persist or revoke.
//! Rotating the master key atomically invalidates every derived secret.

pub mod agekey;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::SecretsConfig;
use crate::error::{ConfigError, SecretsError};

/// HKDF info label for age identity derivation. Changing it rotates every
/// tenant's keypair, so it is versioned.
const AGE_KEY_INFO: &[u8] = b"aegis-control/age-identity/v1";

/// Distinguishing prefix folded into hook-token derivation.
const HOOK_TOKEN_PREFIX: &str = "hook";

/// Derived token length in characters.
const TOKEN_LEN: usize = 64;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// An age-format X25519 keypair, both halves as encoded key-file strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgeKeypair {
    /// Recipient string (`age1...`).
    pub public: String,
    /// Identity string (`AGE-SECRET-KEY-1...`).
    pub private: String,
}

/// Deterministic token derivation, authenticated encryption, and age keypair
/// derivation over one immutable master key.
pub struct SecretsManager {
    master_key: SecretBox<[u8; 32]>,
}

impl SecretsManager {
    /// Build the manager from resolved configuration.
    ///
    /// Outside development/test a missing master key is a fatal, fail-closed
    /// configuration error: a silently derived key would mint tenant secrets
    /// no other process could reproduce.
    pub fn from_config(config: &SecretsConfig) -> Result<Self, ConfigError> {
        let key_bytes = match &config.master_key {
            Some(raw) => parse_master_key(raw.expose_secret()),
            None => {
                if !config.environment.allows_derived_dev_key() {
                    return Err(ConfigError::MissingRequired {
                        key: "SECRETS_MASTER_KEY".to_string(),
                        hint: "Set a 64-hex-char or 32-byte-base64 master key; \
                               derived tenant secrets cannot exist without it."
                            .to_string(),
                    });
                }
                tracing::warn!(
                    "SECRETS_MASTER_KEY is not set; using a fixed development key. \
                     Derived secrets are NOT safe for production."
                );
                sha256(b"aegis-control development master key")
            }
        };
        Ok(Self::from_key(key_bytes))
    }

    /// Build the manager from raw key bytes. Tests use this to supply
    /// distinct keys without touching shared state.
    pub fn from_key(key: [u8; 32]) -> Self {
        Self {
            master_key: SecretBox::new(Box::new(key)),
        }
    }

    /// Gateway auth token for a tenant:
    /// `base64url(sha256(tenant_id + ":" + hex(master_key)))[..64]`.
    pub fn gateway_token(&self, tenant_id: &str) -> String {
        self.derive_token(&format!("{tenant_id}:{}", self.master_key_hex()))
    }

    /// Hook token for a tenant: same scheme as the gateway token with a
    /// distinguishing prefix, so the two can never collide.
    pub fn hook_token(&self, tenant_id: &str) -> String {
        self.derive_token(&format!(
            "{HOOK_TOKEN_PREFIX}:{tenant_id}:{}",
            self.master_key_hex()
        ))
    }

    /// Constant-time check of a presented gateway token.
    pub fn verify_gateway_token(&self, tenant_id: &str, candidate: &str) -> bool {
        let expected = self.gateway_token(tenant_id);
        expected.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    /// Encrypt with AES-256-GCM. Serialized as
    /// `base64url(iv).base64url(tag).base64url(payload)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, SecretsError> {
        let cipher = self.cipher()?;
        let mut iv = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let mut payload = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut payload)
            .map_err(|_| SecretsError::EncryptionFailed("AES-GCM seal failed".to_string()))?;

        Ok(format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(iv),
            URL_SAFE_NO_PAD.encode(tag),
            URL_SAFE_NO_PAD.encode(&payload)
        ))
    }

    /// Decrypt an `iv.tag.payload` string. Fails closed on malformed input or
    /// tag mismatch; never returns partial plaintext.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, SecretsError> {
        let parts: Vec<&str> = ciphertext.split('.').collect();
        if parts.len() != 3 {
            return Err(SecretsError::MalformedCiphertext(format!(
                "expected 3 dot-separated segments, got {}",
                parts.len()
            )));
        }
        let iv = decode_segment(parts[0], "iv")?;
        let tag = decode_segment(parts[1], "tag")?;
        let mut payload = decode_segment(parts[2], "payload")?;
        if iv.len() != NONCE_LEN {
            return Err(SecretsError::MalformedCiphertext(format!(
                "iv must be {NONCE_LEN} bytes, got {}",
                iv.len()
            )));
        }
        if tag.len() != TAG_LEN {
            return Err(SecretsError::MalformedCiphertext(format!(
                "auth tag must be {TAG_LEN} bytes, got {}",
                tag.len()
            )));
        }

        let cipher = self.cipher()?;
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&iv),
                b"",
                &mut payload,
                Tag::from_slice(&tag),
            )
            .map_err(|_| SecretsError::AuthenticationFailed)?;
        Ok(payload)
    }

    /// Derive the tenant's age keypair:
    /// HKDF-SHA256(master_key, salt=tenant_id, info=fixed label) → 32 bytes,
    /// treated as an X25519 private scalar.
    pub fn derive_age_keypair(&self, tenant_id: &str) -> Result<AgeKeypair, SecretsError> {
        let hk = Hkdf::<Sha256>::new(Some(tenant_id.as_bytes()), self.master_key.expose_secret());
        let mut seed = [0u8; 32];
        hk.expand(AGE_KEY_INFO, &mut seed)
            .map_err(|e| SecretsError::KeyDerivation(e.to_string()))?;

        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);

        Ok(AgeKeypair {
            public: agekey::encode_recipient(public.as_bytes()),
            private: agekey::encode_identity(&seed),
        })
    }

    fn cipher(&self) -> Result<Aes256Gcm, SecretsError> {
        Aes256Gcm::new_from_slice(self.master_key.expose_secret())
            .map_err(|e| SecretsError::EncryptionFailed(e.to_string()))
    }

    fn master_key_hex(&self) -> String {
        hex::encode(self.master_key.expose_secret())
    }

    fn derive_token(&self, input: &str) -> String {
        let digest = sha256(input.as_bytes());
        let mut token = URL_SAFE_NO_PAD.encode(digest);
        token.truncate(TOKEN_LEN);
        token
    }
}

/// Accept 64 hex chars or 32-byte base64; hash anything else to 32 bytes.
fn parse_master_key(raw: &str) -> [u8; 32] {
    let trimmed = raw.trim();
    if trimmed.len() == 64
        && let Ok(bytes) = hex::decode(trimmed)
        && let Ok(key) = <[u8; 32]>::try_from(bytes)
    {
        return key;
    }
    if let Ok(bytes) = STANDARD.decode(trimmed)
        && let Ok(key) = <[u8; 32]>::try_from(bytes)
    {
        return key;
    }
    sha256(trimmed.as_bytes())
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>, SecretsError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| SecretsError::MalformedCiphertext(format!("{name}: {e}")))
}

fn sha256(input: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(input);
    digest.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SecretsManager {
        SecretsManager::from_key([3u8; 32])
    }

    #[test]
    fn tokens_are_deterministic_and_scoped() {
        let m = manager();
        assert_eq!(m.gateway_token("tenant-a"), m.gateway_token("tenant-a"));
        assert_ne!(m.gateway_token("tenant-a"), m.gateway_token("tenant-b"));
        assert_ne!(m.gateway_token("tenant-a"), m.hook_token("tenant-a"));

        let other = SecretsManager::from_key([9u8; 32]);
        assert_ne!(m.gateway_token("tenant-a"), other.gateway_token("tenant-a"));
    }

    #[test]
    fn token_verification_is_exact() {
        let m = manager();
        let token = m.gateway_token("t1");
        assert!(m.verify_gateway_token("t1", &token));
        assert!(!m.verify_gateway_token("t1", &token[..token.len() - 1]));
        assert!(!m.verify_gateway_token("t2", &token));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let m = manager();
        let plaintext = b"channel webhook secret";
        let sealed = m.encrypt(plaintext).unwrap();
        assert_eq!(sealed.split('.').count(), 3);
        assert_eq!(m.decrypt(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn single_byte_mutation_fails_decryption() {
        let m = manager();
        let sealed = m.encrypt(b"payload under test").unwrap();

        // Mutate one character in each segment; every variant must fail.
        for idx in [1usize, sealed.find('.').unwrap() + 2, sealed.len() - 1] {
            let mut bytes = sealed.clone().into_bytes();
            bytes[idx] = if bytes[idx] == b'A' { b'B' } else { b'A' };
            let mutated = String::from_utf8(bytes).unwrap();
            assert!(m.decrypt(&mutated).is_err(), "mutation at {idx} accepted");
        }
    }

    #[test]
    fn decrypt_rejects_malformed_structure() {
        let m = manager();
        assert!(m.decrypt("only.two").is_err());
        assert!(m.decrypt("not base64!!.AAAA.AAAA").is_err());
        // Valid base64 but wrong iv length.
        assert!(m.decrypt("AAAA.AAAA.AAAA").is_err());
    }

    #[test]
    fn decrypt_with_wrong_key_fails_closed() {
        let sealed = manager().encrypt(b"sealed for key 3").unwrap();
        let other = SecretsManager::from_key([4u8; 32]);
        assert!(matches!(
            other.decrypt(&sealed),
            Err(SecretsError::AuthenticationFailed)
        ));
    }

    #[test]
    fn age_keypair_is_deterministic_per_tenant() {
        let m = manager();
        let a1 = m.derive_age_keypair("tenant-a").unwrap();
        let a2 = m.derive_age_keypair("tenant-a").unwrap();
        let b = m.derive_age_keypair("tenant-b").unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(a1.public.starts_with("age1"));
        assert!(a1.private.starts_with("AGE-SECRET-KEY-1"));
    }

    #[test]
    fn age_keypair_survives_ecdh_roundtrip() {
        let m = manager();
        let pair = m.derive_age_keypair("tenant-a").unwrap();

        let private = agekey::decode_identity(&pair.private).unwrap();
        let public = agekey::decode_recipient(&pair.public).unwrap();

        let tenant_secret = StaticSecret::from(private);
        assert_eq!(PublicKey::from(&tenant_secret).as_bytes(), &public);

        let peer = StaticSecret::from([0x77u8; 32]);
        let peer_public = PublicKey::from(&peer);
        let shared_a = tenant_secret.diffie_hellman(&peer_public);
        let shared_b = peer.diffie_hellman(&PublicKey::from(public));
        assert_eq!(shared_a.as_bytes(), shared_b.as_bytes());
    }

    #[test]
    fn master_key_accepts_hex_base64_and_raw() {
        let key = [0xABu8; 32];
        let from_hex = parse_master_key(&hex::encode(key));
        assert_eq!(from_hex, key);

        let from_b64 = parse_master_key(&STANDARD.encode(key));
        assert_eq!(from_b64, key);

        let from_raw = parse_master_key("just a passphrase");
        assert_eq!(from_raw, parse_master_key("just a passphrase"));
        assert_ne!(from_raw, key);
    }

    #[test]
    fn production_requires_master_key() {
        let config = SecretsConfig {
            master_key: None,
            environment: crate::config::Environment::Production,
        };
        assert!(SecretsManager::from_config(&config).is_err());

        let dev = SecretsConfig {
            master_key: None,
            environment: crate::config::Environment::Development,
        };
        assert!(SecretsManager::from_config(&dev).is_ok());
    }
}
