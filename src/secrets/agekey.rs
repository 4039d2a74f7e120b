//! age key-file string encoding.
//!
//! The tenant runtime decrypts its secrets at rest with an age X25519
//! identity, so the strings produced here must be bit-compatible with real age
//! key files: bech32 (BIP-173 charset, generator, and checksum constant 1)
//! with HRP `age` for recipients and `age-secret-key-` (emitted uppercase)
//! for identities.
//!
//! The surface is deliberately narrow (`encode_*`/`decode_*` over raw 32-byte
//! keys) so this implementation can later be swapped for a vetted library
//! without touching callers.

use crate::error::SecretsError;

const CHARSET: &[u8] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

const GENERATOR: [u32; 5] = [
    0x3b6a_57b2,
    0x2650_8e6d,
    0x1ea1_19fa,
    0x3d42_33dd,
    0x2a14_62b3,
];

/// HRP for age recipients (public keys), lowercase on the wire.
pub const RECIPIENT_HRP: &str = "age";
/// HRP for age identities (secret keys); the full string is emitted uppercase.
pub const IDENTITY_HRP: &str = "age-secret-key-";

fn polymod(values: &[u8]) -> u32 {
    let mut chk: u32 = 1;
    for &v in values {
        let top = chk >> 25;
        chk = ((chk & 0x01ff_ffff) << 5) ^ u32::from(v);
        for (i, g) in GENERATOR.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= g;
            }
        }
    }
    chk
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(hrp.len() * 2 + 1);
    for b in hrp.bytes() {
        out.push(b >> 5);
    }
    out.push(0);
    for b in hrp.bytes() {
        out.push(b & 31);
    }
    out
}

fn create_checksum(hrp: &str, data: &[u8]) -> [u8; 6] {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0; 6]);
    let plm = polymod(&values) ^ 1;
    let mut checksum = [0u8; 6];
    for (i, c) in checksum.iter_mut().enumerate() {
        *c = ((plm >> (5 * (5 - i))) & 31) as u8;
    }
    checksum
}

fn verify_checksum(hrp: &str, data: &[u8]) -> bool {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    polymod(&values) == 1
}

/// Regroup 8-bit bytes into 5-bit words, zero-padding the tail.
fn to_words(bytes: &[u8]) -> Vec<u8> {
    let mut words = Vec::with_capacity(bytes.len() * 8 / 5 + 1);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            words.push(((acc >> bits) & 31) as u8);
        }
    }
    if bits > 0 {
        words.push(((acc << (5 - bits)) & 31) as u8);
    }
    words
}

/// Regroup 5-bit words back into bytes, rejecting non-zero padding.
fn from_words(words: &[u8]) -> Result<Vec<u8>, SecretsError> {
    let mut bytes = Vec::with_capacity(words.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &w in words {
        if w > 31 {
            return Err(SecretsError::InvalidEncoding(
                "data value out of 5-bit range".to_string(),
            ));
        }
        acc = (acc << 5) | u32::from(w);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            bytes.push(((acc >> bits) & 0xff) as u8);
        }
    }
    if bits >= 5 || (acc & ((1 << bits) - 1)) != 0 {
        return Err(SecretsError::InvalidEncoding(
            "invalid bech32 padding".to_string(),
        ));
    }
    Ok(bytes)
}

/// Encode pre-regrouped 5-bit words under `hrp`. Lowercase output.
fn encode_words(hrp: &str, words: &[u8]) -> String {
    let checksum = create_checksum(hrp, words);
    let mut out = String::with_capacity(hrp.len() + 1 + words.len() + 6);
    out.push_str(hrp);
    out.push('1');
    for &w in words.iter().chain(checksum.iter()) {
        out.push(CHARSET[w as usize] as char);
    }
    out
}

/// Encode raw bytes as a bech32 string under `hrp`. Lowercase output.
pub fn encode(hrp: &str, data: &[u8]) -> String {
    encode_words(hrp, &to_words(data))
}

/// Decode a bech32 string into its HRP (lowercased) and raw bytes.
///
/// Accepts all-lowercase or all-uppercase input; mixed case is rejected, as
/// is a bad checksum or malformed padding. Fails closed on every defect.
pub fn decode(encoded: &str) -> Result<(String, Vec<u8>), SecretsError> {
    let has_lower = encoded.bytes().any(|b| b.is_ascii_lowercase());
    let has_upper = encoded.bytes().any(|b| b.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(SecretsError::InvalidEncoding(
            "mixed-case bech32 string".to_string(),
        ));
    }
    let lowered = encoded.to_ascii_lowercase();

    let sep = lowered.rfind('1').ok_or_else(|| {
        SecretsError::InvalidEncoding("missing bech32 separator".to_string())
    })?;
    if sep == 0 || sep + 7 > lowered.len() {
        return Err(SecretsError::InvalidEncoding(
            "invalid bech32 separator position".to_string(),
        ));
    }
    let hrp = &lowered[..sep];
    if !hrp.bytes().all(|b| (33..=126).contains(&b)) {
        return Err(SecretsError::InvalidEncoding(
            "HRP character out of range".to_string(),
        ));
    }

    let mut words = Vec::with_capacity(lowered.len() - sep - 1);
    for c in lowered[sep + 1..].bytes() {
        let value = CHARSET.iter().position(|&x| x == c).ok_or_else(|| {
            SecretsError::InvalidEncoding(format!("invalid bech32 character '{}'", c as char))
        })?;
        words.push(value as u8);
    }

    if !verify_checksum(hrp, &words) {
        return Err(SecretsError::InvalidEncoding(
            "bech32 checksum mismatch".to_string(),
        ));
    }

    let data = from_words(&words[..words.len() - 6])?;
    Ok((hrp.to_string(), data))
}

/// Encode an X25519 public key as an age recipient string (`age1...`).
pub fn encode_recipient(public_key: &[u8; 32]) -> String {
    encode(RECIPIENT_HRP, public_key)
}

/// Encode an X25519 private key as an age identity string
/// (`AGE-SECRET-KEY-1...`, uppercase like `age-keygen` output).
pub fn encode_identity(private_key: &[u8; 32]) -> String {
    encode(IDENTITY_HRP, private_key).to_ascii_uppercase()
}

fn expect_key(hrp: &str, expected_hrp: &str, data: Vec<u8>) -> Result<[u8; 32], SecretsError> {
    if hrp != expected_hrp {
        return Err(SecretsError::InvalidEncoding(format!(
            "expected HRP '{expected_hrp}', got '{hrp}'"
        )));
    }
    <[u8; 32]>::try_from(data).map_err(|bytes| {
        SecretsError::InvalidEncoding(format!("expected 32 key bytes, got {}", bytes.len()))
    })
}

/// Decode an age recipient string into its X25519 public key bytes.
pub fn decode_recipient(encoded: &str) -> Result<[u8; 32], SecretsError> {
    let (hrp, data) = decode(encoded)?;
    expect_key(&hrp, RECIPIENT_HRP, data)
}

/// Decode an age identity string into its X25519 private key bytes.
pub fn decode_identity(encoded: &str) -> Result<[u8; 32], SecretsError> {
    let (hrp, data) = decode(encoded)?;
    expect_key(&hrp, IDENTITY_HRP, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Golden vectors from BIP-173: empty data under HRP "a", and the full
    // 0..31 word sequence under HRP "abcdef".
    #[test]
    fn bech32_golden_vector_empty_payload() {
        assert_eq!(encode_words("a", &[]), "a12uel5l");
        let (hrp, data) = decode("a12uel5l").unwrap();
        assert_eq!(hrp, "a");
        assert!(data.is_empty());
    }

    #[test]
    fn bech32_golden_vector_full_charset() {
        let words: Vec<u8> = (0..32).collect();
        assert_eq!(
            encode_words("abcdef", &words),
            "abcdef1qpzry9x8gf2tvdw0s3jn54khce6mua7lmqqqxw"
        );
    }

    #[test]
    fn decode_accepts_uppercase() {
        let (hrp, data) = decode("A12UEL5L").unwrap();
        assert_eq!(hrp, "a");
        assert!(data.is_empty());
    }

    #[test]
    fn decode_rejects_mixed_case() {
        assert!(decode("A12uel5l").is_err());
    }

    #[test]
    fn decode_rejects_checksum_mutation() {
        let encoded = encode(RECIPIENT_HRP, &[7u8; 32]);
        // Flip the final checksum character to a different charset member.
        let mut chars: Vec<char> = encoded.chars().collect();
        let last = *chars.last().unwrap();
        let replacement = if last == 'q' { 'p' } else { 'q' };
        *chars.last_mut().unwrap() = replacement;
        let mutated: String = chars.into_iter().collect();
        assert!(decode(&mutated).is_err());
    }

    #[test]
    fn recipient_roundtrip_preserves_key_bytes() {
        let key = [0xA5u8; 32];
        let encoded = encode_recipient(&key);
        assert!(encoded.starts_with("age1"));
        assert_eq!(decode_recipient(&encoded).unwrap(), key);
    }

    #[test]
    fn identity_is_uppercase_and_roundtrips() {
        let key = [0x42u8; 32];
        let encoded = encode_identity(&key);
        assert!(encoded.starts_with("AGE-SECRET-KEY-1"));
        assert_eq!(encoded, encoded.to_ascii_uppercase());
        assert_eq!(decode_identity(&encoded).unwrap(), key);
    }

    #[test]
    fn identity_decoder_rejects_recipient_hrp() {
        let encoded = encode_recipient(&[1u8; 32]);
        assert!(decode_identity(&encoded).is_err());
    }

    #[test]
    fn rejects_nonzero_padding() {
        // 52 words for 32 bytes leaves 4 padding bits; force them non-zero.
        let mut words = to_words(&[0u8; 32]);
        *words.last_mut().unwrap() = 1;
        let encoded = encode_words(RECIPIENT_HRP, &words);
        assert!(decode(&encoded).is_err());
    }
}
