//! Symmetric token encryption, hashing, and secret generation.
//!
//! Refresh-token payloads are sealed with an authenticated cipher under a key
//! derived from the per-installation secret. Decryption failure is the only
//! signal a caller gets for tampered or foreign-key tokens; no cipher
//! internals leak past this module.

use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

// Iteration counts are part of the on-disk/on-wire formats; changing either
// invalidates everything sealed or generated before.
const TOKEN_KEY_ITERATIONS: u32 = 100;
const SECRET_ITERATIONS: u32 = 1_000;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Failures from sealing or opening payloads.
///
/// Callers in the token layer collapse every variant to an unauthorised
/// condition; the distinction only matters for logs.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Input was not valid base64 or is too short to carry a nonce.
    #[error("malformed ciphertext")]
    MalformedCiphertext,

    /// Authentication tag verification failed (wrong key or tampered data).
    #[error("decryption failed")]
    DecryptionFailed,

    /// The cipher rejected the encryption request.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decrypted bytes were not valid UTF-8.
    #[error("invalid plaintext encoding")]
    InvalidPlaintext,
}

/// Derive the payload key for a given nonce from the installation secret.
///
/// Binding the key to the nonce means two tokens sealed under the same secret
/// never share a cipher key.
fn derive_key(master_key: &str, nonce: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha512>(master_key.as_bytes(), nonce, TOKEN_KEY_ITERATIONS, &mut key);
    key
}

/// Encrypts `plaintext` under the installation secret.
/// Returns `base64(nonce (12 bytes) || ciphertext)`.
///
/// # Errors
/// Returns an error if encryption fails.
pub fn encrypt(plaintext: &str, master_key: &str) -> CryptoResult<String> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let key_bytes = derive_key(master_key, &nonce_bytes);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);

    Ok(Base64::encode_string(&sealed))
}

/// Decrypts data produced by [`encrypt`] with the same installation secret.
///
/// # Errors
/// Returns an error if the input is malformed, the authentication tag does
/// not verify (wrong key or tampered data), or the plaintext is not UTF-8.
pub fn decrypt(encoded: &str, master_key: &str) -> CryptoResult<String> {
    let sealed = Base64::decode_vec(encoded).map_err(|_| CryptoError::MalformedCiphertext)?;
    if sealed.len() <= NONCE_LEN {
        return Err(CryptoError::MalformedCiphertext);
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let key_bytes = derive_key(master_key, nonce_bytes);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidPlaintext)
}

/// SHA-256 of `input`, hex encoded.
///
/// Used for refresh-token chain hashes; raw tokens never touch storage.
#[must_use]
pub fn hash_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    to_hex(&hasher.finalize())
}

/// A fresh 32-byte random value, base64url encoded without padding.
/// Used for token nonces and anti-CSRF values.
#[must_use]
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

/// Generates a new installation secret in `<iterations>:<saltHex>:<keyHex>`
/// form. The whole string is the secret; the embedded salt/iterations exist
/// so future format versions can re-derive compatibly.
#[must_use]
pub fn generate_installation_secret() -> String {
    let mut random = [0u8; 64];
    let mut salt = [0u8; 64];
    OsRng.fill_bytes(&mut random);
    OsRng.fill_bytes(&mut salt);

    let mut key = [0u8; 64];
    pbkdf2_hmac::<Sha512>(&random, &salt, SECRET_ITERATIONS, &mut key);

    format!("{SECRET_ITERATIONS}:{}:{}", to_hex(&salt), to_hex(&key))
}

/// Checks the `<iterations>:<saltHex>:<keyHex>` shape of a configured secret.
#[must_use]
pub fn is_valid_installation_secret(secret: &str) -> bool {
    let parts: Vec<&str> = secret.split(':').collect();
    let [iterations, salt, key] = parts.as_slice() else {
        return false;
    };
    iterations.parse::<u32>().is_ok()
        && !salt.is_empty()
        && !key.is_empty()
        && salt.chars().all(|c| c.is_ascii_hexdigit())
        && key.chars().all(|c| c.is_ascii_hexdigit())
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let secret = generate_installation_secret();
        let sealed = encrypt("session-payload", &secret).unwrap();
        assert_ne!(sealed, "session-payload");

        let opened = decrypt(&sealed, &secret).unwrap();
        assert_eq!(opened, "session-payload");
    }

    #[test]
    fn decrypt_with_different_key_fails() {
        let sealed = encrypt("payload", &generate_installation_secret()).unwrap();
        let err = decrypt(&sealed, &generate_installation_secret()).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed));
    }

    #[test]
    fn decrypt_tampered_ciphertext_fails() {
        let secret = generate_installation_secret();
        let sealed = encrypt("payload", &secret).unwrap();

        let mut bytes = Base64::decode_vec(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = Base64::encode_string(&bytes);

        assert!(matches!(
            decrypt(&tampered, &secret),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn decrypt_rejects_garbage_input() {
        let secret = generate_installation_secret();
        assert!(matches!(
            decrypt("not-base64!!", &secret),
            Err(CryptoError::MalformedCiphertext)
        ));
        // Valid base64 but shorter than a nonce.
        assert!(matches!(
            decrypt("AAAA", &secret),
            Err(CryptoError::MalformedCiphertext)
        ));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            hash_sha256("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn installation_secret_has_expected_shape() {
        let secret = generate_installation_secret();
        assert!(is_valid_installation_secret(&secret));

        assert!(!is_valid_installation_secret("no-colons-here"));
        assert!(!is_valid_installation_secret("abc:def:ghi"));
        assert!(!is_valid_installation_secret("1000:zz:zz"));
        assert!(!is_valid_installation_secret("1000::"));
    }

    #[test]
    fn random_tokens_are_unique() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
        // 32 bytes -> 43 base64url chars without padding
        assert_eq!(a.len(), 43);
    }
}
