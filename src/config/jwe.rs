//! Compact JWE decryption for protected secrets.
//!
//! Only direct symmetric encryption is supported: `alg: dir` with
//! `enc: A128GCM` or `A256GCM`, keyed by an `oct` JWK.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JweError {
    #[error("Malformed JWE: {0}")]
    Malformed(String),

    #[error("Unsupported JWE algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Unsupported JWE encryption: {0}")]
    UnsupportedEncryption(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Decryption failed")]
    Decrypt,
}

/// Symmetric JSON Web Key.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub k: String,
}

impl Jwk {
    pub fn from_json(json: &str) -> Result<Self, JweError> {
        let jwk: Jwk =
            serde_json::from_str(json).map_err(|e| JweError::InvalidKey(e.to_string()))?;
        if jwk.kty != "oct" {
            return Err(JweError::InvalidKey(format!("unsupported kty {}", jwk.kty)));
        }
        Ok(jwk)
    }

    fn key_bytes(&self) -> Result<Vec<u8>, JweError> {
        URL_SAFE_NO_PAD
            .decode(self.k.trim_end_matches('='))
            .map_err(|e| JweError::InvalidKey(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
    enc: String,
}

fn b64(part: &str, what: &str) -> Result<Vec<u8>, JweError> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| JweError::Malformed(format!("{what}: {e}")))
}

/// Decrypt a compact-serialized JWE.
pub fn decrypt_compact(token: &str, jwk: &Jwk) -> Result<Vec<u8>, JweError> {
    let parts: Vec<&str> = token.trim().split('.').collect();
    let &[header_b64, encrypted_key, iv, ciphertext, tag] = &parts[..] else {
        return Err(JweError::Malformed(format!(
            "expected 5 segments, got {}",
            parts.len()
        )));
    };

    let header: Header = serde_json::from_slice(&b64(header_b64, "header")?)
        .map_err(|e| JweError::Malformed(format!("header: {e}")))?;
    if header.alg != "dir" {
        return Err(JweError::UnsupportedAlgorithm(header.alg));
    }
    if !encrypted_key.is_empty() {
        return Err(JweError::Malformed(
            "direct encryption carries no encrypted key".to_string(),
        ));
    }

    let iv = b64(iv, "iv")?;
    if iv.len() != 12 {
        return Err(JweError::Malformed(format!("iv length {}", iv.len())));
    }
    let mut msg = b64(ciphertext, "ciphertext")?;
    msg.extend_from_slice(&b64(tag, "tag")?);

    let key = jwk.key_bytes()?;
    let payload = Payload {
        msg: &msg,
        aad: header_b64.as_bytes(),
    };
    let nonce = Nonce::from_slice(&iv);

    match header.enc.as_str() {
        "A128GCM" => Aes128Gcm::new_from_slice(&key)
            .map_err(|_| JweError::InvalidKey(format!("A128GCM needs 16 bytes, got {}", key.len())))?
            .decrypt(nonce, payload)
            .map_err(|_| JweError::Decrypt),
        "A256GCM" => Aes256Gcm::new_from_slice(&key)
            .map_err(|_| JweError::InvalidKey(format!("A256GCM needs 32 bytes, got {}", key.len())))?
            .decrypt(nonce, payload)
            .map_err(|_| JweError::Decrypt),
        other => Err(JweError::UnsupportedEncryption(other.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a `dir` + AES-GCM token the way the platform's secret tooling does.
    pub(crate) fn encrypt(plaintext: &str, key: &[u8], iv: [u8; 12]) -> String {
        let enc = if key.len() == 16 { "A128GCM" } else { "A256GCM" };
        let header = URL_SAFE_NO_PAD.encode(format!(r#"{{"alg":"dir","enc":"{enc}"}}"#));
        let payload = Payload {
            msg: plaintext.as_bytes(),
            aad: header.as_bytes(),
        };
        let nonce = Nonce::from_slice(&iv);
        let sealed = if key.len() == 16 {
            Aes128Gcm::new_from_slice(key).unwrap().encrypt(nonce, payload).unwrap()
        } else {
            Aes256Gcm::new_from_slice(key).unwrap().encrypt(nonce, payload).unwrap()
        };
        let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);
        format!(
            "{header}..{}.{}.{}",
            URL_SAFE_NO_PAD.encode(iv),
            URL_SAFE_NO_PAD.encode(ciphertext),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    pub(crate) fn jwk_json(key: &[u8]) -> String {
        format!(r#"{{"kty":"oct","k":"{}"}}"#, URL_SAFE_NO_PAD.encode(key))
    }

    #[test]
    fn test_decrypt_a256gcm() {
        let key = [7u8; 32];
        let token = encrypt("s3cret", &key, [1u8; 12]);
        let jwk = Jwk::from_json(&jwk_json(&key)).unwrap();
        assert_eq!(decrypt_compact(&token, &jwk).unwrap(), b"s3cret");
    }

    #[test]
    fn test_decrypt_a128gcm() {
        let key = [9u8; 16];
        let token = encrypt("pw", &key, [2u8; 12]);
        let jwk = Jwk::from_json(&jwk_json(&key)).unwrap();
        assert_eq!(decrypt_compact(&token, &jwk).unwrap(), b"pw");
    }

    #[test]
    fn test_wrong_key_fails() {
        let token = encrypt("pw", &[9u8; 32], [2u8; 12]);
        let jwk = Jwk::from_json(&jwk_json(&[8u8; 32])).unwrap();
        assert_eq!(decrypt_compact(&token, &jwk), Err(JweError::Decrypt));
    }

    #[test]
    fn test_tampered_header_fails() {
        let key = [9u8; 32];
        let token = encrypt("pw", &key, [2u8; 12]);
        let forged_header = URL_SAFE_NO_PAD.encode(r#"{"alg":"dir","enc":"A256GCM","x":1}"#);
        let rest = token.split_once('.').unwrap().1;
        let forged = format!("{forged_header}.{rest}");
        let jwk = Jwk::from_json(&jwk_json(&key)).unwrap();
        assert_eq!(decrypt_compact(&forged, &jwk), Err(JweError::Decrypt));
    }

    #[test]
    fn test_rejects_key_wrapping_algorithms() {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"A256KW","enc":"A256GCM"}"#);
        let token = format!("{header}.AAAA.AAAAAAAAAAAAAAAA.AA.AA");
        let jwk = Jwk::from_json(&jwk_json(&[0u8; 32])).unwrap();
        assert_eq!(
            decrypt_compact(&token, &jwk),
            Err(JweError::UnsupportedAlgorithm("A256KW".to_string()))
        );
    }

    #[test]
    fn test_malformed_segments() {
        let jwk = Jwk::from_json(&jwk_json(&[0u8; 32])).unwrap();
        assert!(matches!(
            decrypt_compact("a.b.c", &jwk),
            Err(JweError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_non_symmetric_jwk() {
        assert!(Jwk::from_json(r#"{"kty":"RSA","k":"x"}"#).is_err());
    }
}
