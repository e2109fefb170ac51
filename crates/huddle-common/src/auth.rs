//! Session-token decryption.
//!
//! The web app that creates meetings signs users in with NextAuth.js, which
//! stores its session in a cookie holding a compact JWE:
//!
//! ```text
//! BASE64URL(header) . "" . BASE64URL(iv) . BASE64URL(ciphertext) . BASE64URL(tag)
//! header = {"alg":"dir","enc":"A256GCM"}
//! key    = HKDF-SHA256(ikm: NEXTAUTH_SECRET, salt: "", info: "NextAuth.js Generated Encryption Key")
//! ```
//!
//! The relay only needs the `sub` claim (the user ID) and, when present, the
//! user's `name`. Any failure here degrades the connection to an
//! unauthenticated participant; it never rejects it.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD as B64};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

/// Cookie NextAuth.js uses over plain HTTP.
pub const SESSION_COOKIE: &str = "next-auth.session-token";
/// Cookie NextAuth.js uses when served over HTTPS.
pub const SECURE_SESSION_COOKIE: &str = "__Secure-next-auth.session-token";

const KEY_INFO: &[u8] = b"NextAuth.js Generated Encryption Key";
const KEY_ALGORITHM: &str = "dir";
const CONTENT_ENCRYPTION: &str = "A256GCM";
const TAG_LEN: usize = 16;

/// Error returned when a session token cannot be turned into claims.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token is not a compact JWE")]
    Malformed,
    #[error("Unsupported JWE algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Cryptographic operation failed")]
    Crypto,
    #[error("Token could not be decrypted")]
    Decryption,
    #[error("Token expired")]
    Expired,
    #[error("Invalid claims: {0}")]
    InvalidClaims(#[from] serde_json::Error),
}

/// Claims carried by a NextAuth.js session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (user ID)
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Expiration (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl SessionClaims {
    /// The display name from the token, if it carries a non-empty one.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }
}

#[derive(Serialize, Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
}

/// HKDF output length for the content encryption key.
struct EncryptionKeyLen;

impl hkdf::KeyType for EncryptionKeyLen {
    fn len(&self) -> usize {
        32
    }
}

/// Derive the 256-bit content encryption key from the shared secret.
pub fn derive_encryption_key(secret: &str) -> Result<[u8; 32], TokenError> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(secret.as_bytes());
    let okm = prk
        .expand(&[KEY_INFO], EncryptionKeyLen)
        .map_err(|_| TokenError::Crypto)?;

    let mut key = [0u8; 32];
    okm.fill(&mut key).map_err(|_| TokenError::Crypto)?;
    Ok(key)
}

fn content_key(secret: &str) -> Result<LessSafeKey, TokenError> {
    let key = derive_encryption_key(secret)?;
    let unbound = UnboundKey::new(&AES_256_GCM, &key).map_err(|_| TokenError::Crypto)?;
    Ok(LessSafeKey::new(unbound))
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, TokenError> {
    B64.decode(segment).map_err(|_| TokenError::Malformed)
}

/// Decrypt a session token and return its claims.
///
/// Rejects tokens whose `exp` lies in the past.
pub fn decrypt_session_token(token: &str, secret: &str) -> Result<SessionClaims, TokenError> {
    let mut segments = token.split('.');
    let (Some(header_b64), Some(encrypted_key), Some(iv_b64), Some(ciphertext_b64), Some(tag_b64), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::Malformed);
    };

    let header: JweHeader =
        serde_json::from_slice(&decode_segment(header_b64)?).map_err(|_| TokenError::Malformed)?;
    if header.alg != KEY_ALGORITHM || header.enc != CONTENT_ENCRYPTION {
        return Err(TokenError::UnsupportedAlgorithm(format!(
            "{}/{}",
            header.alg, header.enc
        )));
    }
    // Direct encryption carries no wrapped key.
    if !encrypted_key.is_empty() {
        return Err(TokenError::Malformed);
    }

    let iv = decode_segment(iv_b64)?;
    let nonce = Nonce::try_assume_unique_for_key(&iv).map_err(|_| TokenError::Malformed)?;

    let tag = decode_segment(tag_b64)?;
    if tag.len() != TAG_LEN {
        return Err(TokenError::Malformed);
    }
    let mut in_out = decode_segment(ciphertext_b64)?;
    in_out.extend_from_slice(&tag);

    let key = content_key(secret)?;
    let plaintext = key
        .open_in_place(nonce, Aad::from(header_b64.as_bytes()), &mut in_out)
        .map_err(|_| TokenError::Decryption)?;

    let claims: SessionClaims = serde_json::from_slice(plaintext)?;
    if claims
        .exp
        .is_some_and(|exp| exp <= chrono::Utc::now().timestamp())
    {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}

/// Encrypt claims into a session token the same way NextAuth.js does.
pub fn seal_session_token(claims: &SessionClaims, secret: &str) -> Result<String, TokenError> {
    let header = B64.encode(serde_json::to_vec(&JweHeader {
        alg: KEY_ALGORITHM.into(),
        enc: CONTENT_ENCRYPTION.into(),
    })?);

    let mut iv = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut iv)
        .map_err(|_| TokenError::Crypto)?;

    let key = content_key(secret)?;
    let mut in_out = serde_json::to_vec(claims)?;
    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::from(header.as_bytes()),
            &mut in_out,
        )
        .map_err(|_| TokenError::Crypto)?;

    Ok(format!(
        "{header}..{}.{}.{}",
        B64.encode(iv),
        B64.encode(&in_out),
        B64.encode(tag.as_ref())
    ))
}
