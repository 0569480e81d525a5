//! User token verification seam
//!
//! Real identity lives in an external auth provider; the backend only needs
//! "this bearer token belongs to user X". The default verifier checks an
//! HMAC-signed token (`{user_id}.{signature}`); swapping in a JWT/JWKS
//! verifier is a matter of implementing [`TokenVerifier`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: Uuid,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;
}

pub struct HmacTokenVerifier {
    key: Vec<u8>,
}

impl HmacTokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        HmacSha256::new_from_slice(&self.key).expect("HMAC key of any length is valid")
    }

    /// Mint a token for a user (development tooling and tests)
    pub fn issue(&self, user_id: Uuid) -> String {
        let subject = user_id.to_string();
        let mut mac = self.mac();
        mac.update(subject.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}", subject, signature)
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let (subject, signature) = token.split_once('.').ok_or(AuthError::InvalidToken)?;
        let user_id = Uuid::parse_str(subject).map_err(|_| AuthError::InvalidToken)?;

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::InvalidToken)?;

        let mut mac = self.mac();
        mac.update(subject.as_bytes());
        mac.verify_slice(&signature_bytes)
            .map_err(|_| AuthError::InvalidToken)?;

        Ok(AuthenticatedUser { id: user_id })
    }
}
