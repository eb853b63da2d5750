use base64::engine::general_purpose::STANDARD as Base64Engine;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use std::collections::HashMap;

pub const ORG_HEADER: &str = "x-org-id";
pub const TIMESTAMP_HEADER: &str = "x-org-timestamp";
pub const SIGNATURE_HEADER: &str = "x-org-signature";

/// Bytes an organization signs for one request.
pub fn signing_message(org: &str, timestamp: &str, method: &str, path: &str, body: &[u8]) -> Vec<u8> {
    let mut message = format!("{}:{}:{}:{}:", org, timestamp, method.to_uppercase(), path).into_bytes();
    message.extend_from_slice(body);
    message
}

/// Request credentials produced by [`OrgSigner::sign_request`].
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub org: String,
    pub timestamp: String,
    pub signature: String,
}

impl SignedHeaders {
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            (ORG_HEADER, self.org.as_str()),
            (TIMESTAMP_HEADER, self.timestamp.as_str()),
            (SIGNATURE_HEADER, self.signature.as_str()),
        ]
    }
}

/// An organization's signing key.
pub struct OrgSigner {
    org: String,
    keypair: Keypair,
}

impl OrgSigner {
    pub fn generate(org: impl Into<String>) -> Self {
        let mut rng = OsRng::default();
        Self {
            org: org.into(),
            keypair: Keypair::generate(&mut rng),
        }
    }

    /// Restores a signer from a base64-encoded 64-byte keypair.
    pub fn from_base64(org: impl Into<String>, encoded: &str) -> Result<Self, IdentityError> {
        let bytes = Base64Engine
            .decode(encoded.trim())
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let keypair =
            Keypair::from_bytes(&bytes).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        Ok(Self {
            org: org.into(),
            keypair,
        })
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn keypair_base64(&self) -> String {
        Base64Engine.encode(self.keypair.to_bytes())
    }

    pub fn public_key_base64(&self) -> String {
        Base64Engine.encode(self.keypair.public.to_bytes())
    }

    pub fn sign_request(&self, method: &str, path: &str, body: &[u8]) -> SignedHeaders {
        self.sign_request_at(Utc::now(), method, path, body)
    }

    pub fn sign_request_at(
        &self,
        at: DateTime<Utc>,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> SignedHeaders {
        let timestamp = at.to_rfc3339();
        let message = signing_message(&self.org, &timestamp, method, path, body);
        let signature: Signature = self.keypair.sign(&message);
        SignedHeaders {
            org: self.org.clone(),
            timestamp,
            signature: Base64Engine.encode(signature.to_bytes()),
        }
    }
}

/// Maps organization ids to their registered public keys.
#[derive(Debug, Clone)]
pub struct IdentityVerifier {
    keys: HashMap<String, PublicKey>,
    max_skew: chrono::Duration,
}

impl IdentityVerifier {
    pub fn new(max_skew_secs: i64) -> Self {
        Self {
            keys: HashMap::new(),
            max_skew: chrono::Duration::seconds(max_skew_secs),
        }
    }

    pub fn add_org(&mut self, org: &str, public_key_b64: &str) -> Result<(), IdentityError> {
        let bytes = Base64Engine
            .decode(public_key_b64.trim())
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let key =
            PublicKey::from_bytes(&bytes).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        self.keys.insert(org.to_string(), key);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verifies request credentials and returns the authenticated organization.
    pub fn verify(
        &self,
        headers: &SignedHeaders,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<String, IdentityError> {
        let key = self
            .keys
            .get(&headers.org)
            .ok_or_else(|| IdentityError::UnknownOrg(headers.org.clone()))?;

        let issued = DateTime::parse_from_rfc3339(&headers.timestamp)
            .map_err(|e| IdentityError::BadTimestamp(e.to_string()))?
            .with_timezone(&Utc);
        let skew = (Utc::now() - issued).abs();
        if skew > self.max_skew {
            return Err(IdentityError::Stale(skew.num_seconds()));
        }

        let signature_bytes = Base64Engine
            .decode(&headers.signature)
            .map_err(|e| IdentityError::BadSignature(e.to_string()))?;
        if signature_bytes.len() != 64 {
            return Err(IdentityError::BadSignature(
                "Invalid signature length".to_string(),
            ));
        }
        let signature = Signature::try_from(signature_bytes.as_slice())
            .map_err(|e| IdentityError::BadSignature(e.to_string()))?;

        let message = signing_message(&headers.org, &headers.timestamp, method, path, body);
        key.verify(&message, &signature)
            .map_err(|e| IdentityError::BadSignature(e.to_string()))?;

        Ok(headers.org.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Missing credential header: {0}")]
    MissingHeader(&'static str),
    #[error("Unknown organization: {0}")]
    UnknownOrg(String),
    #[error("Invalid key material: {0}")]
    InvalidKey(String),
    #[error("Invalid request timestamp: {0}")]
    BadTimestamp(String),
    #[error("Request timestamp is {0}s away from server time")]
    Stale(i64),
    #[error("Signature error: {0}")]
    BadSignature(String),
}
