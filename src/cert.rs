//! Peer certificates and CA validation.
//!
//! Certificates bind an overlay address to a Noise static key and are signed
//! by a CA over the CBOR encoding of their details. On the wire the public
//! key field is omitted; the receiver reinserts the static key it saw during
//! the handshake before validating, so the signature check proves the
//! handshake key and the certified key are the same one.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CertError;

/// Signed portion of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDetails {
    pub name: String,
    pub vpn_ip: Ipv4Addr,
    pub vpn_mask_bits: u8,
    /// Validity window, unix seconds.
    pub not_before: u64,
    pub not_after: u64,
    /// Noise static key for peers, ed25519 verifying key for CAs.
    pub public_key: Vec<u8>,
    pub is_ca: bool,
    /// Fingerprint of the signing CA.
    pub issuer: String,
}

/// Certificate envelope: details plus the CA signature over their encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub details: Option<CertificateDetails>,
    pub signature: Vec<u8>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Certificate {
    pub fn encode(&self) -> Result<Vec<u8>, CertError> {
        serde_cbor::to_vec(self).map_err(|e| CertError::Decode(e.to_string()))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CertError> {
        serde_cbor::from_slice(raw).map_err(|e| CertError::Decode(e.to_string()))
    }

    /// SHA-256 over the whole encoded certificate.
    pub fn fingerprint(&self) -> Result<String, CertError> {
        Ok(hex(&Sha256::digest(self.encode()?)))
    }

    fn signed_bytes(&self) -> Result<Vec<u8>, CertError> {
        let details = self.details.as_ref().ok_or(CertError::MissingDetails)?;
        serde_cbor::to_vec(details).map_err(|e| CertError::Decode(e.to_string()))
    }

    /// Validate the validity window and the CA signature at `now`.
    pub fn verify(&self, now: u64, pool: &CaPool) -> Result<(), CertError> {
        let details = self.details.as_ref().ok_or(CertError::MissingDetails)?;

        if now < details.not_before || now > details.not_after {
            return Err(CertError::OutsideValidityWindow);
        }

        let ca_key = pool
            .verifying_key(&details.issuer)
            .ok_or(CertError::UnknownAuthority)?;

        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| CertError::BadSignature)?;
        ca_key
            .verify(&self.signed_bytes()?, &signature)
            .map_err(|_| CertError::BadSignature)
    }
}

/// Trusted certificate authorities, keyed by fingerprint.
#[derive(Default)]
pub struct CaPool {
    cas: HashMap<String, VerifyingKey>,
}

impl CaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a self-signed CA certificate to the pool.
    pub fn add_ca(&mut self, ca: &Certificate) -> Result<String, CertError> {
        let details = ca.details.as_ref().ok_or(CertError::MissingDetails)?;
        if !details.is_ca {
            return Err(CertError::UnknownAuthority);
        }
        let key_bytes: [u8; 32] = details
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| CertError::BadSignature)?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CertError::BadSignature)?;

        let fingerprint = ca.fingerprint()?;
        self.cas.insert(fingerprint.clone(), key);
        Ok(fingerprint)
    }

    pub fn verifying_key(&self, fingerprint: &str) -> Option<&VerifyingKey> {
        self.cas.get(fingerprint)
    }

    pub fn is_empty(&self) -> bool {
        self.cas.is_empty()
    }
}

/// Sign `details` with a CA key, producing a complete certificate.
pub fn sign_certificate(
    details: CertificateDetails,
    ca_key: &SigningKey,
) -> Result<Certificate, CertError> {
    let encoded = serde_cbor::to_vec(&details).map_err(|e| CertError::Decode(e.to_string()))?;
    let signature = ca_key.sign(&encoded);
    Ok(Certificate {
        details: Some(details),
        signature: signature.to_bytes().to_vec(),
    })
}

/// Rebind a transmitted certificate to the static key observed in the Noise
/// handshake and validate it against the CA pool.
///
/// The sender strips its public key before transmitting; only the key that
/// actually authenticated the handshake may satisfy the CA signature.
pub fn recombine_cert_and_validate(
    handshake: &snow::HandshakeState,
    raw_cert: &[u8],
    pool: &CaPool,
) -> Result<Certificate, CertError> {
    let pk = handshake
        .get_remote_static()
        .ok_or(CertError::NoPeerStaticKey)?;

    if raw_cert.is_empty() {
        return Err(CertError::EmptyPayload);
    }

    let mut envelope = Certificate::decode(raw_cert)?;
    let details = envelope.details.as_mut().ok_or(CertError::MissingDetails)?;
    details.public_key = pk.to_vec();

    // Round-trip so the validated certificate is the canonical encoding of
    // what we will store, not the transmitted bytes.
    let recombined = Certificate::decode(&envelope.encode()?)?;
    recombined.verify(unix_now(), pool)?;

    Ok(recombined)
}
