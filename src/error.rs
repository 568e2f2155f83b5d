//! Error types for the packet path and certificate validation.

use thiserror::Error;

/// Per-packet failures. None of these propagate past the dispatcher; each
/// datagram is an independent unit and the worker loop keeps going.
#[derive(Error, Debug)]
pub enum PacketError {
    /// Datagram shorter than the overlay header.
    #[error("malformed header")]
    MalformedHeader,
    /// Decrypted payload is not a well-formed IPv4 datagram.
    #[error("malformed inner packet: {0}")]
    MalformedInnerPacket(String),
    /// AEAD authentication or decryption failed.
    #[error("decryption failed")]
    DecryptionFailed,
    /// Counter fell out of the replay window after decryption.
    #[error("out of window packet")]
    OutOfWindow,
}

/// Certificate decode and validation failures.
#[derive(Error, Debug)]
pub enum CertError {
    #[error("no peer static key was present")]
    NoPeerStaticKey,
    #[error("provided payload was empty")]
    EmptyPayload,
    #[error("error decoding cert: {0}")]
    Decode(String),
    #[error("certificate did not contain any details")]
    MissingDetails,
    #[error("certificate is expired or not yet valid")]
    OutsideValidityWindow,
    #[error("certificate signed by unknown authority")]
    UnknownAuthority,
    #[error("certificate signature did not match")]
    BadSignature,
}
