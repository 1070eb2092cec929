//! Recoverable secp256k1 signatures over query digests.
//!
//! Identity is whoever holds the key that produced the signature: the signer
//! is always recovered from `(digest, signature)`, never looked up.
use alloy_primitives::keccak256;
use alloy_primitives::Address;
use alloy_primitives::B256;
use ccq_messages::RawSignature;
use ccq_messages::SIGNATURE_LEN;
use k256::ecdsa::RecoveryId;
use k256::ecdsa::Signature;
use k256::ecdsa::SigningKey;
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use thiserror::Error;

use crate::digest::query_request_digest;
use crate::digest::query_response_digest;
use crate::Environment;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("signature must be {SIGNATURE_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid recovery id {0}")]
    InvalidRecoveryId(u8),

    #[error("malformed signature: {0}")]
    Malformed(k256::ecdsa::Error),

    #[error("failed to recover signer: {0}")]
    Recovery(k256::ecdsa::Error),

    #[error("failed to sign digest: {0}")]
    Signing(k256::ecdsa::Error),

    #[error("invalid private key")]
    InvalidKey,
}

/// Signs `digest`, returning `r || s || v` with `v` in `{0, 1}`.
pub fn sign(
    key: &SigningKey,
    digest: &B256,
) -> Result<RawSignature, SignatureError> {
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(digest.as_slice())
        .map_err(SignatureError::Signing)?;

    let mut out = [0u8; SIGNATURE_LEN];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = recovery_id.to_byte();
    Ok(out)
}

/// Recovers the public key that produced `signature` over `digest`.
pub fn recover_public_key(
    digest: &B256,
    signature: &[u8],
) -> Result<VerifyingKey, SignatureError> {
    let (signature, recovery_id) = parse(signature)?;
    VerifyingKey::recover_from_prehash(digest.as_slice(), &signature, recovery_id)
        .map_err(SignatureError::Recovery)
}

/// Recovers the Ethereum-style address of the signer.
pub fn recover_signer(
    digest: &B256,
    signature: &[u8],
) -> Result<Address, SignatureError> {
    recover_public_key(digest, signature).map(|key| address_of(&key))
}

/// `keccak256(uncompressed_point[1..])[12..]`
pub fn address_of(key: &VerifyingKey) -> Address {
    let public_key = PublicKey::from(key);
    let point = public_key.to_encoded_point(
        // compress =
        false,
    );
    debug_assert_eq!(point.as_bytes()[0], 0x04);

    Address::from_slice(&keccak256(&point.as_bytes()[1..])[12..])
}

/// Splits a raw signature into its scalar pair and recovery id.
///
/// Accepts `v` as `0/1` or the legacy `27/28`, and normalizes into "low S"
/// form. See:
/// - https://github.com/RustCrypto/elliptic-curves/issues/988
/// - https://github.com/bluealloy/revm/pull/870
fn parse(signature: &[u8]) -> Result<(Signature, RecoveryId), SignatureError> {
    let raw: &RawSignature = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength(signature.len()))?;

    let v = match raw[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        v => return Err(SignatureError::InvalidRecoveryId(v)),
    };
    let mut recovery_id = RecoveryId::from_byte(v).ok_or(SignatureError::InvalidRecoveryId(v))?;
    let mut signature = Signature::from_slice(&raw[..64]).map_err(SignatureError::Malformed)?;

    if let Some(normalized) = signature.normalize_s() {
        signature = normalized;
        recovery_id = RecoveryId::from_byte(recovery_id.to_byte() ^ 1)
            .ok_or(SignatureError::InvalidRecoveryId(v))?;
    }

    Ok((signature, recovery_id))
}

/// A private key able to sign query requests (client side) and responses (gateway side).
#[derive(Clone)]
pub struct QuerySigner {
    key: SigningKey,
    address: Address,
}

impl std::fmt::Debug for QuerySigner {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "QuerySigner<{}>", self.address)
    }
}

impl QuerySigner {
    pub fn new(key: SigningKey) -> Self {
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    /// Parses a 32 byte hex private key, with or without `0x`.
    pub fn from_hex(private_key: &str) -> Result<Self, SignatureError> {
        let private_key = private_key.trim();
        let bytes = hex::decode(private_key.strip_prefix("0x").unwrap_or(private_key))
            .map_err(|_| SignatureError::InvalidKey)?;
        let key = SigningKey::from_slice(&bytes).map_err(|_| SignatureError::InvalidKey)?;
        Ok(Self::new(key))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign_digest(
        &self,
        digest: &B256,
    ) -> Result<RawSignature, SignatureError> {
        sign(&self.key, digest)
    }

    pub fn sign_request(
        &self,
        env: Environment,
        request_bytes: &[u8],
    ) -> Result<RawSignature, SignatureError> {
        self.sign_digest(&query_request_digest(env, request_bytes))
    }

    pub fn sign_response(
        &self,
        response_bytes: &[u8],
    ) -> Result<RawSignature, SignatureError> {
        self.sign_digest(&query_response_digest(response_bytes))
    }
}
