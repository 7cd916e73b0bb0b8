use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub type Address = [u8; 20];

const PERSONAL_MESSAGE_PREFIX: &str = "\x19Ethereum Signed Message:\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid hex encoding")]
    Hex,
    #[error("signature must be 65 bytes, got {0}")]
    SignatureLength(usize),
    #[error("invalid recovery byte {0}")]
    RecoveryByte(u8),
    #[error("malformed signature")]
    Malformed,
    #[error("public key recovery failed")]
    Recovery,
    #[error("unknown public key format: length={len} prefix={prefix}")]
    UnknownKeyFormat { len: usize, prefix: String },
    #[error("public key is not a curve point")]
    InvalidPoint,
    #[error("signing failed")]
    Signing,
}

/// A public key claim in one of the accepted encodings, told apart by length
/// and leading byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimedKey {
    Address(Address),
    Compressed([u8; 33]),
    Uncompressed([u8; 65]),
}

impl ClaimedKey {
    pub fn parse(encoded: &str) -> Result<Self, SignatureError> {
        let bytes = decode_hex(encoded)?;
        match (bytes.len(), bytes.first()) {
            (20, _) => {
                let mut a = [0u8; 20];
                a.copy_from_slice(&bytes);
                Ok(ClaimedKey::Address(a))
            }
            (33, Some(0x02 | 0x03)) => {
                let mut k = [0u8; 33];
                k.copy_from_slice(&bytes);
                Ok(ClaimedKey::Compressed(k))
            }
            (65, Some(0x04)) => {
                let mut k = [0u8; 65];
                k.copy_from_slice(&bytes);
                Ok(ClaimedKey::Uncompressed(k))
            }
            (len, first) => Err(SignatureError::UnknownKeyFormat {
                len,
                prefix: first.map(|b| format!("{b:02x}")).unwrap_or_default(),
            }),
        }
    }

    pub fn address(&self) -> Result<Address, SignatureError> {
        match self {
            ClaimedKey::Address(a) => Ok(*a),
            ClaimedKey::Compressed(k) => sec1_address(k),
            ClaimedKey::Uncompressed(k) => sec1_address(k),
        }
    }
}

fn sec1_address(sec1: &[u8]) -> Result<Address, SignatureError> {
    let vk = VerifyingKey::from_sec1_bytes(sec1).map_err(|_| SignatureError::InvalidPoint)?;
    Ok(address_of(&vk))
}

fn decode_hex(s: &str) -> Result<Vec<u8>, SignatureError> {
    let trimmed = s.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(body).map_err(|_| SignatureError::Hex)
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut h = Keccak256::new();
    h.update(data);
    h.finalize().into()
}

pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut h = Keccak256::new();
    h.update(PERSONAL_MESSAGE_PREFIX.as_bytes());
    h.update(message.len().to_string().as_bytes());
    h.update(message.as_bytes());
    h.finalize().into()
}

pub fn address_of(vk: &VerifyingKey) -> Address {
    let point = vk.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut a = [0u8; 20];
    a.copy_from_slice(&digest[12..]);
    a
}

pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address))
}

pub fn recover_address(message: &str, signature: &str) -> Result<Address, SignatureError> {
    let bytes = decode_hex(signature)?;
    if bytes.len() != 65 {
        return Err(SignatureError::SignatureLength(bytes.len()));
    }

    let v = bytes[64];
    let recovery_byte = match v {
        0 | 1 => v,
        27 | 28 => v - 27,
        other => return Err(SignatureError::RecoveryByte(other)),
    };
    let mut recid = RecoveryId::from_byte(recovery_byte).ok_or(SignatureError::RecoveryByte(v))?;
    let mut sig = Signature::from_slice(&bytes[..64]).map_err(|_| SignatureError::Malformed)?;

    // Mirrored s recovers the same key with the opposite y parity.
    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
        recid = RecoveryId::new(!recid.is_y_odd(), recid.is_x_reduced());
    }

    let digest = personal_message_hash(message);
    let vk = VerifyingKey::recover_from_prehash(&digest, &sig, recid)
        .map_err(|_| SignatureError::Recovery)?;
    Ok(address_of(&vk))
}

/// True only when `signature` over `message` recovers to the address of
/// `claimed_public_key`. Every parse or recovery failure is a `false`.
pub fn verify(message: &str, signature: &str, claimed_public_key: &str) -> bool {
    let expected = match ClaimedKey::parse(claimed_public_key).and_then(|k| k.address()) {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(error = %e, "claimed public key rejected");
            return false;
        }
    };
    match recover_address(message, signature) {
        Ok(recovered) => recovered == expected,
        Err(e) => {
            tracing::debug!(error = %e, "signature recovery failed");
            false
        }
    }
}

/// `personal_sign` with a local key: hex `r || s || v` with `v` in {27, 28}.
pub fn sign_personal(sk: &SigningKey, message: &str) -> Result<String, SignatureError> {
    let digest = personal_message_hash(message);
    let (sig, recid) = sk
        .sign_prehash_recoverable(&digest)
        .map_err(|_| SignatureError::Signing)?;
    let mut out = sig.to_vec();
    out.push(recid.to_byte() + 27);
    Ok(format!("0x{}", hex::encode(out)))
}

pub fn public_key_hex(vk: &VerifyingKey, compressed: bool) -> String {
    format!("0x{}", hex::encode(vk.to_encoded_point(compressed).as_bytes()))
}
