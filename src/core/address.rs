// Address encoding: base58(version || pubkey hash || checksum)

use crate::core::double_sha256;
use crate::error::{Error, Result};

/// Version byte prepended to every address
pub const ADDRESS_VERSION: u8 = 0x00;
/// Length of the trailing checksum
pub const CHECKSUM_LEN: usize = 4;
/// RIPEMD160 output length
pub const PUB_KEY_HASH_LEN: usize = 20;

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = double_sha256(payload);
    let mut result = [0u8; CHECKSUM_LEN];
    result.copy_from_slice(&hash[..CHECKSUM_LEN]);
    result
}

/// Encode a public key hash as an address
pub fn address_from_pub_key_hash(pub_key_hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + pub_key_hash.len() + CHECKSUM_LEN);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pub_key_hash);
    let sum = checksum(&payload);
    payload.extend_from_slice(&sum);
    bs58::encode(payload).into_string()
}

/// Decode an address back to its public key hash, checking version and checksum
pub fn pub_key_hash_from_address(address: &str) -> Result<Vec<u8>> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))?;

    if bytes.len() != 1 + PUB_KEY_HASH_LEN + CHECKSUM_LEN {
        return Err(Error::InvalidAddress(format!(
            "{}: expected {} bytes, got {}",
            address,
            1 + PUB_KEY_HASH_LEN + CHECKSUM_LEN,
            bytes.len()
        )));
    }

    let (payload, sum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if payload[0] != ADDRESS_VERSION {
        return Err(Error::InvalidAddress(format!(
            "{}: unknown version {:#04x}",
            address, payload[0]
        )));
    }
    if checksum(payload).as_slice() != sum {
        return Err(Error::InvalidAddress(format!("{}: bad checksum", address)));
    }

    Ok(payload[1..].to_vec())
}

pub fn validate_address(address: &str) -> bool {
    pub_key_hash_from_address(address).is_ok()
}
