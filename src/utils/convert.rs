use crate::Result;
use crate::StorageError;

/// Big-endian encoding so byte order matches numeric order in the engine.
pub const fn safe_kv(num: u64) -> [u8; 8] {
    num.to_be_bytes()
}

pub fn safe_vk<K: AsRef<[u8]>>(bytes: K) -> Result<u64> {
    let bytes = bytes.as_ref();
    let array: [u8; 8] = bytes.try_into().map_err(|_| StorageError::DataCorruption {
        location: format!("u64 key of {} bytes", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(array))
}
