use sha2::digest::DynDigest;
use std::collections::BTreeMap;
use std::io::Read;
use tracing::debug;

/// Pseudo-hash name whose "checksum" is the decimal size of the data.
pub const SIZE_PSEUDO_HASH: &str = "__size__";

pub const SUPPORTED_HASHES: &[&str] = &[
    "BLAKE2B", "BLAKE2S", "MD5", "SHA1", "SHA256", "SHA3_256", "SHA3_512", "SHA512",
];

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("Unsupported hash: {0}")]
    UnsupportedHash(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of hashing a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashValues {
    pub size: u64,
    /// Hex encoded, keyed by hash name. Never contains [`SIZE_PSEUDO_HASH`].
    pub checksums: BTreeMap<String, String>,
}

pub fn is_supported_hash(name: &str) -> bool {
    name == SIZE_PSEUDO_HASH || SUPPORTED_HASHES.contains(&name)
}

fn new_hasher(name: &str) -> Result<Box<dyn DynDigest>, HashError> {
    Ok(match name {
        "BLAKE2B" => Box::new(blake2::Blake2b512::default()),
        "BLAKE2S" => Box::new(blake2::Blake2s256::default()),
        "MD5" => Box::new(md5::Md5::default()),
        "SHA1" => Box::new(sha1::Sha1::default()),
        "SHA256" => Box::new(sha2::Sha256::default()),
        "SHA512" => Box::new(sha2::Sha512::default()),
        "SHA3_256" => Box::new(sha3::Sha3_256::default()),
        "SHA3_512" => Box::new(sha3::Sha3_512::default()),
        other => return Err(HashError::UnsupportedHash(other.to_string())),
    })
}

/// Reads `reader` to the end, feeding every requested hash in one pass.
///
/// `__size__` may be requested like any other hash; the size is always
/// reported in [`HashValues::size`] and is not repeated in the checksum map.
pub fn hash_reader<R: Read, S: AsRef<str>>(
    mut reader: R,
    hashes: &[S],
) -> Result<HashValues, HashError> {
    let mut hashers = Vec::with_capacity(hashes.len());
    for name in hashes {
        let name = name.as_ref();
        if name == SIZE_PSEUDO_HASH {
            continue;
        }
        hashers.push((name.to_string(), new_hasher(name)?));
    }

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        size += bytes_read as u64;
        for (_, hasher) in hashers.iter_mut() {
            hasher.update(&buffer[..bytes_read]);
        }
    }

    let checksums = hashers
        .into_iter()
        .map(|(name, hasher)| (name, hex::encode(hasher.finalize())))
        .collect();

    debug!("Hashed {} bytes", size);
    Ok(HashValues { size, checksums })
}

pub fn hash_bytes<S: AsRef<str>>(data: &[u8], hashes: &[S]) -> Result<HashValues, HashError> {
    hash_reader(data, hashes)
}
