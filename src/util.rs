use std::{
    io::{Read, Result},
    os::fd::{AsFd, AsRawFd},
};

use sha2::{Digest, Sha256};

/// Formats a string like "/proc/self/fd/3" for the given fd.  This can be used to work with kernel
/// APIs that don't directly accept file descriptors.
///
/// This call never fails.
pub(crate) fn proc_self_fd(fd: impl AsFd) -> String {
    format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd())
}

/// Hashes the entire content of `reader` and returns the SHA-256 digest in lowercase hex.
pub fn sha256_hex(mut reader: impl Read) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    loop {
        match reader.read(&mut buffer)? {
            0 => break,
            n => hasher.update(&buffer[..n]),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        // well-known digests
        assert_eq!(
            sha256_hex(b"" as &[u8]).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc" as &[u8]).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_hex_large() {
        // spans several read buffers
        let data = vec![0x5au8; 200_000];
        let one = sha256_hex(&data[..]).unwrap();
        let two = sha256_hex(&data[..]).unwrap();
        assert_eq!(one, two);
        assert_eq!(one.len(), 64);
    }
}
