//! The Electrum 1.4 scripthash transform.
//!
//! An electrum scripthash is not the RIPEMD160 script hash used in addresses:
//! it is the SHA-256 of the full output payment script, byte-reversed and
//! rendered as lowercase hex. It is the server's lookup key for every
//! per-address subscription and query.

use sha2::{Digest, Sha256};

/// Maps an output script to its Electrum 1.4 protocol scripthash.
///
/// Pure and coin-independent: `hex(reverse(sha256(pk_script)))`.
#[must_use]
pub fn electrum_scripthash(pk_script: &[u8]) -> String {
    let mut digest: [u8; 32] = Sha256::digest(pk_script).into();
    digest.reverse();
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_script() {
        // sha256 of the empty string, byte-reversed
        assert_eq!(
            electrum_scripthash(&[]),
            "55b852781b9995a44c939b64e441ae2724b96f99c8f4fb9a141cfc9842c4b0e3",
        );
    }

    #[test]
    fn reversal_and_rendering() {
        let script = hex::decode("76a914ffffffffffffffffffffffffffffffffffffffff88ac").unwrap();
        let scripthash = electrum_scripthash(&script);
        assert_eq!(scripthash.len(), 64);
        assert_eq!(scripthash, scripthash.to_lowercase());

        let mut forward: [u8; 32] = Sha256::digest(&script).into();
        forward.reverse();
        assert_eq!(scripthash, hex::encode(forward));
    }

    #[test]
    fn distinct_scripts_distinct_hashes() {
        assert_ne!(electrum_scripthash(b"\x00"), electrum_scripthash(b"\x01"));
    }
}
