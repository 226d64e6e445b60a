//! Per-coin chain profiles.
//!
//! Everything the engine needs to know about a coin is carried by a
//! [`ChainProfile`] value: the header record size, the deserializer that
//! turns a raw record into a [`BlockHeader`], the genesis hash to check
//! against `server.features`, the checkpoint the header file starts at and
//! the peer-strategy knobs. No runtime class hierarchy.

use byteorder::{ByteOrder, LittleEndian};
use dashcore_hashes::{hash_x11, Hash as _};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

/// 32 byte hash in wire (little-endian) order.
pub type Hash256 = [u8; 32];

/// Double SHA-256 over `bytes`, in wire order.
#[must_use]
pub fn double_sha256(bytes: &[u8]) -> Hash256 {
    let first = Sha256::digest(bytes);
    Sha256::digest(first).into()
}

/// Renders a wire-order hash the way block explorers and the electrum
/// protocol do: byte-reversed, lowercase hex.
#[must_use]
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// The parsed portion of a block header plus its own hash.
///
/// For FiroPoW nets only the leading 80 bytes of the 120 byte record decode
/// into these fields; the hash still covers the full record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version.
    pub version: i32,
    /// Hash of the previous block, wire order.
    pub prev: Hash256,
    /// Merkle root, wire order.
    pub merkle: Hash256,
    /// Block timestamp.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Nonce.
    pub nonce: u32,
    /// This block's own hash, wire order, computed by the coin's hasher.
    pub hash: Hash256,
}

/// Raised when a raw record cannot be decoded into a [`BlockHeader`].
#[derive(Debug, thiserror::Error)]
#[error("raw header has {got} bytes, record size is {expected}")]
pub struct HeaderDecodeError {
    /// Bytes supplied.
    pub got: usize,
    /// Record size the deserializer expects.
    pub expected: usize,
}

/// Decodes one raw record into a [`BlockHeader`]. Implementations differ per
/// coin only in the hash function and record size.
pub type HeaderDeserializer = fn(&[u8]) -> Result<BlockHeader, HeaderDecodeError>;

const CORE_HEADER_SIZE: usize = 80;
const FIROPOW_HEADER_SIZE: usize = 120;

// field layout shared by every coin in scope:
// version(4 LE) | prev(32) | merkle(32) | time(4 LE) | bits(4 LE) | nonce(4 LE)
fn decode_core_fields(raw: &[u8; CORE_HEADER_SIZE], hash: Hash256) -> BlockHeader {
    let mut prev = [0u8; 32];
    prev.copy_from_slice(&raw[4..36]);
    let mut merkle = [0u8; 32];
    merkle.copy_from_slice(&raw[36..68]);
    BlockHeader {
        version: LittleEndian::read_i32(&raw[0..4]),
        prev,
        merkle,
        time: LittleEndian::read_u32(&raw[68..72]),
        bits: LittleEndian::read_u32(&raw[72..76]),
        nonce: LittleEndian::read_u32(&raw[76..80]),
        hash,
    }
}

fn take_core(raw: &[u8], expected: usize) -> Result<[u8; CORE_HEADER_SIZE], HeaderDecodeError> {
    if raw.len() != expected {
        return Err(HeaderDecodeError {
            got: raw.len(),
            expected,
        });
    }
    let mut core = [0u8; CORE_HEADER_SIZE];
    core.copy_from_slice(&raw[..CORE_HEADER_SIZE]);
    Ok(core)
}

/// 80 byte record hashed with double SHA-256. Bitcoin on every net, Firo on
/// regtest.
pub fn deserialize_sha256d_header(raw: &[u8]) -> Result<BlockHeader, HeaderDecodeError> {
    let core = take_core(raw, CORE_HEADER_SIZE)?;
    Ok(decode_core_fields(&core, double_sha256(raw)))
}

/// 80 byte record hashed with X11. Dash.
pub fn deserialize_x11_header(raw: &[u8]) -> Result<BlockHeader, HeaderDecodeError> {
    let core = take_core(raw, CORE_HEADER_SIZE)?;
    let hash = hash_x11::Hash::hash(raw).to_byte_array();
    Ok(decode_core_fields(&core, hash))
}

/// 120 byte FiroPoW record: double SHA-256 over the full record, structured
/// fields decoded from the leading 80 bytes.
pub fn deserialize_firopow_header(raw: &[u8]) -> Result<BlockHeader, HeaderDecodeError> {
    let core = take_core(raw, FIROPOW_HEADER_SIZE)?;
    Ok(decode_core_fields(&core, double_sha256(raw)))
}

/// Coins this engine ships profiles for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coin {
    /// Bitcoin.
    Btc,
    /// Dash.
    Dash,
    /// Firo.
    Firo,
}

impl std::fmt::Display for Coin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Coin::Btc => write!(f, "btc"),
            Coin::Dash => write!(f, "dash"),
            Coin::Firo => write!(f, "firo"),
        }
    }
}

/// Network type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetType {
    /// Mainnet.
    Mainnet,
    /// Public testnet.
    Testnet,
    /// Local regtest.
    Regtest,
}

impl std::fmt::Display for NetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetType::Mainnet => write!(f, "mainnet"),
            NetType::Testnet => write!(f, "testnet"),
            NetType::Regtest => write!(f, "regtest"),
        }
    }
}

const BTC_GENESIS_MAINNET: &str =
    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
const BTC_GENESIS_TESTNET: &str =
    "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943";
const BTC_GENESIS_REGTEST: &str =
    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";

const DASH_GENESIS_MAINNET: &str =
    "00000ffd590b1485b3caadc19b22e6379c733355108f107a430458cdf3407ab6";
const DASH_GENESIS_TESTNET: &str =
    "00000bafbc94add76cb75e2ec92894837288a481e5c005f6563d91623bf8bc2c";
const DASH_GENESIS_REGTEST: &str =
    "000008ca1832a4baf228eb1553c03d3a2c8e02399550dd6ea8d65cec3ef23d2e";

const FIRO_GENESIS_MAINNET: &str =
    "4381deb85b1b2c9843c222944b616d997516dcbd6a964e1eaf0def0830695233";
const FIRO_GENESIS_TESTNET: &str =
    "aa22adcc12becaf436027ffe62a8fb21b234c58c23865291e5dc52cf53f64fca";
const FIRO_GENESIS_REGTEST: &str =
    "a42b98f04cc2916e8adfb5d9db8a2227c4629bc205748ed2f33180b636ee885b";

/// Everything coin-specific the network engine consumes, passed by value
/// into constructors.
#[derive(Debug, Clone, Copy)]
pub struct ChainProfile {
    /// Coin this profile describes.
    pub coin: Coin,
    /// Net this profile describes.
    pub net: NetType,
    /// On-disk header record size N.
    pub header_size: usize,
    /// Genesis hash, display order, checked against `server.features`.
    pub genesis: &'static str,
    /// Height the header file starts at. Headers below it are trusted to the
    /// server and never stored.
    pub checkpoint: i64,
    /// Target number of sessions in multi-node mode. Zero means single-node.
    pub max_online_peers: usize,
    /// Hard cap on concurrent onion sessions.
    pub max_onion: usize,
    /// Never evict known peers on transient errors. Set for coins with tiny
    /// server fleets.
    pub no_delete_known_peers: bool,
    /// Turns a raw record into a [`BlockHeader`].
    pub deserialize_header: HeaderDeserializer,
}

impl ChainProfile {
    /// Looks up the profile for a coin and net.
    pub fn new(coin: Coin, net: NetType) -> Self {
        match coin {
            Coin::Btc => Self::btc(net),
            Coin::Dash => Self::dash(net),
            Coin::Firo => Self::firo(net),
        }
    }

    // btc runs strictly single-node against the trusted peer; no peer
    // discovery, no onion budget
    fn btc(net: NetType) -> Self {
        let (genesis, checkpoint) = match net {
            NetType::Mainnet => (BTC_GENESIS_MAINNET, 832_000),
            NetType::Testnet => (BTC_GENESIS_TESTNET, 2_560_000),
            NetType::Regtest => (BTC_GENESIS_REGTEST, 0),
        };
        ChainProfile {
            coin: Coin::Btc,
            net,
            header_size: CORE_HEADER_SIZE,
            genesis,
            checkpoint,
            max_online_peers: 0,
            max_onion: 0,
            no_delete_known_peers: false,
            deserialize_header: deserialize_sha256d_header,
        }
    }

    fn dash(net: NetType) -> Self {
        let (genesis, checkpoint, max_online_peers) = match net {
            NetType::Mainnet => (DASH_GENESIS_MAINNET, 2_248_000, 3),
            NetType::Testnet => (DASH_GENESIS_TESTNET, 1_225_000, 1),
            NetType::Regtest => (DASH_GENESIS_REGTEST, 0, 0),
        };
        ChainProfile {
            coin: Coin::Dash,
            net,
            header_size: CORE_HEADER_SIZE,
            genesis,
            checkpoint,
            max_online_peers,
            max_onion: 1,
            no_delete_known_peers: true,
            deserialize_header: deserialize_x11_header,
        }
    }

    fn firo(net: NetType) -> Self {
        // regtest firo predates FiroPoW and still uses the 80 byte wire header
        let (genesis, checkpoint, max_online_peers, header_size, deserialize_header) = match net {
            NetType::Mainnet => (
                FIRO_GENESIS_MAINNET,
                987_000,
                3,
                FIROPOW_HEADER_SIZE,
                deserialize_firopow_header as HeaderDeserializer,
            ),
            NetType::Testnet => (
                FIRO_GENESIS_TESTNET,
                170_000,
                0,
                FIROPOW_HEADER_SIZE,
                deserialize_firopow_header as HeaderDeserializer,
            ),
            NetType::Regtest => (
                FIRO_GENESIS_REGTEST,
                0,
                0,
                CORE_HEADER_SIZE,
                deserialize_sha256d_header as HeaderDeserializer,
            ),
        };
        ChainProfile {
            coin: Coin::Firo,
            net,
            header_size,
            genesis,
            checkpoint,
            max_online_peers,
            max_onion: 0,
            no_delete_known_peers: true,
            deserialize_header,
        }
    }

    /// True when this profile runs a single session against the trusted peer.
    #[must_use]
    pub fn single_node(&self) -> bool {
        self.max_online_peers == 0
    }
}

impl std::str::FromStr for Coin {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "btc" => Ok(Coin::Btc),
            "dash" => Ok(Coin::Dash),
            "firo" => Ok(Coin::Firo),
            other => Err(ConfigError::UnknownCoin(other.to_string())),
        }
    }
}

impl std::str::FromStr for NetType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(NetType::Mainnet),
            "testnet" => Ok(NetType::Testnet),
            "regtest" => Ok(NetType::Regtest),
            other => Err(ConfigError::UnknownNetType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTC_GENESIS_MERKLE_WIRE: &str =
        "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a";

    fn btc_genesis_raw() -> Vec<u8> {
        let mut encoded = String::from("01000000");
        encoded.push_str(&"00".repeat(32));
        encoded.push_str(BTC_GENESIS_MERKLE_WIRE);
        encoded.push_str("29ab5f49ffff001d1dac2b7c");
        hex::decode(encoded).unwrap()
    }

    #[test]
    fn bitcoin_genesis_decodes_and_hashes() {
        let raw = btc_genesis_raw();
        let header = deserialize_sha256d_header(&raw).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.prev, [0u8; 32]);
        assert_eq!(hash_to_hex(&header.hash), BTC_GENESIS_MAINNET);
        assert_eq!(
            hash_to_hex(&header.merkle),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        );
        assert_eq!(header.time, 0x495f_ab29);
        assert_eq!(header.bits, 0x1d00_ffff);
        assert_eq!(header.nonce, 0x7c2b_ac1d);
    }

    #[test]
    fn firopow_record_parses_leading_eighty() {
        let mut raw = btc_genesis_raw();
        raw.resize(120, 0);
        let header = deserialize_firopow_header(&raw).unwrap();
        // structured fields come from the leading 80 bytes
        assert_eq!(header.version, 1);
        assert_eq!(
            hash_to_hex(&header.merkle),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        );
        // the hash covers the whole 120 byte record
        assert_eq!(header.hash, double_sha256(&raw));
        assert_ne!(header.hash, double_sha256(&raw[..80]));
    }

    #[test]
    fn wrong_record_size_is_rejected() {
        assert!(deserialize_sha256d_header(&[0u8; 79]).is_err());
        assert!(deserialize_firopow_header(&[0u8; 80]).is_err());
        assert!(deserialize_x11_header(&[0u8; 120]).is_err());
    }

    #[test]
    fn profiles_carry_coin_specific_records() {
        let firo_main = ChainProfile::new(Coin::Firo, NetType::Mainnet);
        assert_eq!(firo_main.header_size, 120);
        assert_eq!(firo_main.checkpoint, 987_000);
        assert!(firo_main.no_delete_known_peers);

        let firo_reg = ChainProfile::new(Coin::Firo, NetType::Regtest);
        assert_eq!(firo_reg.header_size, 80);
        assert_eq!(firo_reg.checkpoint, 0);
        assert!(firo_reg.single_node());

        let dash = ChainProfile::new(Coin::Dash, NetType::Mainnet);
        assert_eq!(dash.header_size, 80);
        assert_eq!(dash.max_onion, 1);
        assert!(!dash.single_node());

        let btc = ChainProfile::new(Coin::Btc, NetType::Mainnet);
        assert_eq!(btc.genesis, BTC_GENESIS_MAINNET);
        assert!(btc.single_node());
    }
}
