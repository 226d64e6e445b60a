//! Typed shapes for the ElectrumX 1.4 method catalogue the engine uses.

use serde::Deserialize;
use serde_json::Value;

/// Client identity advertised during the `server.version` handshake.
pub const CLIENT_VERSION: &str = concat!("ember-v", env!("CARGO_PKG_VERSION"));
/// Protocol version negotiated during the handshake.
pub const PROTOCOL_VERSION: &str = "1.4";

/// Result of `server.features`. Only the fields the engine inspects are
/// kept; servers attach many more.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerFeatures {
    /// Genesis hash of the chain the server indexes, display order.
    pub genesis_hash: String,
    /// Server software identity.
    #[serde(default)]
    pub server_version: Option<String>,
    /// Lowest protocol version the server speaks.
    #[serde(default)]
    pub protocol_min: Option<String>,
    /// Highest protocol version the server speaks.
    #[serde(default)]
    pub protocol_max: Option<String>,
    /// Hash function used for status hashes. Always sha256 in practice.
    #[serde(default)]
    pub hash_function: Option<String>,
}

/// Payload of `blockchain.headers.subscribe`, both the immediate result and
/// every subsequent notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeadersNotify {
    /// Server tip height.
    pub height: i64,
    /// Raw header at that height, hex.
    pub hex: String,
}

/// One scripthash status notification: `[scripthash, status]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScripthashStatus {
    /// The electrum scripthash that changed.
    pub scripthash: String,
    /// Opaque status hash; empty string means no history yet.
    pub status: String,
}

impl ScripthashStatus {
    /// Parses the positional notification params. The status may be JSON
    /// null for a script with no history.
    pub fn from_params(params: &Value) -> Option<Self> {
        let scripthash = params.get(0)?.as_str()?.to_string();
        let status = match params.get(1) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        Some(ScripthashStatus {
            scripthash,
            status,
        })
    }
}

/// Result of `blockchain.block.headers`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeadersChunk {
    /// Number of headers returned.
    pub count: usize,
    /// Concatenated raw headers, hex.
    pub hex: String,
    /// Maximum chunk size the server will serve.
    #[serde(default)]
    pub max: usize,
}

/// One entry of `blockchain.scripthash.get_history`. Mempool entries have
/// `height <= 0`; `-1` marks a mempool transaction with unconfirmed inputs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HistoryItem {
    /// Transaction id, display order.
    pub tx_hash: String,
    /// Confirmation height, or 0 / -1 for mempool.
    pub height: i64,
    /// Mempool entries carry their fee.
    #[serde(default)]
    pub fee: Option<i64>,
}

/// One entry of `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnspentItem {
    /// Funding transaction id, display order.
    pub tx_hash: String,
    /// Output index.
    pub tx_pos: u32,
    /// Confirmation height, or 0 for mempool.
    pub height: i64,
    /// Value in the coin's base unit.
    pub value: i64,
}

/// Result of `blockchain.transaction.get` with `verbose=true`. Shapes vary
/// across daemons, so everything beyond the raw hex is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct TxVerbose {
    /// Raw transaction, hex.
    pub hex: String,
    /// Transaction id.
    #[serde(default)]
    pub txid: Option<String>,
    /// Containing block hash.
    #[serde(default)]
    pub blockhash: Option<String>,
    /// Containing block time.
    #[serde(default)]
    pub blocktime: Option<i64>,
    /// Confirmation count as the daemon sees it.
    #[serde(default)]
    pub confirmations: Option<i64>,
    /// First-seen time.
    #[serde(default)]
    pub time: Option<i64>,
}

/// A server learned from `server.peers.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHost {
    /// Host name (preferred over the bare IP).
    pub host: String,
    /// Port speaking ssl, if advertised.
    pub ssl_port: Option<u16>,
    /// Port speaking tcp, if advertised.
    pub tcp_port: Option<u16>,
}

/// Parses the `server.peers.subscribe` result: a list of
/// `[ip, hostname, [feature, ...]]` triples with features like `"s50002"`,
/// `"t50001"`, `"v1.4"`. Entries with no usable port are skipped.
pub fn parse_peers(result: &Value) -> Vec<PeerHost> {
    let Some(entries) = result.as_array() else {
        return Vec::new();
    };
    let mut peers = Vec::new();
    for entry in entries {
        let Some(parts) = entry.as_array() else {
            continue;
        };
        let Some(host) = parts.get(1).and_then(Value::as_str) else {
            continue;
        };
        let mut ssl_port = None;
        let mut tcp_port = None;
        if let Some(features) = parts.get(2).and_then(Value::as_array) {
            for feature in features.iter().filter_map(Value::as_str) {
                if let Some(port) = feature.strip_prefix('s') {
                    ssl_port = port.parse().ok().or(ssl_port);
                } else if let Some(port) = feature.strip_prefix('t') {
                    tcp_port = port.parse().ok().or(tcp_port);
                }
            }
        }
        if ssl_port.is_none() && tcp_port.is_none() {
            continue;
        }
        peers.push(PeerHost {
            host: host.to_string(),
            ssl_port,
            tcp_port,
        });
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn history_heights_flag_mempool() {
        let items: Vec<HistoryItem> = serde_json::from_value(json!([
            {"tx_hash": "aa", "height": 100},
            {"tx_hash": "bb", "height": 0, "fee": 144},
        ]))
        .unwrap();
        assert_eq!(items[0].height, 100);
        assert_eq!(items[0].fee, None);
        assert_eq!(items[1].fee, Some(144));
    }

    #[test]
    fn scripthash_status_params() {
        let status =
            ScripthashStatus::from_params(&json!(["ab12", "deadbeef"])).unwrap();
        assert_eq!(status.scripthash, "ab12");
        assert_eq!(status.status, "deadbeef");

        // null status means no history yet
        let empty = ScripthashStatus::from_params(&json!(["ab12", null])).unwrap();
        assert_eq!(empty.status, "");

        assert!(ScripthashStatus::from_params(&json!([])).is_none());
    }

    #[test]
    fn peer_features_carry_ports() {
        let peers = parse_peers(&json!([
            ["1.2.3.4", "electrum.example.org", ["v1.4", "s50002", "t50001"]],
            ["5.6.7.8", "noports.example.org", ["v1.4"]],
            "garbage",
        ]));
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].host, "electrum.example.org");
        assert_eq!(peers[0].ssl_port, Some(50002));
        assert_eq!(peers[0].tcp_port, Some(50001));
    }
}
