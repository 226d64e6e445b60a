//! Network engine error module

use std::path::PathBuf;

/// Top level error returned by [`crate::network::Network`] start-up and the facade.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Configuration error.
    #[error("configuration error. {0}")]
    Config(#[from] ConfigError),
    /// Transport error.
    #[error("transport error. {0}")]
    Transport(#[from] TransportError),
    /// Request error.
    #[error("request error. {0}")]
    Request(#[from] RequestError),
    /// Chain error.
    #[error("chain error. {0}")]
    Chain(#[from] ChainError),
    /// Header store error.
    #[error("header store error. {0}")]
    Store(#[from] StoreError),
}

/// Errors detected while assembling an engine configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A trusted peer is required to bootstrap the peer set.
    #[error("trusted peer required in config")]
    MissingTrustedPeer,
    /// Coin ticker is not one the engine ships a profile for.
    #[error("unknown coin '{0}'")]
    UnknownCoin(String),
    /// Net type string is not recognised.
    #[error("unknown net type '{0}'")]
    UnknownNetType(String),
    /// Server address string could not be parsed.
    #[error("invalid server address '{0}'. expected [tcp|ssl]://host:port")]
    InvalidServerAddr(String),
    /// The data directory could not be created or opened.
    #[error("bad data directory {0}")]
    BadDataDir(PathBuf),
    /// Onion peers require a local socks proxy.
    #[error("onion address configured without a proxy port")]
    OnionWithoutProxy,
}

/// Errors that terminate a server session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// TCP dial or socket i/o failed.
    #[error("socket error. {0}")]
    Io(#[from] std::io::Error),
    /// TLS client setup failed.
    #[error("tls error. {0}")]
    Tls(String),
    /// SOCKS5 proxy connect failed.
    #[error("socks proxy error. {0}")]
    Socks(#[from] tokio_socks::Error),
    /// The server sent a frame that is not valid JSON-RPC. The server is not
    /// trusted to resynchronize after a framing error.
    #[error("framing error. {0}")]
    Framing(#[from] serde_json::Error),
    /// A single message exceeded the frame limit.
    #[error("message of {0} bytes exceeds the {limit} byte frame limit", limit = crate::codec::MAX_FRAME_BYTES)]
    Oversize(usize),
    /// The inbound notification channel overflowed. Either the server is
    /// abusive or the client is wedged.
    #[error("notification channel overflow for {0}")]
    NotifyOverflow(&'static str),
    /// The server stopped answering keep-alive pings.
    #[error("keep-alive expired. no response for {0} seconds")]
    KeepAliveExpired(u64),
}

/// Errors returned to the caller of a single request.
///
/// `Server` is the only non-fatal variant: the session survives a server
/// reported JSON-RPC error object.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// No leader session is ready to serve the call.
    #[error("server not running")]
    ServerNotRunning,
    /// The per-request deadline elapsed.
    #[error("request timed out")]
    Timeout,
    /// The caller's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,
    /// The session died before the response arrived. All pending completion
    /// slots are failed with this error when a session closes.
    #[error("connection dropped before a response arrived")]
    ConnectionDropped,
    /// JSON-RPC error object reported by the server.
    #[error("server error. code {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },
    /// The response arrived but did not have the expected shape.
    #[error("unexpected response shape. {0}")]
    BadResponse(#[from] serde_json::Error),
    /// The response parsed but its payload is unusable, for example raw
    /// header hex of the wrong length.
    #[error("malformed payload from server. {0}")]
    BadPayload(String),
}

/// Protocol invariant violations. Fatal at the network engine level; wallet
/// data is preserved.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The server is indexing a different chain.
    #[error("wrong genesis hash. expected {expected}, server reports {got}")]
    WrongGenesis {
        /// Genesis configured for this coin and net.
        expected: String,
        /// Genesis reported by `server.features`.
        got: String,
    },
    /// Stored prev-hash linkage does not hold.
    #[error("header chain broken at height {0}")]
    ChainBroken(i64),
    /// The server's chain diverges from local headers deeper than the allowed
    /// reorg window.
    #[error("reorg deeper than {0} blocks")]
    DeepReorg(i64),
}

/// Header file errors. Fatal for chain sync; the operator is expected to
/// delete and rebuild the header file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// File or byte-slice length is not a multiple of the record size.
    #[error("corrupt store. length is not a multiple of the header record size")]
    CorruptStore,
    /// A height was requested that is below the checkpoint of this store.
    #[error("height {0} is below the store checkpoint")]
    BelowCheckpoint(i64),
    /// A record failed to decode with the coin's header deserializer.
    #[error("header decode failed at height {0}")]
    Decode(i64),
    /// Underlying file i/o failed.
    #[error("header file i/o error. {0}")]
    Io(#[from] std::io::Error),
}
