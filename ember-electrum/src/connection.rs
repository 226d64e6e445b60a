//! A single session against one ElectrumX endpoint.
//!
//! One server, one lifetime: dial the configured transport, handshake with
//! `server.version` and `server.features`, then serve requests until the
//! session dies. All socket traffic is handled by one task per session,
//! connected to callers via an mpsc request queue and per-request
//! [`tokio::sync::oneshot`] completion slots. Notifications are pushed into
//! bounded channels the owner takes at subscription time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::codec::{
    parse_frame, read_frame, Frame, IdSequence, PendingRequests, Request,
    METHOD_HEADERS_SUBSCRIBE, METHOD_SCRIPTHASH_SUBSCRIBE,
};
use crate::config::{Scheme, ServerAddr, Timeouts};
use crate::error::{ChainError, NetworkError, RequestError, TransportError};
use crate::protocol::{
    BlockHeadersChunk, HeadersNotify, HistoryItem, ScripthashStatus, ServerFeatures, TxVerbose,
    UnspentItem, CLIENT_VERSION, PROTOCOL_VERSION,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(60);
const KEEPALIVE_LIMIT: Duration = Duration::from_secs(120);
/// Inbound notification channels are small; a consumer that cannot keep up
/// with 16 outstanding notifications is wedged.
const NOTIFY_CHANNEL_CAPACITY: usize = 16;
const REQUEST_QUEUE_CAPACITY: usize = 64;

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}
type BoxStream = Box<dyn AsyncStream>;

/// Transport knobs for dialling one endpoint.
#[derive(Debug, Clone)]
pub struct ConnectOpts {
    /// Accept self-signed certificates.
    pub skip_tls_verify: bool,
    /// Local socks5 proxy port, required for onion endpoints.
    pub proxy_port: Option<u16>,
    /// Per-request deadlines.
    pub timeouts: Timeouts,
    /// Genesis hash the server must report in `server.features`.
    pub expected_genesis: String,
}

struct OutboundRequest {
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, RequestError>>,
}

/// Handle to a live server session.
pub struct Connection {
    addr: ServerAddr,
    timeouts: Timeouts,
    request_tx: mpsc::Sender<OutboundRequest>,
    done_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    server_id: OnceLock<(String, String)>,
    subs: Mutex<HashSet<String>>,
    headers_notify: Mutex<Option<mpsc::Receiver<HeadersNotify>>>,
    scripthash_notify: Mutex<Option<mpsc::Receiver<ScripthashStatus>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Connection {
    /// Dials `addr`, spawns the session task and performs the handshake.
    /// Fails with [`ChainError::WrongGenesis`] when the server indexes a
    /// different chain.
    pub async fn connect(
        addr: &ServerAddr,
        opts: &ConnectOpts,
        parent: &CancellationToken,
    ) -> Result<Arc<Connection>, NetworkError> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, dial(addr, opts))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "dial timed out",
                ))
            })??;

        let cancel = parent.child_token();
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (headers_tx, headers_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let (scripthash_tx, scripthash_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);

        tokio::spawn(run_session(
            stream,
            addr.clone(),
            request_rx,
            headers_tx,
            scripthash_tx,
            done_tx,
            cancel.clone(),
        ));

        let connection = Connection {
            addr: addr.clone(),
            timeouts: opts.timeouts,
            request_tx,
            done_rx,
            cancel,
            server_id: OnceLock::new(),
            subs: Mutex::new(HashSet::new()),
            headers_notify: Mutex::new(Some(headers_rx)),
            scripthash_notify: Mutex::new(Some(scripthash_rx)),
        };

        match connection.handshake(&opts.expected_genesis).await {
            Ok(()) => Ok(Arc::new(connection)),
            Err(e) => {
                connection.close();
                Err(e)
            }
        }
    }

    async fn handshake(&self, expected_genesis: &str) -> Result<(), NetworkError> {
        let result = self
            .call(
                "server.version",
                json!([CLIENT_VERSION, PROTOCOL_VERSION]),
                self.timeouts.request,
            )
            .await?;
        let identity: (String, String) = serde_json::from_value(result)
            .map_err(RequestError::BadResponse)?;
        tracing::info!(server = %self.addr, "connected to {} speaking {}", identity.0, identity.1);
        let _already_set = self.server_id.set(identity);

        let features = self.features().await?;
        if features.genesis_hash != expected_genesis {
            return Err(ChainError::WrongGenesis {
                expected: expected_genesis.to_string(),
                got: features.genesis_hash,
            }
            .into());
        }
        Ok(())
    }

    /// Endpoint this session talks to.
    #[must_use]
    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// Server identity from the handshake.
    #[must_use]
    pub fn server_id(&self) -> Option<&(String, String)> {
        self.server_id.get()
    }

    /// Observable once-only done event. The flag flips to `true` when the
    /// session has fully closed and drained its waiters.
    #[must_use]
    pub fn done_watch(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// True once the session has closed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Requests an orderly close.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Takes the bounded header notification stream. Yields the immediate
    /// subscription results as well as later pushes.
    pub fn take_headers_notify(&self) -> Option<mpsc::Receiver<HeadersNotify>> {
        self.headers_notify.lock().expect("not poisoned").take()
    }

    /// Takes the bounded scripthash status stream.
    pub fn take_scripthash_notify(&self) -> Option<mpsc::Receiver<ScripthashStatus>> {
        self.scripthash_notify.lock().expect("not poisoned").take()
    }

    /// Scripthashes currently subscribed on this session.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subs.lock().expect("not poisoned").len()
    }

    /// Sends one request and awaits its completion slot under `timeout`.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let (reply, slot) = oneshot::channel();
        self.request_tx
            .send(OutboundRequest {
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| RequestError::ConnectionDropped)?;
        match tokio::time::timeout(timeout, slot).await {
            Err(_) => Err(RequestError::Timeout),
            Ok(Err(_)) => Err(RequestError::ConnectionDropped),
            Ok(Ok(outcome)) => outcome,
        }
    }

    /// `server.features`.
    pub async fn features(&self) -> Result<ServerFeatures, RequestError> {
        let result = self
            .call("server.features", json!([]), self.timeouts.request)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `server.peers.subscribe`: one-shot peer discovery.
    pub async fn server_peers(&self) -> Result<Value, RequestError> {
        self.call("server.peers.subscribe", json!([]), self.timeouts.request)
            .await
    }

    /// `blockchain.headers.subscribe`: returns the server tip and arms the
    /// header notification stream.
    pub async fn subscribe_headers(&self) -> Result<HeadersNotify, RequestError> {
        let result = self
            .call(
                "blockchain.headers.subscribe",
                json!([]),
                self.timeouts.request,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `blockchain.block.header` for a single raw header, hex.
    pub async fn block_header(&self, height: i64) -> Result<String, RequestError> {
        let result = self
            .call(
                "blockchain.block.header",
                json!([height, 0]),
                self.timeouts.request,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `blockchain.block.headers` for a contiguous chunk.
    pub async fn block_headers(
        &self,
        start_height: i64,
        count: i64,
    ) -> Result<BlockHeadersChunk, RequestError> {
        let result = self
            .call(
                "blockchain.block.headers",
                json!([start_height, count, 0]),
                self.timeouts.request,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `blockchain.scripthash.subscribe`. A `null` status means the script
    /// has no history yet and maps to the empty string.
    pub async fn subscribe_scripthash(&self, scripthash: &str) -> Result<String, RequestError> {
        let result = self
            .call(
                METHOD_SCRIPTHASH_SUBSCRIBE,
                json!([scripthash]),
                self.timeouts.request,
            )
            .await?;
        self.subs
            .lock()
            .expect("not poisoned")
            .insert(scripthash.to_string());
        Ok(match result {
            Value::String(status) => status,
            _ => String::new(),
        })
    }

    /// `blockchain.scripthash.unsubscribe`.
    pub async fn unsubscribe_scripthash(&self, scripthash: &str) -> Result<bool, RequestError> {
        let result = self
            .call(
                "blockchain.scripthash.unsubscribe",
                json!([scripthash]),
                self.timeouts.request,
            )
            .await?;
        self.subs.lock().expect("not poisoned").remove(scripthash);
        Ok(result.as_bool().unwrap_or(false))
    }

    /// `blockchain.scripthash.get_history`.
    pub async fn get_history(&self, scripthash: &str) -> Result<Vec<HistoryItem>, RequestError> {
        let result = self
            .call(
                "blockchain.scripthash.get_history",
                json!([scripthash]),
                self.timeouts.request,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `blockchain.scripthash.listunspent`.
    pub async fn list_unspent(&self, scripthash: &str) -> Result<Vec<UnspentItem>, RequestError> {
        let result = self
            .call(
                "blockchain.scripthash.listunspent",
                json!([scripthash]),
                self.timeouts.request,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `blockchain.transaction.get` with `verbose=false`: raw hex.
    pub async fn get_raw_transaction(&self, txid: &str) -> Result<String, RequestError> {
        let result = self
            .call(
                "blockchain.transaction.get",
                json!([txid, false]),
                self.timeouts.request,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `blockchain.transaction.get` with `verbose=true`.
    pub async fn get_transaction(&self, txid: &str) -> Result<TxVerbose, RequestError> {
        let result = self
            .call(
                "blockchain.transaction.get",
                json!([txid, true]),
                self.timeouts.request,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `blockchain.transaction.broadcast`. Longer deadline: some servers
    /// relay synchronously.
    pub async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, RequestError> {
        let result = self
            .call(
                "blockchain.transaction.broadcast",
                json!([raw_tx_hex]),
                self.timeouts.broadcast,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `blockchain.estimatefee`: coin units per kB for a confirmation
    /// target, -1 when the server has no estimate.
    pub async fn estimate_fee(&self, conf_target: i64) -> Result<f64, RequestError> {
        let result = self
            .call(
                "blockchain.estimatefee",
                json!([conf_target]),
                self.timeouts.request,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

async fn dial(addr: &ServerAddr, opts: &ConnectOpts) -> Result<BoxStream, TransportError> {
    if addr.is_onion() {
        let Some(port) = opts.proxy_port else {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "onion endpoint without a socks proxy",
            )));
        };
        let proxied = tokio_socks::tcp::Socks5Stream::connect(
            ("127.0.0.1", port),
            (addr.host.as_str(), addr.port),
        )
        .await?;
        return match addr.scheme {
            Scheme::Tcp => Ok(Box::new(proxied)),
            Scheme::Ssl => Ok(Box::new(tls_handshake(addr, opts, proxied).await?)),
        };
    }

    let tcp = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    match addr.scheme {
        Scheme::Tcp => Ok(Box::new(tcp)),
        Scheme::Ssl => Ok(Box::new(tls_handshake(addr, opts, tcp).await?)),
    }
}

async fn tls_handshake<S>(
    addr: &ServerAddr,
    opts: &ConnectOpts,
    stream: S,
) -> Result<tokio_rustls::client::TlsStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        // unusable platform certificates are skipped, not fatal
        let _ignore_error = roots.add(cert);
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if opts.skip_tls_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerification::default()));
    }
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(addr.host.clone())
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))
}

mod danger {
    //! Certificate verifier for explicitly-configured self-signed dev
    //! servers. Signatures are still checked; the chain is not.

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl Default for NoVerification {
        fn default() -> Self {
            NoVerification(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

/// The session task. Owns the socket; everything else talks to it through
/// channels. Exits on cancellation, transport error, keep-alive expiry or
/// notification overflow, then drains all waiters and fires `done`.
async fn run_session(
    stream: BoxStream,
    addr: ServerAddr,
    mut request_rx: mpsc::Receiver<OutboundRequest>,
    headers_tx: mpsc::Sender<HeadersNotify>,
    scripthash_tx: mpsc::Sender<ScripthashStatus>,
    done_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let ids = IdSequence::default();
    let mut pending = PendingRequests::default();
    let mut frame_buf = Vec::new();
    let mut last_recv = Instant::now();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_interval.tick().await;

    let exit: Result<(), TransportError> = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),

            outbound = request_rx.recv() => {
                let Some(outbound) = outbound else {
                    // every handle dropped; nothing can use this session
                    break Ok(());
                };
                let id = ids.next_id();
                let frame = match Request::new(id, &outbound.method, outbound.params).to_frame() {
                    Ok(frame) => frame,
                    Err(e) => break Err(e),
                };
                pending.insert(id, outbound.reply);
                if let Err(e) = write_half.write_all(&frame).await {
                    break Err(e.into());
                }
            }

            read = read_frame(&mut reader, &mut frame_buf) => {
                let n = match read {
                    Ok(0) => break Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    ))),
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                last_recv = Instant::now();
                match parse_frame(&frame_buf[..n]) {
                    Ok(Frame::Response { id, outcome }) => pending.complete(id, outcome),
                    Ok(Frame::Notification { method, params }) => {
                        if let Err(e) = route_notification(&method, &params, &headers_tx, &scripthash_tx) {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                }
            }

            _ = ping_interval.tick() => {
                if last_recv.elapsed() >= KEEPALIVE_LIMIT {
                    break Err(TransportError::KeepAliveExpired(KEEPALIVE_LIMIT.as_secs()));
                }
                // the pong is handled like any response; no waiter is registered
                let frame = match Request::new(ids.next_id(), "server.ping", json!([])).to_frame() {
                    Ok(frame) => frame,
                    Err(e) => break Err(e),
                };
                if let Err(e) = write_half.write_all(&frame).await {
                    break Err(e.into());
                }
            }
        }
    };

    // Closing: fail every outstanding and queued waiter, then mark done.
    let cancelled = exit.is_ok();
    match exit {
        Ok(()) => tracing::debug!(server = %addr, "session closed"),
        Err(ref e) => tracing::warn!(server = %addr, "session died: {e}"),
    }
    let make_error = || {
        if cancelled {
            RequestError::Cancelled
        } else {
            RequestError::ConnectionDropped
        }
    };
    pending.fail_all(make_error);
    request_rx.close();
    while let Ok(outbound) = request_rx.try_recv() {
        let _ignore_error = outbound.reply.send(Err(make_error()));
    }
    let _ignore_error = done_tx.send(true);
}

fn route_notification(
    method: &str,
    params: &Value,
    headers_tx: &mpsc::Sender<HeadersNotify>,
    scripthash_tx: &mpsc::Sender<ScripthashStatus>,
) -> Result<(), TransportError> {
    match method {
        METHOD_HEADERS_SUBSCRIBE => {
            // params arrive as [{height, hex}]
            let payload = params.get(0).unwrap_or(params);
            let Ok(notify) = serde_json::from_value::<HeadersNotify>(payload.clone()) else {
                tracing::warn!("malformed headers notification dropped");
                return Ok(());
            };
            match headers_tx.try_send(notify) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    Err(TransportError::NotifyOverflow("headers"))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!("headers notification dropped: no receiver");
                    Ok(())
                }
            }
        }
        METHOD_SCRIPTHASH_SUBSCRIBE => {
            let Some(status) = ScripthashStatus::from_params(params) else {
                tracing::warn!("malformed scripthash notification dropped");
                return Ok(());
            };
            match scripthash_tx.try_send(status) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    Err(TransportError::NotifyOverflow("scripthash"))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!("scripthash notification dropped: no receiver");
                    Ok(())
                }
            }
        }
        other => {
            tracing::warn!("notification for unhandled method {other} dropped");
            Ok(())
        }
    }
}
