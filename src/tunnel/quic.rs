//! QUIC ベースのトンネルデバイス
//!
//! - 接続側（`endpoint` あり）: 相手へ QUIC 接続し、切断時は指数バックオフで再接続する
//! - 待ち受け側（`listen_port` あり）: UDP `0.0.0.0:listen_port` で接続を受け付ける
//!
//! どちらの側も接続直後に X25519 相互認証を行い、認証済みの接続 1 本の上で
//! 仮想 TCP 接続（QUIC 双方向ストリーム）を両方向に張れる。

use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::auth;
use super::config::{ConfigError, TunnelConfig};
use super::stream::{encode_header, read_header, DialStatus, PortTable, QuicListener, VirtualStream};
use super::{DeviceLogger, TunnelError, TunnelInterface};
use crate::service::lock;

/// ALPN プロトコル識別子
pub const ALPN_TUNPORT: &[u8] = b"tunport/1";

/// 自己署名証明書のサーバー名
const SERVER_NAME: &str = "tunport";

/// ピア接続の確立を待つ最大時間
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// ストリームヘッダー受信のタイムアウト
const STREAM_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// 再接続間隔（初期値 / 上限）
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// keepalive を使わない側のアイドルタイムアウト
const DEFAULT_IDLE_TIMEOUT_MS: u32 = 90_000;

/// 1 接続あたりの同時ストリーム数
const MAX_CONCURRENT_STREAMS: u32 = 1024;

/// 送信元の仮想ポートに使う範囲（49152-65535）
const EPHEMERAL_PORT_START: u16 = 49152;
const EPHEMERAL_PORT_COUNT: u16 = 16384;

const CLOSE_NORMAL: u32 = 0;
const CLOSE_AUTH_FAILED: u32 = 1;
const CLOSE_REPLACED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Down,
    Up,
    Closed,
}

fn tls_error(e: impl std::fmt::Display) -> TunnelError {
    TunnelError::Tls(e.to_string())
}

struct Inner {
    local_address: IpAddr,
    mtu: u16,
    logger: DeviceLogger,
    config: Mutex<Option<TunnelConfig>>,
    state: Mutex<DeviceState>,
    endpoint: Mutex<Option<Endpoint>>,
    /// 認証済みのピア接続（未接続なら None）
    peer: watch::Sender<Option<Connection>>,
    ports: Arc<PortTable>,
    next_port: AtomicU16,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// QUIC トンネルデバイス
pub struct QuicTunnel {
    inner: Arc<Inner>,
}

impl QuicTunnel {
    /// デバイスを作成（未設定・停止状態）
    pub fn new(local_address: IpAddr, mtu: u16, logger: DeviceLogger) -> Self {
        let (peer, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                local_address,
                mtu,
                logger,
                config: Mutex::new(None),
                state: Mutex::new(DeviceState::Down),
                endpoint: Mutex::new(None),
                peer,
                ports: Arc::new(PortTable::new()),
                next_port: AtomicU16::new(0),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn local_address(&self) -> IpAddr {
        self.inner.local_address
    }

    /// 認証済みのピア接続があるかどうか
    pub fn is_connected(&self) -> bool {
        self.inner.peer.borrow().is_some()
    }

    /// UDP ソケットのローカルアドレス（up 後のみ）
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.endpoint)
            .as_ref()
            .and_then(|endpoint| endpoint.local_addr().ok())
    }

    fn ensure_up(&self) -> Result<(), TunnelError> {
        match *lock(&self.inner.state) {
            DeviceState::Up => Ok(()),
            DeviceState::Down => Err(TunnelError::NotUp),
            DeviceState::Closed => Err(TunnelError::Closed),
        }
    }

    /// ピア接続が確立されるまで待つ（最大 HANDSHAKE_TIMEOUT）
    async fn wait_for_peer(&self) -> Result<Connection, TunnelError> {
        let mut peer = self.inner.peer.subscribe();
        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

        loop {
            let current = peer.borrow_and_update().clone();
            if let Some(connection) = current {
                return Ok(connection);
            }

            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(TunnelError::Closed),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(TunnelError::NotConnected(HANDSHAKE_TIMEOUT));
                }
                changed = peer.changed() => {
                    if changed.is_err() {
                        return Err(TunnelError::Closed);
                    }
                }
            }
        }
    }
}

impl Drop for QuicTunnel {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[async_trait]
impl TunnelInterface for QuicTunnel {
    type Stream = VirtualStream;
    type Listener = QuicListener;

    fn configure(&self, block: &str) -> Result<(), TunnelError> {
        match *lock(&self.inner.state) {
            DeviceState::Down => {}
            DeviceState::Up => return Err(TunnelError::AlreadyUp),
            DeviceState::Closed => return Err(TunnelError::Closed),
        }

        let config = TunnelConfig::parse(block)?;
        self.inner
            .logger
            .verbose(format_args!("Applying configuration: {:?}", config));
        *lock(&self.inner.config) = Some(config);
        Ok(())
    }

    async fn up(&self) -> Result<(), TunnelError> {
        let config = lock(&self.inner.config)
            .clone()
            .ok_or(TunnelError::NotConfigured)?;

        let server_addr = match config.endpoint {
            Some(ref target) => Some(resolve(target).await?),
            None => None,
        };

        let mut state = lock(&self.inner.state);
        match *state {
            DeviceState::Down => {}
            DeviceState::Up => return Err(TunnelError::AlreadyUp),
            DeviceState::Closed => return Err(TunnelError::Closed),
        }

        let endpoint = if let Some(server_addr) = server_addr {
            let keep_alive = config
                .persistent_keepalive_interval
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::from_secs(u64::from(secs)));
            let endpoint =
                create_client_endpoint(&server_addr, transport_config(self.inner.mtu, keep_alive))?;

            self.inner.logger.verbose(format_args!(
                "Device up on {}, dialing {}",
                self.inner.local_address, server_addr
            ));
            self.inner.tasks.spawn(run_dialer(
                Arc::clone(&self.inner),
                endpoint.clone(),
                server_addr,
                config,
            ));
            endpoint
        } else if let Some(port) = config.listen_port {
            let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            let endpoint =
                create_server_endpoint(bind_addr, transport_config(self.inner.mtu, None))?;

            self.inner.logger.verbose(format_args!(
                "Device up on {}, accepting peers on UDP {}",
                self.inner.local_address, bind_addr
            ));
            self.inner.tasks.spawn(run_acceptor(
                Arc::clone(&self.inner),
                endpoint.clone(),
                config,
            ));
            endpoint
        } else {
            return Err(ConfigError::NoRole.into());
        };

        *lock(&self.inner.endpoint) = Some(endpoint);
        *state = DeviceState::Up;
        Ok(())
    }

    async fn listen(&self, addr: SocketAddr) -> Result<QuicListener, TunnelError> {
        if *lock(&self.inner.state) == DeviceState::Closed {
            return Err(TunnelError::Closed);
        }
        if addr.ip() != self.inner.local_address && !addr.ip().is_unspecified() {
            return Err(TunnelError::NotLocal(addr));
        }

        let port = if addr.port() == 0 {
            self.inner.allocate_port()
        } else {
            addr.port()
        };
        let listener = QuicListener::bind(
            Arc::clone(&self.inner.ports),
            SocketAddr::new(self.inner.local_address, port),
        )?;

        self.inner
            .logger
            .verbose(format_args!("Listening on virtual {}", listener_addr(&listener)));
        Ok(listener)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<VirtualStream, TunnelError> {
        self.ensure_up()?;

        let allowed_ip = lock(&self.inner.config)
            .as_ref()
            .map(|config| config.allowed_ip)
            .ok_or(TunnelError::NotConfigured)?;
        if !allowed_ip.contains(addr.ip()) {
            return Err(TunnelError::NoRoute(addr));
        }

        let connection = self.wait_for_peer().await?;
        let (mut send, mut recv) = connection.open_bi().await?;

        let src_port = self.inner.allocate_port();
        AsyncWriteExt::write_all(&mut send, &encode_header(addr.port(), src_port)).await?;

        let mut status = [0u8; 1];
        AsyncReadExt::read_exact(&mut recv, &mut status).await?;

        match DialStatus::try_from(status[0]) {
            Ok(DialStatus::Accepted) => Ok(VirtualStream::new(
                send,
                recv,
                SocketAddr::new(self.inner.local_address, src_port),
                addr,
            )),
            Ok(DialStatus::Refused) => Err(TunnelError::ConnectionRefused(addr)),
            Err(other) => Err(TunnelError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unexpected dial status: 0x{:02x}", other),
            ))),
        }
    }

    async fn close(&self) -> Result<(), TunnelError> {
        {
            let mut state = lock(&self.inner.state);
            if *state == DeviceState::Closed {
                return Ok(());
            }
            *state = DeviceState::Closed;
        }

        self.inner.cancel.cancel();
        if let Some(connection) = self.inner.peer.send_replace(None) {
            connection.close(quinn::VarInt::from_u32(CLOSE_NORMAL), b"tunnel closed");
        }
        let endpoint = lock(&self.inner.endpoint).take();
        if let Some(ref endpoint) = endpoint {
            endpoint.close(quinn::VarInt::from_u32(CLOSE_NORMAL), b"tunnel closed");
        }
        self.inner.ports.clear();

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        // CONNECTION_CLOSE を送り切るまで少しだけ待つ
        if let Some(endpoint) = endpoint {
            let _ = tokio::time::timeout(Duration::from_secs(1), endpoint.wait_idle()).await;
        }

        self.inner.logger.verbose(format_args!("Device closed"));
        Ok(())
    }
}

fn listener_addr(listener: &QuicListener) -> SocketAddr {
    super::VirtualListener::local_addr(listener)
}

impl Inner {
    fn allocate_port(&self) -> u16 {
        EPHEMERAL_PORT_START + self.next_port.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_PORT_COUNT
    }

    /// 認証済み接続を公開し、相手からのストリームを処理する（切断まで戻らない）
    async fn serve_peer(this: &Arc<Self>, connection: Connection, peer_ip: IpAddr) {
        let previous = this.peer.send_replace(Some(connection.clone()));
        if let Some(previous) = previous {
            if previous.stable_id() != connection.stable_id() {
                previous.close(quinn::VarInt::from_u32(CLOSE_REPLACED), b"replaced");
            }
        }

        loop {
            let accepted = tokio::select! {
                _ = this.cancel.cancelled() => break,
                accepted = connection.accept_bi() => accepted,
            };

            match accepted {
                Ok((send, recv)) => {
                    let inner = Arc::clone(this);
                    this.tasks.spawn(async move {
                        tokio::select! {
                            _ = inner.cancel.cancelled() => {}
                            _ = inner.handle_stream(send, recv, peer_ip) => {}
                        }
                    });
                }
                Err(e) => {
                    this.logger.verbose(format_args!(
                        "Peer connection {} closed: {}",
                        connection.remote_address(),
                        e
                    ));
                    break;
                }
            }
        }

        this.peer.send_if_modified(|current| {
            if current.as_ref().map(Connection::stable_id) == Some(connection.stable_id()) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    /// 相手が張ったストリームを該当ポートのリスナーへ渡す
    async fn handle_stream(&self, send: SendStream, mut recv: RecvStream, peer_ip: IpAddr) {
        let (dst_port, src_port) =
            match tokio::time::timeout(STREAM_HEADER_TIMEOUT, read_header(&mut recv)).await {
                Ok(Ok(header)) => header,
                Ok(Err(e)) => {
                    self.logger
                        .verbose(format_args!("Failed to read stream header: {}", e));
                    return;
                }
                Err(_) => {
                    self.logger
                        .verbose(format_args!("Timed out waiting for stream header"));
                    return;
                }
            };

        let local = SocketAddr::new(self.local_address, dst_port);
        let remote = SocketAddr::new(peer_ip, src_port);
        let mut stream = VirtualStream::new(send, recv, local, remote);

        let Some(incoming) = self.ports.lookup(dst_port) else {
            self.logger.verbose(format_args!(
                "No listener on virtual port {}, refusing {}",
                dst_port, remote
            ));
            let _ = stream.reply(DialStatus::Refused).await;
            let _ = stream.shutdown().await;
            return;
        };

        if let Err(e) = stream.reply(DialStatus::Accepted).await {
            self.logger
                .verbose(format_args!("Failed to accept stream from {}: {}", remote, e));
            return;
        }
        if incoming.send((stream, remote)).await.is_err() {
            self.logger.verbose(format_args!(
                "Listener on virtual port {} went away",
                dst_port
            ));
        }
    }
}

/// 接続側: 接続・認証・再接続を繰り返す
async fn run_dialer(
    inner: Arc<Inner>,
    endpoint: Endpoint,
    server_addr: SocketAddr,
    config: TunnelConfig,
) {
    let mut delay = INITIAL_RECONNECT_DELAY;

    loop {
        let attempt = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            attempt = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                connect_peer(&endpoint, server_addr, &config),
            ) => attempt,
        };

        match attempt {
            Ok(Ok(connection)) => {
                inner
                    .logger
                    .verbose(format_args!("Peer {} authenticated", server_addr));
                delay = INITIAL_RECONNECT_DELAY;
                Inner::serve_peer(&inner, connection, config.allowed_ip.addr).await;
                if inner.cancel.is_cancelled() {
                    break;
                }
                inner.logger.verbose(format_args!(
                    "Connection to {} lost, reconnecting in {:?}",
                    server_addr, delay
                ));
            }
            Ok(Err(e)) => {
                inner.logger.error(format_args!(
                    "Handshake with {} failed: {} (retrying in {:?})",
                    server_addr, e, delay
                ));
            }
            Err(_) => {
                inner.logger.error(format_args!(
                    "Handshake with {} timed out (retrying in {:?})",
                    server_addr, delay
                ));
            }
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

async fn connect_peer(
    endpoint: &Endpoint,
    server_addr: SocketAddr,
    config: &TunnelConfig,
) -> Result<Connection, TunnelError> {
    let connection = endpoint.connect(server_addr, SERVER_NAME)?.await?;
    let (send, recv) = connection.open_bi().await?;
    let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    let mut stream = VirtualStream::new(send, recv, unspecified, connection.remote_address());

    if let Err(e) = auth::initiate(&mut stream, &config.private_key, &config.public_key).await {
        connection.close(
            quinn::VarInt::from_u32(CLOSE_AUTH_FAILED),
            b"authentication failed",
        );
        return Err(e.into());
    }
    let _ = stream.shutdown().await;

    Ok(connection)
}

/// 待ち受け側: 接続を受け付けて認証する
async fn run_acceptor(inner: Arc<Inner>, endpoint: Endpoint, config: TunnelConfig) {
    loop {
        let incoming = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };

        let remote = incoming.remote_address();
        let task_inner = Arc::clone(&inner);
        let config = config.clone();
        inner.tasks.spawn(async move {
            let inner = task_inner;
            let accepted = tokio::select! {
                _ = inner.cancel.cancelled() => return,
                accepted = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_peer(incoming, &config)) => accepted,
            };

            match accepted {
                Ok(Ok(connection)) => {
                    inner
                        .logger
                        .verbose(format_args!("Peer {} authenticated", remote));
                    Inner::serve_peer(&inner, connection, config.allowed_ip.addr).await;
                }
                Ok(Err(e)) => {
                    inner
                        .logger
                        .error(format_args!("Handshake with {} failed: {}", remote, e));
                }
                Err(_) => {
                    inner
                        .logger
                        .error(format_args!("Handshake with {} timed out", remote));
                }
            }
        });
    }
}

async fn accept_peer(
    incoming: quinn::Incoming,
    config: &TunnelConfig,
) -> Result<Connection, TunnelError> {
    let connection = incoming.await?;
    let (send, recv) = connection.accept_bi().await?;
    let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    let mut stream = VirtualStream::new(send, recv, unspecified, connection.remote_address());

    if let Err(e) = auth::respond(&mut stream, &config.private_key, &config.public_key).await {
        connection.close(
            quinn::VarInt::from_u32(CLOSE_AUTH_FAILED),
            b"authentication failed",
        );
        return Err(e.into());
    }
    let _ = stream.shutdown().await;

    Ok(connection)
}

async fn resolve(target: &str) -> Result<SocketAddr, TunnelError> {
    tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| {
            TunnelError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Failed to resolve endpoint: {}", target),
            ))
        })
}

/// トランスポート設定
///
/// MTU は固定（Path MTU Discovery は無効）。
fn transport_config(mtu: u16, keep_alive: Option<Duration>) -> quinn::TransportConfig {
    let idle_timeout_ms = keep_alive
        .map(|interval| interval.as_millis().saturating_mul(3).min(u128::from(u32::MAX)) as u32)
        .unwrap_or(DEFAULT_IDLE_TIMEOUT_MS);

    let mut transport = quinn::TransportConfig::default();
    transport.initial_mtu(mtu);
    transport.mtu_discovery_config(None);
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(MAX_CONCURRENT_STREAMS));
    transport.keep_alive_interval(keep_alive);
    transport.max_idle_timeout(Some(quinn::IdleTimeout::from(quinn::VarInt::from_u32(
        idle_timeout_ms,
    ))));
    transport
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// 待ち受け側の QUIC エンドポイント
///
/// 証明書は起動ごとにメモリ上で生成する。
fn create_server_endpoint(
    bind_addr: SocketAddr,
    transport: quinn::TransportConfig,
) -> Result<Endpoint, TunnelError> {
    let certified_key =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()]).map_err(tls_error)?;
    let cert = CertificateDer::from(certified_key.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified_key.key_pair.serialize_der(),
    ));

    let mut server_crypto = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(tls_error)?;
    server_crypto.alpn_protocols = vec![ALPN_TUNPORT.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).map_err(tls_error)?,
    ));
    server_config.transport_config(Arc::new(transport));

    Ok(Endpoint::server(server_config, bind_addr)?)
}

/// 接続側の QUIC エンドポイント
///
/// 接続先の IP バージョンに合わせて `0.0.0.0:0` か `[::]:0` にバインドする。
fn create_client_endpoint(
    server_addr: &SocketAddr,
    transport: quinn::TransportConfig,
) -> Result<Endpoint, TunnelError> {
    let bind_addr = if server_addr.is_ipv6() {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    };
    let mut endpoint = Endpoint::client(bind_addr)?;

    let provider = crypto_provider();
    let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN_TUNPORT.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto).map_err(tls_error)?,
    ));
    client_config.transport_config(Arc::new(transport));
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

/// 証明書チェーンを検証しないサーバー検証
///
/// ピアの正当性は接続後の X25519 相互認証で確認する。
/// ハンドシェイク署名だけはプロバイダーで検証する。
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
