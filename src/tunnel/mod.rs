//! 仮想トンネルインターフェース
//!
//! フォワーディングエンジンは [`TunnelInterface`] トレイトだけに依存します。
//! デバイスは設定ブロック（[`TunnelConfig`]）で構成され、`up` 後に仮想アドレス上で
//! `listen` / `dial` を提供します。
//!
//! 同梱のデバイス実装は [`QuicTunnel`] です。
//!
//! ```text
//! [egress 10.0.8.2] ←QUIC (X25519 相互認証)→ [ingress 10.0.8.1]
//!        listen(10.0.8.2:P)  ←──────────────  dial(10.0.8.2:P)
//! ```

pub mod auth;
pub mod config;
pub mod quic;
pub mod stream;

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, Span};

pub use auth::AuthError;
pub use config::{
    AllowedIp, ConfigError, TunnelConfig, EGRESS_ADDRESS, INGRESS_ADDRESS, MTU,
    PERSISTENT_KEEPALIVE_SECS,
};
pub use quic::QuicTunnel;
pub use stream::{QuicListener, VirtualStream};

/// トンネルデバイスのエラー
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Tunnel device is not configured")]
    NotConfigured,

    #[error("Tunnel device is already up")]
    AlreadyUp,

    #[error("Tunnel device is not up")]
    NotUp,

    #[error("Tunnel device is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Address {0} does not belong to this interface")]
    NotLocal(SocketAddr),

    #[error("No route to {0}")]
    NoRoute(SocketAddr),

    #[error("Address already in use: {0}")]
    AddrInUse(SocketAddr),

    #[error("Connection refused: {0}")]
    ConnectionRefused(SocketAddr),

    #[error("No peer connection within {0:?}")]
    NotConnected(Duration),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Peer authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("QUIC connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("QUIC connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("TLS setup error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 仮想トンネルインターフェース
///
/// 鍵交換・暗号化・仮想ネットワークの詳細は実装側に閉じ込め、
/// ソケット風の `listen` / `dial` とライフサイクル（`up` / `close`）だけを公開する。
#[async_trait]
pub trait TunnelInterface: Send + Sync + 'static {
    /// 仮想側のコネクション
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    /// 仮想側のリスナー
    type Listener: VirtualListener<Stream = Self::Stream>;

    /// 設定ブロックを適用（`up` の前に呼ぶ）
    fn configure(&self, block: &str) -> Result<(), TunnelError>;

    /// デバイスを起動
    async fn up(&self) -> Result<(), TunnelError>;

    /// 仮想アドレスで待ち受け
    async fn listen(&self, addr: SocketAddr) -> Result<Self::Listener, TunnelError>;

    /// 仮想アドレスへ接続
    async fn dial(&self, addr: SocketAddr) -> Result<Self::Stream, TunnelError>;

    /// デバイスを停止（保留中の accept / dial はエラーで戻る）
    async fn close(&self) -> Result<(), TunnelError>;
}

/// 仮想側のリスナー
#[async_trait]
pub trait VirtualListener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// 次の接続を受け付ける（相手の仮想アドレスも返す）
    async fn accept(&self) -> Result<(Self::Stream, SocketAddr), TunnelError>;

    fn local_addr(&self) -> SocketAddr;
}

/// デバイスへ明示的に渡すロガー
///
/// デバイス内部のログはこのハンドルを経由し、生成元のスパンに紐付けて出力される。
#[derive(Clone)]
pub struct DeviceLogger {
    span: Span,
}

impl DeviceLogger {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    /// 詳細ログ（debug レベル）
    pub fn verbose(&self, args: fmt::Arguments<'_>) {
        let _entered = self.span.enter();
        debug!("{}", args);
    }

    /// エラーログ（error レベル）
    pub fn error(&self, args: fmt::Arguments<'_>) {
        let _entered = self.span.enter();
        error!("{}", args);
    }
}

impl fmt::Debug for DeviceLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLogger")
            .field("span", &self.span.metadata().map(|m| m.name()))
            .finish()
    }
}
