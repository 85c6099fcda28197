//! egress サービス
//!
//! ピアへ接続する側。ローカルの実サービスをトンネル越しに公開します。
//!
//! ```text
//! [ingress] ──dial 10.0.8.2:P──► [egress 仮想リスナー P] ──TCP──► [upstream host:port]
//! ```

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::forward::ForwardTable;
use crate::lifecycle::ForwardService;
use crate::proxy::proxy;
use crate::service::{lock, ServiceError, ServiceRuntime};
use crate::statistics::ForwardStatistics;
use crate::tunnel::{
    DeviceLogger, QuicTunnel, TunnelConfig, TunnelInterface, VirtualListener, EGRESS_ADDRESS, MTU,
};

/// egress サービス
///
/// フォワードテーブル: 仮想ポート -> 実アドレス (`host:port`)
pub struct EgressService<T: TunnelInterface = QuicTunnel> {
    tunnel: Arc<T>,
    forwards: Mutex<ForwardTable<u16, String>>,
    listeners: Mutex<Vec<(T::Listener, String)>>,
    runtime: ServiceRuntime,
}

impl EgressService<QuicTunnel> {
    /// QUIC トンネルデバイスを使う egress サービスを作成
    ///
    /// デバイスは設定済み・未起動の状態になる。
    pub fn new(
        private_key_hex: &str,
        server_endpoint: &str,
        server_public_key_hex: &str,
    ) -> Result<Self, ServiceError> {
        let tunnel = QuicTunnel::new(
            IpAddr::V4(EGRESS_ADDRESS),
            MTU,
            DeviceLogger::new(info_span!("tunnel", side = "egress")),
        );
        Self::with_tunnel(tunnel, private_key_hex, server_endpoint, server_public_key_hex)
    }
}

impl<T: TunnelInterface> EgressService<T> {
    /// 任意のトンネルデバイスで egress サービスを作成
    pub fn with_tunnel(
        tunnel: T,
        private_key_hex: &str,
        server_endpoint: &str,
        server_public_key_hex: &str,
    ) -> Result<Self, ServiceError> {
        let config = TunnelConfig::egress(private_key_hex, server_endpoint, server_public_key_hex)?;
        tunnel
            .configure(&config.render())
            .map_err(ServiceError::Configure)?;

        Ok(Self {
            tunnel: Arc::new(tunnel),
            forwards: Mutex::new(ForwardTable::new()),
            listeners: Mutex::new(Vec::new()),
            runtime: ServiceRuntime::new(),
        })
    }

    /// フォワードを登録（仮想ポート -> 実アドレス）
    ///
    /// `listen()` 後は無視され false を返す。
    pub fn add_forward(&self, virtual_port: u16, upstream: impl Into<String>) -> bool {
        lock(&self.forwards).add_forward(virtual_port, upstream.into())
    }

    pub fn tunnel(&self) -> &T {
        &self.tunnel
    }

    pub fn statistics(&self) -> Arc<ForwardStatistics> {
        Arc::clone(&self.runtime.statistics)
    }

    /// デバイスを起動し、全ルールの仮想リスナーをバインドする
    ///
    /// 1 つでも失敗したらデバイスを閉じてエラーを返す。テーブルは凍結されない。
    pub async fn listen(&self) -> Result<(), ServiceError> {
        let rules: Vec<(u16, String)> = {
            let forwards = lock(&self.forwards);
            if forwards.is_frozen() {
                return Err(ServiceError::AlreadyListening);
            }
            forwards
                .iter()
                .map(|(port, upstream)| (*port, upstream.clone()))
                .collect()
        };

        self.tunnel.up().await.map_err(ServiceError::Up)?;

        let bound = match self.bind_all(rules).await {
            Ok(bound) => bound,
            Err(e) => {
                if let Err(close_err) = self.tunnel.close().await {
                    warn!("Failed to close tunnel after listen failure: {}", close_err);
                }
                return Err(e);
            }
        };

        lock(&self.forwards).freeze();
        *lock(&self.listeners) = bound;
        Ok(())
    }

    async fn bind_all(
        &self,
        rules: Vec<(u16, String)>,
    ) -> Result<Vec<(T::Listener, String)>, ServiceError> {
        let mut bound = Vec::with_capacity(rules.len());
        for (port, upstream) in rules {
            let addr = SocketAddr::new(IpAddr::V4(EGRESS_ADDRESS), port);
            let listener = self
                .tunnel
                .listen(addr)
                .await
                .map_err(|e| ServiceError::Listen {
                    addr: addr.to_string(),
                    source: Box::new(e),
                })?;
            info!("Forwarding virtual {} -> {}", addr, upstream);
            bound.push((listener, upstream));
        }
        Ok(bound)
    }

    /// 全リスナーの accept ループを実行する
    ///
    /// すべての accept ループとセッションが終わるまで戻らない。
    pub async fn serve(&self) -> Result<(), ServiceError> {
        if !lock(&self.forwards).is_frozen() {
            return Err(ServiceError::NotListening);
        }

        let listeners = std::mem::take(&mut *lock(&self.listeners));
        for (listener, upstream) in listeners {
            let span = info_span!("egress", listen = %listener.local_addr());
            self.runtime
                .tracker
                .spawn(accept_loop(listener, upstream, self.runtime.clone()).instrument(span));
        }

        self.runtime.wait().await;
        info!("Egress service stopped");
        self.runtime.log_statistics("Egress");
        Ok(())
    }

    /// accept を止め、処理中のセッションの終了を待つ
    pub async fn shutdown(&self) {
        self.runtime.drain().await;
    }

    /// accept ループとセッションを強制終了し、デバイスを閉じる
    pub async fn close(&self) -> Result<(), ServiceError> {
        self.runtime.force_close();
        lock(&self.listeners).clear();
        self.tunnel.close().await.map_err(ServiceError::Close)
    }

    pub async fn listen_and_serve(&self) -> Result<(), ServiceError> {
        self.listen().await?;
        self.serve().await
    }
}

#[async_trait]
impl<T: TunnelInterface> ForwardService for EgressService<T> {
    async fn listen(&self) -> Result<(), ServiceError> {
        EgressService::listen(self).await
    }

    async fn serve(&self) -> Result<(), ServiceError> {
        EgressService::serve(self).await
    }

    async fn shutdown(&self) {
        EgressService::shutdown(self).await
    }

    async fn close(&self) -> Result<(), ServiceError> {
        EgressService::close(self).await
    }
}

async fn accept_loop<L: VirtualListener>(listener: L, upstream: String, runtime: ServiceRuntime) {
    let local = listener.local_addr();

    loop {
        let accepted = tokio::select! {
            _ = runtime.accept_cancel.cancelled() => {
                debug!("Stopped accepting on virtual {}", local);
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted virtual connection from {}", peer);
                let span = info_span!("session", peer = %peer, upstream = %upstream);
                runtime.tracker.spawn(
                    forward_to_upstream(stream, upstream.clone(), runtime.clone()).instrument(span),
                );
            }
            Err(e) => {
                error!("Failed to accept on virtual {}: {}", local, e);
                break;
            }
        }
    }
}

/// 仮想接続を実ネットワークの upstream へ中継する
async fn forward_to_upstream<S>(stream: S, upstream: String, runtime: ServiceRuntime)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let connected = tokio::select! {
        _ = runtime.session_cancel.cancelled() => return,
        connected = TcpStream::connect(&upstream) => connected,
    };

    let real = match connected {
        Ok(real) => real,
        Err(e) => {
            runtime.statistics.dial_failed();
            warn!("Failed to connect to upstream {}: {}", upstream, e);
            return;
        }
    };

    debug!("Connected to upstream {}", upstream);
    proxy(
        real,
        stream,
        runtime.session_cancel.clone(),
        Arc::clone(&runtime.statistics),
    )
    .await;
}
