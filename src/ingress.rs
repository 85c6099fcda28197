//! ingress サービス
//!
//! ピアからの接続を待ち受ける側。トンネルの向こうで公開されたサービスを
//! ローカルの実ポートで利用できるようにします。
//!
//! ```text
//! [client] ──TCP──► [ingress 実リスナー host:port] ──dial 10.0.8.2:P──► [egress]
//! ```

use async_trait::async_trait;
use socket2::SockRef;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::forward::ForwardTable;
use crate::lifecycle::ForwardService;
use crate::proxy::proxy;
use crate::service::{lock, ServiceError, ServiceRuntime};
use crate::statistics::ForwardStatistics;
use crate::tunnel::{
    DeviceLogger, QuicTunnel, TunnelConfig, TunnelInterface, EGRESS_ADDRESS, INGRESS_ADDRESS, MTU,
};

/// ingress サービス
///
/// フォワードテーブル: 実アドレス (`host:port`) -> 仮想ポート
pub struct IngressService<T: TunnelInterface = QuicTunnel> {
    tunnel: Arc<T>,
    forwards: Mutex<ForwardTable<String, u16>>,
    listeners: Mutex<Vec<(TcpListener, u16)>>,
    listen_addrs: Mutex<Vec<SocketAddr>>,
    runtime: ServiceRuntime,
}

impl IngressService<QuicTunnel> {
    /// QUIC トンネルデバイスを使う ingress サービスを作成
    ///
    /// デバイスは設定済み・未起動の状態になる。
    pub fn new(
        private_key_hex: &str,
        peer_public_key_hex: &str,
        listen_port: u16,
    ) -> Result<Self, ServiceError> {
        let tunnel = QuicTunnel::new(
            IpAddr::V4(INGRESS_ADDRESS),
            MTU,
            DeviceLogger::new(info_span!("tunnel", side = "ingress")),
        );
        Self::with_tunnel(tunnel, private_key_hex, peer_public_key_hex, listen_port)
    }
}

impl<T: TunnelInterface> IngressService<T> {
    /// 任意のトンネルデバイスで ingress サービスを作成
    pub fn with_tunnel(
        tunnel: T,
        private_key_hex: &str,
        peer_public_key_hex: &str,
        listen_port: u16,
    ) -> Result<Self, ServiceError> {
        let config = TunnelConfig::ingress(private_key_hex, peer_public_key_hex, listen_port)?;
        tunnel
            .configure(&config.render())
            .map_err(ServiceError::Configure)?;

        Ok(Self {
            tunnel: Arc::new(tunnel),
            forwards: Mutex::new(ForwardTable::new()),
            listeners: Mutex::new(Vec::new()),
            listen_addrs: Mutex::new(Vec::new()),
            runtime: ServiceRuntime::new(),
        })
    }

    /// フォワードを登録（実アドレス -> 仮想ポート）
    ///
    /// `listen()` 後は無視され false を返す。
    pub fn add_forward(&self, listen_addr: impl Into<String>, virtual_port: u16) -> bool {
        lock(&self.forwards).add_forward(listen_addr.into(), virtual_port)
    }

    pub fn tunnel(&self) -> &T {
        &self.tunnel
    }

    pub fn statistics(&self) -> Arc<ForwardStatistics> {
        Arc::clone(&self.runtime.statistics)
    }

    /// バインド済みの実リスナーのアドレス
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.listen_addrs).clone()
    }

    /// デバイスを起動し、全ルールの実リスナーをバインドする
    ///
    /// 1 つでも失敗したらデバイスを閉じてエラーを返す。テーブルは凍結されない。
    pub async fn listen(&self) -> Result<(), ServiceError> {
        let rules: Vec<(String, u16)> = {
            let forwards = lock(&self.forwards);
            if forwards.is_frozen() {
                return Err(ServiceError::AlreadyListening);
            }
            forwards
                .iter()
                .map(|(addr, port)| (addr.clone(), *port))
                .collect()
        };

        self.tunnel.up().await.map_err(ServiceError::Up)?;

        let (bound, addrs) = match bind_all(rules).await {
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
        *lock(&self.listen_addrs) = addrs;
        Ok(())
    }

    /// 全リスナーの accept ループを実行する
    ///
    /// すべての accept ループとセッションが終わるまで戻らない。
    pub async fn serve(&self) -> Result<(), ServiceError> {
        if !lock(&self.forwards).is_frozen() {
            return Err(ServiceError::NotListening);
        }

        let listeners = std::mem::take(&mut *lock(&self.listeners));
        for (listener, port) in listeners {
            let span = match listener.local_addr() {
                Ok(local) => info_span!("ingress", listen = %local),
                Err(_) => info_span!("ingress", virtual_port = port),
            };
            let target = SocketAddr::new(IpAddr::V4(EGRESS_ADDRESS), port);
            self.runtime.tracker.spawn(
                accept_loop(
                    listener,
                    target,
                    Arc::clone(&self.tunnel),
                    self.runtime.clone(),
                )
                .instrument(span),
            );
        }

        self.runtime.wait().await;
        info!("Ingress service stopped");
        self.runtime.log_statistics("Ingress");
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
impl<T: TunnelInterface> ForwardService for IngressService<T> {
    async fn listen(&self) -> Result<(), ServiceError> {
        IngressService::listen(self).await
    }

    async fn serve(&self) -> Result<(), ServiceError> {
        IngressService::serve(self).await
    }

    async fn shutdown(&self) {
        IngressService::shutdown(self).await
    }

    async fn close(&self) -> Result<(), ServiceError> {
        IngressService::close(self).await
    }
}

/// 全ルールの実リスナーをバインドする
async fn bind_all(
    rules: Vec<(String, u16)>,
) -> Result<(Vec<(TcpListener, u16)>, Vec<SocketAddr>), ServiceError> {
    let mut bound = Vec::with_capacity(rules.len());
    let mut addrs = Vec::with_capacity(rules.len());
    for (addr, port) in rules {
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServiceError::Listen {
                addr: addr.clone(),
                source: Box::new(e),
            })?;
        let local = listener.local_addr().map_err(|e| ServiceError::Listen {
            addr: addr.clone(),
            source: Box::new(e),
        })?;
        info!(
            "Forwarding {} -> virtual {}",
            local,
            SocketAddr::new(IpAddr::V4(EGRESS_ADDRESS), port)
        );
        addrs.push(local);
        bound.push((listener, port));
    }
    Ok((bound, addrs))
}

async fn accept_loop<T: TunnelInterface>(
    listener: TcpListener,
    target: SocketAddr,
    tunnel: Arc<T>,
    runtime: ServiceRuntime,
) {
    loop {
        let accepted = tokio::select! {
            _ = runtime.accept_cancel.cancelled() => {
                debug!("Stopped accepting for virtual {}", target);
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                // SO_LINGER 0: close 時は未送信データを破棄して RST を送る
                if let Err(e) = SockRef::from(&stream).set_linger(Some(Duration::ZERO)) {
                    warn!("Failed to set SO_LINGER for {}: {}", peer, e);
                }

                let span = info_span!("session", peer = %peer, target = %target);
                runtime.tracker.spawn(
                    forward_to_tunnel(stream, target, Arc::clone(&tunnel), runtime.clone())
                        .instrument(span),
                );
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                break;
            }
        }
    }
}

/// 実接続をトンネル越しに egress の仮想ポートへ中継する
async fn forward_to_tunnel<T: TunnelInterface>(
    stream: TcpStream,
    target: SocketAddr,
    tunnel: Arc<T>,
    runtime: ServiceRuntime,
) {
    let dialed = tokio::select! {
        _ = runtime.session_cancel.cancelled() => return,
        dialed = tunnel.dial(target) => dialed,
    };

    let virtual_stream = match dialed {
        Ok(virtual_stream) => virtual_stream,
        Err(e) => {
            runtime.statistics.dial_failed();
            warn!("Failed to dial virtual {}: {}", target, e);
            return;
        }
    };

    debug!("Dialed virtual {}", target);
    proxy(
        stream,
        virtual_stream,
        runtime.session_cancel.clone(),
        Arc::clone(&runtime.statistics),
    )
    .await;
}
