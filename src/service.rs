//! egress / ingress サービス共通の基盤
//!
//! どちらのサービスも次の 2 種類のトークンと 1 つの TaskTracker で全タスクを管理する。
//!
//! - accept トークン: accept ループを止める（graceful shutdown の開始）
//! - セッショントークン: リレー中のセッションを強制終了する（close）

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::statistics::ForwardStatistics;
use crate::tunnel::{ConfigError, TunnelError};

/// サービスのエラー
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid tunnel configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to configure tunnel device: {0}")]
    Configure(#[source] TunnelError),

    #[error("Failed to bring tunnel device up: {0}")]
    Up(#[source] TunnelError),

    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Service is already listening")]
    AlreadyListening,

    #[error("Service is not listening")]
    NotListening,

    #[error("Failed to close tunnel device: {0}")]
    Close(#[source] TunnelError),
}

/// タスク管理とキャンセル
#[derive(Clone)]
pub(crate) struct ServiceRuntime {
    pub tracker: TaskTracker,
    pub accept_cancel: CancellationToken,
    pub session_cancel: CancellationToken,
    pub statistics: Arc<ForwardStatistics>,
}

impl ServiceRuntime {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            accept_cancel: CancellationToken::new(),
            session_cancel: CancellationToken::new(),
            statistics: Arc::new(ForwardStatistics::new()),
        }
    }

    /// 全タスク（accept ループとセッション）の終了を待つ
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// accept を止め、処理中のセッションが自然に終わるのを待つ
    pub async fn drain(&self) {
        info!(
            "Stopping listeners, waiting for {} task(s) to finish",
            self.tracker.len()
        );
        self.accept_cancel.cancel();
        self.wait().await;
    }

    /// accept もセッションも即座に止める（終了は待たない）
    pub fn force_close(&self) {
        self.accept_cancel.cancel();
        self.session_cancel.cancel();
        self.tracker.close();
    }

    /// 統計情報をログに出す
    pub fn log_statistics(&self, service: &str) {
        info!("{} statistics: {}", service, self.statistics.snapshot());
    }
}

/// Mutex のロック（poison されていても中身を使う）
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
