//! サービスのライフサイクル管理
//!
//! ```text
//! Idle ──listen()──► Serving ──1 回目のシグナル──► Draining ──► Terminated (Drained)
//!                       │                             │
//!                       │                             └─2 回目のシグナル─► Terminated (Forced)
//!                       └─serve() が自然に終了──► Terminated (Completed)
//! ```
//!
//! 1 回目の終了シグナルで新規接続の受付を止め、処理中のセッションが終わるのを待つ。
//! 待っている間に 2 回目のシグナルが来たらすべてを強制終了する。

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::service::ServiceError;

/// 強制終了時に close() を待つ上限
pub const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_millis(200);

/// ライフサイクル管理の対象となるフォワーディングサービス
#[async_trait]
pub trait ForwardService: Send + Sync + 'static {
    /// デバイスを起動し、全ルールのリスナーをバインドする
    async fn listen(&self) -> Result<(), ServiceError>;

    /// accept ループを実行し、全タスクの終了まで待つ
    async fn serve(&self) -> Result<(), ServiceError>;

    /// 受付を止め、処理中のセッションの終了を待つ
    async fn shutdown(&self);

    /// すべてを強制終了する
    async fn close(&self) -> Result<(), ServiceError>;
}

/// ライフサイクルのフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Serving,
    Draining,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "IDLE"),
            Phase::Serving => write!(f, "SERVING"),
            Phase::Draining => write!(f, "DRAINING"),
            Phase::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// 終了の仕方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// シグナルなしで serve() が終わった
    Completed,
    /// 1 回目のシグナルで graceful に終わった
    Drained,
    /// 2 回目のシグナルで強制終了した
    Forced,
}

/// フェーズ遷移を管理するコントローラ
pub struct Lifecycle {
    phase: watch::Sender<Phase>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self { phase }
    }

    /// フェーズの変化を購読する
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn transition(&self, next: Phase) {
        let prev = self.phase.send_replace(next);
        if prev != next {
            info!("Lifecycle: {} -> {}", prev, next);
        }
    }

    /// サービスを起動し、終了シグナルに従って止める
    ///
    /// `signals` には受信したシグナル名（"SIGINT" など）が流れてくる。
    /// `listen()` が失敗した場合はフェーズを Idle のままエラーを返す。
    pub async fn run<S: ForwardService>(
        &self,
        service: Arc<S>,
        mut signals: mpsc::Receiver<&'static str>,
    ) -> Result<Outcome, ServiceError> {
        service.listen().await?;
        self.transition(Phase::Serving);

        let serve = service.serve();
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => {
                self.transition(Phase::Terminated);
                return result.map(|_| Outcome::Completed);
            }
            Some(signal) = signals.recv() => {
                info!("Received {}, draining (send again to force shutdown)", signal);
            }
        }

        self.transition(Phase::Draining);

        let drain = async {
            let ((), result) = tokio::join!(service.shutdown(), &mut serve);
            result
        };
        tokio::pin!(drain);

        let outcome = tokio::select! {
            result = &mut drain => {
                result?;
                Outcome::Drained
            }
            Some(signal) = signals.recv() => {
                warn!("Received {} while draining, forcing shutdown", signal);
                match tokio::time::timeout(FORCE_CLOSE_TIMEOUT, service.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Failed to close service: {}", e),
                    Err(_) => warn!(
                        "Close did not finish within {:?}, exiting anyway",
                        FORCE_CLOSE_TIMEOUT
                    ),
                }
                Outcome::Forced
            }
        };

        self.transition(Phase::Terminated);
        Ok(outcome)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// 呼び出しを記録するだけのサービス
    #[derive(Default)]
    struct ScriptedService {
        fail_listen: bool,
        /// true なら shutdown() してもセッションが終わらない
        stuck_sessions: bool,
        /// true なら close() が戻らない
        hang_close: bool,
        stop: CancellationToken,
        closed: AtomicBool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedService {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ForwardService for ScriptedService {
        async fn listen(&self) -> Result<(), ServiceError> {
            self.record("listen");
            if self.fail_listen {
                return Err(ServiceError::Listen {
                    addr: "127.0.0.1:1".to_string(),
                    source: "address in use".into(),
                });
            }
            Ok(())
        }

        async fn serve(&self) -> Result<(), ServiceError> {
            self.record("serve");
            self.stop.cancelled().await;
            Ok(())
        }

        async fn shutdown(&self) {
            self.record("shutdown");
            if !self.stuck_sessions {
                self.stop.cancel();
            }
        }

        async fn close(&self) -> Result<(), ServiceError> {
            self.record("close");
            self.closed.store(true, Ordering::SeqCst);
            if self.hang_close {
                std::future::pending::<()>().await;
            }
            self.stop.cancel();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_listen_failure_stays_idle() {
        let lifecycle = Lifecycle::new();
        let service = Arc::new(ScriptedService {
            fail_listen: true,
            ..Default::default()
        });
        let (_tx, rx) = mpsc::channel(4);

        let result = lifecycle.run(Arc::clone(&service), rx).await;
        assert!(matches!(result, Err(ServiceError::Listen { .. })));
        assert_eq!(lifecycle.phase(), Phase::Idle);
        assert_eq!(service.calls(), vec!["listen"]);
    }

    #[tokio::test]
    async fn test_serve_completes_without_signal() {
        let lifecycle = Lifecycle::new();
        let service = Arc::new(ScriptedService::default());
        service.stop.cancel();
        let (_tx, rx) = mpsc::channel(4);

        let outcome = lifecycle.run(Arc::clone(&service), rx).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(lifecycle.phase(), Phase::Terminated);
        assert_eq!(service.calls(), vec!["listen", "serve"]);
    }

    #[tokio::test]
    async fn test_first_signal_drains() {
        let lifecycle = Lifecycle::new();
        let mut phases = lifecycle.subscribe();
        let service = Arc::new(ScriptedService::default());
        let (tx, rx) = mpsc::channel(4);

        let watcher = tokio::spawn(async move {
            phases.wait_for(|p| *p == Phase::Serving).await.unwrap();
            tx.send("SIGTERM").await.unwrap();
            tx
        });

        let outcome = lifecycle.run(Arc::clone(&service), rx).await.unwrap();
        assert_eq!(outcome, Outcome::Drained);
        assert_eq!(lifecycle.phase(), Phase::Terminated);
        assert!(!service.closed.load(Ordering::SeqCst));
        assert!(service.calls().contains(&"shutdown"));

        drop(watcher.await.unwrap());
    }

    #[tokio::test]
    async fn test_second_signal_forces() {
        let lifecycle = Lifecycle::new();
        let mut phases = lifecycle.subscribe();
        let service = Arc::new(ScriptedService {
            stuck_sessions: true,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(4);

        let watcher = tokio::spawn(async move {
            phases.wait_for(|p| *p == Phase::Serving).await.unwrap();
            tx.send("SIGINT").await.unwrap();
            phases.wait_for(|p| *p == Phase::Draining).await.unwrap();
            tx.send("SIGINT").await.unwrap();
            tx
        });

        let outcome = lifecycle.run(Arc::clone(&service), rx).await.unwrap();
        assert_eq!(outcome, Outcome::Forced);
        assert_eq!(lifecycle.phase(), Phase::Terminated);
        assert!(service.closed.load(Ordering::SeqCst));

        drop(watcher.await.unwrap());
    }

    #[tokio::test]
    async fn test_forced_exit_does_not_wait_for_close() {
        let lifecycle = Lifecycle::new();
        let mut phases = lifecycle.subscribe();
        let service = Arc::new(ScriptedService {
            stuck_sessions: true,
            hang_close: true,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(4);

        let watcher = tokio::spawn(async move {
            phases.wait_for(|p| *p == Phase::Serving).await.unwrap();
            tx.send("SIGTERM").await.unwrap();
            phases.wait_for(|p| *p == Phase::Draining).await.unwrap();
            tx.send("SIGTERM").await.unwrap();
            tx
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            lifecycle.run(Arc::clone(&service), rx),
        )
        .await
        .expect("Forced shutdown must not wait for close()")
        .unwrap();
        assert_eq!(outcome, Outcome::Forced);
        assert_eq!(lifecycle.phase(), Phase::Terminated);
        assert!(service.closed.load(Ordering::SeqCst));

        drop(watcher.await.unwrap());
    }
}
