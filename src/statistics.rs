//! フォワーディング統計情報
//!
//! サービスごとのセッション数や転送量を追跡します。
//! `serve()` の終了時にスナップショットがログへ出力されます。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// フォワーディング統計情報
///
/// すべてのフィールドは Atomic 型で、複数タスクから安全に更新できます。
pub struct ForwardStatistics {
    start_time: Instant,
    /// 累計セッション数
    total_sessions: AtomicU64,
    /// 現在リレー中のセッション数
    active_sessions: AtomicU64,
    /// ダイヤル失敗回数
    dial_failures: AtomicU64,
    /// 実ネットワーク側 -> 仮想側 の転送バイト数
    bytes_to_virtual: AtomicU64,
    /// 仮想側 -> 実ネットワーク側 の転送バイト数
    bytes_to_real: AtomicU64,
}

impl ForwardStatistics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_sessions: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            bytes_to_virtual: AtomicU64::new(0),
            bytes_to_real: AtomicU64::new(0),
        }
    }

    /// リレー開始時に呼び出す
    pub fn session_opened(&self) {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// リレー終了時に呼び出す
    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn dial_failed(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_to_virtual(&self, bytes: u64) {
        self.bytes_to_virtual.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_to_real(&self, bytes: u64) {
        self.bytes_to_real.fetch_add(bytes, Ordering::Relaxed);
    }

    /// 現在値を取得
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            uptime: self.start_time.elapsed(),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            bytes_to_virtual: self.bytes_to_virtual.load(Ordering::Relaxed),
            bytes_to_real: self.bytes_to_real.load(Ordering::Relaxed),
        }
    }
}

impl Default for ForwardStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// 統計情報のスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub uptime: Duration,
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub dial_failures: u64,
    pub bytes_to_virtual: u64,
    pub bytes_to_real: u64,
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uptime={}s sessions={} active={} dial_failures={} bytes_to_virtual={} bytes_to_real={}",
            self.uptime.as_secs(),
            self.total_sessions,
            self.active_sessions,
            self.dial_failures,
            self.bytes_to_virtual,
            self.bytes_to_real
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_counters() {
        let stats = ForwardStatistics::new();
        stats.session_opened();
        stats.session_opened();
        stats.session_closed();
        stats.dial_failed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_sessions, 2);
        assert_eq!(snapshot.active_sessions, 1);
        assert_eq!(snapshot.dial_failures, 1);
    }

    #[test]
    fn test_byte_counters() {
        let stats = ForwardStatistics::default();
        stats.add_bytes_to_virtual(100);
        stats.add_bytes_to_virtual(20);
        stats.add_bytes_to_real(7);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_to_virtual, 120);
        assert_eq!(snapshot.bytes_to_real, 7);
        assert!(snapshot
            .to_string()
            .contains("bytes_to_virtual=120 bytes_to_real=7"));
    }
}
