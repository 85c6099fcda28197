//! 双方向リレー
//!
//! 実ネットワーク側の接続とトンネル側の接続の間でバイト列を中継します。
//!
//! - どちらかの方向が終わったら（EOF・読み書きエラー）セッションのトークンをキャンセルし、
//!   もう片方の方向も即座に止める。EOF の場合は相手側へ FIN を送ってから止める
//! - 両方向のタスクを join し、両方の接続を閉じてから戻る

use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::statistics::ForwardStatistics;

/// リレー用バッファサイズ
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// 転送方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 実ネットワーク側 -> トンネル側
    ToTunnel,
    /// トンネル側 -> 実ネットワーク側
    ToReal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToTunnel => write!(f, "real->tunnel"),
            Direction::ToReal => write!(f, "tunnel->real"),
        }
    }
}

/// 片方向のエラー
#[derive(Debug)]
pub struct DirectionError {
    pub direction: Direction,
    pub source: io::Error,
}

/// リレーエラー（両方向分を集約）
#[derive(Debug, Error)]
#[error("relay failed: {}", format_errors(.errors))]
pub struct RelayError {
    errors: Vec<DirectionError>,
}

impl RelayError {
    pub fn errors(&self) -> &[DirectionError] {
        &self.errors
    }
}

fn format_errors(errors: &[DirectionError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.direction, e.source))
        .collect::<Vec<_>>()
        .join("; ")
}

/// リレー結果
#[derive(Debug, Default)]
pub struct RelayReport {
    pub bytes_to_tunnel: u64,
    pub bytes_to_real: u64,
    pub error: Option<RelayError>,
}

/// 2 つの接続の間でリレーする
///
/// `cancel` はサービス側の強制終了用トークン。キャンセルされると両方向とも即座に止まる。
/// エラーは warn で 1 回だけログに出し、呼び出し元へは `RelayReport` として返す。
pub async fn proxy<R, T>(
    real: R,
    tunnel: T,
    cancel: CancellationToken,
    statistics: Arc<ForwardStatistics>,
) -> RelayReport
where
    R: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (real_read, real_write) = tokio::io::split(real);
    let (tunnel_read, tunnel_write) = tokio::io::split(tunnel);

    // 片方向の終了でセッション全体を止めるためのトークン
    let session = cancel.child_token();
    statistics.session_opened();

    let to_tunnel = tokio::spawn(relay_half(
        real_read,
        tunnel_write,
        Direction::ToTunnel,
        session.clone(),
        Arc::clone(&statistics),
    ));
    let to_real = tokio::spawn(relay_half(
        tunnel_read,
        real_write,
        Direction::ToReal,
        session.clone(),
        Arc::clone(&statistics),
    ));

    let (to_tunnel, to_real) = tokio::join!(to_tunnel, to_real);
    statistics.session_closed();

    let mut report = RelayReport::default();
    let mut errors = Vec::new();
    for (direction, joined) in [(Direction::ToTunnel, to_tunnel), (Direction::ToReal, to_real)] {
        match joined {
            Ok((bytes, result)) => {
                match direction {
                    Direction::ToTunnel => report.bytes_to_tunnel = bytes,
                    Direction::ToReal => report.bytes_to_real = bytes,
                }
                if let Err(source) = result {
                    errors.push(DirectionError { direction, source });
                }
            }
            Err(e) => errors.push(DirectionError {
                direction,
                source: io::Error::new(io::ErrorKind::Other, e.to_string()),
            }),
        }
    }

    if errors.is_empty() {
        debug!(
            "Relay completed ({} bytes to tunnel, {} bytes to real)",
            report.bytes_to_tunnel, report.bytes_to_real
        );
    } else {
        let error = RelayError { errors };
        warn!("{}", error);
        report.error = Some(error);
    }

    report
}

/// 片方向のコピー
///
/// 戻り値: (転送バイト数, 結果)
async fn relay_half<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    session: CancellationToken,
    statistics: Arc<ForwardStatistics>,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    let result: io::Result<()> = async {
        loop {
            let n = tokio::select! {
                _ = session.cancelled() => {
                    debug!("[{}] cancelled", direction);
                    return Ok(());
                }
                result = reader.read(&mut buf) => result?,
            };

            if n == 0 {
                debug!("[{}] EOF, sending FIN", direction);
                writer.shutdown().await?;
                return Ok(());
            }

            tokio::select! {
                _ = session.cancelled() => {
                    debug!("[{}] cancelled", direction);
                    return Ok(());
                }
                result = writer.write_all(&buf[..n]) => result?,
            }

            total += n as u64;
            match direction {
                Direction::ToTunnel => statistics.add_bytes_to_virtual(n as u64),
                Direction::ToReal => statistics.add_bytes_to_real(n as u64),
            }
        }
    }
    .await;

    session.cancel();
    (total, result)
}
