//! 仮想ストリームと仮想リスナー
//!
//! 仮想 TCP 接続 1 本は QUIC の双方向ストリーム 1 本に対応する。
//! ストリームの先頭で接続先ポートを伝え、相手はリスナーの有無で受理 / 拒否を返す。
//!
//! ```text
//! dialer → listener: dst_port (u16 BE) | src_port (u16 BE)
//! listener → dialer: status (u8)
//! ```

use async_trait::async_trait;
use quinn::{RecvStream, SendStream};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use super::{TunnelError, VirtualListener};
use crate::service::lock;

/// ストリームヘッダーのサイズ
pub const STREAM_HEADER_LEN: usize = 4;

/// リスナーごとの受付キュー長
const ACCEPT_BACKLOG: usize = 128;

/// ダイヤル結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DialStatus {
    Accepted = 0x00,
    Refused = 0x01,
}

impl TryFrom<u8> for DialStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(DialStatus::Accepted),
            0x01 => Ok(DialStatus::Refused),
            other => Err(other),
        }
    }
}

/// ストリームヘッダーをエンコード
pub fn encode_header(dst_port: u16, src_port: u16) -> [u8; STREAM_HEADER_LEN] {
    let mut header = [0u8; STREAM_HEADER_LEN];
    header[..2].copy_from_slice(&dst_port.to_be_bytes());
    header[2..].copy_from_slice(&src_port.to_be_bytes());
    header
}

/// ストリームヘッダーを読み取る（dst_port, src_port）
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(u16, u16)> {
    let mut header = [0u8; STREAM_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    Ok((
        u16::from_be_bytes([header[0], header[1]]),
        u16::from_be_bytes([header[2], header[3]]),
    ))
}

/// 仮想 TCP 接続
///
/// QUIC の送信 / 受信ストリームをまとめて `AsyncRead + AsyncWrite` として扱う。
/// `shutdown` は送信側の FIN（QUIC の finish）になる。
#[derive(Debug)]
pub struct VirtualStream {
    send: SendStream,
    recv: RecvStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl VirtualStream {
    pub fn new(
        send: SendStream,
        recv: RecvStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            send,
            recv,
            local_addr,
            peer_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// ダイヤル結果を返す（受理側）
    pub(crate) async fn reply(&mut self, status: DialStatus) -> io::Result<()> {
        self.send.write_all(&[status as u8]).await?;
        Ok(())
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

/// 受付キューへの送信側
type AcceptSender = mpsc::Sender<(VirtualStream, SocketAddr)>;

/// 仮想ポート -> リスナーの対応表
#[derive(Debug, Default)]
pub struct PortTable {
    entries: Mutex<HashMap<u16, (u64, AcceptSender)>>,
    next_id: AtomicU64,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// ポートを登録（使用中なら None）
    fn register(&self, port: u16) -> Option<(u64, mpsc::Receiver<(VirtualStream, SocketAddr)>)> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&port) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        entries.insert(port, (id, tx));
        Some((id, rx))
    }

    fn unregister(&self, port: u16, id: u64) {
        let mut entries = lock(&self.entries);
        if entries.get(&port).map(|(owner, _)| *owner) == Some(id) {
            entries.remove(&port);
        }
    }

    /// ポートの受付キューを取得
    pub fn lookup(&self, port: u16) -> Option<AcceptSender> {
        lock(&self.entries).get(&port).map(|(_, tx)| tx.clone())
    }

    /// 全リスナーを閉じる（待機中の accept は ListenerClosed で戻る）
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 仮想リスナー
///
/// Drop 時にポート登録を解除する。
#[derive(Debug)]
pub struct QuicListener {
    local_addr: SocketAddr,
    id: u64,
    ports: Arc<PortTable>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<(VirtualStream, SocketAddr)>>,
}

impl QuicListener {
    pub(crate) fn bind(ports: Arc<PortTable>, local_addr: SocketAddr) -> Result<Self, TunnelError> {
        let (id, incoming) = ports
            .register(local_addr.port())
            .ok_or(TunnelError::AddrInUse(local_addr))?;
        Ok(Self {
            local_addr,
            id,
            ports,
            incoming: tokio::sync::Mutex::new(incoming),
        })
    }
}

#[async_trait]
impl VirtualListener for QuicListener {
    type Stream = VirtualStream;

    async fn accept(&self) -> Result<(VirtualStream, SocketAddr), TunnelError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(TunnelError::ListenerClosed)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.ports.unregister(self.local_addr.port(), self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_roundtrip() {
        let header = encode_header(8080, 49152);
        let mut reader = &header[..];
        assert_eq!(read_header(&mut reader).await.unwrap(), (8080, 49152));
    }

    #[tokio::test]
    async fn test_short_header() {
        let mut reader = &[0x1fu8, 0x90, 0x00][..];
        assert!(read_header(&mut reader).await.is_err());
    }

    #[test]
    fn test_dial_status() {
        assert_eq!(DialStatus::try_from(0x00), Ok(DialStatus::Accepted));
        assert_eq!(DialStatus::try_from(0x01), Ok(DialStatus::Refused));
        assert_eq!(DialStatus::try_from(0x7f), Err(0x7f));
    }

    #[tokio::test]
    async fn test_listener_registration() {
        let ports = Arc::new(PortTable::new());
        let addr: SocketAddr = "10.0.8.2:8080".parse().unwrap();

        let listener = QuicListener::bind(ports.clone(), addr).unwrap();
        assert_eq!(listener.local_addr(), addr);
        assert!(ports.lookup(8080).is_some());
        assert!(matches!(
            QuicListener::bind(ports.clone(), addr),
            Err(TunnelError::AddrInUse(_))
        ));

        drop(listener);
        assert!(ports.lookup(8080).is_none());
        assert!(QuicListener::bind(ports.clone(), addr).is_ok());
    }

    #[test]
    fn test_poisoned_table_keeps_working() {
        let ports = Arc::new(PortTable::new());
        let holder = Arc::clone(&ports);
        let _ = std::thread::spawn(move || {
            let _entries = holder.entries.lock().unwrap();
            panic!("panic while holding the port table");
        })
        .join();
        assert!(ports.entries.is_poisoned());

        let addr: SocketAddr = "10.0.8.2:80".parse().unwrap();
        let listener = QuicListener::bind(ports.clone(), addr).unwrap();
        assert!(ports.lookup(80).is_some());
        assert!(matches!(
            QuicListener::bind(ports.clone(), addr),
            Err(TunnelError::AddrInUse(_))
        ));

        drop(listener);
        assert!(ports.is_empty());
    }

    #[tokio::test]
    async fn test_clear_closes_listeners() {
        let ports = Arc::new(PortTable::new());
        let listener = QuicListener::bind(ports.clone(), "10.0.8.2:22".parse().unwrap()).unwrap();

        ports.clear();
        assert!(ports.is_empty());
        assert!(matches!(
            listener.accept().await,
            Err(TunnelError::ListenerClosed)
        ));
    }
}
