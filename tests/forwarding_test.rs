//! egress / ingress を QUIC トンネルで繋いだフォワーディングの統合テスト
//!
//! - 実接続 -> ingress -> トンネル -> egress -> upstream の往復
//! - ダイヤル失敗が他のセッションに影響しないこと
//! - graceful shutdown 中も処理中のセッションが完走すること
//! - 片側が閉じると反対側の接続も閉じられること
//! - listen 失敗時にデバイスとテーブルが元に戻ること

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tunport::keys::{generate_keypair, public_key_of};
use tunport::tunnel::TunnelError;
use tunport::{EgressService, IngressService, ServiceError};

/// 未使用の UDP/TCP ポートを取得
fn get_test_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

/// 受信したデータを EOF までそのまま送り返す upstream
async fn start_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    addr
}

/// 受け付けた接続を何もせずテストへ渡す upstream
async fn start_silent_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if tx.send(stream).is_err() {
                break;
            }
        }
    });

    (addr, rx)
}

/// 接続済みの egress / ingress ペア
struct TunnelPair {
    egress: Arc<EgressService>,
    ingress: Arc<IngressService>,
    /// 仮想ポート -> ingress の実リスナーアドレス
    routes: Vec<(u16, SocketAddr)>,
    egress_serve: JoinHandle<Result<(), ServiceError>>,
    ingress_serve: JoinHandle<Result<(), ServiceError>>,
}

impl TunnelPair {
    /// ルールを登録して両サービスを起動し、トンネルの確立を待つ
    async fn start(egress_rules: &[(u16, String)], ingress_rules: &[u16]) -> Self {
        let (egress_private, _) = generate_keypair();
        let (ingress_private, _) = generate_keypair();
        let egress_public = public_key_of(&egress_private);
        let ingress_public = public_key_of(&ingress_private);
        let udp_port = get_test_port();

        let ingress = Arc::new(
            IngressService::new(
                &hex::encode(ingress_private),
                &hex::encode(egress_public),
                udp_port,
            )
            .unwrap(),
        );
        let mut routes = Vec::new();
        for port in ingress_rules {
            let addr: SocketAddr = format!("127.0.0.1:{}", get_test_port()).parse().unwrap();
            assert!(ingress.add_forward(addr.to_string(), *port));
            routes.push((*port, addr));
        }

        let egress = Arc::new(
            EgressService::new(
                &hex::encode(egress_private),
                &format!("127.0.0.1:{}", udp_port),
                &hex::encode(ingress_public),
            )
            .unwrap(),
        );
        for (port, upstream) in egress_rules {
            egress.add_forward(*port, upstream.clone());
        }

        ingress.listen().await.unwrap();
        egress.listen().await.unwrap();

        let ingress_serve = tokio::spawn({
            let ingress = Arc::clone(&ingress);
            async move { ingress.serve().await }
        });
        let egress_serve = tokio::spawn({
            let egress = Arc::clone(&egress);
            async move { egress.serve().await }
        });

        let connected = tokio::time::timeout(Duration::from_secs(10), async {
            while !(egress.tunnel().is_connected() && ingress.tunnel().is_connected()) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(connected.is_ok(), "Tunnel was not established");

        Self {
            egress,
            ingress,
            routes,
            egress_serve,
            ingress_serve,
        }
    }

    /// 仮想ポートに対応する ingress の実リスナーアドレス
    fn route(&self, virtual_port: u16) -> SocketAddr {
        self.routes
            .iter()
            .find(|(port, _)| *port == virtual_port)
            .map(|(_, addr)| *addr)
            .expect("No route for virtual port")
    }

    async fn close(self) {
        self.ingress.close().await.unwrap();
        self.egress.close().await.unwrap();
        let _ = self.ingress_serve.await;
        let _ = self.egress_serve.await;
    }
}

/// 送信しながら同じ長さだけ読み取る（書き込み側は閉じない）
async fn round_trip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (mut reader, mut writer) = stream.split();

    let mut received = vec![0u8; payload.len()];
    let (written, read) = tokio::time::timeout(
        Duration::from_secs(10),
        async { tokio::join!(writer.write_all(payload), reader.read_exact(&mut received)) },
    )
    .await
    .expect("Timed out waiting for echo");
    written.unwrap();
    read.unwrap();
    received
}

/// 相手が閉じたことを読み取りで確認する（EOF でも RST でもよい）
async fn wait_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "Peer close was not propagated");
}

/// セッションがデータなしで閉じられるかどうか
async fn closed_without_data(addr: SocketAddr) -> bool {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let _ = stream.write_all(b"ping").await;
    let _ = stream.shutdown().await;

    let mut received = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut received))
        .await
        .expect("Timed out waiting for session to end");
    received.is_empty()
}

#[tokio::test]
async fn test_forward_through_tunnel() {
    let upstream = start_echo_upstream().await;
    let pair = TunnelPair::start(&[(8080, upstream.to_string())], &[8080]).await;

    let addr = pair.route(8080);
    assert_eq!(pair.ingress.listen_addrs(), vec![addr]);

    let received = round_trip(addr, b"hello through tunport").await;
    assert_eq!(received, b"hello through tunport");

    // 大きめのデータ（複数のバッファにまたがる）
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let received = round_trip(addr, &payload).await;
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "Echoed data does not match");

    // 複数の同時接続
    let mut handles = Vec::new();
    for i in 0..8u8 {
        handles.push(tokio::spawn(async move {
            let payload = vec![i; 1024];
            assert_eq!(round_trip(addr, &payload).await, payload);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    pair.close().await;
}

#[tokio::test]
async fn test_dial_failure_is_isolated() {
    let upstream = start_echo_upstream().await;
    // 誰も待ち受けていない upstream
    let dead_upstream = format!("127.0.0.1:{}", get_test_port());

    // 9000: 正常 / 9001: upstream 接続失敗 / 9002: egress に仮想リスナーなし
    let pair = TunnelPair::start(
        &[(9000, upstream.to_string()), (9001, dead_upstream)],
        &[9000, 9001, 9002],
    )
    .await;

    assert!(closed_without_data(pair.route(9001)).await);
    assert!(closed_without_data(pair.route(9002)).await);
    assert_eq!(round_trip(pair.route(9000), b"ping").await, b"ping");

    // 失敗のあとも同じポートを何度でも試せる
    assert!(closed_without_data(pair.route(9001)).await);
    assert!(closed_without_data(pair.route(9002)).await);
    assert_eq!(round_trip(pair.route(9000), b"again").await, b"again");

    // egress: upstream 接続失敗 / ingress: 仮想ポート拒否
    assert_eq!(pair.egress.statistics().snapshot().dial_failures, 2);
    assert_eq!(pair.ingress.statistics().snapshot().dial_failures, 2);

    pair.close().await;
}

#[tokio::test]
async fn test_graceful_drain_waits_for_sessions() {
    let upstream = start_echo_upstream().await;
    let pair = TunnelPair::start(&[(7000, upstream.to_string())], &[7000]).await;
    let addr = pair.route(7000);

    // セッションを 1 つ開いたままにする
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"first").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"first");

    let shutdown = tokio::spawn({
        let ingress = Arc::clone(&pair.ingress);
        async move { ingress.shutdown().await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!shutdown.is_finished(), "Drain must wait for in-flight session");

    // drain 中も既存セッションは動く
    stream.write_all(b"second").await.unwrap();
    let mut buf = [0u8; 6];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"second");

    // 新規接続は受け付けない
    assert!(TcpStream::connect(addr).await.is_err());

    stream.shutdown().await.unwrap();
    wait_closed(&mut stream).await;

    tokio::time::timeout(Duration::from_secs(10), shutdown)
        .await
        .expect("Drain did not finish")
        .unwrap();

    let snapshot = pair.ingress.statistics().snapshot();
    assert_eq!(snapshot.total_sessions, 1);
    assert_eq!(snapshot.active_sessions, 0);

    pair.close().await;
}

#[tokio::test]
async fn test_client_close_reaches_upstream() {
    let (upstream, mut accepted) = start_silent_upstream().await;
    let pair = TunnelPair::start(&[(6000, upstream.to_string())], &[6000]).await;

    let mut client = TcpStream::connect(pair.route(6000)).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut upstream_conn = tokio::time::timeout(Duration::from_secs(10), accepted.recv())
        .await
        .expect("Upstream was not dialed")
        .unwrap();
    let mut buf = [0u8; 5];
    upstream_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    // upstream は何も送らないまま、クライアントだけが閉じる
    drop(client);
    wait_closed(&mut upstream_conn).await;

    tokio::time::timeout(Duration::from_secs(5), pair.ingress.shutdown())
        .await
        .expect("Ingress drain did not finish");
    tokio::time::timeout(Duration::from_secs(5), pair.egress.shutdown())
        .await
        .expect("Egress drain did not finish");

    pair.close().await;
}

#[tokio::test]
async fn test_upstream_close_reaches_client() {
    let (upstream, mut accepted) = start_silent_upstream().await;
    let pair = TunnelPair::start(&[(6001, upstream.to_string())], &[6001]).await;

    let mut client = TcpStream::connect(pair.route(6001)).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut upstream_conn = tokio::time::timeout(Duration::from_secs(10), accepted.recv())
        .await
        .expect("Upstream was not dialed")
        .unwrap();
    let mut buf = [0u8; 5];
    upstream_conn.read_exact(&mut buf).await.unwrap();

    // クライアントは何も送らないまま、upstream だけが閉じる
    drop(upstream_conn);
    wait_closed(&mut client).await;

    tokio::time::timeout(Duration::from_secs(5), pair.ingress.shutdown())
        .await
        .expect("Ingress drain did not finish");
    tokio::time::timeout(Duration::from_secs(5), pair.egress.shutdown())
        .await
        .expect("Egress drain did not finish");

    pair.close().await;
}

#[tokio::test]
async fn test_listen_failure_rolls_back() {
    let (ingress_private, _) = generate_keypair();
    let (egress_private, _) = generate_keypair();
    let ingress = IngressService::new(
        &hex::encode(ingress_private),
        &hex::encode(public_key_of(&egress_private)),
        get_test_port(),
    )
    .unwrap();

    // 使用中のアドレスを 1 つ混ぜる
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let free = format!("127.0.0.1:{}", get_test_port());
    assert!(ingress.add_forward(free, 5000));
    assert!(ingress.add_forward(taken.local_addr().unwrap().to_string(), 5001));

    let err = ingress.listen().await.unwrap_err();
    assert!(matches!(err, ServiceError::Listen { .. }), "{:?}", err);

    // デバイスは閉じられ、テーブルは凍結されない
    assert!(ingress.tunnel().udp_local_addr().is_none());
    assert!(ingress.listen_addrs().is_empty());
    assert!(ingress.add_forward(format!("127.0.0.1:{}", get_test_port()), 5002));

    // 閉じたデバイスは再起動できない
    let err = ingress.listen().await.unwrap_err();
    assert!(
        matches!(err, ServiceError::Up(TunnelError::Closed)),
        "{:?}",
        err
    );
    assert!(matches!(
        ingress.serve().await,
        Err(ServiceError::NotListening)
    ));
}
