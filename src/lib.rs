//! tunport - 暗号化トンネル越しの TCP ポートフォワーディングライブラリ
//!
//! 2 つのホストを仮想的な点対点トンネルで結び、TCP ポートをどちらの向きにも公開します。
//!
//! # 主要コンポーネント
//!
//! - [`egress`] - ピアへ接続し、ローカルの実サービスを仮想ポートとして公開する
//! - [`ingress`] - ピアを待ち受け、公開された仮想ポートをローカルの実ポートで利用可能にする
//! - [`tunnel`] - 仮想トンネルデバイス（QUIC 実装と X25519 相互認証）
//! - [`proxy`] - 双方向リレー
//! - [`lifecycle`] - 終了シグナルによる graceful shutdown
//! - [`forward`] - フォワードテーブルと `--expose` 指定のパース
//! - [`keys`] - X25519 鍵素材
//!
//! # アーキテクチャ
//!
//! ```text
//! [client] ─TCP─► [ingress 10.0.8.1] ═══QUIC トンネル═══ [egress 10.0.8.2] ─TCP─► [upstream]
//! ```
//!
//! 仮想接続は QUIC の双方向ストリーム 1 本に対応します。
//!
//! # 使用例
//!
//! ```no_run
//! use tunport::egress::EgressService;
//! use tunport::keys::{generate_keypair, public_key_of};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (private_key, _) = generate_keypair();
//!     let (peer_private_key, _) = generate_keypair();
//!     let peer_public_key = public_key_of(&peer_private_key);
//!
//!     let egress = EgressService::new(
//!         &hex::encode(private_key),
//!         "203.0.113.10:51820",
//!         &hex::encode(peer_public_key),
//!     )?;
//!     egress.add_forward(8080, "127.0.0.1:80");
//!     egress.listen_and_serve().await?;
//!     Ok(())
//! }
//! ```

pub mod egress;
pub mod forward;
pub mod ingress;
pub mod keys;
pub mod lifecycle;
pub mod proxy;
pub mod service;
pub mod statistics;
pub mod tunnel;

// 便利な再エクスポート
pub use egress::EgressService;
pub use ingress::IngressService;
pub use lifecycle::{ForwardService, Lifecycle, Outcome, Phase};
pub use service::ServiceError;
