//! ピア認証（X25519 相互認証）
//!
//! QUIC の TLS は自己署名証明書で暗号化のみを担い、ピアの正当性は
//! 接続直後の最初の双方向ストリームで静的鍵ペアを使って相互に確認する。
//!
//! ```text
//! initiator (dialer)                               responder (listener)
//!   "TUNPORT_AUTH" (12 bytes)              ──►
//!   initiator 公開鍵 (32)                  ──►      設定済み公開鍵と照合
//!   initiator チャレンジ (32)              ──►
//!                                          ◄──      responder 公開鍵 (32)
//!   設定済み公開鍵と照合
//!                                          ◄──      エフェメラル公開鍵 (32)
//!                                          ◄──      responder チャレンジ (32)
//!                                          ◄──      HMAC(DH(static, static), initiator チャレンジ)
//!   responder の HMAC を検証
//!   HMAC(DH(static, ephemeral), responder チャレンジ) ──►
//!                                          ◄──      結果 (1 byte, 0x00 = 成功)
//! ```

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::keys::KEY_LEN;

type HmacSha256 = Hmac<Sha256>;

/// 認証マジックバイト
const AUTH_MAGIC: &[u8; 12] = b"TUNPORT_AUTH";

/// 認証成功を示す結果バイト
const AUTH_OK: u8 = 0x00;

/// 認証エラー
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid magic bytes")]
    InvalidMagicBytes,

    #[error("Peer public key is not authorized")]
    PeerNotAuthorized,

    #[error("Peer public key mismatch")]
    PeerKeyMismatch,

    #[error("Peer HMAC verification failed")]
    HmacVerificationFailed,

    #[error("Rejected by peer")]
    Rejected,

    #[error("Invalid HMAC key")]
    InvalidHmacKey,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// ランダムなチャレンジを生成
fn generate_challenge() -> [u8; 32] {
    rand::random::<[u8; 32]>()
}

/// HMAC-SHA256(shared_secret, challenge)
fn compute_response(shared_secret: &[u8; 32], challenge: &[u8; 32]) -> Result<[u8; 32], AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(shared_secret).map_err(|_| AuthError::InvalidHmacKey)?;
    mac.update(challenge);

    let mut response = [0u8; 32];
    response.copy_from_slice(&mac.finalize().into_bytes()[..32]);
    Ok(response)
}

/// 接続を開始した側の認証
pub async fn initiate<S>(
    stream: &mut S,
    private_key: &[u8; KEY_LEN],
    expected_peer_key: &[u8; KEY_LEN],
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(&secret);

    let challenge = generate_challenge();
    let mut hello = Vec::with_capacity(AUTH_MAGIC.len() + 64);
    hello.extend_from_slice(AUTH_MAGIC);
    hello.extend_from_slice(public.as_bytes());
    hello.extend_from_slice(&challenge);
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut peer_key = [0u8; 32];
    stream.read_exact(&mut peer_key).await?;
    if !bool::from(peer_key.ct_eq(expected_peer_key)) {
        return Err(AuthError::PeerKeyMismatch);
    }

    let mut peer_ephemeral = [0u8; 32];
    stream.read_exact(&mut peer_ephemeral).await?;
    let mut peer_challenge = [0u8; 32];
    stream.read_exact(&mut peer_challenge).await?;
    let mut peer_response = [0u8; 32];
    stream.read_exact(&mut peer_response).await?;

    // 相手が静的秘密鍵を持っていることを確認
    let shared_static = secret.diffie_hellman(&PublicKey::from(peer_key));
    let expected = compute_response(shared_static.as_bytes(), &challenge)?;
    if !bool::from(expected.ct_eq(&peer_response)) {
        return Err(AuthError::HmacVerificationFailed);
    }

    let shared = secret.diffie_hellman(&PublicKey::from(peer_ephemeral));
    let response = compute_response(shared.as_bytes(), &peer_challenge)?;
    stream.write_all(&response).await?;
    stream.flush().await?;

    let mut verdict = [0u8; 1];
    stream.read_exact(&mut verdict).await?;
    if verdict[0] != AUTH_OK {
        return Err(AuthError::Rejected);
    }

    Ok(())
}

/// 接続を受けた側の認証
pub async fn respond<S>(
    stream: &mut S,
    private_key: &[u8; KEY_LEN],
    authorized_peer_key: &[u8; KEY_LEN],
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut magic = [0u8; 12];
    stream.read_exact(&mut magic).await?;
    if &magic != AUTH_MAGIC {
        return Err(AuthError::InvalidMagicBytes);
    }

    let mut peer_key = [0u8; 32];
    stream.read_exact(&mut peer_key).await?;
    let mut peer_challenge = [0u8; 32];
    stream.read_exact(&mut peer_challenge).await?;

    if !bool::from(peer_key.ct_eq(authorized_peer_key)) {
        return Err(AuthError::PeerNotAuthorized);
    }

    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(&secret);
    let peer_public = PublicKey::from(peer_key);

    // Forward Secrecy のためセッションごとにエフェメラル鍵を使う
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let challenge = generate_challenge();

    let shared_static = secret.diffie_hellman(&peer_public);
    let response = compute_response(shared_static.as_bytes(), &peer_challenge)?;

    let mut reply = Vec::with_capacity(128);
    reply.extend_from_slice(public.as_bytes());
    reply.extend_from_slice(ephemeral_public.as_bytes());
    reply.extend_from_slice(&challenge);
    reply.extend_from_slice(&response);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    let shared = ephemeral_secret.diffie_hellman(&peer_public);
    let expected = compute_response(shared.as_bytes(), &challenge)?;

    let mut peer_response = [0u8; 32];
    stream.read_exact(&mut peer_response).await?;
    if !bool::from(expected.ct_eq(&peer_response)) {
        return Err(AuthError::HmacVerificationFailed);
    }

    stream.write_all(&[AUTH_OK]).await?;
    stream.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keypair;

    #[test]
    fn test_hmac_response() {
        let shared_secret = [0u8; 32];
        let challenge = [1u8; 32];

        let response1 = compute_response(&shared_secret, &challenge).unwrap();
        let response2 = compute_response(&shared_secret, &challenge).unwrap();
        assert_eq!(response1, response2);

        let response3 = compute_response(&shared_secret, &[2u8; 32]).unwrap();
        assert_ne!(response1, response3);
    }

    #[test]
    fn test_challenge_generation() {
        assert_ne!(generate_challenge(), generate_challenge());
    }

    #[tokio::test]
    async fn test_mutual_auth_success() {
        let (egress_private, egress_public) = generate_keypair();
        let (ingress_private, ingress_public) = generate_keypair();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let (initiated, responded) = tokio::join!(
            initiate(&mut a, &egress_private, &ingress_public),
            respond(&mut b, &ingress_private, &egress_public),
        );

        initiated.unwrap();
        responded.unwrap();
    }

    #[tokio::test]
    async fn test_responder_rejects_unknown_key() {
        let (egress_private, _) = generate_keypair();
        let (ingress_private, ingress_public) = generate_keypair();
        let (_, other_public) = generate_keypair();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let responder = async move {
            let result = respond(&mut b, &ingress_private, &other_public).await;
            drop(b);
            result
        };
        let (initiated, responded) = tokio::join!(
            initiate(&mut a, &egress_private, &ingress_public),
            responder,
        );

        assert!(matches!(responded, Err(AuthError::PeerNotAuthorized)));
        assert!(initiated.is_err());
    }

    #[tokio::test]
    async fn test_initiator_rejects_unexpected_peer() {
        let (egress_private, egress_public) = generate_keypair();
        let (ingress_private, _) = generate_keypair();
        let (_, other_public) = generate_keypair();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let initiator = async move {
            let result = initiate(&mut a, &egress_private, &other_public).await;
            drop(a);
            result
        };
        let (initiated, responded) = tokio::join!(
            initiator,
            respond(&mut b, &ingress_private, &egress_public),
        );

        assert!(matches!(initiated, Err(AuthError::PeerKeyMismatch)));
        assert!(responded.is_err());
    }

    #[tokio::test]
    async fn test_invalid_magic() {
        let (private, public) = generate_keypair();
        let (mut a, mut b) = tokio::io::duplex(1024);

        a.write_all(b"NOT_A_TUNNEL").await.unwrap();
        let result = respond(&mut b, &private, &public).await;
        assert!(matches!(result, Err(AuthError::InvalidMagicBytes)));
    }
}
