//! 鍵素材
//!
//! WireGuard と同じ形式の X25519 鍵を扱います。
//!
//! - ファイル / CLI 上の表現: 32 バイトの生データを標準 Base64 でエンコード（44 文字）
//! - トンネルデバイスへ渡す表現: 小文字 16 進数（64 文字）

use base64::Engine;
use rand::rngs::OsRng;
use std::path::Path;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// 鍵の長さ（バイト）
pub const KEY_LEN: usize = 32;

/// 鍵エラー
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid base64 encoding: {0}")]
    InvalidBase64(String),

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("No key found in {0}")]
    Empty(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Base64 形式の鍵をパース
pub fn parse_base64_key(key_str: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key_str.trim())
        .map_err(|e| KeyError::InvalidBase64(e.to_string()))?;
    to_key(&decoded)
}

/// 鍵を Base64 文字列に変換
pub fn encode_base64_key(key: &[u8; KEY_LEN]) -> String {
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// 16 進数形式の鍵をパース（設定ブロック用）
pub fn parse_hex_key(key_str: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let decoded = hex::decode(key_str.trim()).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
    to_key(&decoded)
}

fn to_key(bytes: &[u8]) -> Result<[u8; KEY_LEN], KeyError> {
    if bytes.len() != KEY_LEN {
        return Err(KeyError::InvalidKeyLength(bytes.len()));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(bytes);
    Ok(key)
}

/// 鍵ファイルを読み込み、16 進数文字列として返す
///
/// ファイル形式:
/// - Base64 エンコードされた鍵（`wg genkey` / `tunport genkey` の出力そのまま）
/// - '#' で始まる行と空行は無視し、最初の行を鍵として扱う
pub fn read_key_file(path: &Path) -> Result<String, KeyError> {
    let content = std::fs::read_to_string(path)?;
    let line = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| KeyError::Empty(path.display().to_string()))?;

    let key = parse_base64_key(line)?;
    Ok(hex::encode(key))
}

/// 新しい鍵ペアを生成（秘密鍵, 公開鍵）
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// 秘密鍵から公開鍵を導出
pub fn public_key_of(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}
