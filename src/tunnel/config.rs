//! トンネルデバイス設定ブロック
//!
//! デバイスには改行区切りの `key=value` テキストで設定を渡します。
//!
//! ```text
//! # egress（接続側）
//! private_key=<hex>
//! public_key=<hex>
//! allowed_ip=10.0.8.1/32
//! endpoint=<host:port>
//! persistent_keepalive_interval=25
//!
//! # ingress（待ち受け側）
//! private_key=<hex>
//! listen_port=<port>
//! public_key=<hex>
//! allowed_ip=10.0.8.2/32
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

use crate::keys::{parse_hex_key, KeyError, KEY_LEN};

/// egress 側のローカル仮想アドレス
pub const EGRESS_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 8, 2);

/// ingress 側のローカル仮想アドレス
pub const INGRESS_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 8, 1);

/// 仮想インターフェースの MTU
pub const MTU: u16 = 1420;

/// egress 側の keepalive 間隔（秒）
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

/// 設定エラー
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Malformed line: {0:?}")]
    MalformedLine(String),

    #[error("Unknown key: {0}")]
    UnknownKey(String),

    #[error("Missing required key: {0}")]
    MissingKey(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Either endpoint or listen_port must be set")]
    NoRole,

    #[error("Invalid key: {0}")]
    Key(#[from] KeyError),
}

/// 許可アドレス（`addr/prefix`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedIp {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl AllowedIp {
    /// 単一ホスト（/32 または /128）
    pub fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix }
    }

    /// アドレスがこの範囲に含まれるか
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix.min(128)))
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for AllowedIp {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidValue {
            key: "allowed_ip",
            value: s.to_string(),
        };

        let (addr_str, prefix_str) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr_str.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix_str.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }

        Ok(Self { addr, prefix })
    }
}

/// デバイス設定
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub private_key: [u8; KEY_LEN],
    pub public_key: [u8; KEY_LEN],
    pub allowed_ip: AllowedIp,
    /// 接続側のみ: 相手の実エンドポイント（host:port）
    pub endpoint: Option<String>,
    /// 接続側のみ: keepalive 間隔（秒）
    pub persistent_keepalive_interval: Option<u16>,
    /// 待ち受け側のみ: UDP 待ち受けポート
    pub listen_port: Option<u16>,
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 秘密鍵はログに出さない
        f.debug_struct("TunnelConfig")
            .field("public_key", &hex::encode(self.public_key))
            .field("allowed_ip", &self.allowed_ip)
            .field("endpoint", &self.endpoint)
            .field(
                "persistent_keepalive_interval",
                &self.persistent_keepalive_interval,
            )
            .field("listen_port", &self.listen_port)
            .finish_non_exhaustive()
    }
}

impl TunnelConfig {
    /// egress（接続側）の設定
    pub fn egress(
        private_key_hex: &str,
        server_endpoint: &str,
        server_public_key_hex: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            private_key: parse_hex_key(private_key_hex)?,
            public_key: parse_hex_key(server_public_key_hex)?,
            allowed_ip: AllowedIp::host(IpAddr::V4(INGRESS_ADDRESS)),
            endpoint: Some(server_endpoint.to_string()),
            persistent_keepalive_interval: Some(PERSISTENT_KEEPALIVE_SECS),
            listen_port: None,
        })
    }

    /// ingress（待ち受け側）の設定
    pub fn ingress(
        private_key_hex: &str,
        peer_public_key_hex: &str,
        listen_port: u16,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            private_key: parse_hex_key(private_key_hex)?,
            public_key: parse_hex_key(peer_public_key_hex)?,
            allowed_ip: AllowedIp::host(IpAddr::V4(EGRESS_ADDRESS)),
            endpoint: None,
            persistent_keepalive_interval: None,
            listen_port: Some(listen_port),
        })
    }

    /// 接続側（endpoint を持つ）かどうか
    pub fn is_dialer(&self) -> bool {
        self.endpoint.is_some()
    }

    /// 設定ブロックに変換
    pub fn render(&self) -> String {
        let mut lines = vec![format!("private_key={}", hex::encode(self.private_key))];
        if let Some(port) = self.listen_port {
            lines.push(format!("listen_port={}", port));
        }
        lines.push(format!("public_key={}", hex::encode(self.public_key)));
        lines.push(format!("allowed_ip={}", self.allowed_ip));
        if let Some(ref endpoint) = self.endpoint {
            lines.push(format!("endpoint={}", endpoint));
        }
        if let Some(interval) = self.persistent_keepalive_interval {
            lines.push(format!("persistent_keepalive_interval={}", interval));
        }
        lines.join("\n")
    }

    /// 設定ブロックをパース
    pub fn parse(block: &str) -> Result<Self, ConfigError> {
        let mut private_key = None;
        let mut public_key = None;
        let mut allowed_ip = None;
        let mut endpoint = None;
        let mut persistent_keepalive_interval = None;
        let mut listen_port = None;

        for line in block.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedLine(line.to_string()))?;

            match key {
                "private_key" => private_key = Some(parse_hex_key(value)?),
                "public_key" => public_key = Some(parse_hex_key(value)?),
                "allowed_ip" => allowed_ip = Some(value.parse::<AllowedIp>()?),
                "endpoint" => {
                    if value.is_empty() {
                        return Err(ConfigError::InvalidValue {
                            key: "endpoint",
                            value: value.to_string(),
                        });
                    }
                    endpoint = Some(value.to_string());
                }
                "persistent_keepalive_interval" => {
                    persistent_keepalive_interval =
                        Some(value.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                            key: "persistent_keepalive_interval",
                            value: value.to_string(),
                        })?);
                }
                "listen_port" => {
                    listen_port = Some(value.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                        key: "listen_port",
                        value: value.to_string(),
                    })?);
                }
                other => return Err(ConfigError::UnknownKey(other.to_string())),
            }
        }

        if endpoint.is_none() && listen_port.is_none() {
            return Err(ConfigError::NoRole);
        }

        Ok(Self {
            private_key: private_key.ok_or(ConfigError::MissingKey("private_key"))?,
            public_key: public_key.ok_or(ConfigError::MissingKey("public_key"))?,
            allowed_ip: allowed_ip.ok_or(ConfigError::MissingKey("allowed_ip"))?,
            endpoint,
            persistent_keepalive_interval,
            listen_port,
        })
    }
}
