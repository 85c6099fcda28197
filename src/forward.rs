//! フォワーディングルール
//!
//! サービスごとのポート / アドレス対応表と、CLI の `--expose` 指定のパースを提供します。
//!
//! ```text
//! egress : 仮想ポート (u16)        -> 実アドレス ("host:port")
//! ingress: 実アドレス ("host:port") -> 仮想ポート (u16)
//! ```

use std::collections::hash_map;
use std::collections::HashMap;
use std::hash::Hash;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// フォワード指定のパースエラー
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ForwardSpecError {
    #[error("Invalid expose syntax: expected localPort:localAddress:peerPort, got {0} field(s)")]
    FieldCount(usize),

    #[error("Invalid expose syntax: peer port {0:?} is not a valid port number")]
    InvalidPeerPort(String),
}

/// フォワードテーブル
///
/// キーは 1 インスタンス内で一意。同じキーを再登録すると黙って上書きされる（後勝ち）。
/// `freeze()` 以降は読み取り専用になり、`add_forward` は無視される。
/// イテレーション順序は未定義。
#[derive(Debug, Clone)]
pub struct ForwardTable<K, V> {
    rules: HashMap<K, V>,
    frozen: bool,
}

impl<K, V> Default for ForwardTable<K, V> {
    fn default() -> Self {
        Self {
            rules: HashMap::new(),
            frozen: false,
        }
    }
}

impl<K: Eq + Hash + std::fmt::Debug, V> ForwardTable<K, V> {
    /// 空のテーブルを作成
    pub fn new() -> Self {
        Self::default()
    }

    /// ルールを追加（既存キーは上書き）
    ///
    /// 戻り値: ルールが反映された場合は true
    pub fn add_forward(&mut self, key: K, value: V) -> bool {
        if self.frozen {
            warn!("Ignoring forward for {:?}: service is already listening", key);
            return false;
        }
        self.rules.insert(key, value);
        true
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.rules.get(key)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, K, V> {
        self.rules.iter()
    }

    /// テーブルを凍結（listen() から呼ばれる）
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

/// `--expose` の指定 `localPort:localAddress:peerPort`
///
/// ローカル側は文字列のまま `localAddress:localPort` に結合する（ここでは検証しない）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local_port: String,
    pub local_address: String,
    pub peer_port: u16,
}

impl ForwardSpec {
    /// ローカル側の実アドレス (`localAddress:localPort`)
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_address, self.local_port)
    }

    /// egress 用ルール: 仮想ポート -> 実アドレス
    pub fn egress_rule(&self) -> (u16, String) {
        (self.peer_port, self.local_addr())
    }

    /// ingress 用ルール: 実アドレス -> 仮想ポート
    pub fn ingress_rule(&self) -> (String, u16) {
        (self.local_addr(), self.peer_port)
    }
}

impl FromStr for ForwardSpec {
    type Err = ForwardSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(ForwardSpecError::FieldCount(parts.len()));
        }

        let peer_port: u16 = parts[2]
            .parse()
            .map_err(|_| ForwardSpecError::InvalidPeerPort(parts[2].to_string()))?;

        Ok(Self {
            local_port: parts[0].to_string(),
            local_address: parts[1].to_string(),
            peer_port,
        })
    }
}

/// 複数の指定をまとめてパース（最初のエラーで中断）
pub fn parse_forward_specs<S: AsRef<str>>(specs: &[S]) -> Result<Vec<ForwardSpec>, ForwardSpecError> {
    specs.iter().map(|s| s.as_ref().parse()).collect()
}
