// =========================
// config.rs
// milter_core 設定管理モジュール
//
// 【このファイルで使う主なクレート】
// - std: ファイル入出力（fs::read_to_string）、文字列処理、同期（sync::RwLock）
// - lazy_static: グローバル変数初期化（設定の静的共有）
//
// 【役割】
// - サーバー設定（Listenアドレス、クライアントタイムアウト、spam_header、
//   discard_on_reject）の読み込み・保持（spec §6.3）
// - 設定ファイル(MilterDecoder.conf)からConfig構造体を生成
// - グローバル設定CONFIGとして全体で参照可能（teacherの`init.rs`の
//   行指向パーサ・lazy_static構成をそのまま踏襲し、ディレクティブを
//   2つ追加する）
// =========================

use lazy_static::lazy_static; // lazy_static: グローバル変数初期化
use std::sync::RwLock; // RwLock: スレッド安全な設定共有

/// サーバー設定情報構造体。
///
/// - `address`: サーバー待受アドレス（例: `0.0.0.0:8898`）
/// - `client_timeout`: クライアント無通信タイムアウト秒
/// - `spam_header`: `add header`アクションで書き換えるヘッダ名（spec §6.3）
/// - `discard_on_reject`: `reject`判定をDISCARDにするかREJECTにするか（spec §6.3）
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub client_timeout: u64,
    pub spam_header: String,
    pub discard_on_reject: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "[::]:8898".to_string(),
            client_timeout: 30,
            spam_header: "X-Spam".to_string(),
            discard_on_reject: false,
        }
    }
}

impl Config {
    pub fn session_flags(&self) -> crate::session::SessionFlags {
        let mut flags = crate::session::SessionFlags::empty();
        if self.discard_on_reject {
            flags |= crate::session::SessionFlags::DISCARD_ON_REJECT;
        }
        flags
    }
}

/// 設定ファイル(MilterDecoder.conf)からConfigを生成する。
///
/// `Listen <アドレス/ポート>`、`Client_timeout <秒>`、
/// `Spam_header <ヘッダ名>`、`Discard_on_reject <yes|no>`をパースする。
/// 未指定の項目は[`Config::default`]の値を使う。設定ファイルが存在
/// しない場合も既定値のみで起動できるようにする（teacherの`init.rs`は
/// ファイル必須だったが、このcrateはライブラリとしても使われうるため
/// 読み込み失敗を致命的にしない）。
pub fn load_config() -> Config {
    load_config_from_path("MilterDecoder.conf")
}

pub fn load_config_from_path(path: &str) -> Config {
    let mut config = Config::default();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return config,
    };
    parse_into(&text, &mut config);
    config
}

fn parse_into(text: &str, config: &mut Config) {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Listen ") {
            let addr = rest.trim();
            config.address = if addr.contains(':') {
                addr.to_string()
            } else {
                format!("[::]:{}", addr)
            };
        } else if let Some(rest) = line.strip_prefix("Client_timeout ") {
            if let Ok(val) = rest.trim().parse::<u64>() {
                config.client_timeout = val;
            }
        } else if let Some(rest) = line.strip_prefix("Spam_header ") {
            let name = rest.trim();
            if !name.is_empty() {
                config.spam_header = name.to_string();
            }
        } else if let Some(rest) = line.strip_prefix("Discard_on_reject ") {
            let value = rest.trim().to_ascii_lowercase();
            config.discard_on_reject = matches!(value.as_str(), "yes" | "true" | "1" | "on");
        }
    }
}

lazy_static! {
    /// グローバル設定。プロセス起動時に一度だけ読み込まれる
    /// （Design Note「Global state」: 最初の`attach`より前に一度だけ
    /// 初期化される前提で、再初期化はサポートしない）。SIGHUP時は
    /// `main.rs`がこのRwLockを書き換えることで再読込を実現する。
    pub static ref CONFIG: RwLock<Config> = RwLock::new(load_config());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_directives_absent() {
        let mut config = Config::default();
        parse_into("", &mut config);
        assert_eq!(config.address, "[::]:8898");
        assert_eq!(config.spam_header, "X-Spam");
        assert!(!config.discard_on_reject);
    }

    #[test]
    fn parses_all_four_directives() {
        let mut config = Config::default();
        parse_into(
            "Listen 127.0.0.1:9000\nClient_timeout 45\nSpam_header X-My-Spam\nDiscard_on_reject yes\n",
            &mut config,
        );
        assert_eq!(config.address, "127.0.0.1:9000");
        assert_eq!(config.client_timeout, 45);
        assert_eq!(config.spam_header, "X-My-Spam");
        assert!(config.discard_on_reject);
    }

    #[test]
    fn bare_port_listen_binds_dual_stack() {
        let mut config = Config::default();
        parse_into("Listen 8899\n", &mut config);
        assert_eq!(config.address, "[::]:8899");
    }

    #[test]
    fn session_flags_reflect_discard_on_reject() {
        let mut config = Config::default();
        config.discard_on_reject = true;
        assert!(config
            .session_flags()
            .contains(crate::session::SessionFlags::DISCARD_ON_REJECT));
    }
}
