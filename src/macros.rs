// =========================
// macros.rs
// Milterマクロ（{name} -> value）の大文字小文字を区別しないマップ
//
// 【役割】
// - MACROコマンドのペイロードから受け取ったキーを正規化して保持する
// - キーの比較は大文字小文字を無視するが、元の表記は保存する
//   （Design Note「Macro case-insensitivity」: キー比較は大小無視、
//   値は元の大小文字のまま保持する）
// =========================

use std::collections::HashMap;

/// 大文字小文字を無視してキーを比較するマクロマップ。
///
/// 内部ではキーを小文字化したものをインデックスに使い、元のキー・値は
/// そのまま保存する。同じキーが大小文字違いで複数回送られてきた場合は
/// 後勝ち（最後に受信した値で上書き）。
#[derive(Debug, Clone, Default)]
pub struct MacroMap {
    entries: HashMap<String, (String, String)>,
}

impl MacroMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// マクロ名・値を格納する。名前の大小文字は区別しないが、格納される
    /// 値はそのまま保持される。
    pub fn insert(&mut self, name: &str, value: &str) {
        self.entries
            .insert(name.to_ascii_lowercase(), (name.to_string(), value.to_string()));
    }

    /// 大小文字を無視して検索する。
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
