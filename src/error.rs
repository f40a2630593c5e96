// =========================
// error.rs
// Milterコアのエラー分類
//
// 【このファイルで使う主なクレート】
// - thiserror: エラー型のderive（std::error::Error実装・Display生成）
//
// 【役割】
// - プロトコル違反（フレーム形式・コマンド不正等）を`ProtocolError`に分類
// - I/O・タイムアウト・プロトコルエラーをまとめた`MilterError`を提供
// - spec §7のエラー種別ごとの扱い（致命/非致命）をそのまま型に落とす
//
// 【grounding】
// retarus-miltr (examples/other_examples/add2b649_..., ddfac8de_...) の
// ProtocolError/NotEnoughDataの分け方を踏襲。rspamd milter.cはGErrorで
// フラットに扱っているが、Rustではバリアントごとに区別した方が
// Host::error側でのハンドリングがしやすい。
// =========================

use thiserror::Error;

/// フレーム・コマンドレベルのプロトコル違反。
///
/// すべて致命的（spec §7: セッションを`WANNA_DIE`へ遷移させ、
/// `Host::error`を呼んでから破棄する）。
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command byte: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("command payload length {0} exceeds limit {1}")]
    PayloadTooLarge(usize, usize),

    #[error("command payload length is zero")]
    EmptyPayload,

    #[error("envelope command 0x{0:02x} received before option negotiation")]
    BeforeOptNeg(u8),

    #[error("invalid OPTNEG payload: expected 12 bytes, got {0}")]
    InvalidOptNeg(usize),

    #[error("MTA offered protocol version {offered}, minimum supported is {minimum}")]
    UnsupportedVersion { offered: u32, minimum: u32 },

    #[error("invalid CONNECT command: {0}")]
    InvalidConnect(&'static str),

    #[error("invalid MACRO command: {0}")]
    InvalidMacro(&'static str),

    #[error("invalid HEADER command: {0}")]
    InvalidHeader(&'static str),

    #[error("frame read past advertised payload length")]
    ReadPastPayload,
}

/// 接続全体の致命的エラー。spec §7のエラー種別に対応。
#[derive(Debug, Error)]
pub enum MilterError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out")]
    Timeout,

    #[error("unexpected EOF from peer")]
    UnexpectedEof,
}

/// verdict（スキャン結果）が欠落・不正な場合のエラー。
///
/// spec §7: 致命的エラーではなく、TEMPFAILを送って接続は維持する。
#[derive(Debug, Error)]
#[error("malformed or missing verdict: {0}")]
pub struct VerdictError(pub String);
