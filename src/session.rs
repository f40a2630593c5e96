// =========================
// session.rs
// Milterセッションの状態と参照カウント（C4）
//
// 【このファイルで使う主なクレート】
// - tokio: セッション状態はawaitをまたいでロックされるため、
//   std::sync::MutexではなくTokioの非同期Mutexを使う
// - bitflags: reset()に渡すリセット範囲の指定
//
// 【役割】
// - 1接続=1トランザクション分の状態（マクロ・エンベロープ・出力キュー）
// - `retain`/`release`をAPI表面に明示したハンドル
//   （Design Note: Rustでは`Arc`のclone/dropがそのまま参照カウントだが、
//   C実装のretain/releaseブラケット規律を見えるようにしておく）
// =========================

use std::any::Any;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bitflags::bitflags;
use tokio::sync::{Mutex, MutexGuard};

use crate::address::SmtpAddress;
use crate::constants::Protocol;
use crate::macros::MacroMap;

bitflags! {
    /// `SessionState::reset`に渡す、どの範囲をリセットするかのフラグ。
    /// rspamd milter.cの`RSPAMD_MILTER_RESET_*`に対応する。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResetFlags: u32 {
        /// HELO/MAIL FROM/RCPT/ヘッダ出現回数など、メッセージ単位の状態
        const COMMON = 0b0001;
        /// マクロマップ
        const MACRO  = 0b0010;
        /// 接続元アドレス・ホスト名
        const ADDR   = 0b0100;
        /// 出力キュー・I/O関連の一時状態
        const IO     = 0b1000;
    }
}

impl ResetFlags {
    /// ABORTコマンド: メッセージ単位の状態だけ捨てて接続は維持する。
    pub const ON_ABORT: ResetFlags = ResetFlags::COMMON;
    /// QUIT_NC: メッセージ状態・接続元アドレス・マクロを捨てるが、
    /// 接続自体は維持する（MTAが新しいSMTP接続のために同じソケットを
    /// 使い回す場合がある。spec §3/invariant 4: addr/macrosも消える）。
    pub const ON_QUIT_NC: ResetFlags = ResetFlags::from_bits_truncate(
        ResetFlags::COMMON.bits() | ResetFlags::MACRO.bits() | ResetFlags::ADDR.bits(),
    );
    /// セッション破棄時: すべてリセットする。
    pub const ON_DESTROY: ResetFlags = ResetFlags::all();
}

/// 接続全体のプロトコル状態機械。spec §4.4/§5。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// ソケットから読み取りたい（何も書くものがない）。
    ReadMore,
    /// 返信を書き込みたい。書き終えたら読み取りに戻る。
    WriteReply,
    /// 返信を書き込んだらセッションを終了する（QUITやプロトコルエラー後)。
    WriteAndDie,
    /// 書き込みも終わり、接続を閉じてよい。
    WannaDie,
}

/// 接続元アドレスの種別。CONNECTコマンドのfamilyバイトに対応する。
#[derive(Debug, Clone)]
pub enum SessionAddr {
    Inet(SocketAddr),
    Inet6(SocketAddr),
    Unix(String),
    Unknown,
}

bitflags! {
    /// spec §3「per-session flags」: `discard_on_reject`/`no_action`。
    /// config.rsのグローバル既定値からセッション生成時にコピーされ、
    /// verdict.rsの変換規則を分岐させる。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: u32 {
        const DISCARD_ON_REJECT = 0b01;
        const NO_ACTION         = 0b10;
    }
}

/// 1接続ぶんのMilterセッション状態。
#[derive(Debug)]
pub struct SessionState {
    pub id: u64,
    pub conn: ConnState,

    /// OPTNEGで確定したプロトコルバージョンと、MTAが省略してよい
    /// コマンド群（SMFIP_*）。OPTNEG完了までは`None`。
    pub negotiated: Option<(u32, Protocol)>,

    pub macros: MacroMap,

    pub hostname: Option<String>,
    pub addr: Option<SessionAddr>,

    pub helo: Option<String>,
    pub mail_from: Option<SmtpAddress>,
    pub rcpts: Vec<SmtpAddress>,

    /// このメッセージ中に見た各ヘッダ名（小文字化）の出現回数。
    /// verdict適用時の位置指定（CHGHEADER index）の基準になる。
    pub header_counts: HashMap<String, u32>,

    /// 受信順のヘッダ（name, value）。BODYEOB時にスキャン要求を
    /// 組み立てるために保持しておく。
    pub headers: Vec<(String, String)>,

    /// 受信したボディの断片をそのまま連結したもの。
    pub body: Vec<u8>,

    /// MTAへ送り返す、エンコード済みフレームのキュー。
    pub outbox: VecDeque<Vec<u8>>,

    /// spec §3: `discard_on_reject`/`no_action`。
    pub flags: SessionFlags,

    /// ホスト側が自由に使える不透明なユーザデータ（spec §3）。
    /// 核自身はこの中身を解釈しない。
    pub user_data: Option<Box<dyn Any + Send>>,
}

impl SessionState {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            conn: ConnState::ReadMore,
            negotiated: None,
            macros: MacroMap::new(),
            hostname: None,
            addr: None,
            helo: None,
            mail_from: None,
            rcpts: Vec::new(),
            header_counts: HashMap::new(),
            headers: Vec::new(),
            body: Vec::new(),
            outbox: VecDeque::new(),
            flags: SessionFlags::empty(),
            user_data: None,
        }
    }

    /// ユーザデータを入れ替え、それまで入っていた値を返す
    /// （rspamd `rspamd_milter_update_userdata`相当）。
    pub fn swap_user_data(
        &mut self,
        data: Option<Box<dyn Any + Send>>,
    ) -> Option<Box<dyn Any + Send>> {
        std::mem::replace(&mut self.user_data, data)
    }

    /// 指定された範囲の状態を初期値に戻す。
    pub fn reset(&mut self, flags: ResetFlags) {
        if flags.contains(ResetFlags::COMMON) {
            self.helo = None;
            self.mail_from = None;
            self.rcpts.clear();
            self.header_counts.clear();
            self.headers.clear();
            self.body.clear();
        }
        if flags.contains(ResetFlags::MACRO) {
            self.macros.clear();
        }
        if flags.contains(ResetFlags::ADDR) {
            self.hostname = None;
            self.addr = None;
        }
        if flags.contains(ResetFlags::IO) {
            self.outbox.clear();
        }
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated.is_some()
    }

    pub fn protocol_flags(&self) -> Protocol {
        self.negotiated.map(|(_, p)| p).unwrap_or(Protocol::empty())
    }

    pub fn note_header_seen(&mut self, name: &str) -> u32 {
        let key = name.to_ascii_lowercase();
        let count = self.header_counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }
}

/// 参照カウント付きのセッションハンドル。
///
/// `Arc`のclone/dropがそのまま参照カウントとして働くが、ホスト側の
/// コールバック境界で明示的に`retain`/`release`を呼ぶ規律を
/// コード上に残すため、薄いラッパーとして公開する。
#[derive(Clone)]
pub struct SessionHandle(Arc<Mutex<SessionState>>);

impl SessionHandle {
    pub fn new(id: u64) -> Self {
        Self(Arc::new(Mutex::new(SessionState::new(id))))
    }

    /// `config.rs`のグローバル既定値（`discard_on_reject`等）を
    /// セッション生成時点のフラグとして焼き込む。
    pub fn new_with_flags(id: u64, flags: SessionFlags) -> Self {
        let mut state = SessionState::new(id);
        state.flags = flags;
        Self(Arc::new(Mutex::new(state)))
    }

    /// 参照カウントを1つ増やした新しいハンドルを返す。
    pub fn retain(&self) -> SessionHandle {
        self.clone()
    }

    /// このハンドルの参照を手放す。最後の1つが手放されたとき
    /// `SessionState`は破棄される。
    pub fn release(self) {
        drop(self);
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.0.lock().await
    }

    /// 現在この状態を指しているハンドルの数（テスト・診断用）。
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retain_and_release_track_the_same_refcount_as_arc() {
        let handle = SessionHandle::new(1);
        assert_eq!(handle.strong_count(), 1);

        let retained = handle.retain();
        assert_eq!(handle.strong_count(), 2);

        retained.release();
        assert_eq!(handle.strong_count(), 1);
    }

    #[tokio::test]
    async fn reset_common_clears_envelope_but_keeps_macros() {
        let handle = SessionHandle::new(1);
        {
            let mut state = handle.lock().await;
            state.helo = Some("mx.example.com".to_string());
            state.mail_from = Some(crate::address::parse_smtp_address("<a@example.com>"));
            state.rcpts.push(crate::address::parse_smtp_address("<b@example.com>"));
            state.macros.insert("j", "mx.example.com");
        }

        {
            let mut state = handle.lock().await;
            state.reset(ResetFlags::ON_ABORT);
        }

        let state = handle.lock().await;
        assert!(state.helo.is_none());
        assert!(state.mail_from.is_none());
        assert!(state.rcpts.is_empty());
        assert_eq!(state.macros.get("j"), Some("mx.example.com"));
    }

    #[tokio::test]
    async fn reset_on_quit_nc_also_clears_address_and_macros() {
        let handle = SessionHandle::new(1);
        {
            let mut state = handle.lock().await;
            state.addr = Some(SessionAddr::Unix("/var/run/sendmail.sock".to_string()));
            state.hostname = Some("mx.example.com".to_string());
            state.macros.insert("j", "mx.example.com");
            state.mail_from = Some(crate::address::parse_smtp_address("<a@example.com>"));
        }

        {
            let mut state = handle.lock().await;
            state.reset(ResetFlags::ON_QUIT_NC);
        }

        let state = handle.lock().await;
        assert!(state.addr.is_none());
        assert!(state.hostname.is_none());
        assert!(state.macros.get("j").is_none());
        assert!(state.mail_from.is_none());
    }

    #[test]
    fn header_counts_increment_per_occurrence() {
        let mut state = SessionState::new(1);
        assert_eq!(state.note_header_seen("Received"), 1);
        assert_eq!(state.note_header_seen("received"), 2);
        assert_eq!(state.note_header_seen("Subject"), 1);
    }
}
