// =========================
// host.rs
// ホスト側コールバック境界（spec §6.2）
//
// 【役割】
// - io.rs（C6）がBODYEOB・QUIT・致命的エラーのタイミングで呼び出す
//   トレイト。スキャンエンジンそのものはこのクレートの外側（spec §1の
//   Out of scope）にあり、Hostの実装を差し替えることで繋ぎ込む。
// - すべての呼び出しはio.rsが`SessionHandle::retain`した上でブラケット
//   する（spec invariant 4: 「I/O callbacks bracket their work with
//   retain/release around host callbacks」）。
// =========================

use crate::error::MilterError;
use crate::session::SessionHandle;

/// BODYEOB/QUIT/致命的エラーをホストへ通知するコールバック境界。
///
/// 実装は`Send + Sync`でなければならない。複数接続が同じ`Arc<dyn Host>`
/// を共有しうるため（spec §5: セッション間で状態を共有しない核自体とは
/// 別に、ホスト実装自身がスレッドセーフである責任を負う）。
pub trait Host: Send + Sync {
    /// BODYEOBに到達した。ホストは`session`からスキャン要求を組み立て
    /// （`request::to_request`）、判定が出たら
    /// `verdict::apply_verdict`の結果をセッションのoutboxへ積んで
    /// I/Oドライバに書き込ませる。
    fn finish(&self, session: SessionHandle);

    /// 致命的エラー（プロトコル違反・I/O・タイムアウト）が発生した。
    /// セッションはこの呼び出しの直後に破棄される。
    fn error(&self, session: SessionHandle, err: MilterError);
}
