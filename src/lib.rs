// =========================
// lib.rs
// milter_core クレートルート
//
// 【役割】
// - Sendmail milterワイヤプロトコルのコア（C1〜C7, spec §2）を構成する
//   モジュール群を公開する
// - スキャンエンジン・設定ソース・IP/SMTPアドレスパーサ等、spec §1が
//   外部協力者として切り出しているものは、差し替え可能なデフォルト
//   実装（address.rs）または単純なトレイト境界（host.rs）として提供する
// =========================

pub mod address;
pub mod command;
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod host;
pub mod io;
pub mod logging;
pub mod macros;
pub mod parser;
pub mod reply;
pub mod request;
pub mod session;
pub mod verdict;

pub use command::{dispatch, Dispatched};
pub use error::{MilterError, ProtocolError, VerdictError};
pub use host::Host;
pub use io::{attach, SessionsCache};
pub use reply::Action;
pub use request::{to_request, ScanRequest};
pub use session::{SessionHandle, SessionState};
pub use verdict::{apply_verdict, deliver_verdict_json, MilterBlock, SpamHeaderOverride, Verdict};
