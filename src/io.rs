// =========================
// io.rs
// I/Oドライバ（C6）: イベントループ統合・読み書きポンプ・タイムアウト
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期TCP通信・タイムアウト・シャットダウン通知
//   （teacherの`client.rs`が使っていたのと同じ
//   `tokio::time::timeout` + `tokio::select!` + `broadcast::Receiver`の
//   組み合わせを踏襲する）
//
// 【役割】
// - 1接続につき1 tokioタスクを駆動し、parser.rs（C2）へバイト列を
//   供給し、command.rs（C3）の結果に応じてhost.rs（C6→host境界）を
//   呼び出し、session.rsのoutboxを書き出す
// - spec §4.6「Scheduling model」：協調的シングルスレッド、core自体は
//   ブロッキングsyscallを行わない
//
// 【design note】
// spec §4.6はepoll風の`arm(socket, interest, timeout)`抽象を述べているが、
// tokioの`AsyncRead`/`AsyncWrite` + `select!`はその抽象を暗黙に実現して
// いるため、明示的なR/W/Interest状態機械は導入しない（teacherの
// `client.rs`も素直なasync/awaitループだった）。`ConnState`
// （session.rs）がspec §4.3の接続状態機械そのものを保持する。
// =========================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};

use crate::command::{self, Dispatched};
use crate::error::MilterError;
use crate::host::Host;
use crate::parser::Parser;
use crate::session::{ConnState, SessionFlags, SessionHandle};

/// 初回読み取りバッファの基準サイズ。パーサ自身がamortized doublingで
/// 伸長するため、ここは単なる出発点。
const INITIAL_READ_SIZE: usize = 8192;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// 生存中のセッションを`id`で引けるようにする、任意のセッションキャッシュ
/// （spec §4.4「unregisters from an optional sessions-cache」）。
/// coreはこのキャッシュの中身を解釈しない。
pub type SessionsCache = Arc<Mutex<std::collections::HashMap<u64, SessionHandle>>>;

/// `stream`の所有権を引き取り、セッションを生成してバックグラウンドで
/// 読み取りを開始する（spec §6.2 `attach`）。
///
/// 返された[`SessionHandle`]はホスト側が`retain`/`release`するための
/// ものであり、接続処理そのものは内部でspawnされたタスクが担う。
pub fn attach(
    stream: TcpStream,
    timeout: Duration,
    flags: SessionFlags,
    host: Arc<dyn Host>,
    shutdown_rx: broadcast::Receiver<()>,
    cache: Option<SessionsCache>,
) -> SessionHandle {
    let id = next_session_id();
    let handle = SessionHandle::new_with_flags(id, flags);
    let task_handle = handle.retain();

    if let Some(cache) = cache.clone() {
        let handle_for_cache = handle.retain();
        tokio::spawn(async move {
            cache.lock().await.insert(id, handle_for_cache);
        });
    }

    tokio::spawn(run_connection(
        stream,
        timeout,
        task_handle,
        host,
        shutdown_rx,
        cache,
        id,
    ));

    handle
}

async fn run_connection(
    mut stream: TcpStream,
    timeout: Duration,
    session: SessionHandle,
    host: Arc<dyn Host>,
    mut shutdown_rx: broadcast::Receiver<()>,
    cache: Option<SessionsCache>,
    id: u64,
) {
    let mut parser = Parser::new();
    let mut read_buf = vec![0u8; INITIAL_READ_SIZE];

    let outcome = loop {
        if let Err(err) = drain_outbox(&mut stream, &session).await {
            break Err(err);
        }

        let conn = session.lock().await.conn;
        if conn == ConnState::WannaDie || conn == ConnState::WriteAndDie {
            break Ok(());
        }

        let read_result = tokio::select! {
            res = tokio::time::timeout(timeout, stream.read(&mut read_buf)) => res,
            _ = shutdown_rx.recv() => {
                break Ok(());
            }
        };

        let n = match read_result {
            Ok(Ok(0)) => break Err(MilterError::UnexpectedEof),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => break Err(MilterError::Io(e)),
            Err(_) => break Err(MilterError::Timeout),
        };

        parser.feed(&read_buf[..n]);

        match pump_parser(&mut parser, &session, &host).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(err) => break Err(err),
        }

        parser.compact();
    };

    if let Some(cache) = cache {
        cache.lock().await.remove(&id);
    }

    match outcome {
        Ok(()) => host.finish(session),
        Err(err) => host.error(session, err),
    }
}

/// バッファに貯まっているだけコマンドを取り出し、ディスパッチする。
///
/// `Ok(true)`なら読み取りを継続してよい。`Ok(false)`なら接続を正常に
/// 終了してよい（QUITで即破棄、またはBODYEOBでホストに処理を委譲した
/// 後の継続読み取りはhost側の責務）。
async fn pump_parser(
    parser: &mut Parser,
    session: &SessionHandle,
    host: &Arc<dyn Host>,
) -> Result<bool, MilterError> {
    loop {
        // parser.poll()はバッファへの参照を返すため、デコードした
        // (cmd, payload)をコピーしてからロックを取り直す
        // （ロックガードをawaitの外に出す設計と両立させるため）。
        let decoded = match parser.poll() {
            Ok(Some((cmd, payload))) => Some((cmd, payload.to_vec())),
            Ok(None) => None,
            Err(e) => return Err(MilterError::Protocol(e)),
        };

        let Some((cmd, payload)) = decoded else {
            return Ok(true);
        };

        let mut state = session.lock().await;
        let dispatched = command::dispatch(&mut state, cmd, &payload);
        match dispatched {
            Ok(Dispatched::Continue) => continue,
            Ok(Dispatched::NeedsVerdict) => {
                drop(state);
                host.finish(session.retain());
                continue;
            }
            Ok(Dispatched::Quit) => {
                let should_drain = !state.outbox.is_empty();
                if should_drain {
                    state.conn = ConnState::WriteAndDie;
                    return Ok(true);
                }
                return Ok(false);
            }
            Err(e) => {
                state.conn = ConnState::WannaDie;
                return Err(MilterError::Protocol(e));
            }
        }
    }
}

/// セッションのoutboxを先頭から全て書き出す（spec invariant 3:
/// FIFO順、部分書き込みでも順序を崩さない。tokioの`write_all`が
/// バッファ単位の部分書き込みを内部で吸収するので、ここでは
/// フレーム単位の順序保証だけを見ればよい）。
async fn drain_outbox(
    stream: &mut TcpStream,
    session: &SessionHandle,
) -> Result<(), MilterError> {
    loop {
        let next = {
            let mut state = session.lock().await;
            state.outbox.pop_front()
        };
        let Some(frame) = next else {
            return Ok(());
        };
        stream.write_all(&frame).await.map_err(MilterError::Io)?;
    }
}

