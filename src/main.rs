// =========================
// main.rs
// milter_core デモサーバーバイナリ
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期TCPサーバ・シグナル・ブロードキャスト（net::TcpListener,
//   sync::broadcast, signal::unix）
// - std: スレッド安全な参照カウント・ロック（Arc, RwLock）
//
// 【役割】
// - サーバー起動・設定管理・クライアント接続受付・シグナル処理
//   （teacherの`main.rs`の再起動ループ・SIGHUP/SIGTERM構成をそのまま
//   踏襲する）
// - 実際のスキャンは行わず、常にACCEPTするスタブ`Host`を繋いだ
//   デモ配線（spec §1: スキャンエンジンはこのcrateの外側）
// =========================

use std::sync::{Arc, RwLock};

use milter_core::host::Host;
use milter_core::session::SessionHandle;
use milter_core::{config, io, MilterError};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
#[cfg(windows)]
use tokio::signal::windows::{ctrl_break, ctrl_c};
use tokio::{net::TcpListener, sync::broadcast};

/// 常にACCEPTするデモ用ホスト。BODYEOBを受けたら`Verdict::default()`
/// （`no action`）を`apply_verdict`へ通し、その結果をoutboxへ積む。
struct AcceptAllHost {
    spam_header: String,
    discard_on_reject: bool,
}

impl Host for AcceptAllHost {
    fn finish(&self, session: SessionHandle) {
        let spam_header = self.spam_header.clone();
        let discard_on_reject = self.discard_on_reject;
        tokio::spawn(async move {
            let mut state = session.lock().await;
            if state.conn == milter_core::session::ConnState::WannaDie {
                return;
            }
            let verdict = milter_core::Verdict::default();
            let actions =
                milter_core::apply_verdict(&state, &verdict, &spam_header, discard_on_reject);
            for action in actions {
                state.outbox.push_back(action.encode());
            }
            state.conn = milter_core::session::ConnState::WriteReply;
        });
    }

    fn error(&self, _session: SessionHandle, err: MilterError) {
        milter_core::printdaytimeln!("セッションエラー: {}", err);
    }
}

/// 非同期メイン関数（Tokioランタイム）
/// - サーバー起動・設定管理・クライアント接続受付・シグナル処理
#[tokio::main]
async fn main() {
    // 設定をスレッド安全に共有（Arc+RwLock）
    let shared_config = Arc::new(RwLock::new(config::load_config()));
    // サーバー再起動・終了通知用ブロードキャストチャネル
    let (shutdown_tx, _) = broadcast::channel::<()>(100);

    #[cfg(unix)]
    {
        let shared_config = Arc::clone(&shared_config);
        let shutdown_tx_hup = shutdown_tx.clone();
        let shutdown_tx_term = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut hup = signal(SignalKind::hangup()).expect("SIGHUP登録失敗");
            while hup.recv().await.is_some() {
                milter_core::printdaytimeln!("SIGHUP受信: 設定ファイル再読込");
                let new_config = config::load_config();
                *shared_config.write().unwrap() = new_config;
                let _ = shutdown_tx_hup.send(());
            }
        });
        tokio::spawn(async move {
            let mut term = signal(SignalKind::terminate()).expect("SIGTERM登録失敗");
            while term.recv().await.is_some() {
                milter_core::printdaytimeln!("SIGTERM受信: サーバー安全終了");
                let _ = shutdown_tx_term.send(());
                std::process::exit(0);
            }
        });
    }

    #[cfg(windows)]
    {
        let shared_config = Arc::clone(&shared_config);
        let shutdown_tx_ctrl_c = shutdown_tx.clone();
        let shutdown_tx_ctrl_break = shutdown_tx.clone();

        tokio::spawn(async move {
            let mut ctrl_c_signal = ctrl_c().expect("Ctrl+C登録失敗");
            while ctrl_c_signal.recv().await.is_some() {
                milter_core::printdaytimeln!("Ctrl+C受信: 設定ファイル再読込");
                let new_config = config::load_config();
                *shared_config.write().unwrap() = new_config;
                let _ = shutdown_tx_ctrl_c.send(());
            }
        });

        tokio::spawn(async move {
            let mut ctrl_break_signal = ctrl_break().expect("Ctrl+Break登録失敗");
            while ctrl_break_signal.recv().await.is_some() {
                milter_core::printdaytimeln!("Ctrl+Break受信: サーバー安全終了");
                let _ = shutdown_tx_ctrl_break.send(());
                std::process::exit(0);
            }
        });
    }

    loop {
        let current_config = shared_config.read().unwrap().clone();
        milter_core::printdaytimeln!("設定読込: {}", current_config.address);
        let listener = match TcpListener::bind(&current_config.address).await {
            Ok(listener) => {
                milter_core::printdaytimeln!("待受開始: {}", current_config.address);
                listener
            }
            Err(e) => {
                eprintln!(
                    "ポートバインド失敗: {}\n他プロセスが {} 使用中?",
                    e, current_config.address
                );
                std::process::exit(1);
            }
        };

        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                Ok((stream, addr)) = listener.accept() => {
                    milter_core::printdaytimeln!("接続: {}", addr);
                    let config = shared_config.read().unwrap().clone();
                    let host: Arc<dyn Host> = Arc::new(AcceptAllHost {
                        spam_header: config.spam_header.clone(),
                        discard_on_reject: config.discard_on_reject,
                    });
                    let _session = io::attach(
                        stream,
                        std::time::Duration::from_secs(config.client_timeout),
                        config.session_flags(),
                        host,
                        shutdown_tx.subscribe(),
                        None,
                    );
                }
                _ = shutdown_rx.recv() => {
                    milter_core::printdaytimeln!("再起動のためリスナー再バインド");
                    break;
                }
            }
        }
    }
}
