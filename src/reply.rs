// =========================
// reply.rs
// MTAへ送り返すアクションの型と配線（C5: Reply builder）
//
// 【役割】
// - spec §4.5の応答アクション一覧を、ワイヤ表現を知っている型として表現
// - `Action::encode`でフレーム（C1: frame.rs）に変換する
//
// 【grounding】
// ペイロードレイアウトはexamples/original_source/src/libserver/milter.c
// の`rspamd_milter_send_action`/`SET_COMMAND`マクロに正確に対応させてある
// （CHGHEADER/INSHEADERのindexはu32be、ADDHEADERにはindexがない、等）。
// =========================

use crate::constants::reply;
use crate::frame::encode_frame;

/// MTAへ送り返す1つのアクション。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// メッセージを受理する。以降このトランザクションでは何もしない。
    Accept,
    /// 次のコマンドを送ってよい（フィルタからは何もしない）。
    Continue,
    /// メッセージを静かに破棄する（送信者には成功したように見せる）。
    Discard,
    /// デフォルトのSMTPエラーコードで拒否する。
    Reject,
    /// 一時エラーとして拒否する（再送を促す）。
    TempFail,
    /// `"XYZ free-text"`形式のSMTP応答コードを指定して拒否する。
    ReplyCode(String),
    /// 処理に時間がかかることをMTAに伝え、タイムアウトを延長させる。
    Progress,
    /// ヘッダを末尾に追加する（既存の同名ヘッダには触れない）。
    AddHeader { name: String, value: String },
    /// `index`番目（1始まり）の同名ヘッダを変更・削除する。
    /// `value`が`None`ならそのヘッダを削除する。
    ChgHeader {
        index: u32,
        name: String,
        value: Option<String>,
    },
    /// `index`番目の位置に新しい同名ヘッダを挿入する。
    InsHeader {
        index: u32,
        name: String,
        value: String,
    },
    /// エンベロープ差出人を変更する。
    ChgFrom {
        from: String,
        esmtp_args: Option<String>,
    },
    /// エンベロープ受信者を追加する。
    AddRcpt { rcpt: String },
    /// エンベロープ受信者を削除する。
    DelRcpt { rcpt: String },
    /// OPTNEGネゴシエーション応答。
    OptNeg {
        version: u32,
        actions: u32,
        protocol: u32,
    },
}

impl Action {
    /// このアクションをワイヤフレーム（長さ+コマンド+ペイロード）に
    /// エンコードする。
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Action::Accept => encode_frame(reply::ACCEPT, &[]),
            Action::Continue => encode_frame(reply::CONTINUE, &[]),
            Action::Discard => encode_frame(reply::DISCARD, &[]),
            Action::Reject => encode_frame(reply::REJECT, &[]),
            Action::TempFail => encode_frame(reply::TEMPFAIL, &[]),
            Action::Progress => encode_frame(reply::PROGRESS, &[]),

            Action::ReplyCode(code) => {
                let mut payload = code.as_bytes().to_vec();
                payload.push(0);
                encode_frame(reply::REPLYCODE, &payload)
            }

            Action::AddHeader { name, value } => {
                let mut payload = Vec::with_capacity(name.len() + value.len() + 2);
                payload.extend_from_slice(name.as_bytes());
                payload.push(0);
                payload.extend_from_slice(value.as_bytes());
                payload.push(0);
                encode_frame(reply::ADDHEADER, &payload)
            }

            Action::ChgHeader { index, name, value } => {
                let value = value.as_deref().unwrap_or("");
                let mut payload = Vec::with_capacity(4 + name.len() + value.len() + 2);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(name.as_bytes());
                payload.push(0);
                payload.extend_from_slice(value.as_bytes());
                payload.push(0);
                encode_frame(reply::CHGHEADER, &payload)
            }

            Action::InsHeader { index, name, value } => {
                let mut payload = Vec::with_capacity(4 + name.len() + value.len() + 2);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(name.as_bytes());
                payload.push(0);
                payload.extend_from_slice(value.as_bytes());
                payload.push(0);
                encode_frame(reply::INSHEADER, &payload)
            }

            Action::ChgFrom { from, esmtp_args } => {
                let mut payload = from.as_bytes().to_vec();
                payload.push(0);
                if let Some(args) = esmtp_args {
                    payload.extend_from_slice(args.as_bytes());
                }
                payload.push(0);
                encode_frame(reply::CHGFROM, &payload)
            }

            Action::AddRcpt { rcpt } => {
                let mut payload = rcpt.as_bytes().to_vec();
                payload.push(0);
                encode_frame(reply::ADDRCPT, &payload)
            }

            Action::DelRcpt { rcpt } => {
                let mut payload = rcpt.as_bytes().to_vec();
                payload.push(0);
                encode_frame(reply::DELRCPT, &payload)
            }

            Action::OptNeg {
                version,
                actions,
                protocol,
            } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&version.to_be_bytes());
                payload.extend_from_slice(&actions.to_be_bytes());
                payload.extend_from_slice(&protocol.to_be_bytes());
                encode_frame(reply::OPTNEG, &payload)
            }
        }
    }

    /// `"xcode rcode reply"`形式のSMTP応答コード文字列を組み立てて
    /// REPLYCODEアクションにする（`rspamd_milter_set_reply`相当）。
    /// reject/soft rejectの両方がこのヘルパーを共有する。
    pub fn replycode_for(code_prefix: &str, text: &str) -> Action {
        Action::ReplyCode(format!("{code_prefix} {text}"))
    }

    /// このアクションの後、接続を継続してよいか（`false`なら
    /// `WriteAndDie`へ遷移すべき終端アクション）。
    pub fn terminates_transaction(&self) -> bool {
        matches!(
            self,
            Action::Accept
                | Action::Discard
                | Action::Reject
                | Action::TempFail
                | Action::ReplyCode(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chgheader_removal_encodes_empty_value() {
        let action = Action::ChgHeader {
            index: 1,
            name: "X-Spam".to_string(),
            value: None,
        };
        let frame = action.encode();
        assert_eq!(frame[4], reply::CHGHEADER);
        // index(4) + "X-Spam\0" + "\0"
        assert_eq!(frame.len(), 5 + 4 + "X-Spam".len() + 1 + 1);
        assert_eq!(&frame[9..9 + 4], &1u32.to_be_bytes());
    }

    #[test]
    fn addheader_has_no_index() {
        let action = Action::AddHeader {
            name: "X-Spam".to_string(),
            value: "Yes".to_string(),
        };
        let frame = action.encode();
        assert_eq!(frame[4], reply::ADDHEADER);
        assert_eq!(&frame[5..], b"X-Spam\0Yes\0");
    }

    #[test]
    fn optneg_payload_is_three_be_words() {
        let action = Action::OptNeg {
            version: 6,
            actions: 0x1ff,
            protocol: 0,
        };
        let frame = action.encode();
        assert_eq!(frame.len(), 4 + 1 + 12);
        assert_eq!(&frame[5..9], &6u32.to_be_bytes());
        assert_eq!(&frame[9..13], &0x1ffu32.to_be_bytes());
        assert_eq!(&frame[13..17], &0u32.to_be_bytes());
    }

    #[test]
    fn replycode_for_joins_code_and_text() {
        assert_eq!(
            Action::replycode_for("554 5.7.1", "no"),
            Action::ReplyCode("554 5.7.1 no".to_string())
        );
    }

    #[test]
    fn terminal_actions_are_marked() {
        assert!(Action::Accept.terminates_transaction());
        assert!(!Action::Continue.terminates_transaction());
        assert!(!Action::AddHeader {
            name: "X".into(),
            value: "Y".into()
        }
        .terminates_transaction());
    }
}
