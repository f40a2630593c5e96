// =========================
// command.rs
// Milterコマンドディスパッチャ（C3）
//
// 【役割】
// - parser.rs（C2）が切り出した`(cmd, payload)`を、コマンドごとの
//   意味論に従って解釈し、session.rs（C4）の状態を更新する
// - 応答が必要なコマンドについては`reply.rs`（C5）のActionを
//   session.outboxに積む
//
// 【grounding】
// 各コマンドのペイロード解釈はexamples/original_source/src/libserver/
// milter.cの`rspamd_milter_process_command`に対応する。MAIL/RCPTの
// 末尾バイトの扱い、HELOのNUL終端有無、CONNECTの"IPv6:"リテラル剥がし
// などはDesign NotesのOpen Question解決に従う。
// =========================

use std::net::{IpAddr, SocketAddr};

use crate::address::parse_smtp_address;
use crate::constants::{cmd, family, Protocol};
use crate::error::ProtocolError;
use crate::reply::Action;
use crate::session::{ResetFlags, SessionAddr, SessionState};

/// コマンド処理の結果、I/Oドライバ（io.rs）が次に取るべき行動。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// このコマンドは処理済み。必要な応答があれば`outbox`に積んである。
    /// そのまま次のコマンドを読み進めてよい。
    Continue,
    /// BODYEOBに到達した。ホストに判定を問い合わせ、その結果
    /// （verdict.rs）を適用してから応答を送る必要がある。
    NeedsVerdict,
    /// QUITを受け取った。応答は送らず、接続を閉じる。
    Quit,
}

/// 1つの`(cmd, payload)`をセッション状態に適用する。
pub fn dispatch(
    state: &mut SessionState,
    command: u8,
    payload: &[u8],
) -> Result<Dispatched, ProtocolError> {
    if command != cmd::OPTNEG && command != cmd::MACRO && !state.is_negotiated() {
        return Err(ProtocolError::BeforeOptNeg(command));
    }

    match command {
        cmd::OPTNEG => handle_optneg(state, payload),
        cmd::MACRO => handle_macro(state, payload),
        cmd::CONNECT => handle_connect(state, payload),
        cmd::HELO => handle_helo(state, payload),
        cmd::MAIL => handle_mail(state, payload),
        cmd::RCPT => handle_rcpt(state, payload),
        cmd::DATA => handle_data(state),
        cmd::HEADER => handle_header(state, payload),
        cmd::EOH => handle_eoh(state),
        cmd::BODY => handle_body(state, payload),
        cmd::BODYEOB => handle_bodyeob(state, payload),
        cmd::ABORT => handle_abort(state),
        cmd::QUIT_NC => handle_quit_nc(state),
        cmd::QUIT => handle_quit(state),
        cmd::UNKNOWN => handle_unknown(state),
        other => Err(ProtocolError::UnknownCommand(other)),
    }
}

/// `payload`からNUL区切りの部分列を取り出す。末尾の空要素（終端NULの
/// 結果）だけは取り除くが、途中の空文字列（値が空のマクロなど）は残す。
fn split_nul(payload: &[u8]) -> Vec<&[u8]> {
    let mut parts: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
    if parts.last().is_some_and(|s| s.is_empty()) {
        parts.pop();
    }
    parts
}

fn handle_optneg(state: &mut SessionState, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
    if payload.len() != 12 {
        return Err(ProtocolError::InvalidOptNeg(payload.len()));
    }

    let offered_version = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

    if offered_version < crate::constants::PROTO_MIN {
        return Err(ProtocolError::UnsupportedVersion {
            offered: offered_version,
            minimum: crate::constants::PROTO_MIN,
        });
    }

    // milter.c:653 `version = RSPAMD_MILTER_PROTO_VER;`: once the MTA's
    // offer clears PROTO_MIN, the reply always carries this core's own
    // fixed version, never the offered one.
    let negotiated_version = crate::constants::PROTO_VERSION;

    // 常にNOREPLY_MASKを宣言する: MTAが何を申告してきたかに関わらず、
    // このコアは全コマンドについて個別ACKを省略してよいと約束する
    // （spec §4.3: "declare all supported modifications and suppress
    // per-command acknowledgements"）。NOREPLY_MASKはNO_HDRS/NO_BODYを
    // 含まないので、ヘッダ・ボディは引き続き必ず受け取る。
    let protocol = Protocol::from_bits_truncate(crate::constants::NOREPLY_MASK);

    state.negotiated = Some((negotiated_version, protocol));

    state.outbox.push_back(
        Action::OptNeg {
            version: negotiated_version,
            actions: crate::constants::ACTIONS_MASK,
            protocol: protocol.bits(),
        }
        .encode(),
    );

    Ok(Dispatched::Continue)
}

fn handle_macro(state: &mut SessionState, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::InvalidMacro("missing leading command byte"));
    }
    // payload[0]はこのマクロ群が前置されるコマンドのコード。どのコマンドの
    // 前触れかに関わらずマクロマップへの反映は同じなので、ここでは読み
    // 捨てる。
    let pairs = split_nul(&payload[1..]);
    let mut it = pairs.into_iter();
    while let (Some(name), Some(value)) = (it.next(), it.next()) {
        let name = String::from_utf8_lossy(name);
        let value = String::from_utf8_lossy(value);
        // milter.c L475-478: {mail_host} additionally seeds the client
        // hostname, independent of whatever CONNECT reported. The wire
        // name carries its enclosing braces, it is not the bare word.
        if name.eq_ignore_ascii_case("{mail_host}") {
            state.hostname = Some(value.to_string());
        }
        state.macros.insert(&name, &value);
    }
    Ok(Dispatched::Continue)
}

fn handle_connect(state: &mut SessionState, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
    let parts = split_nul(payload);
    if parts.is_empty() {
        return Err(ProtocolError::InvalidConnect("missing hostname"));
    }
    let hostname = String::from_utf8_lossy(parts[0]).to_string();

    // ホスト名の直後にNUL終端文字列の一部として現れないfamilyバイトを
    // 取り出すため、生payloadでの位置を再計算する。
    let after_hostname = parts[0].len() + 1;
    if after_hostname >= payload.len() {
        return Err(ProtocolError::InvalidConnect("missing address family"));
    }
    let fam = payload[after_hostname];
    let mut cursor = after_hostname + 1;

    let addr = match fam {
        family::UNKNOWN => SessionAddr::Unknown,
        family::UNIX => {
            let path = parts.get(1).map(|s| String::from_utf8_lossy(s).to_string());
            SessionAddr::Unix(path.unwrap_or_default())
        }
        family::INET | family::INET6 => {
            if cursor + 2 > payload.len() {
                return Err(ProtocolError::InvalidConnect("truncated port"));
            }
            let port = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]);
            cursor += 2;
            let addr_str = payload[cursor..]
                .split(|&b| b == 0)
                .next()
                .unwrap_or(&[]);
            let mut addr_str = String::from_utf8_lossy(addr_str).to_string();
            // rspamdのmilter.cと同様、"IPv6:"リテラルプレフィックスを
            // 剥がしてから解析する。
            if let Some(stripped) = addr_str.strip_prefix("IPv6:") {
                addr_str = stripped.to_string();
            }
            let ip: IpAddr = addr_str
                .parse()
                .map_err(|_| ProtocolError::InvalidConnect("unparsable address literal"))?;
            let socket = SocketAddr::new(ip, port);
            if fam == family::INET {
                SessionAddr::Inet(socket)
            } else {
                SessionAddr::Inet6(socket)
            }
        }
        _ => return Err(ProtocolError::InvalidConnect("unknown address family byte")),
    };

    state.hostname = Some(hostname);
    state.addr = Some(addr);

    reply_unless(state, Protocol::NR_CONN, Action::Continue);
    Ok(Dispatched::Continue)
}

fn handle_helo(state: &mut SessionState, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
    // Open Question解決: NUL終端の有無どちらも受理する。
    let raw = if payload.last() == Some(&0) {
        &payload[..payload.len() - 1]
    } else {
        payload
    };
    state.helo = Some(String::from_utf8_lossy(raw).to_string());
    reply_unless(state, Protocol::NR_HELO, Action::Continue);
    Ok(Dispatched::Continue)
}

fn first_nul_terminated(payload: &[u8]) -> String {
    // Open Question解決: MAIL/RCPTはESMTPパラメータを無視し、最初のNULまで
    // だけをアドレスとして扱う。
    let raw = payload.split(|&b| b == 0).next().unwrap_or(&[]);
    String::from_utf8_lossy(raw).to_string()
}

fn handle_mail(state: &mut SessionState, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
    state.mail_from = Some(parse_smtp_address(&first_nul_terminated(payload)));
    reply_unless(state, Protocol::NR_MAIL, Action::Continue);
    Ok(Dispatched::Continue)
}

fn handle_rcpt(state: &mut SessionState, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
    state
        .rcpts
        .push(parse_smtp_address(&first_nul_terminated(payload)));
    reply_unless(state, Protocol::NR_RCPT, Action::Continue);
    Ok(Dispatched::Continue)
}

fn handle_data(state: &mut SessionState) -> Result<Dispatched, ProtocolError> {
    reply_unless(state, Protocol::NR_DATA, Action::Continue);
    Ok(Dispatched::Continue)
}

fn handle_header(state: &mut SessionState, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
    let parts = split_nul(payload);
    if parts.is_empty() {
        return Err(ProtocolError::InvalidHeader("missing header name"));
    }
    let name = String::from_utf8_lossy(parts[0]).to_string();
    let value = parts
        .get(1)
        .map(|v| String::from_utf8_lossy(v).to_string())
        .unwrap_or_default();

    state.note_header_seen(&name);
    state.headers.push((name, value));

    reply_unless(state, Protocol::NR_HDR, Action::Continue);
    Ok(Dispatched::Continue)
}

fn handle_eoh(state: &mut SessionState) -> Result<Dispatched, ProtocolError> {
    reply_unless(state, Protocol::NR_EOH, Action::Continue);
    Ok(Dispatched::Continue)
}

fn handle_body(state: &mut SessionState, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
    state.body.extend_from_slice(payload);
    reply_unless(state, Protocol::NR_BODY, Action::Continue);
    Ok(Dispatched::Continue)
}

fn handle_bodyeob(state: &mut SessionState, payload: &[u8]) -> Result<Dispatched, ProtocolError> {
    if !payload.is_empty() {
        state.body.extend_from_slice(payload);
    }
    // 応答はホストの判定を受け取ってから送るので、ここでは何も積まない。
    Ok(Dispatched::NeedsVerdict)
}

fn handle_abort(state: &mut SessionState) -> Result<Dispatched, ProtocolError> {
    state.reset(ResetFlags::ON_ABORT);
    Ok(Dispatched::Continue)
}

fn handle_quit_nc(state: &mut SessionState) -> Result<Dispatched, ProtocolError> {
    state.reset(ResetFlags::ON_QUIT_NC);
    Ok(Dispatched::Continue)
}

fn handle_quit(state: &mut SessionState) -> Result<Dispatched, ProtocolError> {
    state.conn = crate::session::ConnState::WannaDie;
    Ok(Dispatched::Quit)
}

fn handle_unknown(state: &mut SessionState) -> Result<Dispatched, ProtocolError> {
    reply_unless(state, Protocol::NR_UNKNOWN, Action::Continue);
    Ok(Dispatched::Continue)
}

/// ネゴシエーション済みプロトコルフラグに`flag`が立っていなければ
/// `action`を応答キューに積む。
fn reply_unless(state: &mut SessionState, flag: Protocol, action: Action) {
    let suppressed = state.protocol_flags().contains(flag);
    if !suppressed {
        state.outbox.push_back(action.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiate(state: &mut SessionState) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&6u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        dispatch(state, cmd::OPTNEG, &payload).unwrap();
        state.outbox.clear();
    }

    #[test]
    fn commands_before_optneg_are_fatal() {
        let mut state = SessionState::new(1);
        let err = dispatch(&mut state, cmd::HELO, b"mx\0").unwrap_err();
        assert!(matches!(err, ProtocolError::BeforeOptNeg(cmd::HELO)));
    }

    #[test]
    fn macro_before_optneg_is_allowed() {
        let mut state = SessionState::new(1);
        let mut payload = vec![cmd::HELO];
        payload.extend_from_slice(b"{mail_host}\0mx.example\0");
        let dispatched = dispatch(&mut state, cmd::MACRO, &payload).unwrap();
        assert_eq!(dispatched, Dispatched::Continue);
        assert_eq!(state.hostname.as_deref(), Some("mx.example"));
    }

    #[test]
    fn optneg_always_declares_noreply_mask_regardless_of_offer() {
        let mut state = SessionState::new(1);
        let mut payload = Vec::new();
        payload.extend_from_slice(&6u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&(Protocol::NO_HDRS.bits() | Protocol::NO_BODY.bits()).to_be_bytes());
        dispatch(&mut state, cmd::OPTNEG, &payload).unwrap();
        let (_, proto) = state.negotiated.unwrap();
        assert_eq!(proto.bits(), crate::constants::NOREPLY_MASK);
        assert!(!proto.contains(Protocol::NO_HDRS));
        assert!(!proto.contains(Protocol::NO_BODY));
    }

    #[test]
    fn optneg_reply_protocol_field_is_noreply_mask() {
        let mut state = SessionState::new(1);
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        dispatch(&mut state, cmd::OPTNEG, &payload).unwrap();
        let frame = state.outbox.pop_front().unwrap();
        let expected = crate::reply::Action::OptNeg {
            version: crate::constants::PROTO_VERSION,
            actions: crate::constants::ACTIONS_MASK,
            protocol: crate::constants::NOREPLY_MASK,
        }
        .encode();
        assert_eq!(frame, expected);
    }

    #[test]
    fn optneg_always_replies_with_our_own_fixed_version() {
        let mut state = SessionState::new(1);
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        dispatch(&mut state, cmd::OPTNEG, &payload).unwrap();
        let (negotiated_version, _) = state.negotiated.unwrap();
        assert_eq!(negotiated_version, crate::constants::PROTO_VERSION);
    }

    #[test]
    fn unsupported_version_is_fatal() {
        let mut state = SessionState::new(1);
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        let err = dispatch(&mut state, cmd::OPTNEG, &payload).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion { .. }));
    }

    #[test]
    fn mail_and_rcpt_stop_at_first_nul() {
        let mut state = SessionState::new(1);
        negotiate(&mut state);
        dispatch(&mut state, cmd::MAIL, b"<a@example.com>\0SIZE=100\0").unwrap();
        assert_eq!(
            state.mail_from.as_ref().map(|a| a.raw.as_str()),
            Some("<a@example.com>")
        );

        dispatch(&mut state, cmd::RCPT, b"<b@example.com>\0NOTIFY=NEVER\0").unwrap();
        assert_eq!(
            state.rcpts,
            vec![parse_smtp_address("<b@example.com>")]
        );
    }

    #[test]
    fn helo_accepts_both_terminated_and_unterminated() {
        let mut state = SessionState::new(1);
        negotiate(&mut state);
        dispatch(&mut state, cmd::HELO, b"mx.example.com\0").unwrap();
        assert_eq!(state.helo.as_deref(), Some("mx.example.com"));

        dispatch(&mut state, cmd::HELO, b"mx2.example.com").unwrap();
        assert_eq!(state.helo.as_deref(), Some("mx2.example.com"));
    }

    #[test]
    fn connect_strips_ipv6_literal_prefix() {
        let mut state = SessionState::new(1);
        negotiate(&mut state);
        let mut payload = Vec::new();
        payload.extend_from_slice(b"mx.example.com\0");
        payload.push(family::INET6);
        payload.extend_from_slice(&25u16.to_be_bytes());
        payload.extend_from_slice(b"IPv6:::1\0");
        dispatch(&mut state, cmd::CONNECT, &payload).unwrap();
        match state.addr {
            Some(SessionAddr::Inet6(addr)) => {
                assert_eq!(addr.port(), 25);
                assert_eq!(addr.ip().to_string(), "::1");
            }
            other => panic!("unexpected addr: {other:?}"),
        }
    }

    #[test]
    fn header_counts_support_later_position_math() {
        let mut state = SessionState::new(1);
        negotiate(&mut state);
        dispatch(&mut state, cmd::HEADER, b"Received\0one\0").unwrap();
        dispatch(&mut state, cmd::HEADER, b"Received\0two\0").unwrap();
        assert_eq!(state.header_counts.get("received"), Some(&2));
        assert_eq!(state.headers.len(), 2);
    }

    #[test]
    fn bodyeob_requests_verdict_instead_of_replying() {
        let mut state = SessionState::new(1);
        negotiate(&mut state);
        let outcome = dispatch(&mut state, cmd::BODYEOB, b"tail").unwrap();
        assert_eq!(outcome, Dispatched::NeedsVerdict);
        assert!(state.outbox.is_empty());
        assert_eq!(state.body, b"tail");
    }

    #[test]
    fn abort_resets_envelope_but_not_macros() {
        let mut state = SessionState::new(1);
        negotiate(&mut state);
        dispatch(&mut state, cmd::MAIL, b"<a@example.com>\0").unwrap();
        state.macros.insert("j", "mx.example.com");
        dispatch(&mut state, cmd::ABORT, &[]).unwrap();
        assert!(state.mail_from.is_none());
        assert_eq!(state.macros.get("j"), Some("mx.example.com"));
    }

    #[test]
    fn quit_transitions_to_wanna_die_with_no_reply() {
        let mut state = SessionState::new(1);
        negotiate(&mut state);
        let outcome = dispatch(&mut state, cmd::QUIT, &[]).unwrap();
        assert_eq!(outcome, Dispatched::Quit);
        assert!(state.outbox.is_empty());
        assert_eq!(state.conn, crate::session::ConnState::WannaDie);
    }
}
