// =========================
// request.rs
// BODYEOB時のスキャン要求組み立て（spec §6.2 `to_request`）
//
// 【役割】
// - セッションのエンベロープ・マクロ・メッセージ本体から、下流の
//   スキャンエンジンへ渡す構造化リクエストを1つ組み立てる
// - このクレート自身はHTTPクライアントを持たない（spec §1: 「the HTTP
//   request value consumed downstream」は外部協力者）。ここで作るのは
//   その値そのものであって、送信はホスト側の責務。
// =========================

use crate::session::SessionState;

/// BODYEOB時に組み立てる、下流スキャナへのリクエスト値。
///
/// `headers`はspec §6.2が列挙する順序で積む。`message`は
/// ヘッダ（CRLF終端）+ 空行 + ボディを、受信順そのままに保持する
/// （spec invariant 5）。
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub headers: Vec<(String, String)>,
    pub message: Vec<u8>,
}

impl ScanRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// `session`からヘッダと`message`本体を組み立てる（spec §6.2）。
///
/// マクロ名はワイヤ上の正式名（波括弧つき、`{i}`等）で探す。postfix系
/// MTAが1文字の裸名（`i`等）で送ってくる場合だけ、対応する裸名に
/// フォールバックする（milter.c:1254-1340 `rspamd_milter_macro_http`の
/// `IF_MACRO`連鎖に対応）。
pub fn to_request(state: &SessionState) -> ScanRequest {
    let mut headers = Vec::new();

    if let Some(queue_id) = first_macro(state, &["{i}", "i"]) {
        headers.push(("Queue-Id".to_string(), queue_id));
    }

    if let Some(daemon) = state.macros.get("{daemon_name}") {
        headers.push(("MTA-Tag".to_string(), daemon.to_string()));
    }
    if let Some(name) = first_macro(state, &["{daemon_name}", "{j}", "j"]) {
        headers.push(("MTA-Name".to_string(), name));
    }

    if let Some(agent) = first_macro(state, &["{v}", "v"]) {
        headers.push(("User-Agent".to_string(), agent));
    }

    if let Some(cipher) = state.macros.get("{cipher}") {
        headers.push(("TLS-Cipher".to_string(), cipher.to_string()));
    }
    if let Some(version) = state.macros.get("{tls_version}") {
        headers.push(("TLS-Version".to_string(), version.to_string()));
    }

    if let Some(user) = state.macros.get("{auth_authen}") {
        headers.push(("User".to_string(), user.to_string()));
    }

    let hostname = state
        .hostname
        .clone()
        .or_else(|| state.macros.get("{client_name}").map(|s| s.to_string()));
    if let Some(hostname) = hostname {
        headers.push(("Hostname".to_string(), hostname));
    }

    if let Some(helo) = &state.helo {
        headers.push(("Helo".to_string(), helo.clone()));
    }

    if let Some(from) = &state.mail_from {
        headers.push(("From".to_string(), from.raw.clone()));
    }

    for rcpt in &state.rcpts {
        headers.push(("Rcpt".to_string(), rcpt.raw.clone()));
    }

    if let Some(ip) = session_ip(state) {
        headers.push(("IP".to_string(), ip));
    }

    headers.push(("Milter".to_string(), "Yes".to_string()));

    let mut message = Vec::with_capacity(state.headers.iter().map(|(n, v)| n.len() + v.len() + 4).sum::<usize>() + 2 + state.body.len());
    for (name, value) in &state.headers {
        message.extend_from_slice(name.as_bytes());
        message.extend_from_slice(b": ");
        message.extend_from_slice(value.as_bytes());
        message.extend_from_slice(b"\r\n");
    }
    message.extend_from_slice(b"\r\n");
    message.extend_from_slice(&state.body);

    ScanRequest { headers, message }
}

/// `candidates`を優先順に探し、最初に見つかったマクロ値を返す。
fn first_macro(state: &SessionState, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find_map(|name| state.macros.get(name).map(|v| v.to_string()))
}

fn session_ip(state: &SessionState) -> Option<String> {
    use crate::session::SessionAddr;
    match &state.addr {
        Some(SessionAddr::Inet(addr)) => Some(addr.ip().to_string()),
        Some(SessionAddr::Inet6(addr)) => Some(addr.ip().to_string()),
        Some(SessionAddr::Unix(path)) => Some(path.clone()),
        Some(SessionAddr::Unknown) | None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::parse_smtp_address;

    #[test]
    fn builds_message_with_headers_then_blank_line_then_body() {
        let mut state = SessionState::new(1);
        state.headers.push(("Subject".to_string(), "Hi".to_string()));
        state.body = b"hello".to_vec();

        let request = to_request(&state);
        assert_eq!(request.message, b"Subject: Hi\r\n\r\nhello");
    }

    #[test]
    fn queue_id_prefers_braced_macro_over_bare() {
        let mut state = SessionState::new(1);
        state.macros.insert("i", "short123");
        state.macros.insert("{i}", "long456");

        let request = to_request(&state);
        assert_eq!(request.header("Queue-Id"), Some("long456"));
    }

    #[test]
    fn falls_back_to_short_macro_when_long_missing() {
        let mut state = SessionState::new(1);
        state.macros.insert("i", "short123");

        let request = to_request(&state);
        assert_eq!(request.header("Queue-Id"), Some("short123"));
    }

    #[test]
    fn envelope_headers_reflect_from_and_rcpts() {
        let mut state = SessionState::new(1);
        state.mail_from = Some(parse_smtp_address("<a@example.com>"));
        state.rcpts.push(parse_smtp_address("<b@example.com>"));
        state.rcpts.push(parse_smtp_address("<c@example.com>"));

        let request = to_request(&state);
        assert_eq!(request.header("From"), Some("<a@example.com>"));
        let rcpts: Vec<_> = request
            .headers
            .iter()
            .filter(|(k, _)| k == "Rcpt")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(rcpts, vec!["<b@example.com>", "<c@example.com>"]);
    }

    #[test]
    fn mta_tag_only_fires_for_daemon_name_while_mta_name_falls_back_to_j() {
        let mut state = SessionState::new(1);
        state.macros.insert("{j}", "mx.example.com");

        let request = to_request(&state);
        assert_eq!(request.header("MTA-Tag"), None);
        assert_eq!(request.header("MTA-Name"), Some("mx.example.com"));
    }

    #[test]
    fn always_carries_milter_marker() {
        let state = SessionState::new(1);
        let request = to_request(&state);
        assert_eq!(request.header("Milter"), Some("Yes"));
    }
}
