// =========================
// address.rs
// SMTPアドレス（MAIL FROM / RCPT TO）の最小パース
//
// 【役割】
// - spec §1「Out of scope (external collaborators)」が挙げる"SMTP address
//   parsing"の、このクレート単体で動かすためのデフォルト実装
// - 本番運用では`AddressParser`を差し替えて、より厳密なRFC5321パーサ
//   （外部クレート）に委譲できるようにしておく
//
// 【grounding】
// command.rsのMAIL/RCPT処理（既にfirst_nul_terminatedで生文字列を
// 切り出している）に対して、ローカル部/ドメイン部への分解だけを追加する。
// 厳密なRFC5321文法チェックはこのクレートの責務外（spec §1）。
// =========================

/// 1つのSMTPアドレス。角括弧を含む生の形（`<user@example.com>`）と、
/// 分解できた場合のローカル部・ドメイン部を保持する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpAddress {
    /// MTAから受け取った生の文字列（`<...>`を含む）。
    pub raw: String,
    /// `user@domain`のうち`user`部分。空（`<>`のNULL送信者）もありうる。
    pub local: String,
    /// `user@domain`のうち`domain`部分。見つからなければ空文字列。
    pub domain: String,
}

impl SmtpAddress {
    pub fn is_null_sender(&self) -> bool {
        self.local.is_empty() && self.domain.is_empty()
    }
}

impl std::fmt::Display for SmtpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// SMTPアドレス解析の差し替え可能な境界。デフォルト実装は
/// [`parse_smtp_address`]。
pub trait AddressParser: Send + Sync {
    fn parse(&self, raw: &str) -> SmtpAddress;
}

/// デフォルトのアドレス解析器。角括弧を剥がし、最後の`@`でローカル部/
/// ドメイン部を分ける（引用符付きローカル部の`@`は考慮しない、という
/// 単純化を意図的に行っている）。
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAddressParser;

impl AddressParser for DefaultAddressParser {
    fn parse(&self, raw: &str) -> SmtpAddress {
        parse_smtp_address(raw)
    }
}

/// `raw`（例: `<user@example.com>`）を[`SmtpAddress`]へ分解する。
pub fn parse_smtp_address(raw: &str) -> SmtpAddress {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed);

    let (local, domain) = match stripped.rfind('@') {
        Some(at) => (stripped[..at].to_string(), stripped[at + 1..].to_string()),
        None => (stripped.to_string(), String::new()),
    };

    SmtpAddress {
        raw: trimmed.to_string(),
        local,
        domain,
    }
}
