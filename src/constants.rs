// =========================
// constants.rs
// Milterワイヤプロトコルの定数定義
//
// 【このファイルで使う主なクレート】
// - bitflags: OPTNEGのactions/protocolフラグ（Capability/Protocol）
//
// 【役割】
// - コマンドバイト・応答バイトの一覧（mfdef.h相当）
// - プロトコルバージョン・チャンクサイズの上限などの設計定数
// =========================

use bitflags::bitflags;

/// このコアが話す最小のMilterプロトコルバージョン。
/// これより低いバージョンを申告したMTAとはネゴシエーションしない。
pub const PROTO_MIN: u32 = 2;

/// OPTNEG応答で申告する、このコアが話すプロトコルバージョン。
pub const PROTO_VERSION: u32 = 6;

/// BODY/HEADERチャンクの基準サイズ。`datalen`の上限は`2 * CHUNK_MAX`。
pub const CHUNK_MAX: usize = 65536;

bitflags! {
    /// SMFIF_* — フィルタが利用できる修正アクション（xxfi側の申告）
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u32 {
        const ADD_HEADERS      = 0x0001;
        const CHANGE_BODY      = 0x0002;
        const ADD_RCPT         = 0x0004;
        const DELETE_RCPT      = 0x0008;
        const CHANGE_HEADERS   = 0x0010;
        const QUARANTINE       = 0x0020;
        const CHANGE_FROM      = 0x0040;
        const ADD_RCPT_PAR     = 0x0080;
        const SET_SYMLIST      = 0x0100;
    }
}

/// このコアが常に申告する、完全な修正権限を示すマスク。
/// `actions | ACTIONS_MASK` として OPTNEG 応答に使われる。
pub const ACTIONS_MASK: u32 = Capability::all().bits();

bitflags! {
    /// SMFIP_* — MTA側がどのコマンドを省略してよいか・どの応答を
    /// 省略してよいか（sendmail libmilterのmfdef.hに対応）。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protocol: u32 {
        const NO_CONNECT   = 0x0000_0001;
        const NO_HELO      = 0x0000_0002;
        const NO_MAIL      = 0x0000_0004;
        const NO_RCPT      = 0x0000_0008;
        const NO_BODY      = 0x0000_0010;
        const NO_HDRS      = 0x0000_0020;
        const NO_EOH       = 0x0000_0040;
        const NR_HDR       = 0x0000_0080;
        const NO_UNKNOWN   = 0x0000_0100;
        const NO_DATA      = 0x0000_0200;
        const SKIP         = 0x0000_0400;
        const RCPT_REJ     = 0x0000_0800;
        const NR_CONN      = 0x0000_1000;
        const NR_HELO      = 0x0000_2000;
        const NR_MAIL      = 0x0000_4000;
        const NR_RCPT      = 0x0000_8000;
        const NR_DATA      = 0x0001_0000;
        const NR_UNKNOWN   = 0x0002_0000;
        const NR_EOH       = 0x0004_0000;
        const NR_BODY      = 0x0008_0000;
        const HDR_LEADSPC  = 0x0010_0000;
    }
}

/// このコアはヘッダ・ボディを必ず受け取りたいので、OPTNEG応答では
/// `NO_HDRS`/`NO_BODY`を絶対に立てない。`NOREPLY_MASK`はコマンドごとの
/// ACK応答を省略してよい`NR_*`系ビットすべての集合で、このコアは常に
/// この値をOPTNEG応答の`protocol`として宣言する
/// （spec §4.3: "suppress per-command acknowledgements" — MTAの申告を
/// 経由せず、常に全コマンドの個別ACKを省略してよいと約束する）。
pub const NOREPLY_MASK: u32 = Protocol::RCPT_REJ.bits()
    | Protocol::NR_CONN.bits()
    | Protocol::NR_HELO.bits()
    | Protocol::NR_MAIL.bits()
    | Protocol::NR_RCPT.bits()
    | Protocol::NR_DATA.bits()
    | Protocol::NR_HDR.bits()
    | Protocol::NR_UNKNOWN.bits()
    | Protocol::NR_EOH.bits()
    | Protocol::NR_BODY.bits();

/// Milterコマンド（MTA → フィルタ方向）の1バイトコード。
pub mod cmd {
    pub const ABORT: u8 = b'A';
    pub const BODY: u8 = b'B';
    pub const CONNECT: u8 = b'C';
    pub const MACRO: u8 = b'D';
    pub const BODYEOB: u8 = b'E';
    pub const HELO: u8 = b'H';
    pub const QUIT_NC: u8 = b'K';
    pub const HEADER: u8 = b'L';
    pub const MAIL: u8 = b'M';
    pub const EOH: u8 = b'N';
    pub const OPTNEG: u8 = b'O';
    pub const QUIT: u8 = b'Q';
    pub const RCPT: u8 = b'R';
    pub const DATA: u8 = b'T';
    pub const UNKNOWN: u8 = b'U';

    /// 既知のコマンドバイト一覧（未知コマンドは致命的プロトコルエラー）。
    pub const ALL: &[u8] = &[
        ABORT, BODY, CONNECT, MACRO, BODYEOB, HELO, QUIT_NC, HEADER, MAIL, EOH, OPTNEG, QUIT,
        RCPT, DATA, UNKNOWN,
    ];

    pub fn is_valid(b: u8) -> bool {
        ALL.contains(&b)
    }
}

/// Milter応答（フィルタ → MTA方向）の1バイトコード。
pub mod reply {
    pub const ACCEPT: u8 = b'a';
    pub const CONTINUE: u8 = b'c';
    pub const DISCARD: u8 = b'd';
    pub const CHGFROM: u8 = b'e';
    pub const ADDHEADER: u8 = b'h';
    pub const INSHEADER: u8 = b'i';
    pub const CHGHEADER: u8 = b'm';
    pub const OPTNEG: u8 = b'O';
    pub const PROGRESS: u8 = b'p';
    pub const REJECT: u8 = b'r';
    pub const TEMPFAIL: u8 = b't';
    pub const REPLYCODE: u8 = b'y';
    pub const ADDRCPT: u8 = b'+';
    pub const DELRCPT: u8 = b'-';
}

/// CONNECTコマンドの接続ファミリーバイト。
pub mod family {
    pub const UNKNOWN: u8 = b'U';
    pub const UNIX: u8 = b'S';
    pub const INET: u8 = b'4';
    pub const INET6: u8 = b'6';
}
