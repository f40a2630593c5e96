// =========================
// parser.rs
// Milterフレームの再開可能（resumable）パーサFSM（C2）
//
// 【役割】
// - 任意の分割で届くTCPバイト列から、フレーム境界を跨いでも状態を
//   保持しながらコマンドを1つずつ切り出す
// - ペイロードはコピーせず、自前バッファへのビューとして返す
//   （次にpoll()を呼ぶまでの間のみ有効）
//
// Design Note「Resumable parser」: 整数FSM + 伸長可能バッファという
// 構造を維持し、同期readerへの書き換えは行わない。
// =========================

use crate::constants::{self, cmd};
use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Len1,
    Len2,
    Len3,
    Len4,
    ReadCmd,
    ReadData,
}

/// 再開可能なMilterフレームパーサ。
///
/// 呼び出し側（C6: I/Oドライバ）は、読み取ったバイト列を[`Parser::feed`]
/// で追記し、[`Parser::poll`]を`Ok(None)`が返るまで繰り返し呼んでから、
/// 次の読み取りに進む。完全に消費し切ったら[`Parser::compact`]でバッファ
/// を縮める。
#[derive(Debug)]
pub struct Parser {
    buf: Vec<u8>,
    pos: usize,
    state: State,
    cur_cmd: u8,
    /// 現在のコマンドについて、まだ読み終えていないバイト数。
    /// Len1..ReadCmd の間はフレーム全体（cmd+payload）の長さを指し、
    /// ReadCmd完了時にコマンドバイト分を差し引いてペイロード長になる。
    datalen: usize,
    cmd_start: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(constants::CHUNK_MAX + 5),
            pos: 0,
            state: State::Len1,
            cur_cmd: 0,
            datalen: 0,
            cmd_start: 0,
        }
    }

    /// 受信したバイト列を内部バッファの末尾に追記する。
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 次の読み取りに向けて、残りペイロード分のキャパシティを
    /// あらかじめ確保しておく（amortized doubling）。
    fn reserve_for_remaining(&mut self) {
        if self.state == State::ReadData {
            let have = self.buf.len().saturating_sub(self.cmd_start);
            if have < self.datalen {
                let want = self.cmd_start + self.datalen;
                if self.buf.capacity() < want {
                    self.buf.reserve(want - self.buf.len());
                }
            }
        }
    }

    /// バッファ中に完成したコマンドがあれば1つ切り出す。
    ///
    /// `Ok(None)`はさらにバイトが必要であることを示す。呼び出し側は
    /// もう一度読み取ってから`feed`し、`poll`をやり直す。
    pub fn poll(&mut self) -> Result<Option<(u8, &[u8])>, ProtocolError> {
        loop {
            match self.state {
                State::Len1 => {
                    if self.pos >= self.buf.len() {
                        return Ok(None);
                    }
                    self.datalen = (self.buf[self.pos] as usize) << 24;
                    self.pos += 1;
                    self.state = State::Len2;
                }
                State::Len2 => {
                    if self.pos >= self.buf.len() {
                        return Ok(None);
                    }
                    self.datalen |= (self.buf[self.pos] as usize) << 16;
                    self.pos += 1;
                    self.state = State::Len3;
                }
                State::Len3 => {
                    if self.pos >= self.buf.len() {
                        return Ok(None);
                    }
                    self.datalen |= (self.buf[self.pos] as usize) << 8;
                    self.pos += 1;
                    self.state = State::Len4;
                }
                State::Len4 => {
                    if self.pos >= self.buf.len() {
                        return Ok(None);
                    }
                    self.datalen |= self.buf[self.pos] as usize;
                    self.pos += 1;
                    self.state = State::ReadCmd;
                }
                State::ReadCmd => {
                    if self.pos >= self.buf.len() {
                        return Ok(None);
                    }
                    if self.datalen < 1 {
                        return Err(ProtocolError::EmptyPayload);
                    }

                    self.cur_cmd = self.buf[self.pos];
                    self.pos += 1;
                    self.datalen -= 1; // コマンドバイト自体を消費
                    self.cmd_start = self.pos;
                    self.state = State::ReadData;

                    if self.datalen > 2 * constants::CHUNK_MAX {
                        return Err(ProtocolError::PayloadTooLarge(
                            self.datalen,
                            2 * constants::CHUNK_MAX,
                        ));
                    }
                    if !cmd::is_valid(self.cur_cmd) {
                        return Err(ProtocolError::UnknownCommand(self.cur_cmd));
                    }
                }
                State::ReadData => {
                    if self.buf.len() - self.cmd_start < self.datalen {
                        self.reserve_for_remaining();
                        return Ok(None);
                    }

                    let start = self.cmd_start;
                    let end = start + self.datalen;
                    let consumed_cmd = self.cur_cmd;

                    self.pos = end;
                    self.state = State::Len1;
                    self.cur_cmd = 0;
                    self.cmd_start = 0;

                    return Ok(Some((consumed_cmd, &self.buf[start..end])));
                }
            }
        }
    }

    /// 消費済みの先頭バイト列を捨てる。完全に消費し切っていればバッファ
    /// を空にし、途中であれば未消費分を先頭に詰める。
    pub fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        if self.pos >= self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else {
            self.buf.drain(0..self.pos);
            self.cmd_start = self.cmd_start.saturating_sub(self.pos);
            self.pos = 0;
        }
    }

    /// 現在バッファが保持しているキャパシティ（読み取り先のサイズ決定用）。
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len() - self.pos
    }
}
