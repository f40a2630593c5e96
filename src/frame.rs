// =========================
// frame.rs
// Milterワイヤフレームのエンコード
//
// 【役割】
// - `len:u32be || cmd:u8 || payload` フレームの組み立て（C1 Frame codec）
// - デコード側（4バイト長 + 1バイトコマンドの分解）はparser.rsのFSMが
//   1バイトずつ担うため、ここではencode側のみを提供する
// =========================

/// `cmd`と`payload`から1つの連続バッファとしてフレームを組み立てる。
///
/// 先頭4バイトは`htonl(1 + payload.len())`、5バイト目が`cmd`、
/// それ以降が`payload`。
pub fn encode_frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let body_len = 1 + payload.len();
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.push(cmd);
    out.extend_from_slice(payload);
    out
}

/// フレームヘッダ5バイト（4バイト長 + 1バイトコマンド）をデコードする。
///
/// 戻り値は `(command_and_payload_len, cmd)`。`parser.rs`のFSMから
/// 切り出された、5バイトが揃った時点での解釈ロジックとしてテストしやすく
/// 分離してある。
pub fn decode_header(header: [u8; 5]) -> (u32, u8) {
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    (len, header[4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_roundtrips_with_decode_header() {
        let frame = encode_frame(b'a', &[]);
        assert_eq!(frame, vec![0, 0, 0, 1, b'a']);

        let frame = encode_frame(b'h', b"X-Spam\0Yes\0");
        let (len, cmd) = decode_header([frame[0], frame[1], frame[2], frame[3], frame[4]]);
        assert_eq!(cmd, b'h');
        assert_eq!(len as usize, frame.len() - 4);
        assert_eq!(&frame[5..], b"X-Spam\0Yes\0");
    }

    #[test]
    fn encode_optneg_payload_layout() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&6u32.to_be_bytes());
        payload.extend_from_slice(&0xFFu32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        let frame = encode_frame(b'O', &payload);
        assert_eq!(frame.len(), 4 + 1 + 12);
        assert_eq!(frame[4], b'O');
    }
}
