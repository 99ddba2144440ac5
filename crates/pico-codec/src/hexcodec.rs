//! 16 進ペイロードのエンコード/デコード
//!
//! デバイスは `ubinascii.hexlify` の結果（小文字、1 バイト = 2 文字）を print する。
//! print の改行や端末の折り返しが混ざるので、ASCII 空白は無視してからデコードする。

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::CodecError;

/// バイト列を小文字の 16 進文字列にする
pub fn encode_hex(bytes: &[u8]) -> String {
    ::hex::encode(bytes)
}

/// デバイスが出力した 16 進文字列をバイト列に戻す
///
/// 2 文字ずつ 16 進として解釈する。空文字列（空ファイル）は 0 バイトになる。
///
/// # エラー
/// - `CodecError::OddLength`: 空白を除いた長さが奇数
/// - `CodecError::InvalidCharacter`: 16 進数字以外を含む
pub fn decode_hex(text: &str) -> Result<Vec<u8>, CodecError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    ::hex::decode(compact.as_bytes()).map_err(|e| match e {
        ::hex::FromHexError::InvalidHexCharacter { c, index } => CodecError::InvalidCharacter {
            character: c,
            index,
        },
        ::hex::FromHexError::OddLength | ::hex::FromHexError::InvalidStringLength => {
            CodecError::OddLength
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_byte_values() {
        let data: Vec<u8> = (0..=255u8).collect();
        let text = encode_hex(&data);
        assert_eq!(text.len(), 512);
        assert_eq!(decode_hex(&text).unwrap(), data);
    }

    #[test]
    fn test_empty_payload_decodes_to_nothing() {
        assert_eq!(encode_hex(&[]), "");
        assert!(decode_hex("").unwrap().is_empty());
        // print() の改行だけが届いた場合も空ファイル
        assert!(decode_hex("\r\n").unwrap().is_empty());
    }

    #[test]
    fn test_encode_is_lowercase() {
        assert_eq!(encode_hex(&[0xAB, 0x0F]), "ab0f");
    }

    #[test]
    fn test_decode_ignores_line_breaks() {
        assert_eq!(decode_hex("6869\r\n").unwrap(), b"hi");
        assert_eq!(decode_hex("68\r\n69").unwrap(), b"hi");
    }

    #[test]
    fn test_decode_accepts_uppercase() {
        assert_eq!(decode_hex("FF00").unwrap(), [0xFF, 0x00]);
    }

    #[test]
    fn test_decode_odd_length() {
        assert_eq!(decode_hex("abc"), Err(CodecError::OddLength));
    }

    #[test]
    fn test_decode_invalid_character() {
        assert_eq!(
            decode_hex("6g"),
            Err(CodecError::InvalidCharacter {
                character: 'g',
                index: 1
            })
        );
    }
}
