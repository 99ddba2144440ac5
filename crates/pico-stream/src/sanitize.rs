//! 端末出力のサニタイズ

use alloc::borrow::Cow;
use alloc::string::String;

use pico_proto::ControlByte;

/// 端末に渡すテキストから REPL の制御バイトと NUL を取り除く
///
/// raw REPL の区切り（`0x04` など）は端末エミュレータでは意味を持たないため捨てる。
/// ANSI エスケープ、CR/LF、タブはそのまま通す。
pub fn sanitize_for_terminal(text: &str) -> Cow<'_, str> {
    if !text.chars().any(is_stripped) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.chars().filter(|c| !is_stripped(*c)).collect::<String>())
}

fn is_stripped(c: char) -> bool {
    c == '\0' || (c.is_ascii() && ControlByte::from_byte(c as u8).is_some())
}
