//! デバイスで実行するスクリプトの生成
//!
//! 生成するコードはすべて raw REPL にそのまま流し込み、`0x04` で実行させる前提。

use alloc::format;
use alloc::string::String;
use core::fmt::Write as _;

use crate::error::CodecError;

/// ファイル名がスクリプトの文字列リテラルに埋め込めるか確認する
///
/// 空文字列、`"` と `\`、制御文字を含む名前は拒否する。
pub fn validate_file_name(name: &str) -> Result<(), CodecError> {
    let bad = name.is_empty()
        || name
            .chars()
            .any(|c| c == '"' || c == '\\' || c.is_control());
    if bad {
        return Err(CodecError::InvalidFileName(name.into()));
    }
    Ok(())
}

/// バイト列を 10 進整数のリストリテラルにする（`[104,105]`）
pub fn byte_list_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 2);
    out.push('[');
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        // String への書き込みは失敗しない
        let _ = write!(out, "{}", b);
    }
    out.push(']');
    out
}

/// `name` をバイナリ書き込みで開き、`content` を書き込むスクリプト
///
/// `chunk_len` バイトごとに `f.write(...)` を 1 行ずつ出力する。
/// 空の内容でも 1 行（`bytes([])`）を出力してファイルを作る。
///
/// # エラー
/// - `CodecError::InvalidFileName`: 埋め込めないファイル名
pub fn write_file_script(name: &str, content: &[u8], chunk_len: usize) -> Result<String, CodecError> {
    validate_file_name(name)?;

    let mut script = format!("with open(\"{}\", \"wb\") as f:\n", name);
    if content.is_empty() {
        script.push_str("  f.write(bytes([]))\n");
    }
    for chunk in content.chunks(chunk_len.max(1)) {
        script.push_str("  f.write(bytes(");
        script.push_str(&byte_list_literal(chunk));
        script.push_str("))\n");
    }
    Ok(script)
}

/// `name` をバイナリ読み込みで開き、内容を 16 進で print するスクリプト
///
/// デバイスのメモリを節約するため `chunk_len` バイトずつ読み、改行なしで出力する。
///
/// # エラー
/// - `CodecError::InvalidFileName`: 埋め込めないファイル名
pub fn read_file_script(name: &str, chunk_len: usize) -> Result<String, CodecError> {
    validate_file_name(name)?;

    Ok(format!(
        "import ubinascii\n\
         with open(\"{name}\", \"rb\") as f:\n\
         \x20 while True:\n\
         \x20   b = f.read({len})\n\
         \x20   if not b:\n\
         \x20     break\n\
         \x20   print(ubinascii.hexlify(b).decode(), end=\"\")\n",
        name = name,
        len = chunk_len.max(1),
    ))
}

/// カレントディレクトリのエントリ一覧を print するスクリプト
pub fn list_files_script() -> &'static str {
    "import os\nprint(os.listdir())\n"
}
