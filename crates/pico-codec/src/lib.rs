//! # pico-codec
//!
//! raw REPL 経由のファイル転送コーデック。
//!
//! デバイスへの書き込み経路は「REPL にソースコードを流し込む」ことしかないため、
//! バイナリは REPL で実行できる文に変換して送る。読み出しはデバイス側で
//! hexlify した文字列を print させ、ローカルで 16 進デコードする。
//!
//! ```text
//! 書き込み:
//!   [0x68, 0x69] → with open("a.py", "wb") as f:
//!                    f.write(bytes([104,105]))
//!
//! 読み出し:
//!   デバイス: print(ubinascii.hexlify(chunk).decode(), end="")
//!   ホスト:   "6869" → [0x68, 0x69]
//! ```
//!
//! `no_std` + `alloc` 環境（WASM を含む）で動作する。

#![no_std]
extern crate alloc;

mod error;
mod hexcodec;
mod listing;
mod script;

pub use error::CodecError;
pub use hexcodec::{decode_hex, encode_hex};
pub use listing::{parse_listing, ExtensionFilter};
pub use script::{
    byte_list_literal, list_files_script, read_file_script, validate_file_name,
    write_file_script,
};

/// 1 行の `f.write(bytes([...]))` に載せる既定バイト数
pub const DEFAULT_WRITE_CHUNK_LEN: usize = 256;

/// デバイス側で 1 回に `f.read(n)` する既定バイト数
pub const DEFAULT_READ_CHUNK_LEN: usize = 256;
