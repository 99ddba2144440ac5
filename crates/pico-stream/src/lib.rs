//! # pico-stream
//!
//! シリアルのバイトストリームを扱うバッファ群。
//!
//! ## 設計の背景
//!
//! トランスポートはメッセージ境界の無いバイト列を、任意の位置で分割して届ける。
//! 区切り文字列（`>OK` や `0x04`）が 2 つのチャンクにまたがることも、
//! 1 つのチャンクに今回の応答の末尾と次の応答の先頭が同居することもある。
//!
//! ```text
//! 受信チャンク:  | ...6869 0x04 0x04 > | OK 7a ...
//!                          ↑ take_until(0x04)
//! 応答:          ...6869
//! 残り (leftover): 0x04 > OK 7a ... → 次の読み取りの先頭になる
//! ```
//!
//! - [`ResponseBuffer`]: 受信バイトを蓄積し、区切りで切り出す。残りは捨てない
//! - [`Utf8Accumulator`]: チャンク境界で割れたマルチバイト文字をつなぎ直す
//! - [`sanitize_for_terminal`]: 端末に出す前に制御バイトを取り除く

#![no_std]
extern crate alloc;

pub mod buffer;
pub mod sanitize;
pub mod utf8;

pub use buffer::ResponseBuffer;
pub use sanitize::sanitize_for_terminal;
pub use utf8::Utf8Accumulator;
