//! # pico-proto
//!
//! MicroPython REPL の制御バイト・マーカー文字列・セッションモードの定義。
//!
//! ## raw REPL の往復
//!
//! REPL 自体にはフレーミングが無いので、境界はすべてバイト内容から推測する。
//!
//! ```text
//! ホスト → デバイス:  0x01                      (raw REPL に入る)
//! デバイス → ホスト:  "raw REPL; CTRL-B to exit\r\n>"
//! ホスト → デバイス:  <コード> 0x04             (コード送信 + 実行)
//! デバイス → ホスト:  "OK" <stdout> 0x04 <stderr> 0x04 ">"
//! ホスト → デバイス:  0x02                      (通常 REPL に戻る)
//! デバイス → ホスト:  "MicroPython v1.x ...\r\n>>> "
//! ```
//!
//! プロンプトの `>` と応答の `OK` が連続するため、出力開始の目印は `>OK` になる。

#![no_std]

pub mod mode;

pub use mode::{DeviceStatus, SessionMode};

/// シリアルポートのボーレート（固定）
pub const BAUD_RATE: u32 = 115_200;

/// raw REPL に入る (CTRL+A)
pub const RAW_MODE_ENTER: u8 = 0x01;

/// raw REPL から抜ける (CTRL+B)
pub const RAW_MODE_EXIT: u8 = 0x02;

/// 実行中のプログラムを中断する (CTRL+C)
pub const INTERRUPT: u8 = 0x03;

/// コマンド終端。raw REPL ではコード実行、応答では stdout / stderr の区切り (CTRL+D)
pub const END_OF_COMMAND: u8 = 0x04;

/// コマンドのエコーと実際の出力の境界
pub const OUTPUT_START_MARKER: &[u8] = b">OK";

/// 対話プロンプト。ステータス推定にのみ使い、フレーミングには使わない
pub const PROMPT_MARKER: &str = ">>>";

/// REPL が意味を持たせている制御バイト
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlByte {
    /// raw REPL に入る
    RawModeEnter = RAW_MODE_ENTER,
    /// raw REPL から抜ける
    RawModeExit = RAW_MODE_EXIT,
    /// 中断
    Interrupt = INTERRUPT,
    /// コマンド終端
    EndOfCommand = END_OF_COMMAND,
}

impl ControlByte {
    /// 全制御バイト
    pub const ALL: [ControlByte; 4] = [
        ControlByte::RawModeEnter,
        ControlByte::RawModeExit,
        ControlByte::Interrupt,
        ControlByte::EndOfCommand,
    ];

    /// 生のバイト値
    pub const fn byte(self) -> u8 {
        self as u8
    }

    /// バイト値から制御バイトを判定する
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.byte() == byte)
    }
}
