//! # pico-session
//!
//! MicroPython raw REPL のプロトコルエンジン。
//!
//! REPL 自体にはメッセージの枠が無いので、フレーミングはすべて受信バイトの
//! 中身から推定する。
//!
//! ```text
//! ホスト → デバイス               デバイス → ホスト
//! ───────────────               ───────────────────────────────────
//! 0x01                          raw REPL; CTRL-B to exit\r\n>
//! <コード> 0x04                  OK <stdout> 0x04 <stderr> 0x04 >
//! 0x02                          \r\nMicroPython ...\r\n>>>
//! ```
//!
//! - 出力の始まり: `>OK`（直前の `>` と `OK` がチャンクをまたいでもよい）
//! - 出力の終わり: 0x04（stdout と stderr それぞれ）
//! - `>>>` は UI 向けの状態推定にだけ使う
//!
//! [`DeviceSession`] が 1 本のストリームを passthrough とコマンド実行とで
//! 切り替える。コマンドは同時に 1 つだけ。

mod config;
mod error;
mod files;
mod session;
mod sink;
mod status;

pub use config::SessionConfig;
pub use error::SessionError;
pub use session::{CommandOutput, DeviceSession, SessionStats};
pub use sink::TerminalSink;
pub use status::StatusTracker;
