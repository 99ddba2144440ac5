//! # pico-wasm
//!
//! wasm-bindgen エクスポート：ブラウザのエディタ・端末 UI から呼び出す公開 API。
//!
//! ## 使用方法（TypeScript）
//!
//! ```typescript
//! import init, { DeviceClient, init_panic_hook, initLogging } from './pkg/pico_wasm';
//!
//! await init();
//! init_panic_hook();
//! initLogging("debug");
//!
//! const port = await navigator.serial.requestPort();
//! const client = new DeviceClient(port);
//! client.onTerminal((text) => term.write(text));
//! navigator.serial.addEventListener("disconnect", () => client.handleDisconnect());
//!
//! await client.connect();
//! await client.runCode(editor.getValue());
//!
//! // Ctrl-C
//! await client.interrupt();
//! ```

use wasm_bindgen::prelude::*;

pub mod client;
pub mod logger;
pub mod serial;

pub use client::DeviceClient;
pub use serial::{SerialPort, WasmSpawner, WebSerialBackend};

/// パニック時にブラウザコンソールにスタックトレースを出力する
///
/// 開発時に必ず呼び出すこと。本番ビルドでは feature flag で無効化可能。
#[wasm_bindgen]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// `log` の出力先をブラウザコンソールにする
///
/// # 引数
/// - `level`: "error" / "warn" / "info" / "debug" / "trace" / "off"（不明な値は "info"）
#[wasm_bindgen(js_name = "initLogging")]
pub fn init_logging(level: &str) {
    logger::init(logger::parse_level(level));
}

/// バイト列を小文字の 16 進文字列にするユーティリティ
#[wasm_bindgen(js_name = "encodeHex")]
pub fn encode_hex(data: &[u8]) -> String {
    pico_codec::encode_hex(data)
}

/// 16 進文字列をバイト列に戻すユーティリティ
///
/// テスト・デバッグ用。デバイスから読み出したダンプの確認などに使う。
///
/// # エラー
/// - 長さが奇数
/// - 16 進数字以外の文字
#[wasm_bindgen(js_name = "decodeHex")]
pub fn decode_hex(text: &str) -> Result<js_sys::Uint8Array, JsError> {
    let bytes = pico_codec::decode_hex(text).map_err(|e| JsError::new(&e.to_string()))?;
    Ok(js_sys::Uint8Array::from(bytes.as_slice()))
}
