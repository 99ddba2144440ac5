//! DeviceClient wasm-bindgen エクスポート
//!
//! エディタ・端末 UI から呼び出すデバイス操作の主エントリポイント。
//! 非同期の操作はすべて Promise を返す。

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures::StreamExt;
use js_sys::{Array, Function, Object, Promise, Reflect, Uint8Array};
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{future_to_promise, spawn_local};

use pico_session::{DeviceSession, SessionConfig, SessionError, TerminalSink};

use crate::serial::{describe, sleep, SerialPort, WasmSpawner, WebSerialBackend};

/// 設定 JSON を読む（省略時は既定値）
///
/// # 例
/// ```
/// let config = pico_wasm::client::parse_config(Some(r#"{"verify_writes": false}"#)).unwrap();
/// assert!(!config.verify_writes);
/// assert_eq!(config.ready_attempts, 20);
/// ```
pub fn parse_config(json: Option<&str>) -> Result<SessionConfig, serde_json::Error> {
    match json {
        Some(json) if !json.trim().is_empty() => serde_json::from_str(json),
        _ => Ok(SessionConfig::default()),
    }
}

fn to_js(error: SessionError) -> JsValue {
    JsError::new(&error.to_string()).into()
}

/// 端末コールバック `(text: string) => void`
struct JsTerminal {
    callback: Function,
}

impl TerminalSink for JsTerminal {
    fn accept(&self, chunk: &str) {
        if let Err(e) = self.callback.call1(&JsValue::NULL, &JsValue::from_str(chunk)) {
            log::warn!("terminal callback threw: {}", describe(&e));
        }
    }
}

/// MicroPython デバイスとのセッション
///
/// ## 使用方法（TypeScript）
///
/// ```typescript
/// const port = await navigator.serial.requestPort();
/// const client = new DeviceClient(port, JSON.stringify({ file_extensions: [".py"] }));
/// client.onTerminal((text) => term.write(text));
/// client.onStatus(({ status }) => setRunning(status === "RUNNING"));
///
/// await client.connect();
/// term.onData((data) => client.sendText(data));
///
/// await client.writeTextFile("main.py", editor.getValue());
/// const names = await client.listFiles();
/// ```
///
/// ## スレッド安全性
///
/// WASM はシングルスレッドのため、`!Send + !Sync` を満たす。
#[wasm_bindgen]
pub struct DeviceClient {
    session: DeviceSession<WebSerialBackend>,
    timeout: Duration,
}

#[wasm_bindgen]
impl DeviceClient {
    /// クライアントを生成する（まだポートは開かない）
    ///
    /// # 引数
    /// - `port`: `navigator.serial.requestPort()` の結果
    /// - `config_json`: `SessionConfig` の JSON。省略したフィールドは既定値
    ///
    /// # エラー
    /// - 設定 JSON の構文・型の誤り
    #[wasm_bindgen(constructor)]
    pub fn new(port: SerialPort, config_json: Option<String>) -> Result<DeviceClient, JsError> {
        let config = parse_config(config_json.as_deref())
            .map_err(|e| JsError::new(&format!("Invalid config: {}", e)))?;
        let timeout = config.command_timeout();
        let session = DeviceSession::new(WebSerialBackend::new(port), config, Rc::new(WasmSpawner));
        Ok(DeviceClient { session, timeout })
    }

    /// 端末出力のコールバックを登録する
    #[wasm_bindgen(js_name = "onTerminal")]
    pub fn on_terminal(&self, callback: Function) {
        self.session.set_terminal(Rc::new(JsTerminal { callback }));
    }

    /// 状態変化のコールバックを登録する
    ///
    /// コールバックには `{ status: "REPL" | "RUNNING" }` が渡される。
    #[wasm_bindgen(js_name = "onStatus")]
    pub fn on_status(&self, callback: Function) {
        let mut changes = self.session.subscribe_status();
        spawn_local(async move {
            while let Some(status) = changes.next().await {
                let event = Object::new();
                if Reflect::set(&event, &"status".into(), &status.as_str().into()).is_err() {
                    continue;
                }
                if let Err(e) = callback.call1(&JsValue::NULL, &event) {
                    log::warn!("status callback threw: {}", describe(&e));
                }
            }
        });
    }

    /// ポートを 115200 baud で開き、端末への出力を始める
    ///
    /// # 戻り値
    /// `Promise<number>`（ボーレート）
    pub fn connect(&self) -> Promise {
        let session = self.session.clone();
        future_to_promise(async move {
            let connection = session.connect().await.map_err(to_js)?;
            Ok(JsValue::from(connection.baud_rate))
        })
    }

    /// ポートを閉じる
    pub fn disconnect(&self) -> Promise {
        let session = self.session.clone();
        future_to_promise(async move {
            session.disconnect().await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// `navigator.serial` の disconnect イベントから呼ぶ
    #[wasm_bindgen(js_name = "handleDisconnect")]
    pub fn handle_disconnect(&self) {
        self.session.handle_disconnect();
    }

    #[wasm_bindgen(js_name = "isConnected")]
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// 端末のキー入力をそのまま送る
    #[wasm_bindgen(js_name = "sendText")]
    pub fn send_text(&self, text: String) -> Promise {
        self.send_raw(text.into_bytes())
    }

    /// バイト列をそのまま送る（コマンド実行中は Busy）
    #[wasm_bindgen(js_name = "sendRaw")]
    pub fn send_raw(&self, data: Vec<u8>) -> Promise {
        let session = self.session.clone();
        future_to_promise(async move {
            session.send_raw(&data).await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// Ctrl-C を送る
    pub fn interrupt(&self) -> Promise {
        let session = self.session.clone();
        future_to_promise(async move {
            session.interrupt().await.map_err(to_js)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// エディタのコードを実行する。出力は端末に流れる
    #[wasm_bindgen(js_name = "runCode")]
    pub fn run_code(&self, code: String) -> Promise {
        self.timed(move |session| async move {
            session.run_code(&code).await?;
            Ok::<_, SessionError>(JsValue::UNDEFINED)
        })
    }

    /// コードを実行し、出力を `{"stdout": ..., "stderr": ...}` の JSON で返す
    pub fn exec(&self, code: String) -> Promise {
        self.timed(move |session| async move {
            let output = session.exec(&code).await?;
            let json = serde_json::to_string(&output)
                .map_err(|e| SessionError::Remote(e.to_string()))?;
            Ok::<_, SessionError>(JsValue::from_str(&json))
        })
    }

    /// ファイルを読む
    ///
    /// # 戻り値
    /// `Promise<Uint8Array>`
    #[wasm_bindgen(js_name = "readFile")]
    pub fn read_file(&self, name: String) -> Promise {
        self.timed(move |session| async move {
            let content = session.read_file(&name).await?;
            Ok::<JsValue, SessionError>(Uint8Array::from(content.as_slice()).into())
        })
    }

    /// ファイルに書き込む（設定により読み戻して照合する）
    #[wasm_bindgen(js_name = "writeFile")]
    pub fn write_file(&self, name: String, data: Vec<u8>) -> Promise {
        self.timed(move |session| async move {
            session.write_file(&name, &data).await?;
            Ok::<_, SessionError>(JsValue::UNDEFINED)
        })
    }

    /// ファイルを UTF-8 テキストとして読む
    #[wasm_bindgen(js_name = "readTextFile")]
    pub fn read_text_file(&self, name: String) -> Promise {
        self.timed(move |session| async move {
            let text = session.read_text_file(&name).await?;
            Ok::<_, SessionError>(JsValue::from_str(&text))
        })
    }

    /// UTF-8 テキストをファイルに書き込む
    #[wasm_bindgen(js_name = "writeTextFile")]
    pub fn write_text_file(&self, name: String, text: String) -> Promise {
        self.timed(move |session| async move {
            session.write_text_file(&name, &text).await?;
            Ok::<_, SessionError>(JsValue::UNDEFINED)
        })
    }

    /// 設定の拡張子に合うファイル名の一覧
    ///
    /// # 戻り値
    /// `Promise<string[]>`（デバイスが返した順）
    #[wasm_bindgen(js_name = "listFiles")]
    pub fn list_files(&self) -> Promise {
        self.timed(|session| async move {
            let names = session.list_files().await?;
            let array = Array::new();
            for name in names {
                array.push(&JsValue::from_str(&name));
            }
            Ok::<JsValue, SessionError>(array.into())
        })
    }

    /// 推定されたデバイス状態（"REPL" / "RUNNING"、未確定なら undefined）
    pub fn status(&self) -> Option<String> {
        self.session.status().map(|s| s.as_str().to_string())
    }

    /// 現在のモード（"repl" / "raw_command" / "file_transfer"）
    pub fn mode(&self) -> String {
        serde_json::to_value(self.session.mode())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// セッション統計を JSON 文字列で返す
    ///
    /// # 戻り値
    /// JSON 文字列:
    /// ```json
    /// {
    ///   "bytes_sent": 1024,
    ///   "bytes_received": 4096,
    ///   "commands_completed": 12,
    ///   "commands_failed": 1
    /// }
    /// ```
    #[wasm_bindgen(js_name = "getStats")]
    pub fn get_stats(&self) -> String {
        serde_json::to_string(&self.session.stats()).unwrap_or_default()
    }
}

impl DeviceClient {
    /// 設定のタイムアウト付きで操作を Promise にする
    fn timed<F, Fut>(&self, op: F) -> Promise
    where
        F: FnOnce(DeviceSession<WebSerialBackend>) -> Fut,
        Fut: Future<Output = Result<JsValue, SessionError>> + 'static,
    {
        let session = self.session.clone();
        let timeout = self.timeout;
        let work = op(session.clone());
        future_to_promise(async move {
            session
                .with_timeout(work, sleep(timeout))
                .await
                .map_err(to_js)
        })
    }
}
