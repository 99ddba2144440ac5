//! Web Serial API バックエンド
//!
//! `navigator.serial.requestPort()` で得た `SerialPort` を JS から受け取り、
//! `pico_port::SerialBackend` として使えるようにする。
//!
//! Web Serial は web-sys では unstable 扱いなので、必要なメソッドだけを
//! 自前で宣言している。

use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use futures::task::{LocalFutureObj, LocalSpawn, SpawnError};
use js_sys::{Object, Promise, Reflect, Uint8Array};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use pico_port::{ByteSink, ByteSource, PortError, SerialBackend};

#[wasm_bindgen]
extern "C" {
    /// Web Serial の `SerialPort`
    pub type SerialPort;

    #[wasm_bindgen(method)]
    fn open(this: &SerialPort, options: &Object) -> Promise;

    #[wasm_bindgen(method)]
    fn close(this: &SerialPort) -> Promise;

    /// 開いていなければ `null`
    #[wasm_bindgen(method, getter)]
    fn readable(this: &SerialPort) -> JsValue;

    #[wasm_bindgen(method, getter)]
    fn writable(this: &SerialPort) -> JsValue;

    type ReadableStream;

    #[wasm_bindgen(method, getter)]
    fn locked(this: &ReadableStream) -> bool;

    #[wasm_bindgen(method, catch, js_name = getReader)]
    fn get_reader(this: &ReadableStream) -> Result<StreamReader, JsValue>;

    type StreamReader;

    #[wasm_bindgen(method)]
    fn read(this: &StreamReader) -> Promise;

    #[wasm_bindgen(method)]
    fn cancel(this: &StreamReader) -> Promise;

    #[wasm_bindgen(method, catch, js_name = releaseLock)]
    fn release_lock(this: &StreamReader) -> Result<(), JsValue>;

    type WritableStream;

    #[wasm_bindgen(method, getter)]
    fn locked(this: &WritableStream) -> bool;

    #[wasm_bindgen(method, catch, js_name = getWriter)]
    fn get_writer(this: &WritableStream) -> Result<StreamWriter, JsValue>;

    type StreamWriter;

    #[wasm_bindgen(method)]
    fn write(this: &StreamWriter, chunk: &Uint8Array) -> Promise;

    #[wasm_bindgen(method, catch, js_name = releaseLock)]
    fn release_lock(this: &StreamWriter) -> Result<(), JsValue>;

    #[wasm_bindgen(js_name = setTimeout)]
    fn set_timeout(handler: &js_sys::Function, timeout_ms: i32) -> JsValue;
}

/// `setTimeout` で待つ
pub async fn sleep(duration: Duration) {
    let ms = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
    let promise = Promise::new(&mut |resolve, _reject| {
        set_timeout(&resolve, ms);
    });
    let _ = JsFuture::from(promise).await;
}

/// JS の例外を文字列にする
pub(crate) fn describe(value: &JsValue) -> String {
    if let Some(text) = value.as_string() {
        return text;
    }
    match value.dyn_ref::<js_sys::Error>() {
        Some(error) => String::from(error.message()),
        None => format!("{:?}", value),
    }
}

fn io_error(value: JsValue) -> PortError {
    PortError::Io(describe(&value))
}

/// `SerialPort` をラップしたバックエンド
pub struct WebSerialBackend {
    port: SerialPort,
}

impl WebSerialBackend {
    pub fn new(port: SerialPort) -> Self {
        WebSerialBackend { port }
    }

    fn readable_stream(&self) -> Option<ReadableStream> {
        let value = self.port.readable();
        (!value.is_null() && !value.is_undefined()).then(|| value.unchecked_into())
    }

    fn writable_stream(&self) -> Option<WritableStream> {
        let value = self.port.writable();
        (!value.is_null() && !value.is_undefined()).then(|| value.unchecked_into())
    }
}

#[async_trait(?Send)]
impl SerialBackend for WebSerialBackend {
    async fn open(&self, baud_rate: u32) -> Result<(), PortError> {
        let options = Object::new();
        Reflect::set(&options, &"baudRate".into(), &baud_rate.into()).map_err(io_error)?;
        JsFuture::from(self.port.open(&options))
            .await
            .map_err(|e| PortError::PortUnavailable(describe(&e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PortError> {
        JsFuture::from(self.port.close()).await.map_err(io_error)?;
        Ok(())
    }

    fn is_readable(&self) -> bool {
        self.readable_stream().map_or(false, |stream| !stream.locked())
    }

    fn is_writable(&self) -> bool {
        self.writable_stream().map_or(false, |stream| !stream.locked())
    }

    fn reader(&self) -> Result<Rc<dyn ByteSource>, PortError> {
        let stream = self
            .readable_stream()
            .ok_or_else(|| PortError::PortUnavailable("port is not readable".into()))?;
        let reader = stream.get_reader().map_err(io_error)?;
        Ok(Rc::new(WebSerialSource { reader }))
    }

    fn writer(&self) -> Result<Rc<dyn ByteSink>, PortError> {
        let stream = self
            .writable_stream()
            .ok_or_else(|| PortError::PortUnavailable("port is not writable".into()))?;
        let writer = stream.get_writer().map_err(io_error)?;
        Ok(Rc::new(WebSerialSink { writer }))
    }

    async fn sleep(&self, duration: Duration) {
        sleep(duration).await;
    }
}

struct WebSerialSource {
    reader: StreamReader,
}

#[async_trait(?Send)]
impl ByteSource for WebSerialSource {
    async fn read_chunk(&self) -> Result<Option<Vec<u8>>, PortError> {
        let result = JsFuture::from(self.reader.read()).await.map_err(io_error)?;
        let done = Reflect::get(&result, &"done".into())
            .map_err(io_error)?
            .as_bool()
            .unwrap_or(false);
        if done {
            return Ok(None);
        }
        let value = Reflect::get(&result, &"value".into()).map_err(io_error)?;
        Ok(Some(Uint8Array::new(&value).to_vec()))
    }

    async fn cancel(&self) -> Result<(), PortError> {
        JsFuture::from(self.reader.cancel()).await.map_err(io_error)?;
        Ok(())
    }

    fn release(&self) {
        if let Err(e) = self.reader.release_lock() {
            log::debug!("reader releaseLock failed: {}", describe(&e));
        }
    }
}

struct WebSerialSink {
    writer: StreamWriter,
}

#[async_trait(?Send)]
impl ByteSink for WebSerialSink {
    async fn write(&self, data: &[u8]) -> Result<(), PortError> {
        let chunk = Uint8Array::from(data);
        JsFuture::from(self.writer.write(&chunk)).await.map_err(io_error)?;
        Ok(())
    }

    fn release(&self) {
        if let Err(e) = self.writer.release_lock() {
            log::debug!("writer releaseLock failed: {}", describe(&e));
        }
    }
}

/// `wasm_bindgen_futures::spawn_local` で passthrough ループを走らせる
#[derive(Debug, Clone, Copy, Default)]
pub struct WasmSpawner;

impl LocalSpawn for WasmSpawner {
    fn spawn_local_obj(&self, future: LocalFutureObj<'static, ()>) -> Result<(), SpawnError> {
        wasm_bindgen_futures::spawn_local(future);
        Ok(())
    }
}
