//! デバイスセッション本体（モード状態機械と passthrough ループ）

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::{select, Either};
use futures::lock::Mutex;
use futures::task::LocalSpawn;
use serde::Serialize;

use pico_port::{Connection, PortError, ReaderHandle, SerialBackend, StreamPort};
use pico_proto::{
    DeviceStatus, SessionMode, END_OF_COMMAND, INTERRUPT, OUTPUT_START_MARKER, RAW_MODE_ENTER,
    RAW_MODE_EXIT,
};
use pico_stream::{sanitize_for_terminal, ResponseBuffer, Utf8Accumulator};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::sink::TerminalSink;
use crate::status::StatusTracker;

/// raw REPL で実行したコマンドの出力
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// 標準出力（`OK` の後、最初の 0x04 まで）
    pub stdout: String,
    /// エラー出力（1 つ目と 2 つ目の 0x04 の間）
    pub stderr: String,
}

/// セッション統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// 送信した総バイト数
    pub bytes_sent: u64,
    /// 受信した総バイト数
    pub bytes_received: u64,
    /// 成功したコマンド数
    pub commands_completed: u64,
    /// 失敗したコマンド数
    pub commands_failed: u64,
}

struct Inner<B> {
    port: StreamPort<B>,
    config: SessionConfig,
    mode: Cell<SessionMode>,
    /// 区切りの先まで読んでしまったバイト。次の読み取りの先頭になる
    leftover: RefCell<ResponseBuffer>,
    terminal: RefCell<Option<Rc<dyn TerminalSink>>>,
    status: RefCell<StatusTracker>,
    status_listeners: RefCell<Vec<UnboundedSender<DeviceStatus>>>,
    spawner: Rc<dyn LocalSpawn>,
    /// 書き込みバーストは 1 つずつ
    write_lock: Mutex<()>,
    /// passthrough がリーダーを取り直している間は true
    resuming: Cell<bool>,
    completed: Cell<u64>,
    failed: Cell<u64>,
}

/// raw REPL プロトコルエンジン
///
/// 1 本の双方向バイトストリームを、端末への素通し（passthrough）と
/// プログラムからのコマンド実行とで切り替えて使う。
///
/// ```text
///            ┌──────── enter_raw ────────┐
///            │  リーダーを取り直す          ↓
///   Repl (passthrough)          RawCommand / FileTransfer
///            ↑                            │ コマンド送信 → 区切りまで読む
///            └── 0x02 を送り passthrough ──┘
/// ```
///
/// ## 不変条件
/// - コマンドは同時に 1 つだけ。`Repl` 以外で次のコマンドを始めると `Busy`
/// - 成功・失敗にかかわらず、コマンドの後は必ず `Repl` に戻る
/// - leftover は捨てず、次の読み取り（passthrough かコマンド）の先頭にする
///
/// ## スレッド安全性
///
/// `Rc` ベースのハンドルで、クローンは同じセッションを指す。
/// WASM のシングルスレッド前提で `!Send + !Sync`。
pub struct DeviceSession<B> {
    inner: Rc<Inner<B>>,
}

impl<B> Clone for DeviceSession<B> {
    fn clone(&self) -> Self {
        DeviceSession {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<B: SerialBackend + 'static> DeviceSession<B> {
    /// セッションを生成する
    ///
    /// # 引数
    /// * `backend` - 物理ポート
    /// * `config` - セッション設定
    /// * `spawner` - passthrough ループを走らせるローカル executor
    pub fn new(backend: B, config: SessionConfig, spawner: Rc<dyn LocalSpawn>) -> Self {
        let port = StreamPort::with_policy(backend, config.ready_policy());
        DeviceSession {
            inner: Rc::new(Inner {
                port,
                config,
                mode: Cell::new(SessionMode::Repl),
                leftover: RefCell::new(ResponseBuffer::new()),
                terminal: RefCell::new(None),
                status: RefCell::new(StatusTracker::new()),
                status_listeners: RefCell::new(Vec::new()),
                spawner,
                write_lock: Mutex::new(()),
                resuming: Cell::new(false),
                completed: Cell::new(0),
                failed: Cell::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// 下位のストリームポート
    pub fn port(&self) -> &StreamPort<B> {
        &self.inner.port
    }

    /// 現在のモード
    pub fn mode(&self) -> SessionMode {
        self.inner.mode.get()
    }

    /// 推定されたデバイス状態（未確定なら `None`）
    pub fn status(&self) -> Option<DeviceStatus> {
        self.inner.status.borrow().current()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.port.is_connected()
    }

    /// 端末を登録する（既存のものは置き換える）
    pub fn set_terminal(&self, sink: Rc<dyn TerminalSink>) {
        *self.inner.terminal.borrow_mut() = Some(sink);
    }

    /// 端末の登録を外す
    pub fn clear_terminal(&self) {
        self.inner.terminal.borrow_mut().take();
    }

    /// 状態変化を購読する
    pub fn subscribe_status(&self) -> UnboundedReceiver<DeviceStatus> {
        let (tx, rx) = unbounded();
        self.inner.status_listeners.borrow_mut().push(tx);
        rx
    }

    /// 送受信とコマンドの統計
    pub fn stats(&self) -> SessionStats {
        let port = self.inner.port.stats();
        SessionStats {
            bytes_sent: port.total_sent_bytes,
            bytes_received: port.total_received_bytes,
            commands_completed: self.inner.completed.get(),
            commands_failed: self.inner.failed.get(),
        }
    }

    // ===== 接続 =====

    /// ポートを開いて passthrough を始める
    ///
    /// 既に接続していれば何もせず現在の接続を返す。
    ///
    /// # エラー
    /// - `PortUnavailable`: open が拒否された
    /// - `PortNotReady`: 受信ストリームが取得可能にならなかった（ポートは閉じる）
    pub async fn connect(&self) -> Result<Connection, SessionError> {
        let was_connected = self.inner.port.is_connected();
        let connection = self.inner.port.open().await?;
        if was_connected {
            return Ok(connection);
        }

        self.inner.mode.set(SessionMode::Repl);
        self.inner.leftover.borrow_mut().clear();
        self.inner.status.borrow_mut().reset();

        match self.inner.port.acquire_reader().await {
            Ok(reader) => {
                self.spawn_passthrough(reader);
                Ok(connection)
            }
            Err(e) => {
                log::warn!("could not start passthrough: {}", e);
                if let Err(close_err) = self.inner.port.close().await {
                    log::warn!("failed to close port after connect error: {}", close_err);
                }
                Err(e.into())
            }
        }
    }

    /// passthrough を止めてポートを閉じる。既に閉じていれば何もしない
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let result = self.inner.port.close().await;
        self.reset_after_disconnect();
        result.map_err(Into::into)
    }

    /// ハードウェア切断の通知を反映する
    pub fn handle_disconnect(&self) {
        self.inner.port.handle_disconnect();
        self.reset_after_disconnect();
    }

    // ===== 対話操作 =====

    /// 端末からの入力をそのまま書き込む
    ///
    /// # エラー
    /// - `Busy`: コマンド実行中
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.mode().is_raw() {
            return Err(SessionError::Busy);
        }
        self.write_burst(&[bytes]).await
    }

    /// 0x03 を送って実行中のプログラムを止める（どのモードでも送れる）
    pub async fn interrupt(&self) -> Result<(), SessionError> {
        log::debug!("sending interrupt");
        self.write_burst(&[&[INTERRUPT][..]]).await
    }

    // ===== コマンド =====

    /// コードを raw REPL で実行させる
    ///
    /// 出力は捕捉しない。REPL に戻った後、passthrough で端末に流れる。
    pub async fn run_code(&self, code: &str) -> Result<(), SessionError> {
        let result = match self.enter_raw(SessionMode::RawCommand).await {
            Ok(_reader) => {
                let sent = self
                    .write_burst(&[code.as_bytes(), &[END_OF_COMMAND][..]])
                    .await;
                self.restore_repl(true).await;
                sent
            }
            Err(e) => Err(e),
        };
        self.record(result)
    }

    /// コードを raw REPL で実行し、出力を捕捉する
    ///
    /// エラー出力が空でなくてもエラーにはしない（`CommandOutput::stderr` を見る）。
    pub async fn exec(&self, code: &str) -> Result<CommandOutput, SessionError> {
        let result = match self.enter_raw(SessionMode::RawCommand).await {
            Ok(reader) => {
                let output = self.exec_capture(&reader, code.as_bytes()).await;
                self.restore_repl(true).await;
                output
            }
            Err(e) => Err(e),
        };
        self.record(result)
    }

    /// 操作に期限を付ける
    ///
    /// 期限が先に来た場合は実行中のコマンドを打ち切り、`recover()` で
    /// REPL に戻してから `NoResponse` を返す。
    ///
    /// # 引数
    /// * `op` - セッションの操作
    /// * `deadline` - 期限で完了する Future（タイマーは呼び出し側が用意する）
    pub async fn with_timeout<T, F, D>(&self, op: F, deadline: D) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, SessionError>>,
        D: Future<Output = ()>,
    {
        match select(Box::pin(op), Box::pin(deadline)).await {
            Either::Left((result, _)) => result,
            Either::Right(((), pending)) => {
                drop(pending);
                log::warn!("command timed out");
                if self.mode().is_raw() {
                    self.recover().await;
                }
                self.record(Err(SessionError::NoResponse))
            }
        }
    }

    /// 打ち切られたコマンドの後始末
    ///
    /// リーダーをキャンセルし、leftover を捨て、0x02 を送り直して REPL に戻し、
    /// passthrough を再開する。
    pub async fn recover(&self) {
        log::info!("recovering session from {:?}", self.mode());
        if let Err(e) = self.inner.port.release_reader().await {
            log::warn!("failed to cancel reader during recovery: {}", e);
        }
        self.inner.leftover.borrow_mut().clear();
        self.restore_repl(true).await;
    }

    // ===== Private / crate 内メソッド =====

    /// raw REPL に入り、コマンド用のリーダーを返す
    ///
    /// モードは最初の `.await` より前に切り替えるので、同じタスク内でも
    /// 別タスクからでも 2 つ目のコマンドは必ず `Busy` になる。
    pub(crate) async fn enter_raw(&self, mode: SessionMode) -> Result<ReaderHandle, SessionError> {
        if self.mode().is_raw() || self.inner.resuming.get() {
            return Err(SessionError::Busy);
        }
        if !self.inner.port.is_connected() {
            return Err(PortError::PortUnavailable("serial port is not open".into()).into());
        }
        self.inner.mode.set(mode);
        log::debug!("entering {:?}", mode);

        // passthrough のリーダーはここでキャンセルされる
        let reader = match self.inner.port.acquire_reader().await {
            Ok(reader) => reader,
            Err(e) => {
                self.restore_repl(false).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.write_burst(&[&[RAW_MODE_ENTER][..]]).await {
            self.restore_repl(false).await;
            return Err(e);
        }
        Ok(reader)
    }

    /// REPL に戻り passthrough を再開する
    ///
    /// passthrough 用のリーダーを取ってからモードを戻す。取り終えるまでは
    /// 他のコマンドが `Busy` になり、リーダーを奪い合わない。
    pub(crate) async fn restore_repl(&self, send_exit: bool) {
        let port = &self.inner.port;
        if send_exit && port.is_connected() {
            if let Err(e) = self.write_burst(&[&[RAW_MODE_EXIT][..]]).await {
                log::warn!("failed to send raw mode exit: {}", e);
            }
        }

        let reader = if port.is_connected() {
            match port.acquire_reader().await {
                Ok(reader) => Some(reader),
                Err(e) => {
                    log::warn!("failed to resume passthrough: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.inner.mode.set(SessionMode::Repl);
        log::debug!("back to REPL");
        if let Some(reader) = reader {
            self.spawn_passthrough(reader);
        }
    }

    /// コマンドを送り、`OK` から 2 つ目の 0x04 までを読む
    pub(crate) async fn exec_capture(
        &self,
        reader: &ReaderHandle,
        code: &[u8],
    ) -> Result<CommandOutput, SessionError> {
        self.write_burst(&[code, &[END_OF_COMMAND][..]]).await?;

        // 前回の応答の末尾 '>' が leftover に残っていれば、それと合わせて >OK になる
        self.read_until(reader, OUTPUT_START_MARKER).await?;
        let stdout = self.read_until(reader, &[END_OF_COMMAND]).await?;
        let stderr = self.read_until(reader, &[END_OF_COMMAND]).await?;
        log::debug!(
            "command finished: {} bytes stdout, {} bytes stderr",
            stdout.len(),
            stderr.len()
        );

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// `exec_capture` し、エラー出力があれば `Remote` にする
    pub(crate) async fn exec_checked(
        &self,
        reader: &ReaderHandle,
        code: &[u8],
    ) -> Result<String, SessionError> {
        let output = self.exec_capture(reader, code).await?;
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            return Err(SessionError::Remote(stderr.to_string()));
        }
        Ok(output.stdout)
    }

    /// 区切りが見つかるまで leftover に読み足し、区切りの手前を返す
    ///
    /// 区切りの後ろは leftover に残る。区切りが来なければ、リーダーが
    /// キャンセルされるかストリームが終わるまで待ち続ける。
    async fn read_until(
        &self,
        reader: &ReaderHandle,
        delimiter: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        loop {
            if let Some(found) = self.inner.leftover.borrow_mut().take_until(delimiter) {
                return Ok(found);
            }
            match reader.read().await? {
                Some(bytes) => self.inner.leftover.borrow_mut().push(&bytes),
                None if reader.is_cancelled() => return Err(SessionError::NoResponse),
                None => {
                    log::warn!("device stream ended during a command");
                    self.inner.port.handle_disconnect();
                    return Err(PortError::TransportClosed.into());
                }
            }
        }
    }

    /// ライターを取り、書いて、解放する
    ///
    /// 他のバーストが書き込み中なら、それが終わるまで待つ。
    async fn write_burst(&self, parts: &[&[u8]]) -> Result<(), SessionError> {
        let _burst = self.inner.write_lock.lock().await;
        let port = &self.inner.port;
        if port.acquire_writer().is_none() {
            return Err(if port.is_connected() {
                PortError::WriterUnavailable
            } else {
                PortError::PortUnavailable("serial port is not open".into())
            }
            .into());
        }

        let mut result = Ok(());
        for part in parts.iter().filter(|p| !p.is_empty()) {
            result = port.write_bytes(part).await;
            if result.is_err() {
                break;
            }
        }
        port.release_writer();
        result.map_err(Into::into)
    }

    pub(crate) fn record<T>(&self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        let counter = if result.is_ok() {
            &self.inner.completed
        } else {
            &self.inner.failed
        };
        counter.set(counter.get() + 1);
        result
    }

    fn reset_after_disconnect(&self) {
        self.inner.mode.set(SessionMode::Repl);
        self.inner.leftover.borrow_mut().clear();
        self.inner.status.borrow_mut().reset();
    }

    fn spawn_passthrough(&self, reader: ReaderHandle) {
        let session = self.clone();
        let task = async move { session.passthrough(reader).await };
        if let Err(e) = self.inner.spawner.spawn_local_obj(Box::pin(task).into()) {
            log::warn!("failed to spawn passthrough loop: {}", e);
        }
    }

    /// 端末への素通しループ
    ///
    /// 始まる前にリーダーが奪われていれば、leftover には触れずに終わる
    /// （次のコマンドが読む）。
    async fn passthrough(self, mut reader: ReaderHandle) {
        if reader.is_cancelled() {
            return;
        }
        log::debug!("passthrough started");

        let mut utf8 = Utf8Accumulator::new();
        let pending = self.inner.leftover.borrow_mut().take_all();
        if !pending.is_empty() {
            self.forward(&mut utf8, &pending);
        }

        loop {
            match reader.read().await {
                Ok(Some(bytes)) => self.forward(&mut utf8, &bytes),
                Ok(None) if reader.is_cancelled() => break,
                Ok(None) => {
                    log::info!("device stream ended");
                    self.handle_disconnect();
                    return;
                }
                Err(e) => {
                    if reader.is_cancelled() {
                        break;
                    }
                    // 回線エラーではポートは開いたまま。新しいリーダーで続ける
                    log::warn!("passthrough read failed: {}", e);
                    match self.resume_reader().await {
                        Some(next) => reader = next,
                        None => return,
                    }
                }
            }
        }

        // 割れたマルチバイト文字は次の読み手に渡す
        let partial = utf8.take_partial();
        if !partial.is_empty() {
            let mut leftover = self.inner.leftover.borrow_mut();
            let rest = leftover.take_all();
            leftover.push(&partial);
            leftover.push(&rest);
        }
        log::debug!("passthrough stopped");
    }

    /// 読み取りエラーの後、passthrough 用のリーダーを取り直す
    ///
    /// 取り直している間はコマンドを `Busy` にする。取れなければポートを閉じ、
    /// 再接続できる状態にする。
    async fn resume_reader(&self) -> Option<ReaderHandle> {
        self.inner.resuming.set(true);
        let result = self.inner.port.acquire_reader().await;
        self.inner.resuming.set(false);
        match result {
            Ok(next) => Some(next),
            Err(e) => {
                log::warn!("could not resume passthrough: {}", e);
                if let Err(close_err) = self.inner.port.close().await {
                    log::warn!("failed to close port after read error: {}", close_err);
                }
                self.reset_after_disconnect();
                None
            }
        }
    }

    fn forward(&self, utf8: &mut Utf8Accumulator, bytes: &[u8]) {
        let text = utf8.decode(bytes);
        if text.is_empty() {
            return;
        }

        let change = self.inner.status.borrow_mut().observe(&text);
        if let Some(status) = change {
            self.emit_status(status);
        }

        let clean = sanitize_for_terminal(&text);
        if clean.is_empty() {
            return;
        }
        let terminal = self.inner.terminal.borrow().clone();
        if let Some(terminal) = terminal {
            terminal.accept(&clean);
        }
    }

    fn emit_status(&self, status: DeviceStatus) {
        log::debug!("device status: {}", status);
        self.inner
            .status_listeners
            .borrow_mut()
            .retain(|tx| tx.unbounded_send(status).is_ok());
    }
}

impl<B> std::fmt::Debug for DeviceSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("mode", &self.inner.mode.get())
            .field("port", &self.inner.port)
            .field("leftover", &self.inner.leftover.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::channel::oneshot;
    use futures::task::LocalSpawnExt;
    use pico_port::mock::{MockBackend, SimulatedDevice};

    use super::*;
    use crate::testutil::{connected, scripted, silent};

    #[test]
    fn test_passthrough_forwards_sanitized_text() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.backend.push_inbound(b"hello\x04\r\n>>> ");
        h.pool.run_until_stalled();
        assert_eq!(*h.terminal.borrow(), "hello\r\n>>> ");
        assert_eq!(h.session.status(), Some(DeviceStatus::Repl));
    }

    #[test]
    fn test_passthrough_reassembles_split_characters() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.backend.push_inbound(b"\xE3\x81");
        h.pool.run_until_stalled();
        h.backend.push_inbound(b"\x82");
        h.pool.run_until_stalled();
        assert_eq!(*h.terminal.borrow(), "\u{3042}");
    }

    #[test]
    fn test_status_changes_fire_once() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        let mut changes = h.session.subscribe_status();
        for chunk in [">>> ", "1", "2", "\r\n>>> "] {
            h.backend.push_inbound(chunk.as_bytes());
            h.pool.run_until_stalled();
        }
        assert_eq!(changes.try_next().unwrap(), Some(DeviceStatus::Repl));
        assert_eq!(changes.try_next().unwrap(), Some(DeviceStatus::Running));
        assert_eq!(changes.try_next().unwrap(), Some(DeviceStatus::Repl));
        assert!(changes.try_next().is_err(), "同じ状態は通知しない");
    }

    #[test]
    fn test_send_raw_is_written_unmodified() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.pool.run_until(h.session.send_raw(b"help()\r")).unwrap();
        assert_eq!(h.backend.written(), b"help()\r".to_vec());
        assert_eq!(h.backend.writers_released(), 1);
    }

    #[test]
    fn test_overlapping_writes_are_serialized() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.backend.hold_writes();

        let (tx_a, rx_a) = oneshot::channel();
        let session = h.session.clone();
        h.pool
            .spawner()
            .spawn_local(async move {
                let _ = tx_a.send(session.send_raw(b"a").await);
            })
            .unwrap();
        h.pool.run_until_stalled();
        assert!(h.backend.writer_locked());

        let (tx_b, rx_b) = oneshot::channel();
        let session = h.session.clone();
        h.pool
            .spawner()
            .spawn_local(async move {
                let _ = tx_b.send(session.send_raw(b"b").await);
            })
            .unwrap();
        h.pool.run_until_stalled();

        h.backend.resume_writes();
        h.pool.run_until_stalled();
        assert_eq!(h.pool.run_until(rx_a).unwrap(), Ok(()));
        assert_eq!(h.pool.run_until(rx_b).unwrap(), Ok(()), "2 つ目は待ってから書く");

        h.pool.run_until(h.session.send_raw(b"c")).unwrap();
        assert_eq!(h.backend.written(), b"abc".to_vec());
        assert!(!h.backend.writer_locked());
        assert_eq!(h.backend.writers_released(), 3);
    }

    #[test]
    fn test_interrupt_waits_for_command_write() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.backend.hold_writes();

        let (tx, mut rx) = oneshot::channel();
        let session = h.session.clone();
        h.pool
            .spawner()
            .spawn_local(async move {
                let _ = tx.send(session.exec("while True: pass").await);
            })
            .unwrap();
        h.pool.run_until_stalled();
        assert_eq!(h.session.mode(), SessionMode::RawCommand);

        let (itx, irx) = oneshot::channel();
        let session = h.session.clone();
        h.pool
            .spawner()
            .spawn_local(async move {
                let _ = itx.send(session.interrupt().await);
            })
            .unwrap();
        h.pool.run_until_stalled();

        h.backend.resume_writes();
        h.pool.run_until_stalled();

        assert_eq!(h.pool.run_until(irx).unwrap(), Ok(()));
        let written = h.backend.written();
        assert_eq!(written.first(), Some(&RAW_MODE_ENTER));
        assert!(written.contains(&INTERRUPT));
        assert!(written.ends_with(b"\x04") || written.ends_with(&[INTERRUPT]));
        // コマンドは書き込みに失敗せず、応答待ちのまま
        assert_eq!(rx.try_recv(), Ok(None));
        assert!(!h.backend.writer_locked());
    }

    #[test]
    fn test_recover_after_write_dropped_mid_burst() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.backend.hold_writes();

        let (deadline_tx, deadline_rx) = oneshot::channel::<()>();
        let (tx, rx) = oneshot::channel();
        let session = h.session.clone();
        h.pool
            .spawner()
            .spawn_local(async move {
                let deadline = async move {
                    let _ = deadline_rx.await;
                };
                let _ = tx.send(session.with_timeout(session.exec("x"), deadline).await);
            })
            .unwrap();
        h.pool.run_until_stalled();

        deadline_tx.send(()).unwrap();
        h.pool.run_until_stalled();
        h.backend.resume_writes();
        h.pool.run_until_stalled();

        assert_eq!(h.pool.run_until(rx).unwrap(), Err(SessionError::NoResponse));
        assert_eq!(h.session.mode(), SessionMode::Repl);
        assert_eq!(h.backend.written(), vec![RAW_MODE_EXIT]);
        assert!(!h.backend.writer_locked());

        h.pool.run_until(h.session.send_raw(b"x")).unwrap();
        assert_eq!(h.backend.written(), vec![RAW_MODE_EXIT, b'x']);
    }

    #[test]
    fn test_clear_terminal_stops_forwarding() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.backend.push_inbound(b"a");
        h.pool.run_until_stalled();
        h.session.clear_terminal();
        h.backend.push_inbound(b"b");
        h.pool.run_until_stalled();
        assert_eq!(*h.terminal.borrow(), "a");
        assert_eq!(h.session.status(), Some(DeviceStatus::Running));
    }

    #[test]
    fn test_run_code_frames_with_sentinels() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.pool.run_until(h.session.run_code("x = 1")).unwrap();
        assert_eq!(h.backend.written(), b"\x01x = 1\x04\x02".to_vec());
        assert_eq!(h.session.mode(), SessionMode::Repl);
        assert_eq!(h.session.stats().commands_completed, 1);
    }

    #[test]
    fn test_run_code_output_reaches_terminal() {
        let backend = MockBackend::with_responder(SimulatedDevice::new());
        let mut h = connected(backend, SessionConfig::default());
        h.pool.run_until(h.session.run_code("print(\"hi\")")).unwrap();
        h.pool.run_until_stalled();

        let terminal = h.terminal.borrow().clone();
        assert!(terminal.contains("OKhi\r\n>"), "terminal: {:?}", terminal);
        assert!(terminal.ends_with(">>> "));
        assert!(!terminal.contains('\x04'));
        assert_eq!(h.session.status(), Some(DeviceStatus::Repl));
    }

    #[test]
    fn test_exec_captures_stdout_and_stderr() {
        let backend = MockBackend::with_responder(scripted(&[b"raw REPL; CTRL-B to exit\r\n>OKout\x04err\x04>"]));
        let mut h = connected(backend, SessionConfig::default());
        let output = h.pool.run_until(h.session.exec("anything")).unwrap();
        assert_eq!(
            output,
            CommandOutput {
                stdout: "out".into(),
                stderr: "err".into(),
            }
        );
    }

    #[test]
    fn test_start_marker_split_across_chunks() {
        let backend = MockBackend::with_responder(|written: &[u8]| -> Vec<Vec<u8>> {
            if written.contains(&END_OF_COMMAND) {
                vec![b"raw REPL\r\n>".to_vec(), b"O".to_vec(), b"Kyes\x04".to_vec(), b"\x04>".to_vec()]
            } else {
                Vec::new()
            }
        });
        let mut h = connected(backend, SessionConfig::default());
        let output = h.pool.run_until(h.session.exec("x")).unwrap();
        assert_eq!(output.stdout, "yes");
    }

    #[test]
    fn test_leftover_carries_into_next_command() {
        // 1 回目の応答チャンクに 2 回目の応答の先頭が同居している
        let backend = MockBackend::with_responder(scripted(&[
            b">OKfirst\x04\x04>OKsec",
            b"ond\x04\x04>",
        ]));
        let mut h = connected(backend, SessionConfig::default());
        let session = h.session.clone();
        let (first, second) = h.pool.run_until(async move {
            let first = session.exec("a").await.unwrap();
            let second = session.exec("b").await.unwrap();
            (first, second)
        });
        assert_eq!(first.stdout, "first");
        assert_eq!(second.stdout, "second", "leftover を落としても重複させてもいけない");
    }

    #[test]
    fn test_leftover_reaches_terminal_when_idle() {
        let backend = MockBackend::with_responder(scripted(&[b">OKx\x04\x04>trailing"]));
        let mut h = connected(backend, SessionConfig::default());
        h.pool.run_until(h.session.exec("a")).unwrap();
        h.pool.run_until_stalled();
        assert_eq!(*h.terminal.borrow(), ">trailing");
    }

    #[test]
    fn test_second_command_is_busy() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        let (tx, rx) = oneshot::channel();
        let session = h.session.clone();
        h.pool
            .spawner()
            .spawn_local(async move {
                let _ = tx.send(session.write_file("main.py", b"print(1)").await);
            })
            .unwrap();
        h.pool.run_until_stalled();
        assert_eq!(h.session.mode(), SessionMode::FileTransfer);

        assert_eq!(h.pool.run_until(h.session.run_code("x")), Err(SessionError::Busy));
        assert_eq!(h.pool.run_until(h.session.list_files()), Err(SessionError::Busy));
        assert_eq!(h.pool.run_until(h.session.send_raw(b"a")), Err(SessionError::Busy));
        // 割り込みだけはいつでも送れる
        h.pool.run_until(h.session.interrupt()).unwrap();
        assert!(h.backend.written().ends_with(&[INTERRUPT]));

        h.pool.run_until(h.session.recover());
        h.pool.run_until_stalled();
        assert_eq!(h.pool.run_until(rx).unwrap(), Err(SessionError::NoResponse));
        assert_eq!(h.session.mode(), SessionMode::Repl);
    }

    #[test]
    fn test_timeout_recovers_to_repl() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        let (deadline_tx, deadline_rx) = oneshot::channel::<()>();
        let (tx, rx) = oneshot::channel();
        let session = h.session.clone();
        h.pool
            .spawner()
            .spawn_local(async move {
                let deadline = async move {
                    let _ = deadline_rx.await;
                };
                let _ = tx.send(session.with_timeout(session.read_file("a.py"), deadline).await);
            })
            .unwrap();
        h.pool.run_until_stalled();
        assert_eq!(h.session.mode(), SessionMode::FileTransfer);

        deadline_tx.send(()).unwrap();
        h.pool.run_until_stalled();

        assert_eq!(h.pool.run_until(rx).unwrap(), Err(SessionError::NoResponse));
        assert_eq!(h.session.mode(), SessionMode::Repl);
        assert_eq!(h.backend.written().last(), Some(&RAW_MODE_EXIT));
        assert_eq!(h.session.stats().commands_failed, 1);

        // 復旧後は passthrough が動いている
        h.backend.push_inbound(b">>> ");
        h.pool.run_until_stalled();
        assert!(h.terminal.borrow().ends_with(">>> "));
    }

    #[test]
    fn test_timeout_not_reached() {
        let backend = MockBackend::with_responder(scripted(&[b">OK42\x04\x04>"]));
        let mut h = connected(backend, SessionConfig::default());
        let output = h
            .pool
            .run_until(h.session.with_timeout(h.session.exec("print(42)"), futures::future::pending()))
            .unwrap();
        assert_eq!(output.stdout, "42");
    }

    #[test]
    fn test_not_connected() {
        let pool = futures::executor::LocalPool::new();
        let session = DeviceSession::new(MockBackend::new(), SessionConfig::default(), Rc::new(pool.spawner()));
        let err = futures::executor::block_on(session.exec("x")).unwrap_err();
        assert!(matches!(err, SessionError::Port(PortError::PortUnavailable(_))));
        assert_eq!(session.mode(), SessionMode::Repl);
    }

    #[test]
    fn test_mode_restored_after_reader_not_ready() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.backend.set_unreadable_for(u32::MAX);
        let err = h.pool.run_until(h.session.exec("x")).unwrap_err();
        assert_eq!(err, SessionError::Port(PortError::PortNotReady { attempts: 20 }));
        assert_eq!(h.session.mode(), SessionMode::Repl);

        h.backend.set_unreadable_for(0);
        h.backend.clear_written();
        h.pool.run_until(h.session.send_raw(b"\r")).unwrap();
        assert_eq!(h.backend.written(), b"\r".to_vec());
    }

    #[test]
    fn test_unplug_during_command() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        let (tx, rx) = oneshot::channel();
        let session = h.session.clone();
        h.pool
            .spawner()
            .spawn_local(async move {
                let _ = tx.send(session.exec("while True: pass").await);
            })
            .unwrap();
        h.pool.run_until_stalled();

        h.backend.unplug();
        h.pool.run_until_stalled();

        assert_eq!(
            h.pool.run_until(rx).unwrap(),
            Err(SessionError::Port(PortError::TransportClosed))
        );
        assert_eq!(h.session.mode(), SessionMode::Repl);
        assert!(!h.session.is_connected());
    }

    #[test]
    fn test_unplug_while_idle() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        let mut events = h.session.port().subscribe();
        h.backend.unplug();
        h.pool.run_until_stalled();
        assert!(!h.session.is_connected());
        assert_eq!(events.try_next().unwrap(), Some(pico_port::PortEvent::Disconnected));
    }

    #[test]
    fn test_read_error_keeps_passthrough_running() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.backend.fail_reads(1);
        h.pool.run_until_stalled();

        assert!(h.session.is_connected());
        assert_eq!(h.backend.closes(), 0);
        assert_eq!(h.backend.readers_created(), 2);
        assert_eq!(h.backend.live_readers(), 1);

        h.backend.push_inbound(b">>> ");
        h.pool.run_until_stalled();
        assert_eq!(*h.terminal.borrow(), ">>> ");
    }

    #[test]
    fn test_read_error_without_new_reader_closes_port() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.backend.set_unreadable_for(u32::MAX);
        h.backend.fail_reads(1);
        h.pool.run_until_stalled();

        assert!(!h.session.is_connected());
        assert_eq!(h.backend.closes(), 1, "バックエンドも閉じる");

        h.backend.set_unreadable_for(0);
        h.pool.run_until(h.session.connect()).unwrap();
        h.pool.run_until_stalled();
        h.backend.push_inbound(b">>> ");
        h.pool.run_until_stalled();
        assert_eq!(*h.terminal.borrow(), ">>> ");
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.pool.run_until(h.session.disconnect()).unwrap();
        h.pool.run_until_stalled();
        assert!(!h.session.is_connected());
        assert_eq!(h.backend.live_readers(), 0);
        h.pool.run_until(h.session.disconnect()).unwrap();

        h.pool.run_until(h.session.connect()).unwrap();
        h.pool.run_until_stalled();
        h.backend.push_inbound(b">>> ");
        h.pool.run_until_stalled();
        assert_eq!(*h.terminal.borrow(), ">>> ");
    }

    #[test]
    fn test_connect_rejected() {
        let backend = MockBackend::new();
        backend.reject_open("no port selected");
        let mut pool = futures::executor::LocalPool::new();
        let session = DeviceSession::new(backend, SessionConfig::default(), Rc::new(pool.spawner()));
        let err = pool.run_until(session.connect()).unwrap_err();
        assert!(matches!(err, SessionError::Port(PortError::PortUnavailable(_))));
    }

    #[test]
    fn test_stats_serialize() {
        let mut h = connected(MockBackend::with_responder(silent()), SessionConfig::default());
        h.pool.run_until(h.session.send_raw(b"ab")).unwrap();
        let json = serde_json::to_string(&h.session.stats()).unwrap();
        assert_eq!(
            json,
            r#"{"bytes_sent":2,"bytes_received":0,"commands_completed":0,"commands_failed":0}"#
        );
    }
}
