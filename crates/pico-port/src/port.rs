//! ストリームポート本体

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};

use pico_proto::BAUD_RATE;

use crate::backend::{ByteSource, SerialBackend};
use crate::error::PortError;
use crate::handle::{ReadShared, ReaderHandle, WriterHandle};

/// readiness 確認の既定回数
pub const DEFAULT_READY_ATTEMPTS: u32 = 20;

/// readiness 確認の既定間隔
pub const DEFAULT_READY_INTERVAL: Duration = Duration::from_millis(100);

/// 開いている接続の情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    /// ボーレート（常に 115200）
    pub baud_rate: u32,
}

/// 接続状態の変化通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    /// ポートを開いた
    Connected(Connection),
    /// ポートを閉じた、またはハードウェアが切断された
    Disconnected,
}

/// リーダー取得時に readiness を待つ方針
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyPolicy {
    /// readiness を確認する最大回数
    pub attempts: u32,
    /// 確認の間隔
    pub interval: Duration,
}

impl Default for ReadyPolicy {
    fn default() -> Self {
        ReadyPolicy {
            attempts: DEFAULT_READY_ATTEMPTS,
            interval: DEFAULT_READY_INTERVAL,
        }
    }
}

/// ポートの送受信統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    /// 送信した総バイト数
    pub total_sent_bytes: u64,
    /// 受信した総バイト数
    pub total_received_bytes: u64,
}

/// 現在のリーダー（キャンセル用の控え）
struct ActiveReader {
    source: Rc<dyn ByteSource>,
    cancelled: Rc<Cell<bool>>,
}

#[derive(Default)]
struct PortState {
    connected: bool,
    writer: Option<WriterHandle>,
    reader: Option<ActiveReader>,
}

/// 物理バイトチャンネルの所有者
///
/// open/close、排他ライター・リーダーの取得、接続状態の報告を担当する。
/// プロトコルの知識は持たない。
///
/// ## 不変条件
/// - リーダーは同時に 1 つだけ。新しいリーダーを渡す前に古いものをキャンセル・解放する
/// - `RefCell` の借用を `.await` をまたいで保持しない
///
/// ## スレッド安全性
///
/// WASM のシングルスレッド協調スケジューリングを前提とし、`!Send + !Sync`。
pub struct StreamPort<B> {
    backend: B,
    policy: ReadyPolicy,
    state: RefCell<PortState>,
    shared: Rc<ReadShared>,
    sent: Cell<u64>,
    listeners: RefCell<Vec<UnboundedSender<PortEvent>>>,
}

impl<B: SerialBackend> StreamPort<B> {
    /// 既定の readiness 方針でポートを生成する
    pub fn new(backend: B) -> Self {
        Self::with_policy(backend, ReadyPolicy::default())
    }

    /// readiness 方針を指定してポートを生成する
    pub fn with_policy(backend: B, policy: ReadyPolicy) -> Self {
        StreamPort {
            backend,
            policy,
            state: RefCell::new(PortState::default()),
            shared: Rc::new(ReadShared::default()),
            sent: Cell::new(0),
            listeners: RefCell::new(Vec::new()),
        }
    }

    /// 接続中か
    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    /// 接続状態の変化を購読する
    pub fn subscribe(&self) -> UnboundedReceiver<PortEvent> {
        let (tx, rx) = unbounded();
        self.listeners.borrow_mut().push(tx);
        rx
    }

    /// ポートを固定ボーレートで開く
    ///
    /// 既に開いている場合は何もせず現在の接続を返す。
    ///
    /// # エラー
    /// - `PortError::PortUnavailable`: ポート未選択、または open が拒否された
    pub async fn open(&self) -> Result<Connection, PortError> {
        let connection = Connection {
            baud_rate: BAUD_RATE,
        };
        if self.is_connected() {
            return Ok(connection);
        }

        if let Err(e) = self.backend.open(BAUD_RATE).await {
            log::warn!("failed to open serial port: {}", e);
            return Err(match e {
                PortError::PortUnavailable(_) => e,
                other => PortError::PortUnavailable(other.to_string()),
            });
        }

        self.state.borrow_mut().connected = true;
        log::info!("serial port opened at {} baud", BAUD_RATE);
        self.emit(PortEvent::Connected(connection));
        Ok(connection)
    }

    /// リーダーをキャンセルし、ライターを解放してポートを閉じる
    ///
    /// 既に閉じている場合は何もしない。
    pub async fn close(&self) -> Result<(), PortError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.state.borrow_mut().connected = false;

        if let Err(e) = self.release_reader().await {
            log::warn!("failed to cancel reader while closing: {}", e);
        }
        self.release_writer();
        self.shared.carry.borrow_mut().clear();

        let result = self.backend.close().await;
        if let Err(e) = &result {
            log::warn!("failed to close serial port: {}", e);
        }
        log::info!("serial port closed");
        self.emit(PortEvent::Disconnected);
        result
    }

    /// ハードウェア切断の通知を反映する
    ///
    /// ストリームは既に壊れているので、バックエンドのキャンセルは待たない。
    pub fn handle_disconnect(&self) {
        let (was_connected, reader, writer) = {
            let mut state = self.state.borrow_mut();
            let was_connected = std::mem::replace(&mut state.connected, false);
            (was_connected, state.reader.take(), state.writer.take())
        };
        if let Some(active) = reader {
            active.cancelled.set(true);
            active.source.release();
        }
        if let Some(writer) = writer {
            writer.sink.release();
        }
        self.shared.carry.borrow_mut().clear();
        if was_connected {
            log::info!("serial port disconnected");
            self.emit(PortEvent::Disconnected);
        }
    }

    /// ライターを取得する
    ///
    /// 取得したハンドルは内部に記憶され、`write_bytes()` が使う。
    /// 保持中のライターは、ストリームの書き込み可否にかかわらずそのまま返す。
    ///
    /// # 戻り値
    /// 接続中で書き込み可能なら `Some`、それ以外は `None`
    pub fn acquire_writer(&self) -> Option<WriterHandle> {
        let mut state = self.state.borrow_mut();
        if !state.connected {
            if let Some(stale) = state.writer.take() {
                stale.sink.release();
            }
            return None;
        }
        if let Some(writer) = &state.writer {
            return Some(writer.clone());
        }
        if !self.backend.is_writable() {
            return None;
        }
        match self.backend.writer() {
            Ok(sink) => {
                let writer = WriterHandle { sink };
                state.writer = Some(writer.clone());
                Some(writer)
            }
            Err(e) => {
                log::warn!("failed to lock writable stream: {}", e);
                None
            }
        }
    }

    /// 記憶しているライターを解放する
    pub fn release_writer(&self) {
        let writer = self.state.borrow_mut().writer.take();
        if let Some(writer) = writer {
            writer.sink.release();
        }
    }

    /// 記憶しているライターで生のバイト列を書き込む
    ///
    /// # エラー
    /// - `PortError::WriterUnavailable`: ライターを保持していない
    pub async fn write_bytes(&self, data: &[u8]) -> Result<(), PortError> {
        let writer = self
            .state
            .borrow()
            .writer
            .clone()
            .ok_or(PortError::WriterUnavailable)?;
        writer.write(data).await?;
        self.sent.set(self.sent.get() + data.len() as u64);
        Ok(())
    }

    /// 新しい排他リーダーを取得する
    ///
    /// 既存のリーダーがあれば、先にキャンセルして解放する。
    /// 受信ストリームが取得可能になるまで `ReadyPolicy` に従ってポーリングする。
    ///
    /// # エラー
    /// - `PortError::PortUnavailable`: ポートが開いていない
    /// - `PortError::PortNotReady`: リトライ回数を使い切った
    pub async fn acquire_reader(&self) -> Result<ReaderHandle, PortError> {
        loop {
            if let Some(stale) = self.take_active_reader() {
                // エラーで終わったストリームは cancel も失敗するが、ロックは解放済み
                if let Err(e) = Self::cancel_active(stale).await {
                    log::debug!("stale reader cancel failed: {}", e);
                }
            }

            self.wait_until_readable().await?;

            // 待っている間に別のリーダーが取られていたら、もう一度キャンセルからやり直す
            if self.state.borrow().reader.is_some() {
                continue;
            }

            // ここから先は .await しない
            let source = self.backend.reader()?;
            let cancelled = Rc::new(Cell::new(false));
            self.state.borrow_mut().reader = Some(ActiveReader {
                source: Rc::clone(&source),
                cancelled: Rc::clone(&cancelled),
            });
            log::debug!("reader acquired");
            return Ok(ReaderHandle {
                source,
                cancelled,
                shared: Rc::clone(&self.shared),
            });
        }
    }

    /// 現在のリーダーをキャンセルして解放する
    ///
    /// 保留中の読み取りは `Ok(None)` で完了する。リーダーが無ければ何もしない。
    pub async fn release_reader(&self) -> Result<(), PortError> {
        match self.take_active_reader() {
            Some(active) => Self::cancel_active(active).await,
            None => Ok(()),
        }
    }

    /// 送受信統計
    pub fn stats(&self) -> PortStats {
        PortStats {
            total_sent_bytes: self.sent.get(),
            total_received_bytes: self.shared.received.get(),
        }
    }

    // ===== Private メソッド =====

    fn take_active_reader(&self) -> Option<ActiveReader> {
        self.state.borrow_mut().reader.take()
    }

    async fn cancel_active(active: ActiveReader) -> Result<(), PortError> {
        // フラグはバックエンドを待つ前に立てる
        active.cancelled.set(true);
        let result = active.source.cancel().await;
        active.source.release();
        log::debug!("reader released");
        result
    }

    async fn wait_until_readable(&self) -> Result<(), PortError> {
        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            if !self.is_connected() {
                return Err(PortError::PortUnavailable("serial port is not open".into()));
            }
            if self.backend.is_readable() {
                return Ok(());
            }
            if attempt < attempts {
                self.backend.sleep(self.policy.interval).await;
            }
        }
        log::warn!("serial port not readable after {} attempts", attempts);
        Err(PortError::PortNotReady { attempts })
    }

    fn emit(&self, event: PortEvent) {
        self.listeners
            .borrow_mut()
            .retain(|tx| tx.unbounded_send(event).is_ok());
    }
}

impl<B> std::fmt::Debug for StreamPort<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("StreamPort")
            .field("connected", &state.connected)
            .field("has_reader", &state.reader.is_some())
            .field("has_writer", &state.writer.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}
