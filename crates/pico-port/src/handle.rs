//! 排他リーダー / ライターハンドル

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::backend::{ByteSink, ByteSource};
use crate::error::PortError;

/// リーダー間で共有する受信状態
#[derive(Default)]
pub(crate) struct ReadShared {
    /// キャンセル済みハンドルが受け取ってしまったバイト。次のリーダーが最初に返す
    pub(crate) carry: RefCell<Vec<u8>>,
    /// 受信した総バイト数（統計用）
    pub(crate) received: Cell<u64>,
}

/// 受信ストリームの排他カーソル
///
/// 同時に存在できるのは 1 つだけ。`StreamPort::acquire_reader()` が新しいハンドルを
/// 返す前に、古いハンドルはキャンセルされる。
///
/// ## キャンセルの扱い
///
/// キャンセルフラグはバックエンドのキャンセルを待つ前に同期的に立てる。
/// フラグが立った後に届いたチャンクは呼び出し側に返さず、共有の carry に移す。
/// そのため、キャンセルとハンドル破棄の間に届いたバイトが消えることはない。
pub struct ReaderHandle {
    pub(crate) source: Rc<dyn ByteSource>,
    pub(crate) cancelled: Rc<Cell<bool>>,
    pub(crate) shared: Rc<ReadShared>,
}

impl ReaderHandle {
    /// 次のチャンクを読む
    ///
    /// 前のリーダーから引き継いだ carry があれば、それを最初に返す。
    ///
    /// # 戻り値
    /// - `Ok(Some(bytes))`: 受信データ
    /// - `Ok(None)`: ストリーム終端、またはこのハンドルがキャンセルされた
    pub async fn read(&self) -> Result<Option<Vec<u8>>, PortError> {
        if self.cancelled.get() {
            return Ok(None);
        }

        let carried = std::mem::take(&mut *self.shared.carry.borrow_mut());
        if !carried.is_empty() {
            return Ok(Some(carried));
        }

        match self.source.read_chunk().await {
            Ok(Some(bytes)) => {
                self.shared
                    .received
                    .set(self.shared.received.get() + bytes.len() as u64);
                if self.cancelled.get() {
                    log::debug!("reader cancelled mid-read, carrying {} bytes", bytes.len());
                    self.shared.carry.borrow_mut().extend_from_slice(&bytes);
                    return Ok(None);
                }
                Ok(Some(bytes))
            }
            Ok(None) => Ok(None),
            Err(_) if self.cancelled.get() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// このハンドルがキャンセルされたか
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

impl std::fmt::Debug for ReaderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderHandle")
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}

/// 送信ストリームのカーソル
///
/// 書き込みは短いので、いつでも取り直してよい。
#[derive(Clone)]
pub struct WriterHandle {
    pub(crate) sink: Rc<dyn ByteSink>,
}

impl WriterHandle {
    /// バイト列を書き込む
    pub async fn write(&self, data: &[u8]) -> Result<(), PortError> {
        self.sink.write(data).await
    }
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WriterHandle")
    }
}
