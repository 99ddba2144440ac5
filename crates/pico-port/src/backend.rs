//! 物理バイトチャンネルのバックエンド抽象
//!
//! 実装は環境ごとに用意する（ブラウザでは Web Serial、テストではモック）。
//! どのメソッドも `&self` を取り、内部可変性で状態を持つ。読み取り中の
//! ソースを別タスクからキャンセルできるようにするため。

use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PortError;

/// 物理ポート
#[async_trait(?Send)]
pub trait SerialBackend {
    /// 指定ボーレートでポートを開く
    ///
    /// ポートが選ばれていない、または open が拒否された場合は
    /// `PortError::PortUnavailable` を返す。
    async fn open(&self, baud_rate: u32) -> Result<(), PortError>;

    /// ポートを閉じる
    async fn close(&self) -> Result<(), PortError>;

    /// 受信ストリームが取得可能か
    fn is_readable(&self) -> bool;

    /// 送信ストリームが取得可能か
    fn is_writable(&self) -> bool;

    /// 受信ストリームをロックしてソースを得る
    fn reader(&self) -> Result<Rc<dyn ByteSource>, PortError>;

    /// 送信ストリームをロックしてシンクを得る
    fn writer(&self) -> Result<Rc<dyn ByteSink>, PortError>;

    /// 待機する（readiness ポーリングの間隔）
    async fn sleep(&self, duration: Duration);
}

/// 受信バイトのソース
#[async_trait(?Send)]
pub trait ByteSource {
    /// 次のチャンクを読む
    ///
    /// ストリーム終端、またはキャンセル後は `Ok(None)`。
    async fn read_chunk(&self) -> Result<Option<Vec<u8>>, PortError>;

    /// 保留中の `read_chunk()` を `Ok(None)` で完了させる
    async fn cancel(&self) -> Result<(), PortError>;

    /// ストリームのロックを解放する
    fn release(&self);
}

/// 送信バイトのシンク
#[async_trait(?Send)]
pub trait ByteSink {
    /// バイト列を書き込む
    async fn write(&self, data: &[u8]) -> Result<(), PortError>;

    /// ストリームのロックを解放する
    fn release(&self);
}
