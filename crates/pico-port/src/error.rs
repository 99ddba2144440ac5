//! pico-port エラー型

/// ストリームポートのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// ポートが選択されていない、または open が拒否された
    #[error("serial port unavailable: {0}")]
    PortUnavailable(String),
    /// 読み取り可能になるのを待ったがリトライ回数を使い切った
    #[error("serial port not ready after {attempts} attempts")]
    PortNotReady {
        /// 確認した回数
        attempts: u32,
    },
    /// ライターを保持していない状態で書き込もうとした
    #[error("no writer acquired")]
    WriterUnavailable,
    /// 操作中に接続が切れた
    #[error("serial transport closed")]
    TransportClosed,
    /// バックエンドの I/O エラー
    #[error("serial I/O error: {0}")]
    Io(String),
}
