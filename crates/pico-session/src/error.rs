//! pico-session エラー型

use pico_codec::CodecError;
use pico_port::PortError;

/// デバイスセッションのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// ポート層のエラー（PortUnavailable / PortNotReady / TransportClosed など）
    #[error(transparent)]
    Port(#[from] PortError),
    /// 別のコマンドが実行中
    #[error("another command is already in flight")]
    Busy,
    /// 応答の区切りが見つからないうちに読み取りが打ち切られた
    #[error("no response from device")]
    NoResponse,
    /// 16 進ペイロードの不正、またはファイル名の不正
    #[error("decode error: {0}")]
    Decode(#[from] CodecError),
    /// 書き込み後の読み戻しが一致しない
    #[error("verification failed for {name:?}: wrote {expected} bytes, read back {actual} bytes")]
    VerificationFailed {
        /// ファイル名
        name: String,
        /// 書き込んだバイト数
        expected: usize,
        /// 読み戻したバイト数
        actual: usize,
    },
    /// デバイス側で例外が発生した（エラーチャンネルに出力されたトレースバック）
    #[error("device error: {0}")]
    Remote(String),
}
