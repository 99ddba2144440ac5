//! セッション設定

use std::time::Duration;

use serde::{Deserialize, Serialize};

use pico_codec::{ExtensionFilter, DEFAULT_READ_CHUNK_LEN, DEFAULT_WRITE_CHUNK_LEN};
use pico_port::{ReadyPolicy, DEFAULT_READY_ATTEMPTS};

/// セッション設定
///
/// JSON から読み込む場合、省略したフィールドは既定値になる。
///
/// ```json
/// { "verify_writes": false, "file_extensions": [".py", ".txt"] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// リーダー取得時に readiness を確認する最大回数
    pub ready_attempts: u32,
    /// readiness 確認の間隔（ミリ秒）
    pub ready_interval_ms: u64,
    /// write_file の後に読み戻して照合するか
    pub verify_writes: bool,
    /// `f.write(bytes([...]))` 1 行に載せるバイト数
    pub write_chunk_len: usize,
    /// デバイス側で 1 回に読むバイト数
    pub read_chunk_len: usize,
    /// list_files で残す拡張子（空ならすべて）
    pub file_extensions: Vec<String>,
    /// 呼び出し側が使うコマンドのタイムアウト（ミリ秒）
    pub command_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ready_attempts: DEFAULT_READY_ATTEMPTS,
            ready_interval_ms: 100,
            verify_writes: true,
            write_chunk_len: DEFAULT_WRITE_CHUNK_LEN,
            read_chunk_len: DEFAULT_READ_CHUNK_LEN,
            file_extensions: vec![".py".into()],
            command_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    /// ポートに渡す readiness 方針
    pub fn ready_policy(&self) -> ReadyPolicy {
        ReadyPolicy {
            attempts: self.ready_attempts,
            interval: Duration::from_millis(self.ready_interval_ms),
        }
    }

    /// list_files の拡張子フィルタ
    pub fn extension_filter(&self) -> ExtensionFilter {
        ExtensionFilter::new(self.file_extensions.iter().map(String::as_str))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
