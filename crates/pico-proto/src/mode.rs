//! セッションモードとデバイスステータス

use serde::Serialize;

/// デバイスセッションのモード
///
/// ```text
/// Repl ──(run_code / exec)────────────────→ RawCommand ──┐
///   ↑                                                    │ 0x02 を送って戻る
///   ├──(read_file / write_file / list_files)→ FileTransfer ┤
///   └────────────────────────────────────────────────────┘
/// ```
///
/// `Repl` 以外のときに次のコマンドを始めることはできない（`Busy`）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// 対話モード。端末との素通し転送が有効
    #[default]
    Repl,
    /// raw REPL で 1 つのコマンドを実行中
    RawCommand,
    /// raw REPL でファイル内容を転送中（16 進コーデックを使う）
    FileTransfer,
}

impl SessionMode {
    /// raw REPL を使うモードか
    pub fn is_raw(self) -> bool {
        !matches!(self, SessionMode::Repl)
    }
}

/// 受信テキストから推定するデバイスの状態（UI 用の参考値）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceStatus {
    /// `>>>` プロンプトが見えている
    #[serde(rename = "REPL")]
    Repl,
    /// プロンプト以外の出力が流れている
    #[serde(rename = "RUNNING")]
    Running,
}

impl DeviceStatus {
    /// 通知に載せる名前
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Repl => "REPL",
            DeviceStatus::Running => "RUNNING",
        }
    }
}

impl core::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
