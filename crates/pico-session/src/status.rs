//! 受信テキストからのデバイス状態推定

use pico_proto::{DeviceStatus, PROMPT_MARKER};

/// `>>>` プロンプトの有無で REPL / RUNNING を推定する
///
/// プロンプトがチャンク境界で割れても見つけられるよう、直前のチャンクの
/// 末尾（マーカー長 - 1 文字、ただし照合済みのプロンプトより後ろ）を
/// 次のチャンクの前に付けて探す。
/// 状態は参考値で、フレーミングには使わない。
#[derive(Debug, Default)]
pub struct StatusTracker {
    tail: String,
    current: Option<DeviceStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在の推定状態（まだ何も受信していなければ `None`）
    pub fn current(&self) -> Option<DeviceStatus> {
        self.current
    }

    /// テキストチャンクを観測する
    ///
    /// # 戻り値
    /// 状態が変わった場合のみ新しい状態
    pub fn observe(&mut self, text: &str) -> Option<DeviceStatus> {
        if text.is_empty() {
            return None;
        }

        let mut window = std::mem::take(&mut self.tail);
        window.push_str(text);

        // 照合済みのプロンプトは tail に残さない
        let matched_end = window
            .match_indices(PROMPT_MARKER)
            .last()
            .map(|(i, m)| i + m.len());
        let next = if matched_end.is_some() {
            DeviceStatus::Repl
        } else {
            DeviceStatus::Running
        };

        let keep = PROMPT_MARKER.chars().count() - 1;
        let start = window
            .char_indices()
            .rev()
            .nth(keep - 1)
            .map_or(0, |(i, _)| i)
            .max(matched_end.unwrap_or(0));
        self.tail = window[start..].to_string();

        if self.current == Some(next) {
            return None;
        }
        self.current = Some(next);
        Some(next)
    }

    /// 推定をリセットする（切断時）
    pub fn reset(&mut self) {
        self.tail.clear();
        self.current = None;
    }
}
