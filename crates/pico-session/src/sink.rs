//! 端末出力の受け口

use std::cell::RefCell;

use futures::channel::mpsc::UnboundedSender;

/// サニタイズ済みテキストを受け取る端末
///
/// passthrough ループから呼ばれる。描画方法には関知しない。
pub trait TerminalSink {
    /// テキストチャンクを受け取る
    fn accept(&self, chunk: &str);
}

/// チャンネルに流す（受信側が閉じていれば捨てる）
impl TerminalSink for UnboundedSender<String> {
    fn accept(&self, chunk: &str) {
        let _ = self.unbounded_send(chunk.to_string());
    }
}

/// 文字列に貯める
impl TerminalSink for RefCell<String> {
    fn accept(&self, chunk: &str) {
        self.borrow_mut().push_str(chunk);
    }
}
