//! 応答バッファ（蓄積 + leftover）

use alloc::vec::Vec;

/// 受信バイトの蓄積バッファ
///
/// raw REPL の応答を区切り文字列で切り出すためのバッファ。
/// 区切りより後ろのバイトは次のやり取りのものなので、バッファに残したまま
/// 次の `take_until()` の先頭として使う（leftover）。
///
/// ## 注意
/// このクラス自体は読み取りを行わない。チャンクを `push()` するのは
/// `pico-session` の読み取りループが担当する。
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    /// 未消費の受信バイト
    buf: Vec<u8>,
    /// 直前に失敗した検索で調べ終えた位置
    scanned: usize,
    /// `scanned` を求めたときの区切り
    scanned_for: Vec<u8>,
}

impl ResponseBuffer {
    /// 空のバッファを生成する
    pub fn new() -> Self {
        Self::default()
    }

    /// 受信したチャンクを末尾に積む
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 最初の `delimiter` までを切り出す
    ///
    /// 見つかった場合、区切りより前を返し、区切り自体は捨て、後ろは残す。
    /// 見つからない場合は何も消費せず `None` を返す。
    ///
    /// # 引数
    /// - `delimiter`: 区切りバイト列（空なら即座に空の応答を返す）
    pub fn take_until(&mut self, delimiter: &[u8]) -> Option<Vec<u8>> {
        if delimiter.is_empty() {
            return Some(Vec::new());
        }

        // 前回と同じ区切りなら、調べ終えた位置から再開する。
        // 区切りがチャンク境界をまたぐ場合に備えて len - 1 バイト戻る。
        let start = if self.scanned_for.as_slice() == delimiter {
            self.scanned.saturating_sub(delimiter.len() - 1)
        } else {
            0
        };

        match find(&self.buf[start..], delimiter) {
            Some(pos) => {
                let at = start + pos;
                let rest = self.buf.split_off(at + delimiter.len());
                self.buf.truncate(at);
                let response = core::mem::replace(&mut self.buf, rest);
                self.reset_scan();
                Some(response)
            }
            None => {
                self.scanned = self.buf.len();
                self.scanned_for.clear();
                self.scanned_for.extend_from_slice(delimiter);
                None
            }
        }
    }

    /// 未消費のバイトをすべて取り出す
    pub fn take_all(&mut self) -> Vec<u8> {
        self.reset_scan();
        core::mem::take(&mut self.buf)
    }

    /// 未消費のバイトを捨てる
    pub fn clear(&mut self) {
        self.buf.clear();
        self.reset_scan();
    }

    /// 未消費のバイト数
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// 空か
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn reset_scan(&mut self) {
        self.scanned = 0;
        self.scanned_for.clear();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
