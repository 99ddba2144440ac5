//! コーデックエラー型

use alloc::string::String;

/// ファイル転送コーデックのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// 16 進文字列の長さが奇数
    #[error("hex payload has odd length")]
    OddLength,
    /// 16 進数字以外の文字を含む
    #[error("invalid hex character {character:?} at index {index}")]
    InvalidCharacter {
        /// 問題の文字
        character: char,
        /// 空白除去後の文字列における位置
        index: usize,
    },
    /// スクリプトに埋め込めないファイル名
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),
}
