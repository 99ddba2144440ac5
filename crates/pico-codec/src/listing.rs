//! `os.listdir()` の出力解析

use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// `print(os.listdir())` の出力をファイル名の列に分解する
///
/// `['a.py', 'b.txt']` のようなリスト表現から括弧・引用符・空白を取り除き、
/// `,` で区切る。名前の順序は保つ。
pub fn parse_listing(text: &str) -> Vec<String> {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '\'' | '"') && !c.is_whitespace())
        .collect();
    stripped
        .split(',')
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// 拡張子によるファイル名フィルタ
///
/// 拡張子は `.py` のようにドット付きで指定する。空のフィルタはすべて通す。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    /// 拡張子のリストからフィルタを作る
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExtensionFilter {
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    /// すべての名前を通すフィルタ
    pub fn any() -> Self {
        Self::default()
    }

    /// 名前がフィルタを通るか
    pub fn allows(&self, name: &str) -> bool {
        self.extensions.is_empty() || self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// 通る名前だけを順序を保って返す
    pub fn apply(&self, names: Vec<String>) -> Vec<String> {
        names.into_iter().filter(|n| self.allows(n)).collect()
    }
}
