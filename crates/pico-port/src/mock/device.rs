//! raw REPL を話す MicroPython デバイスのシミュレータ
//!
//! 本物のインタプリタではない。`pico-codec` が生成するスクリプト
//! （ファイル書き込み・読み出し・一覧）と単純な `print("...")` だけを解釈し、
//! メモリ上のファイルシステムに対して実行する。

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use pico_proto::{END_OF_COMMAND, INTERRUPT, RAW_MODE_ENTER, RAW_MODE_EXIT};

use super::Responder;

/// 通常 REPL に戻ったときのバナー
pub const BANNER: &str = "\r\nMicroPython v1.22.0 on 2024-01-05; Raspberry Pi Pico with RP2040\r\n\
                          Type \"help()\" for more information.\r\n>>> ";

/// raw REPL に入ったときの表示
pub const RAW_BANNER: &str = "raw REPL; CTRL-B to exit\r\n>";

const ENOENT: &str = "Traceback (most recent call last):\r\n  File \"<stdin>\", line 2, in <module>\r\n\
                      OSError: [Errno 2] ENOENT\r\n";

/// raw REPL デバイスのシミュレータ
pub struct SimulatedDevice {
    files: Rc<RefCell<BTreeMap<String, Vec<u8>>>>,
    executed: Rc<RefCell<Vec<String>>>,
    raw: bool,
    code: Vec<u8>,
    chunk_len: usize,
}

impl SimulatedDevice {
    /// 空のファイルシステムで生成する。応答は 16 バイトずつに分割される
    pub fn new() -> Self {
        SimulatedDevice {
            files: Rc::new(RefCell::new(BTreeMap::new())),
            executed: Rc::new(RefCell::new(Vec::new())),
            raw: false,
            code: Vec::new(),
            chunk_len: 16,
        }
    }

    /// 応答チャンクの大きさを変える
    pub fn with_chunk_len(mut self, chunk_len: usize) -> Self {
        self.chunk_len = chunk_len.max(1);
        self
    }

    /// ファイルを置く
    pub fn with_file(self, name: &str, content: &[u8]) -> Self {
        self.files.borrow_mut().insert(name.into(), content.to_vec());
        self
    }

    /// ファイルシステムへのハンドル
    pub fn files(&self) -> Rc<RefCell<BTreeMap<String, Vec<u8>>>> {
        Rc::clone(&self.files)
    }

    /// 実行されたスクリプトの記録
    pub fn executed(&self) -> Rc<RefCell<Vec<String>>> {
        Rc::clone(&self.executed)
    }

    fn execute(&mut self, code: &str) -> (String, String) {
        self.executed.borrow_mut().push(code.to_string());

        if code.contains("os.listdir()") {
            let names: Vec<String> = self
                .files
                .borrow()
                .keys()
                .map(|n| format!("'{}'", n))
                .collect();
            return (format!("[{}]\r\n", names.join(", ")), String::new());
        }

        if let Some(name) = open_target(code, "rb") {
            let content = self.files.borrow().get(&name).cloned();
            return match content {
                Some(content) => (hex::encode(content), String::new()),
                None => (String::new(), ENOENT.to_string()),
            };
        }

        if let Some(name) = open_target(code, "wb") {
            let content = parse_byte_lists(code);
            self.files.borrow_mut().insert(name, content);
            return (String::new(), String::new());
        }

        let mut stdout = String::new();
        for line in code.lines() {
            let text = line
                .trim()
                .strip_prefix("print(\"")
                .and_then(|rest| rest.strip_suffix("\")"));
            if let Some(text) = text {
                stdout.push_str(text);
                stdout.push_str("\r\n");
            }
        }
        (stdout, String::new())
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Responder for SimulatedDevice {
    fn respond(&mut self, written: &[u8]) -> Vec<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        for &byte in written {
            if self.raw {
                match byte {
                    RAW_MODE_EXIT => {
                        self.raw = false;
                        self.code.clear();
                        out.extend_from_slice(BANNER.as_bytes());
                    }
                    END_OF_COMMAND => {
                        let code = String::from_utf8_lossy(&std::mem::take(&mut self.code)).into_owned();
                        let (stdout, stderr) = self.execute(&code);
                        out.extend_from_slice(b"OK");
                        out.extend_from_slice(stdout.as_bytes());
                        out.push(END_OF_COMMAND);
                        out.extend_from_slice(stderr.as_bytes());
                        out.push(END_OF_COMMAND);
                        out.push(b'>');
                    }
                    RAW_MODE_ENTER => {
                        self.code.clear();
                        out.extend_from_slice(RAW_BANNER.as_bytes());
                    }
                    INTERRUPT => self.code.clear(),
                    other => self.code.push(other),
                }
            } else {
                match byte {
                    RAW_MODE_ENTER => {
                        self.raw = true;
                        self.code.clear();
                        out.extend_from_slice(RAW_BANNER.as_bytes());
                    }
                    INTERRUPT => out.extend_from_slice(b"\r\nKeyboardInterrupt\r\n>>> "),
                    RAW_MODE_EXIT => out.extend_from_slice(BANNER.as_bytes()),
                    END_OF_COMMAND => {}
                    other => out.push(other),
                }
            }
        }
        out.chunks(self.chunk_len).map(|c| c.to_vec()).collect()
    }
}

/// `open("<name>", "<mode>")` のファイル名
fn open_target(code: &str, mode: &str) -> Option<String> {
    let start = code.find("open(\"")? + "open(\"".len();
    let rest = &code[start..];
    let end = rest.find('"')?;
    let suffix = format!("\", \"{}\")", mode);
    rest[end..]
        .starts_with(suffix.as_str())
        .then(|| rest[..end].to_string())
}

/// すべての `bytes([...])` の中身をつなげる
fn parse_byte_lists(code: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = code;
    while let Some(start) = rest.find("bytes([") {
        let after = &rest[start + "bytes([".len()..];
        let Some(end) = after.find("])") else {
            break;
        };
        out.extend(
            after[..end]
                .split(',')
                .filter_map(|n| n.trim().parse::<u8>().ok()),
        );
        rest = &after[end..];
    }
    out
}
