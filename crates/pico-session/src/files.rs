//! ファイル転送操作
//!
//! すべて raw REPL 上でスクリプトを実行して行う。スクリプトの生成と
//! 16 進デコードは `pico-codec` に任せる。

use pico_codec::{decode_hex, list_files_script, parse_listing, read_file_script, write_file_script};
use pico_port::{ReaderHandle, SerialBackend};
use pico_proto::SessionMode;

use crate::error::SessionError;
use crate::session::DeviceSession;

impl<B: SerialBackend + 'static> DeviceSession<B> {
    /// デバイス上のファイルに書き込む
    ///
    /// `verify_writes` が有効なら、同じ raw セッションのまま読み戻して
    /// バイト単位で照合する。
    ///
    /// # エラー
    /// - `Busy`: 別のコマンドが実行中
    /// - `Decode`: ファイル名をスクリプトに埋め込めない
    /// - `Remote`: デバイス側で例外が発生した
    /// - `VerificationFailed`: 読み戻した内容が一致しない
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<(), SessionError> {
        let result = match write_file_script(name, content, self.config().write_chunk_len) {
            Ok(script) => match self.enter_raw(SessionMode::FileTransfer).await {
                Ok(reader) => {
                    let written = self.store(&reader, name, content, &script).await;
                    self.restore_repl(true).await;
                    written
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        };
        self.record(result)
    }

    /// デバイス上のファイルを読む
    ///
    /// # エラー
    /// - `Decode`: 16 進ペイロードが壊れている、またはファイル名が不正
    /// - `Remote`: ファイルが無いなど、デバイス側で例外が発生した
    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>, SessionError> {
        let result = match read_file_script(name, self.config().read_chunk_len) {
            Ok(script) => match self.enter_raw(SessionMode::FileTransfer).await {
                Ok(reader) => {
                    let content = self.fetch(&reader, &script).await;
                    self.restore_repl(true).await;
                    content
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        };
        self.record(result)
    }

    /// デバイスのカレントディレクトリのファイル名を、設定の拡張子で絞って返す
    pub async fn list_files(&self) -> Result<Vec<String>, SessionError> {
        let result = match self.enter_raw(SessionMode::RawCommand).await {
            Ok(reader) => {
                let listing = self
                    .exec_checked(&reader, list_files_script().as_bytes())
                    .await
                    .map(|stdout| self.config().extension_filter().apply(parse_listing(&stdout)));
                self.restore_repl(true).await;
                listing
            }
            Err(e) => Err(e),
        };
        self.record(result)
    }

    /// UTF-8 テキストとして読む（不正なバイトは U+FFFD）
    pub async fn read_text_file(&self, name: &str) -> Result<String, SessionError> {
        let bytes = self.read_file(name).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// UTF-8 テキストを書き込む
    pub async fn write_text_file(&self, name: &str, text: &str) -> Result<(), SessionError> {
        self.write_file(name, text.as_bytes()).await
    }

    async fn store(
        &self,
        reader: &ReaderHandle,
        name: &str,
        content: &[u8],
        script: &str,
    ) -> Result<(), SessionError> {
        self.exec_checked(reader, script.as_bytes()).await?;
        log::debug!("wrote {} bytes to {}", content.len(), name);

        if !self.config().verify_writes {
            return Ok(());
        }
        let script = read_file_script(name, self.config().read_chunk_len)?;
        let actual = self.fetch(reader, &script).await?;
        if actual != content {
            log::warn!("readback of {} does not match", name);
            return Err(SessionError::VerificationFailed {
                name: name.to_string(),
                expected: content.len(),
                actual: actual.len(),
            });
        }
        Ok(())
    }

    async fn fetch(&self, reader: &ReaderHandle, script: &str) -> Result<Vec<u8>, SessionError> {
        let stdout = self.exec_checked(reader, script.as_bytes()).await?;
        Ok(decode_hex(&stdout)?)
    }
}
