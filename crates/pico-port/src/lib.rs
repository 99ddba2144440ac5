//! # pico-port
//!
//! シリアル接続された MicroPython デバイスへの物理バイトチャンネル。
//!
//! プロトコルの知識は持たず、次のことだけを担当する。
//!
//! - 固定ボーレート (115200) での open / close
//! - 排他ライター（書き込みバーストごとに取得・解放）
//! - 排他リーダー（同時に 1 つだけ。取り直すと古いものはキャンセルされる）
//! - 受信ストリームが取得可能になるまでの readiness ポーリング
//! - 接続状態の変化通知
//!
//! ## リーダーの受け渡し
//!
//! ```text
//!   passthrough ループ          コマンド
//!   ──────────────────          ────────
//!   reader A で read 待ち
//!                               acquire_reader()
//!                                 ├ A.cancelled = true   ← 同期的に立てる
//!                                 ├ A.cancel().await     ← 保留中の read が None で戻る
//!                                 ├ readiness を待つ
//!                                 └ reader B を返す
//!   read → None で終了
//!   （A が受け取ってしまったバイトは carry に移り、B が最初に返す）
//! ```
//!
//! 実際の入出力は [`SerialBackend`] の実装に委ねる。ブラウザでは Web Serial、
//! テストでは `mock` フィーチャの [`mock::MockBackend`] を使う。

pub mod backend;
pub mod error;
pub mod handle;
pub mod port;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use backend::{ByteSink, ByteSource, SerialBackend};
pub use error::PortError;
pub use handle::{ReaderHandle, WriterHandle};
pub use port::{
    Connection, PortEvent, PortStats, ReadyPolicy, StreamPort, DEFAULT_READY_ATTEMPTS,
    DEFAULT_READY_INTERVAL,
};

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::executor::{block_on, LocalPool};
    use futures::task::LocalSpawnExt;

    use super::mock::MockBackend;
    use super::*;

    fn open_port(backend: &MockBackend) -> StreamPort<MockBackend> {
        let port = StreamPort::new(backend.clone());
        block_on(port.open()).unwrap();
        port
    }

    #[test]
    fn test_open_uses_fixed_baud_rate() {
        let backend = MockBackend::new();
        let port = StreamPort::new(backend.clone());
        let connection = block_on(port.open()).unwrap();
        assert_eq!(connection.baud_rate, 115_200);
        assert!(port.is_connected());
        assert!(backend.is_open());
    }

    #[test]
    fn test_open_rejected_is_port_unavailable() {
        let backend = MockBackend::new();
        backend.reject_open("port already in use");
        let port = StreamPort::new(backend);
        let err = block_on(port.open()).unwrap_err();
        assert!(matches!(err, PortError::PortUnavailable(_)));
        assert!(!port.is_connected());
    }

    #[test]
    fn test_open_twice_returns_existing_connection() {
        let backend = MockBackend::new();
        let port = open_port(&backend);
        let mut events = port.subscribe();
        let again = block_on(port.open()).unwrap();
        assert_eq!(again.baud_rate, 115_200);
        // 2 回目の open は通知しない
        assert!(events.try_next().is_err());
    }

    #[test]
    fn test_reader_not_ready_after_retry_budget() {
        let backend = MockBackend::new();
        backend.set_unreadable_for(u32::MAX);
        let port = open_port(&backend);

        let err = block_on(port.acquire_reader()).unwrap_err();
        assert_eq!(err, PortError::PortNotReady { attempts: 20 });
        assert_eq!(backend.readable_polls(), 20);
        assert_eq!(backend.sleeps(), vec![Duration::from_millis(100); 19]);
        assert_eq!(backend.readers_created(), 0);
    }

    #[test]
    fn test_reader_waits_for_readable_stream() {
        let backend = MockBackend::new();
        backend.set_unreadable_for(3);
        let port = open_port(&backend);

        let reader = block_on(port.acquire_reader()).unwrap();
        assert!(!reader.is_cancelled());
        assert_eq!(backend.readable_polls(), 4);
        assert_eq!(backend.sleeps().len(), 3);
    }

    #[test]
    fn test_custom_ready_policy() {
        let backend = MockBackend::new();
        backend.set_unreadable_for(u32::MAX);
        let policy = ReadyPolicy {
            attempts: 3,
            interval: Duration::from_millis(5),
        };
        let port = StreamPort::with_policy(backend.clone(), policy);
        block_on(port.open()).unwrap();

        let err = block_on(port.acquire_reader()).unwrap_err();
        assert_eq!(err, PortError::PortNotReady { attempts: 3 });
        assert_eq!(backend.sleeps(), vec![Duration::from_millis(5); 2]);
    }

    #[test]
    fn test_acquire_reader_when_closed() {
        let backend = MockBackend::new();
        let port = StreamPort::new(backend.clone());
        let err = block_on(port.acquire_reader()).unwrap_err();
        assert!(matches!(err, PortError::PortUnavailable(_)));
    }

    #[test]
    fn test_second_reader_cancels_first() {
        let backend = MockBackend::new();
        let port = open_port(&backend);

        let first = block_on(port.acquire_reader()).unwrap();
        let second = block_on(port.acquire_reader()).unwrap();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(backend.readers_created(), 2);
        assert_eq!(backend.live_readers(), 1, "リーダーは常に 1 つだけ");

        backend.push_inbound(b">>> ");
        assert_eq!(block_on(first.read()).unwrap(), None);
        assert_eq!(block_on(second.read()).unwrap(), Some(b">>> ".to_vec()));
    }

    #[test]
    fn test_cancel_unblocks_pending_read() {
        let backend = MockBackend::new();
        let port = std::rc::Rc::new(open_port(&backend));
        let first = block_on(port.acquire_reader()).unwrap();

        let mut pool = LocalPool::new();
        let (tx, rx) = futures::channel::oneshot::channel();
        pool.spawner()
            .spawn_local(async move {
                let _ = tx.send(first.read().await);
            })
            .unwrap();
        pool.run_until_stalled();

        let port2 = std::rc::Rc::clone(&port);
        let second = pool.run_until(async move { port2.acquire_reader().await.unwrap() });
        pool.run_until_stalled();

        assert_eq!(pool.run_until(rx).unwrap().unwrap(), None);
        backend.push_inbound(b"data");
        assert_eq!(block_on(second.read()).unwrap(), Some(b"data".to_vec()));
    }

    #[test]
    fn test_release_reader_is_noop_without_reader() {
        let backend = MockBackend::new();
        let port = open_port(&backend);
        block_on(port.release_reader()).unwrap();

        let reader = block_on(port.acquire_reader()).unwrap();
        block_on(port.release_reader()).unwrap();
        assert!(reader.is_cancelled());
        assert_eq!(backend.live_readers(), 0);
    }

    #[test]
    fn test_write_bytes_requires_writer() {
        let backend = MockBackend::new();
        let port = open_port(&backend);

        let err = block_on(port.write_bytes(&[0x03])).unwrap_err();
        assert_eq!(err, PortError::WriterUnavailable);

        assert!(port.acquire_writer().is_some());
        block_on(port.write_bytes(&[0x01, b'x'])).unwrap();
        port.release_writer();

        assert_eq!(backend.written(), vec![0x01, b'x']);
        assert_eq!(backend.writers_released(), 1);
        assert_eq!(port.stats().total_sent_bytes, 2);
        assert_eq!(
            block_on(port.write_bytes(b"y")).unwrap_err(),
            PortError::WriterUnavailable
        );
    }

    #[test]
    fn test_acquire_writer_needs_open_writable_port() {
        let backend = MockBackend::new();
        let port = StreamPort::new(backend.clone());
        assert!(port.acquire_writer().is_none());

        block_on(port.open()).unwrap();
        backend.set_writable(false);
        assert!(port.acquire_writer().is_none());

        backend.set_writable(true);
        assert!(port.acquire_writer().is_some());
    }

    #[test]
    fn test_held_writer_is_returned_while_stream_locked() {
        let backend = MockBackend::new();
        let port = open_port(&backend);

        assert!(port.acquire_writer().is_some());
        assert!(backend.writer_locked());
        // 自分のライターでロックされていても取り直せる
        assert!(port.acquire_writer().is_some());
        assert_eq!(backend.writers_released(), 0);

        port.release_writer();
        assert!(!backend.writer_locked());
        assert!(port.acquire_writer().is_some());
        port.release_writer();
        assert_eq!(backend.writers_released(), 2);
    }

    #[test]
    fn test_disconnect_releases_held_writer() {
        let backend = MockBackend::new();
        let port = open_port(&backend);
        port.acquire_writer().unwrap();

        backend.unplug();
        port.handle_disconnect();
        assert!(port.acquire_writer().is_none());
        assert!(!backend.writer_locked());

        block_on(port.open()).unwrap();
        assert!(port.acquire_writer().is_some());
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = MockBackend::new();
        let port = StreamPort::new(backend.clone());
        let mut events = port.subscribe();

        block_on(port.close()).unwrap();
        assert_eq!(backend.closes(), 0);

        block_on(port.open()).unwrap();
        let reader = block_on(port.acquire_reader()).unwrap();
        port.acquire_writer().unwrap();

        block_on(port.close()).unwrap();
        block_on(port.close()).unwrap();

        assert_eq!(backend.closes(), 1);
        assert!(reader.is_cancelled());
        assert_eq!(backend.writers_released(), 1);
        assert!(!port.is_connected());

        assert_eq!(
            events.try_next().unwrap(),
            Some(PortEvent::Connected(Connection { baud_rate: 115_200 }))
        );
        assert_eq!(events.try_next().unwrap(), Some(PortEvent::Disconnected));
        assert!(events.try_next().is_err(), "close は 1 回だけ通知する");
    }

    #[test]
    fn test_handle_disconnect() {
        let backend = MockBackend::new();
        let port = open_port(&backend);
        let mut events = port.subscribe();
        let reader = block_on(port.acquire_reader()).unwrap();

        backend.unplug();
        port.handle_disconnect();
        port.handle_disconnect();

        assert!(!port.is_connected());
        assert!(reader.is_cancelled());
        assert_eq!(events.try_next().unwrap(), Some(PortEvent::Disconnected));
        assert!(events.try_next().is_err());
    }

    #[test]
    fn test_unplug_ends_pending_read() {
        let backend = MockBackend::new();
        let port = open_port(&backend);
        let reader = block_on(port.acquire_reader()).unwrap();

        let mut pool = LocalPool::new();
        let (tx, rx) = futures::channel::oneshot::channel();
        pool.spawner()
            .spawn_local(async move {
                let _ = tx.send(reader.read().await);
            })
            .unwrap();
        pool.run_until_stalled();
        backend.unplug();

        assert_eq!(pool.run_until(rx).unwrap().unwrap(), None);
    }

    #[test]
    fn test_received_bytes_are_counted() {
        let backend = MockBackend::new();
        let port = open_port(&backend);
        let reader = block_on(port.acquire_reader()).unwrap();
        backend.push_inbound(b"abc");
        backend.push_inbound(b"de");
        block_on(reader.read()).unwrap();
        block_on(reader.read()).unwrap();
        assert_eq!(port.stats().total_received_bytes, 5);
    }
}
