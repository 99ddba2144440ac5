//! テスト用のモックバックエンド
//!
//! 書き込みを記録し、`Responder` で受信チャンクを生成するスクリプト可能な
//! 双方向バイトチャンネル。`futures::executor::LocalPool` 上で使う前提。

mod device;

pub use device::{SimulatedDevice, BANNER, RAW_BANNER};

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::{Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::poll_fn;

use crate::backend::{ByteSink, ByteSource, SerialBackend};
use crate::error::PortError;

/// 書き込みに応じて受信チャンクを返すデバイス役
pub trait Responder {
    /// 書き込まれたバイト列に対する応答チャンク
    fn respond(&mut self, written: &[u8]) -> Vec<Vec<u8>>;
}

impl<F> Responder for F
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>>,
{
    fn respond(&mut self, written: &[u8]) -> Vec<Vec<u8>> {
        self(written)
    }
}

#[derive(Default)]
struct SourceState {
    cancelled: bool,
    released: bool,
    waker: Option<Waker>,
}

#[derive(Default)]
struct MockState {
    open: bool,
    reject_open: Option<String>,
    /// is_readable() が false を返す残り回数
    unreadable_polls: Option<u32>,
    writable: bool,
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    sources: Vec<Rc<RefCell<SourceState>>>,
    responder: Option<Box<dyn Responder>>,
    readable_polls: u32,
    sleeps: Vec<Duration>,
    writers_released: u32,
    /// ライターが解放されるまで送信ストリームはロックされる
    writer_locked: bool,
    /// true の間、書き込みは完了しない
    writes_held: bool,
    write_waiters: Vec<Waker>,
    read_failures: u32,
    closes: u32,
}

/// スクリプト可能なモックポート
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Rc<RefCell<MockState>>,
}

impl MockBackend {
    /// 書き込み可能なモックを生成する
    pub fn new() -> Self {
        let backend = Self::default();
        backend.state.borrow_mut().writable = true;
        backend
    }

    /// デバイス役を指定して生成する
    pub fn with_responder(responder: impl Responder + 'static) -> Self {
        let backend = Self::new();
        backend.set_responder(responder);
        backend
    }

    /// デバイス役を差し替える
    pub fn set_responder(&self, responder: impl Responder + 'static) {
        self.state.borrow_mut().responder = Some(Box::new(responder));
    }

    /// 次の open を拒否させる
    pub fn reject_open(&self, reason: &str) {
        self.state.borrow_mut().reject_open = Some(reason.into());
    }

    /// 受信ストリームを `polls` 回だけ取得不能にする（`u32::MAX` でずっと）
    pub fn set_unreadable_for(&self, polls: u32) {
        self.state.borrow_mut().unreadable_polls = Some(polls);
    }

    /// 書き込み可否を切り替える
    pub fn set_writable(&self, writable: bool) {
        self.state.borrow_mut().writable = writable;
    }

    /// デバイスからの受信チャンクを積む
    pub fn push_inbound(&self, chunk: &[u8]) {
        self.state.borrow_mut().inbound.push_back(chunk.to_vec());
        self.wake_readers();
    }

    /// これまでに書き込まれた全バイト
    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    /// 書き込み記録を消す
    pub fn clear_written(&self) {
        self.state.borrow_mut().written.clear();
    }

    /// 以降の書き込みを `resume_writes()` まで保留させる
    pub fn hold_writes(&self) {
        self.state.borrow_mut().writes_held = true;
    }

    /// 保留中の書き込みを完了させる
    pub fn resume_writes(&self) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            state.writes_held = false;
            std::mem::take(&mut state.write_waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }

    /// 送信ストリームがロックされているか
    pub fn writer_locked(&self) -> bool {
        self.state.borrow().writer_locked
    }

    /// 次の `count` 回の読み取りを I/O エラーにする（回線エラー相当）
    pub fn fail_reads(&self, count: u32) {
        self.state.borrow_mut().read_failures = count;
        self.wake_readers();
    }

    /// is_readable() が呼ばれた回数
    pub fn readable_polls(&self) -> u32 {
        self.state.borrow().readable_polls
    }

    /// sleep() に渡された時間
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.borrow().sleeps.clone()
    }

    /// 作られたリーダーの数
    pub fn readers_created(&self) -> usize {
        self.state.borrow().sources.len()
    }

    /// キャンセルも解放もされていないリーダーの数
    pub fn live_readers(&self) -> usize {
        self.state
            .borrow()
            .sources
            .iter()
            .filter(|s| {
                let s = s.borrow();
                !s.cancelled && !s.released
            })
            .count()
    }

    /// 解放されたライターの数
    pub fn writers_released(&self) -> u32 {
        self.state.borrow().writers_released
    }

    /// close() が呼ばれた回数
    pub fn closes(&self) -> u32 {
        self.state.borrow().closes
    }

    /// 開いているか
    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    /// ケーブルが抜けたことにする（保留中の読み取りは終端になる）
    pub fn unplug(&self) {
        self.state.borrow_mut().open = false;
        self.wake_readers();
        self.resume_writes();
    }

    fn wake_readers(&self) {
        let wakers: Vec<Waker> = self
            .state
            .borrow()
            .sources
            .iter()
            .filter_map(|s| s.borrow_mut().waker.take())
            .collect();
        for waker in wakers {
            waker.wake();
        }
    }
}

#[async_trait(?Send)]
impl SerialBackend for MockBackend {
    async fn open(&self, _baud_rate: u32) -> Result<(), PortError> {
        let mut state = self.state.borrow_mut();
        if let Some(reason) = state.reject_open.take() {
            return Err(PortError::PortUnavailable(reason));
        }
        state.open = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), PortError> {
        {
            let mut state = self.state.borrow_mut();
            state.open = false;
            state.closes += 1;
        }
        self.wake_readers();
        Ok(())
    }

    fn is_readable(&self) -> bool {
        let mut state = self.state.borrow_mut();
        state.readable_polls += 1;
        if !state.open {
            return false;
        }
        match state.unreadable_polls {
            Some(0) | None => true,
            Some(u32::MAX) => false,
            Some(n) => {
                state.unreadable_polls = Some(n - 1);
                false
            }
        }
    }

    fn is_writable(&self) -> bool {
        let state = self.state.borrow();
        state.open && state.writable && !state.writer_locked
    }

    fn reader(&self) -> Result<Rc<dyn ByteSource>, PortError> {
        let source_state = Rc::new(RefCell::new(SourceState::default()));
        self.state.borrow_mut().sources.push(Rc::clone(&source_state));
        Ok(Rc::new(MockSource {
            backend: self.clone(),
            state: source_state,
        }))
    }

    fn writer(&self) -> Result<Rc<dyn ByteSink>, PortError> {
        {
            let mut state = self.state.borrow_mut();
            if state.writer_locked {
                return Err(PortError::Io("writable stream is locked".into()));
            }
            state.writer_locked = true;
        }
        Ok(Rc::new(MockSink {
            backend: self.clone(),
        }))
    }

    async fn sleep(&self, duration: Duration) {
        self.state.borrow_mut().sleeps.push(duration);
    }
}

struct MockSource {
    backend: MockBackend,
    state: Rc<RefCell<SourceState>>,
}

#[async_trait(?Send)]
impl ByteSource for MockSource {
    async fn read_chunk(&self) -> Result<Option<Vec<u8>>, PortError> {
        poll_fn(|cx| {
            let mut shared = self.backend.state.borrow_mut();
            let mut me = self.state.borrow_mut();
            if me.cancelled || !shared.open {
                return Poll::Ready(Ok(None));
            }
            if shared.read_failures > 0 {
                shared.read_failures -= 1;
                return Poll::Ready(Err(PortError::Io("BufferOverrunError".into())));
            }
            if let Some(chunk) = shared.inbound.pop_front() {
                return Poll::Ready(Ok(Some(chunk)));
            }
            me.waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    async fn cancel(&self) -> Result<(), PortError> {
        let waker = {
            let mut me = self.state.borrow_mut();
            me.cancelled = true;
            me.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    fn release(&self) {
        self.state.borrow_mut().released = true;
    }
}

struct MockSink {
    backend: MockBackend,
}

#[async_trait(?Send)]
impl ByteSink for MockSink {
    async fn write(&self, data: &[u8]) -> Result<(), PortError> {
        poll_fn(|cx| {
            let mut state = self.backend.state.borrow_mut();
            if state.writes_held && state.open {
                state.write_waiters.push(cx.waker().clone());
                return Poll::Pending;
            }
            Poll::Ready(())
        })
        .await;

        let responder = {
            let mut state = self.backend.state.borrow_mut();
            if !state.open {
                return Err(PortError::TransportClosed);
            }
            state.written.extend_from_slice(data);
            state.responder.take()
        };

        if let Some(mut responder) = responder {
            let replies = responder.respond(data);
            {
                let mut state = self.backend.state.borrow_mut();
                state.responder = Some(responder);
                state.inbound.extend(replies.into_iter().filter(|c| !c.is_empty()));
            }
            self.backend.wake_readers();
        }
        Ok(())
    }

    fn release(&self) {
        let mut state = self.backend.state.borrow_mut();
        state.writers_released += 1;
        state.writer_locked = false;
    }
}
