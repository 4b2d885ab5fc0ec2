use std::cell::RefCell;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::Stream;
use tracing::debug;

use super::engine::Readable;
use crate::chunk::Chunk;
use crate::error::StreamError;
use crate::event::ListenerId;

type WakerSlot = Rc<RefCell<Option<Waker>>>;

/// 可读引擎的异步迭代适配器。
///
/// # 教案式说明
/// - **意图 (Why)**：让消费者以 `while let Some(chunk) = stream.next().await` 的方式逐个取数，
///   背压由“只在被轮询时才 `read()`”自然实现；
/// - **契约 (What)**：
///   - 元素为 `Result<C, StreamError>`：引擎出错时产出一次 `Err` 后结束；
///   - 引擎在未结束时被销毁（无错误）产出一次 [`StreamError::PrematureClose`]；
///   - 惰性且不可重启：只有第一次轮询才开始拉取，结束后恒返回 `None`；
///   - 在结束前被丢弃时销毁引擎，且只销毁一次；
/// - **执行逻辑 (How)**：在引擎上注册 `readable`、`end`、`error`、`close` 监听器，任一触发都唤醒
///   最近一次轮询登记的 waker；注册 `readable` 监听器本身会让引擎切换到暂停模式；
/// - **设计权衡 (Trade-offs)**：迭代器独占引擎的消费侧，迭代期间再注册 `data` 监听器会让两者争抢数据。
pub struct ReadableStream<C: Chunk> {
    readable: Readable<C>,
    waker: WakerSlot,
    listeners: Vec<ListenerId>,
    done: bool,
}

impl<C: Chunk> Readable<C> {
    /// 转换为 `futures::Stream`。
    pub fn into_stream(self) -> ReadableStream<C> {
        let waker: WakerSlot = Rc::default();
        let wake = {
            let waker = waker.clone();
            move || {
                if let Some(waker) = waker.borrow_mut().take() {
                    waker.wake();
                }
            }
        };
        let listeners = vec![
            self.on_readable(wake.clone()),
            self.on_end(wake.clone()),
            self.on_close(wake.clone()),
            self.on_error({
                let wake = wake.clone();
                move |_: &StreamError| wake()
            }),
        ];
        ReadableStream {
            readable: self,
            waker,
            listeners,
            done: false,
        }
    }
}

impl<C: Chunk> ReadableStream<C> {
    /// 底层可读引擎。
    pub fn readable(&self) -> &Readable<C> {
        &self.readable
    }

    /// 迭代是否已经结束。
    pub fn is_terminated(&self) -> bool {
        self.done
    }

    fn detach(&mut self) {
        for id in self.listeners.drain(..) {
            self.readable.remove_listener(id);
        }
    }

    fn terminate(&mut self, item: Option<Result<C, StreamError>>) -> Poll<Option<Result<C, StreamError>>> {
        self.done = true;
        self.detach();
        Poll::Ready(item)
    }
}

impl<C: Chunk> Stream for ReadableStream<C> {
    type Item = Result<C, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        *this.waker.borrow_mut() = Some(cx.waker().clone());

        if let Some(chunk) = this.readable.read(None) {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if this.readable.is_errored() {
            let error = this.readable.error().unwrap_or(StreamError::PrematureClose);
            return this.terminate(Some(Err(error)));
        }
        if this.readable.is_end_emitted() {
            return this.terminate(None);
        }
        if this.readable.is_destroyed() {
            return this.terminate(Some(Err(StreamError::PrematureClose)));
        }
        Poll::Pending
    }
}

impl<C: Chunk> Drop for ReadableStream<C> {
    fn drop(&mut self) {
        if !self.done {
            debug!(stream = %self.readable.label(), "stream adapter dropped before end, destroying");
            self.detach();
            self.readable.destroy(None);
        }
    }
}

impl<C: Chunk> fmt::Debug for ReadableStream<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStream")
            .field("readable", &self.readable)
            .field("done", &self.done)
            .finish()
    }
}
