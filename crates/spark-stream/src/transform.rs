//! # transform 模块说明
//!
//! ## 角色定位（Why）
//! - 转换端是“写入 `I`、读出 `O`”的双工端：写入侧把每个输入交给 [`Transformer`]，
//!   转换产出被推入读出侧；
//! - 背压跨越两侧传递：读出侧积压超过高水位时，写入确认被扣留，写入侧随之积压并向上游报告背压。
//!
//! ## 契约（What）
//! - `transform` 期间经 [`TransformContext::push`] 产出的数据先暂存，返回 `Ready(Ok)` 时按序提交，
//!   返回 `Ready(Err)` 时丢弃；
//! - 返回 `Pending` 前必须调用 [`TransformContext::defer`] 取得 [`Deferred`] 句柄，
//!   之后由句柄推送输出并结束本次转换；在此之前下一个写入不会被派发；
//! - 异步转换的输出（含 `defer` 前暂存的部分）留在句柄内，`complete(Ok)` 时才提交，
//!   以错误结束或句柄被丢弃时整体丢弃；
//! - 转换函数报告的任何错误都归类为 [`StreamError::Transform`]，原错误作为其原因保留。
//! - 输入结束时调用 `flush`，随后推送输出结束标记；`end()` 的完成晚于结束标记被推送；
//! - 转换失败会以该错误结算当前写入与全部排队写入，并销毁两侧；此前已推送的输出保留在读出侧缓冲中，
//!   直到销毁丢弃缓冲。

use std::cell::{OnceCell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Poll;

use tracing::{trace, warn};

use crate::chunk::Chunk;
use crate::completion::{Completion, Done};
use crate::config::TransformOptions;
use crate::duplex::Duplex;
use crate::error::StreamError;
use crate::event::{Flow, ListenerId};
use crate::readable::{Readable, ReadableController, Source};
use crate::tick::SharedScheduler;
use crate::writable::{EndCompletion, Sink, WeakWritable, Writable, WriteOutcome};

/// 转换函数。
///
/// # 教案式说明
/// - **意图 (Why)**：以最小接口描述“一个输入产生零到多个输出”的同步或异步变换；
/// - **契约 (What)**：
///   - `transform`：处理一个输入。同步完成返回 `Poll::Ready`；异步完成先调用 `cx.defer()`，
///     再返回 `Poll::Pending`；
///   - `flush`：全部输入处理完毕后调用一次，可产出尾部数据，默认什么也不做；
/// - **风险 (Trade-offs)**：转换函数运行期间持有自身的可变借用，不能在回调中再次驱动同一个转换端写入。
pub trait Transformer<I: Chunk, O: Chunk> {
    fn transform(&mut self, chunk: I, cx: &mut TransformContext<O>) -> Poll<Result<(), StreamError>>;

    fn flush(&mut self, cx: &mut TransformContext<O>) -> Poll<Result<(), StreamError>> {
        let _ = cx;
        Poll::Ready(Ok(()))
    }
}

/// 把转换函数报告的错误归类为转换错误。
fn classify(error: StreamError) -> StreamError {
    match error {
        StreamError::Transform(_) => error,
        other => StreamError::Transform(Arc::new(other)),
    }
}

/// 异步转换尚未提交的输出。
type DeferredOutput<O> = Rc<RefCell<Vec<O>>>;

/// 转换调用的上下文：暂存输出、申请异步完成。
pub struct TransformContext<O: Chunk> {
    controller: ReadableController<O>,
    staged: Vec<O>,
    done: Option<Done>,
    deferred: Option<DeferredOutput<O>>,
}

impl<O: Chunk> TransformContext<O> {
    fn new(controller: ReadableController<O>, done: Done) -> Self {
        Self {
            controller,
            staged: Vec::new(),
            done: Some(done),
            deferred: None,
        }
    }

    /// 暂存一个输出；`defer` 之后的输出交由 [`Deferred`] 一并提交。
    pub fn push(&mut self, chunk: O) {
        match &self.deferred {
            Some(output) => output.borrow_mut().push(chunk),
            None => self.staged.push(chunk),
        }
    }

    /// 读出侧的缓冲长度（不含本次暂存）。
    pub fn readable_length(&self) -> usize {
        self.controller.readable_length()
    }

    /// 申请异步完成；仅第一次调用返回句柄。
    pub fn defer(&mut self) -> Option<Deferred<O>> {
        let done = self.done.take()?;
        let output: DeferredOutput<O> = Rc::new(RefCell::new(std::mem::take(&mut self.staged)));
        self.deferred = Some(output.clone());
        Some(Deferred {
            controller: self.controller.clone(),
            output,
            done,
        })
    }

    fn commit(mut self, poll: Poll<Result<(), StreamError>>, stage: &'static str) {
        match poll {
            Poll::Ready(Ok(())) => {
                self.push_staged();
                if let Some(done) = self.done.take() {
                    done.succeed();
                }
            }
            Poll::Ready(Err(error)) => {
                trace!(stage, discarded = self.staged.len(), "transform failed, staged output discarded");
                self.staged.clear();
                if let Some(output) = self.deferred.take() {
                    output.borrow_mut().clear();
                }
                match self.done.take() {
                    Some(done) => done.fail(error),
                    None => warn!(stage, code = error.code(), "deferred transform reported a synchronous error"),
                }
            }
            Poll::Pending => {
                // 已 defer 时输出都在句柄内，由 `Deferred::complete` 决定去留。
                if let Some(done) = self.done.take() {
                    self.staged.clear();
                    done.fail(StreamError::transform_failed(format!(
                        "{stage} returned Pending without deferring completion"
                    )));
                }
            }
        }
    }

    fn push_staged(&mut self) {
        for chunk in self.staged.drain(..) {
            self.controller.push(chunk);
        }
    }
}

impl<O: Chunk> fmt::Debug for TransformContext<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformContext")
            .field("staged", &self.staged.len())
            .field("deferred", &self.done.is_none())
            .finish()
    }
}

/// 异步转换的完成句柄。
///
/// 句柄被丢弃而未调用 [`Deferred::complete`] 时，本次转换按失败处理，暂存的输出一并丢弃。
pub struct Deferred<O: Chunk> {
    controller: ReadableController<O>,
    output: DeferredOutput<O>,
    done: Done,
}

impl<O: Chunk> Deferred<O> {
    /// 暂存一个输出，`complete(Ok)` 时按序提交。
    pub fn push(&self, chunk: O) {
        self.output.borrow_mut().push(chunk);
    }

    /// 结束本次转换：成功时先提交全部暂存输出再确认写入，失败时丢弃暂存输出。
    pub fn complete(self, result: Result<(), StreamError>) {
        let staged = std::mem::take(&mut *self.output.borrow_mut());
        match result {
            Ok(()) => {
                for chunk in staged {
                    self.controller.push(chunk);
                }
                self.done.succeed();
            }
            Err(error) => {
                trace!(discarded = staged.len(), "deferred transform failed, staged output discarded");
                self.done.fail(error);
            }
        }
    }
}

impl<O: Chunk> fmt::Debug for Deferred<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("staged", &self.output.borrow().len())
            .finish_non_exhaustive()
    }
}

/// 两侧共享的转换状态。
struct Shared<I: Chunk, O: Chunk> {
    transformer: RefCell<Box<dyn Transformer<I, O>>>,
    /// 因读出侧积压而扣留的写入确认。
    held: RefCell<Option<Done>>,
    output: OnceCell<ReadableController<O>>,
    input: OnceCell<WeakWritable<I>>,
    scheduler: SharedScheduler,
}

impl<I: Chunk, O: Chunk> Shared<I, O> {
    fn controller(&self) -> Option<ReadableController<O>> {
        self.output.get().cloned()
    }

    /// 写入成功后决定立即确认还是扣留。
    fn release_or_hold(&self, done: Done, length_before: usize) {
        let Some(controller) = self.controller() else {
            done.succeed();
            return;
        };
        if controller.is_ended() {
            self.scheduler.defer(Box::new(move || done.succeed()));
            return;
        }
        let input_ending = self
            .input
            .get()
            .and_then(WeakWritable::upgrade)
            .is_none_or(|writable| writable.is_ending());
        let length = controller.readable_length();
        if input_ending || length == length_before || length < controller.high_water_mark() {
            done.succeed();
        } else {
            trace!(length, "transform output above high water mark, holding write");
            *self.held.borrow_mut() = Some(done);
        }
    }

    fn release_held(&self) {
        let held = self.held.borrow_mut().take();
        if let Some(done) = held {
            trace!("transform output drained, releasing held write");
            done.succeed();
        }
    }
}

struct TransformSink<I: Chunk, O: Chunk> {
    shared: Rc<Shared<I, O>>,
}

impl<I: Chunk, O: Chunk> Sink<I> for TransformSink<I, O> {
    fn dispatch(&mut self, chunk: I, done: Done) {
        let Some(controller) = self.shared.controller() else {
            done.fail(StreamError::Destroyed { operation: "write" });
            return;
        };
        let length_before = controller.readable_length();
        let shared = self.shared.clone();
        let settle = Done::new(
            move |outcome| match outcome {
                Ok(()) => shared.release_or_hold(done, length_before),
                Err(error) => done.fail(classify(error)),
            },
            Done::dropped_write,
        );
        let mut cx = TransformContext::new(controller, settle);
        let poll = match self.shared.transformer.try_borrow_mut() {
            Ok(mut transformer) => transformer.transform(chunk, &mut cx),
            Err(_) => Poll::Ready(Err(StreamError::transform_failed(
                "transformer re-entered while a transformation was running",
            ))),
        };
        cx.commit(poll, "transform");
    }

    fn finish(&mut self, done: Done) {
        let Some(controller) = self.shared.controller() else {
            done.succeed();
            return;
        };
        if controller.is_closed() {
            controller.end();
            done.succeed();
            return;
        }
        let end = controller.clone();
        let settle = Done::new(
            move |outcome| match outcome {
                Ok(()) => {
                    end.end();
                    done.succeed();
                }
                Err(error) => done.fail(classify(error)),
            },
            Done::dropped_finish,
        );
        let mut cx = TransformContext::new(controller, settle);
        let poll = match self.shared.transformer.try_borrow_mut() {
            Ok(mut transformer) => transformer.flush(&mut cx),
            Err(_) => Poll::Ready(Err(StreamError::transform_failed(
                "transformer re-entered while flushing",
            ))),
        };
        cx.commit(poll, "flush");
    }
}

struct TransformSource<I: Chunk, O: Chunk> {
    shared: Rc<Shared<I, O>>,
}

impl<I: Chunk, O: Chunk> Source<O> for TransformSource<I, O> {
    fn produce(&mut self, _controller: &ReadableController<O>, _size: usize) {
        self.shared.release_held();
    }

    fn destroy(&mut self, _error: Option<&StreamError>, done: Done) {
        let held = self.shared.held.borrow_mut().take();
        if let Some(write) = held {
            write.fail(StreamError::Destroyed { operation: "write" });
        }
        done.succeed();
    }
}

/// 转换端：写入 `I`，读出 `O`。
pub struct Transform<I: Chunk, O: Chunk> {
    duplex: Duplex<O, I>,
}

impl<I: Chunk, O: Chunk> Clone for Transform<I, O> {
    fn clone(&self) -> Self {
        Self {
            duplex: self.duplex.clone(),
        }
    }
}

impl<I: Chunk, O: Chunk> Transform<I, O> {
    /// 以转换函数创建转换端。
    pub fn new<T>(transformer: T, options: TransformOptions, scheduler: SharedScheduler) -> Self
    where
        T: Transformer<I, O> + 'static,
    {
        let shared = Rc::new(Shared {
            transformer: RefCell::new(Box::new(transformer)),
            held: RefCell::new(None),
            output: OnceCell::new(),
            input: OnceCell::new(),
            scheduler: scheduler.clone(),
        });
        let readable = Readable::new(
            TransformSource {
                shared: shared.clone(),
            },
            options.readable,
            scheduler.clone(),
        );
        let writable = Writable::new(
            TransformSink {
                shared: shared.clone(),
            },
            options.writable,
            scheduler,
        );
        let _ = shared.output.set(readable.controller());
        let _ = shared.input.set(writable.downgrade());
        Self {
            duplex: Duplex::new(readable, writable),
        }
    }

    /// 读出侧。
    pub fn readable(&self) -> &Readable<O> {
        self.duplex.readable()
    }

    /// 写入侧。
    pub fn writable(&self) -> &Writable<I> {
        self.duplex.writable()
    }

    pub fn duplex(&self) -> &Duplex<O, I> {
        &self.duplex
    }

    pub fn write(&self, chunk: I) -> WriteOutcome {
        self.writable().write(chunk)
    }

    pub fn end(&self) -> EndCompletion {
        self.writable().end()
    }

    pub fn end_with(&self, chunk: I) -> EndCompletion {
        self.writable().end_with(chunk)
    }

    pub fn read(&self, size: Option<usize>) -> Option<O> {
        self.readable().read(size)
    }

    pub fn on_data<F, R>(&self, listener: F) -> ListenerId
    where
        F: Fn(&O) -> R + 'static,
        R: Into<Flow>,
    {
        self.readable().on_data(listener)
    }

    pub fn on_end(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.readable().on_end(listener)
    }

    /// 两侧的错误最终都以同一错误销毁读出侧，因此只在读出侧监听即可观察全部错误。
    pub fn on_error(&self, listener: impl Fn(&StreamError) + 'static) -> ListenerId {
        self.readable().on_error(listener)
    }

    pub fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.readable().on_close(listener)
    }

    pub fn destroy(&self, error: Option<StreamError>) {
        self.duplex.destroy(error);
    }

    pub fn is_destroyed(&self) -> bool {
        self.duplex.is_destroyed()
    }

    pub fn finished(&self) -> Completion {
        self.duplex.finished()
    }
}

impl<C: Chunk> Transform<C, C> {
    /// 原样转发的转换端。
    pub fn pass_through(options: TransformOptions, scheduler: SharedScheduler) -> Self {
        Self::new(PassThrough, options, scheduler)
    }
}

/// 恒等转换。
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl<C: Chunk> Transformer<C, C> for PassThrough {
    fn transform(&mut self, chunk: C, cx: &mut TransformContext<C>) -> Poll<Result<(), StreamError>> {
        cx.push(chunk);
        Poll::Ready(Ok(()))
    }
}

impl<I: Chunk, O: Chunk> fmt::Debug for Transform<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform").field("duplex", &self.duplex).finish()
    }
}
