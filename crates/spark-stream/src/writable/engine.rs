use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use super::state::{Admission, WritablePhase, WritableState};
use crate::chunk::Chunk;
use crate::completion::{Completion, CompletionQueue, Done, Outcome, resolve_all};
use crate::config::WritableOptions;
use crate::error::StreamError;
use crate::event::{ListenerId, ListenerIds, Listeners};
use crate::state::StateAdvance;
use crate::tick::SharedScheduler;

/// 单次写入的完成 Future。
pub type WriteCompletion = Completion;

/// `end()` 的完成 Future：在 `finish` 之后（或以错误）结算。
pub type EndCompletion = Completion;

/// 数据消费者接口。
///
/// # 教案式说明
/// - **意图 (Why)**：把“数据最终写到哪里”与背压、排序、结束协议解耦；
///   实现者只需处理单个数据单元并在完成时调用 [`Done`]；
/// - **契约 (What)**：
///   - 同一时刻至多一次 `dispatch`（或 `dispatch_vectored`）未完成；
///   - `done` 可以在 `dispatch` 内同步完成，也可以移动到别处异步完成；丢弃未完成的句柄视为汇失败；
///   - `is_vectored` 返回 `true` 时，多个排队写入会合并为一次 `dispatch_vectored`；
///   - `finish` 在全部写入确认后调用一次；`destroy` 在引擎销毁时调用一次；
/// - **风险 (Trade-offs)**：`dispatch` 期间汇对象被引擎暂时取出，其间触发的新派发会排队到本次调用返回之后。
pub trait Sink<C: Chunk> {
    /// 写出一个数据单元。
    fn dispatch(&mut self, chunk: C, done: Done);

    /// 是否支持批量写出。
    fn is_vectored(&self) -> bool {
        false
    }

    /// 批量写出；仅在 `is_vectored` 为真时被调用。
    fn dispatch_vectored(&mut self, chunks: Vec<C>, done: Done) {
        let _ = chunks;
        done.fail(StreamError::Unsupported {
            operation: "dispatch_vectored",
        });
    }

    /// 全部写入确认后的收尾。
    fn finish(&mut self, done: Done) {
        done.succeed();
    }

    /// 引擎被销毁，释放资源。
    fn destroy(&mut self, error: Option<&StreamError>, done: Done) {
        let _ = error;
        done.succeed();
    }
}

/// `write` 的即时结果。
///
/// - `is_ready()`：写入后缓冲仍低于高水位，调用方可以继续写；
/// - `completion()`：该写入被汇确认（或失败）时结算的 Future。
#[derive(Clone, Debug)]
pub struct WriteOutcome {
    ready: bool,
    completion: WriteCompletion,
}

impl WriteOutcome {
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn completion(&self) -> &WriteCompletion {
        &self.completion
    }

    pub fn into_completion(self) -> WriteCompletion {
        self.completion
    }
}

enum SinkOp<C> {
    Dispatch(C, Done),
    DispatchVectored(Vec<C>, Done),
    Finish(Done),
    Destroy(Option<StreamError>, Done),
}

struct Buffered<C> {
    chunk: C,
    size: usize,
    sequence: u64,
}

/// 在途写入：`token` 为批次首个序号，用于识别过期的确认。
struct InFlight {
    token: u64,
    sequences: Vec<u64>,
    size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitEvent {
    Drain,
    Finish,
    Close,
}

#[derive(Default)]
struct Events {
    drain: Listeners<dyn Fn()>,
    finish: Listeners<dyn Fn()>,
    close: Listeners<dyn Fn()>,
    error: Listeners<dyn Fn(&StreamError)>,
    destroy: Listeners<dyn Fn(Option<&StreamError>)>,
}

impl Events {
    fn unit(&mut self, event: UnitEvent) -> &mut Listeners<dyn Fn()> {
        match event {
            UnitEvent::Drain => &mut self.drain,
            UnitEvent::Finish => &mut self.finish,
            UnitEvent::Close => &mut self.close,
        }
    }

    fn remove(&mut self, id: ListenerId) -> bool {
        self.drain.remove(id)
            || self.finish.remove(id)
            || self.close.remove(id)
            || self.error.remove(id)
            || self.destroy.remove(id)
    }

    fn clear(&mut self) {
        self.drain.clear();
        self.finish.clear();
        self.close.clear();
        self.error.clear();
        self.destroy.clear();
    }
}

struct Core<C: Chunk> {
    state: WritableState,
    buffered: VecDeque<Buffered<C>>,
    in_flight: Option<InFlight>,
    after_write: Option<Vec<u64>>,
    completions: CompletionQueue,
    next_sequence: u64,
    finish_waiters: Vec<Completion>,
    events: Events,
    ids: ListenerIds,
    error: Option<StreamError>,
    auto_destroy_guard: Option<Rc<dyn Fn() -> bool>>,
}

impl<C: Chunk> Core<C> {
    fn record_error(&mut self, error: &StreamError) {
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
        self.state.errored = true;
    }

    fn register(&mut self) -> (u64, Completion) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let completion = Completion::pending();
        self.completions.register(sequence, completion.clone());
        (sequence, completion)
    }

    fn settle_all(&mut self, sequences: &[u64], outcome: &Outcome) -> Vec<(Completion, Outcome)> {
        let mut ready = Vec::new();
        for &sequence in sequences {
            self.state.pending_callbacks = self.state.pending_callbacks.saturating_sub(1);
            ready.extend(self.completions.settle(sequence, outcome.clone()));
        }
        ready
    }
}

struct Inner<C: Chunk> {
    core: RefCell<Core<C>>,
    sink: RefCell<Option<Box<dyn Sink<C>>>>,
    ops: RefCell<VecDeque<SinkOp<C>>>,
    sink_busy: Cell<bool>,
    vectored: bool,
    scheduler: SharedScheduler,
    label: Rc<str>,
}

/// 可写引擎。
///
/// # 教案式说明
/// - **意图 (Why)**：把任意速度的汇包装为“可排队、可背压、可批量、可优雅结束”的写入端；
/// - **契约 (What)**：
///   - `write` 永不阻塞：超过高水位时仍接受数据，只以 `is_ready() == false` 提示背压，
///     缓冲排空后派发 `drain`；
///   - 写入完成严格按写入顺序结算；汇在 `dispatch` 内同步确认时，结算推迟到下一拍；
///   - 汇失败时，失败写入与全部排队写入以同一错误结算，随后引擎销毁并派发一次 `error`；
///   - `end()` 的完成在 `finish` 事件时结算；
/// - **执行逻辑 (How)**：对汇的所有调用经由一个操作队列串行执行，
///   汇在自身调用栈内触发的新操作排到当前调用返回之后，避免对汇的重入借用；
/// - **设计权衡 (Trade-offs)**：与 [`crate::Readable`] 相同，句柄基于 `Rc`，为 `!Send`。
pub struct Writable<C: Chunk> {
    inner: Rc<Inner<C>>,
}

impl<C: Chunk> Clone for Writable<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// 不延长引擎生命周期的弱句柄。
pub(crate) struct WeakWritable<C: Chunk> {
    inner: Weak<Inner<C>>,
}

impl<C: Chunk> Clone for WeakWritable<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Chunk> WeakWritable<C> {
    pub(crate) fn upgrade(&self) -> Option<Writable<C>> {
        self.inner.upgrade().map(|inner| Writable { inner })
    }
}

impl<C: Chunk> Writable<C> {
    /// 以给定汇、配置与调度器创建可写引擎。
    pub fn new<S>(sink: S, options: WritableOptions, scheduler: SharedScheduler) -> Self
    where
        S: Sink<C> + 'static,
    {
        let high_water_mark = options.resolve_high_water_mark(C::MODE);
        let label: Rc<str> = Rc::from(options.label.as_deref().unwrap_or("writable"));
        let vectored = sink.is_vectored();
        trace!(stream = %label, high_water_mark, vectored, "writable created");
        Self {
            inner: Rc::new(Inner {
                core: RefCell::new(Core {
                    state: WritableState::new(
                        C::MODE,
                        high_water_mark,
                        options.auto_destroy,
                        options.emit_close,
                    ),
                    buffered: VecDeque::new(),
                    in_flight: None,
                    after_write: None,
                    completions: CompletionQueue::default(),
                    next_sequence: 0,
                    finish_waiters: Vec::new(),
                    events: Events::default(),
                    ids: ListenerIds::default(),
                    error: None,
                    auto_destroy_guard: None,
                }),
                sink: RefCell::new(Some(Box::new(sink))),
                ops: RefCell::new(VecDeque::new()),
                sink_busy: Cell::new(false),
                vectored,
                scheduler,
                label,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub(crate) fn downgrade(&self) -> WeakWritable<C> {
        WeakWritable {
            inner: Rc::downgrade(&self.inner),
        }
    }

    fn core(&self) -> Ref<'_, Core<C>> {
        self.inner.core.borrow()
    }

    fn core_mut(&self) -> RefMut<'_, Core<C>> {
        self.inner.core.borrow_mut()
    }

    fn schedule(&self, task: impl FnOnce(&Writable<C>) + 'static) {
        let this = self.clone();
        self.inner.scheduler.defer(Box::new(move || task(&this)));
    }

    // ---- 写入 ----

    /// 写入一个数据单元。
    pub fn write(&self, chunk: C) -> WriteOutcome {
        self.write_chunk(chunk).0
    }

    fn write_chunk(&self, chunk: C) -> (WriteOutcome, Option<StreamError>) {
        let size = chunk.size();
        let admission = self.core_mut().state.admit(size);
        let (ready, completion) = match admission {
            Admission::Rejected(error) => {
                warn!(stream = %self.inner.label, code = error.code(), "write rejected");
                let completion = Completion::pending();
                let deferred = completion.clone();
                let outcome = Err(error.clone());
                self.schedule(move |_| {
                    deferred.resolve(outcome);
                });
                self.error_or_destroy(error.clone());
                let outcome = WriteOutcome {
                    ready: false,
                    completion,
                };
                return (outcome, Some(error));
            }
            Admission::Buffer { ready } => {
                let mut core = self.core_mut();
                let (sequence, completion) = core.register();
                core.buffered.push_back(Buffered {
                    chunk,
                    size,
                    sequence,
                });
                trace!(stream = %self.inner.label, size, sequence, "write buffered");
                (ready, completion)
            }
            Admission::Dispatch { ready } => {
                let (sequence, completion) = {
                    let mut core = self.core_mut();
                    let (sequence, completion) = core.register();
                    core.in_flight = Some(InFlight {
                        token: sequence,
                        sequences: vec![sequence],
                        size,
                    });
                    (sequence, completion)
                };
                trace!(stream = %self.inner.label, size, sequence, "write dispatched");
                self.run_sink(SinkOp::Dispatch(chunk, self.write_done(sequence)));
                (ready, completion)
            }
        };
        let state = self.core().state;
        let ready = ready && !state.errored && !state.destroyed;
        (WriteOutcome { ready, completion }, None)
    }

    /// 结束写入：等待缓冲排空后调用汇的 `finish`，完成后派发 `finish` 事件。
    pub fn end(&self) -> EndCompletion {
        self.end_inner(None)
    }

    /// 写入最后一个数据单元后结束。
    pub fn end_with(&self, chunk: C) -> EndCompletion {
        self.end_inner(Some(chunk))
    }

    fn end_inner(&self, chunk: Option<C>) -> EndCompletion {
        let mut failure = chunk.and_then(|chunk| self.write_chunk(chunk).1);

        let corked = self.core().state.corked > 0;
        if corked {
            self.core_mut().state.corked = 1;
            self.uncork();
        }

        if failure.is_none() {
            let before = self.phase();
            let begin = self.core_mut().state.begin_end();
            match begin {
                Ok(true) => {
                    let advance = StateAdvance::between(before, WritablePhase::Ending);
                    debug!(stream = %self.inner.label, ?advance, "writable ending");
                    self.finish_maybe(true);
                    self.core_mut().state.ended = true;
                }
                Ok(false) => {}
                Err(error) => failure = Some(error),
            }
        }

        let completion = Completion::pending();
        let finished = self.core().state.finished;
        if failure.is_some() || finished {
            let deferred = completion.clone();
            let outcome = failure.map_or(Ok(()), Err);
            self.schedule(move |_| {
                deferred.resolve(outcome);
            });
        } else {
            self.core_mut().finish_waiters.push(completion.clone());
        }
        completion
    }

    /// 暂存后续写入；可嵌套。
    pub fn cork(&self) {
        self.core_mut().state.corked += 1;
    }

    /// 解除一层暂存；最外层解除时把暂存的写入派发出去（汇支持时合并为一次批量写出）。
    pub fn uncork(&self) {
        let clear = self.core_mut().state.uncork();
        if clear {
            self.clear_buffer();
        }
    }

    /// 销毁引擎：排队写入与等待中的 `end()` 以错误结算，随后派发 `error`（如有）与 `close`。
    pub fn destroy(&self, error: Option<StreamError>) {
        let (hooks, flush) = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            if core.state.destroyed {
                return;
            }
            let flush = !core.buffered.is_empty() || !core.finish_waiters.is_empty();
            if let Some(error) = &error {
                core.record_error(error);
            }
            let before = core.state.phase();
            core.state.destroyed = true;
            let advance = StateAdvance::between(before, core.state.phase());
            debug!(
                stream = %self.inner.label,
                buffered = core.buffered.len(),
                code = error.as_ref().map(StreamError::code),
                ?advance,
                "writable destroyed"
            );
            (core.events.destroy.snapshot(), flush)
        };
        if flush {
            self.schedule(Self::error_buffer);
        }
        for hook in hooks {
            hook(error.as_ref());
        }
        self.release_sink(error);
    }

    // ---- 事件 ----

    pub fn on_drain(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.add_unit(UnitEvent::Drain, Rc::new(listener), false)
    }

    pub fn on_finish(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.add_unit(UnitEvent::Finish, Rc::new(listener), false)
    }

    pub fn on_close(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.add_unit(UnitEvent::Close, Rc::new(listener), false)
    }

    /// 只接收下一次 `drain` 的监听器。
    pub fn once_drain(&self, listener: impl Fn() + 'static) -> ListenerId {
        self.add_unit(UnitEvent::Drain, Rc::new(listener), true)
    }

    pub fn on_error(&self, listener: impl Fn(&StreamError) + 'static) -> ListenerId {
        let mut core = self.core_mut();
        let id = core.ids.allocate();
        core.events.error.add(id, Rc::new(listener), false);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.core_mut().events.remove(id)
    }

    pub(crate) fn on_destroy(&self, hook: impl Fn(Option<&StreamError>) + 'static) -> ListenerId {
        let mut core = self.core_mut();
        let id = core.ids.allocate();
        core.events.destroy.add(id, Rc::new(hook), false);
        id
    }

    pub(crate) fn set_auto_destroy_guard(&self, guard: Rc<dyn Fn() -> bool>) {
        self.core_mut().auto_destroy_guard = Some(guard);
    }

    fn add_unit(&self, event: UnitEvent, listener: Rc<dyn Fn()>, once: bool) -> ListenerId {
        let mut core = self.core_mut();
        let id = core.ids.allocate();
        core.events.unit(event).add(id, listener, once);
        id
    }

    // ---- 观察 ----

    /// 在途与缓冲中的计量单位数。
    pub fn writable_length(&self) -> usize {
        self.core().state.length
    }

    pub fn high_water_mark(&self) -> usize {
        self.core().state.high_water_mark
    }

    /// 是否处于背压中（等待 `drain`）。
    pub fn need_drain(&self) -> bool {
        self.core().state.need_drain
    }

    /// 当前 cork 嵌套层数。
    pub fn corked(&self) -> u32 {
        self.core().state.corked
    }

    /// 是否已调用 `end()`。
    pub fn is_ending(&self) -> bool {
        self.core().state.ending
    }

    pub fn is_finished(&self) -> bool {
        self.core().state.finished
    }

    pub fn is_destroyed(&self) -> bool {
        self.core().state.destroyed
    }

    pub fn is_errored(&self) -> bool {
        self.core().state.errored
    }

    pub fn is_closed(&self) -> bool {
        self.core().state.close_emitted
    }

    /// 仍可写入：未销毁、未出错、未结束。
    pub fn writable(&self) -> bool {
        self.core().state.is_writable()
    }

    pub fn error(&self) -> Option<StreamError> {
        self.core().error.clone()
    }

    /// 状态快照。
    pub fn state(&self) -> WritableState {
        self.core().state
    }

    pub fn phase(&self) -> WritablePhase {
        self.core().state.phase()
    }

    // ---- 汇调用 ----

    fn write_done(&self, token: u64) -> Done {
        let weak = Rc::downgrade(&self.inner);
        Done::new(
            move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    Writable { inner }.on_write(token, outcome);
                }
            },
            Done::dropped_write,
        )
    }

    /// 串行执行汇操作；汇调用栈内登记的新操作在当前调用返回后继续执行。
    fn run_sink(&self, op: SinkOp<C>) {
        self.inner.ops.borrow_mut().push_back(op);
        if self.inner.sink_busy.replace(true) {
            return;
        }
        loop {
            let next = self.inner.ops.borrow_mut().pop_front();
            let Some(op) = next else {
                break;
            };
            let taken = self.inner.sink.borrow_mut().take();
            let Some(mut sink) = taken else {
                trace!(stream = %self.inner.label, "sink released, operation dropped");
                drop(op);
                continue;
            };
            if self.apply(sink.as_mut(), op) {
                *self.inner.sink.borrow_mut() = Some(sink);
            }
        }
        self.inner.sink_busy.set(false);
    }

    /// 执行一次汇操作；返回汇是否仍应保留。
    fn apply(&self, sink: &mut dyn Sink<C>, op: SinkOp<C>) -> bool {
        match op {
            SinkOp::Dispatch(chunk, done) => {
                self.core_mut().state.sync = true;
                sink.dispatch(chunk, done);
                self.core_mut().state.sync = false;
                true
            }
            SinkOp::DispatchVectored(chunks, done) => {
                self.core_mut().state.sync = true;
                sink.dispatch_vectored(chunks, done);
                self.core_mut().state.sync = false;
                true
            }
            SinkOp::Finish(done) => {
                self.core_mut().state.sync = true;
                sink.finish(done);
                self.core_mut().state.sync = false;
                true
            }
            SinkOp::Destroy(error, done) => {
                sink.destroy(error.as_ref(), done);
                false
            }
        }
    }

    fn on_write(&self, token: u64, outcome: Outcome) {
        let (sync, flight) = {
            let mut core = self.core_mut();
            let current = core.in_flight.as_ref().map(|flight| flight.token);
            if current != Some(token) {
                trace!(stream = %self.inner.label, token, "stale write completion ignored");
                return;
            }
            let Some(flight) = core.in_flight.take() else {
                return;
            };
            core.state.on_acknowledged(flight.size);
            (core.state.sync, flight)
        };

        match outcome {
            Err(error) => {
                warn!(stream = %self.inner.label, code = error.code(), %error, "sink write failed");
                self.core_mut().record_error(&error);
                if sync {
                    self.schedule(move |this| this.on_write_error(&flight.sequences, error));
                } else {
                    self.on_write_error(&flight.sequences, error);
                }
            }
            Ok(()) => {
                let has_buffered = !self.core().buffered.is_empty();
                if has_buffered {
                    self.clear_buffer();
                }
                if sync {
                    let schedule = {
                        let mut core = self.core_mut();
                        match core.after_write.as_mut() {
                            Some(batch) => {
                                batch.extend(flight.sequences);
                                false
                            }
                            None => {
                                core.after_write = Some(flight.sequences);
                                true
                            }
                        }
                    };
                    if schedule {
                        self.schedule(|this| {
                            let batch = this.core_mut().after_write.take().unwrap_or_default();
                            this.after_write(&batch);
                        });
                    }
                } else {
                    self.after_write(&flight.sequences);
                }
            }
        }
    }

    fn after_write(&self, sequences: &[u64]) {
        let drain = self.core_mut().state.take_drain();
        if drain {
            trace!(stream = %self.inner.label, "drain");
            self.emit_unit(UnitEvent::Drain);
        }
        let ready = self.core_mut().settle_all(sequences, &Ok(()));
        resolve_all(ready);
        if self.core().state.destroyed {
            self.error_buffer();
        }
        self.finish_maybe(false);
    }

    fn on_write_error(&self, sequences: &[u64], error: StreamError) {
        let ready = self.core_mut().settle_all(sequences, &Err(error.clone()));
        resolve_all(ready);
        self.error_buffer();
        self.error_or_destroy(error);
    }

    /// 以当前错误（或“已销毁”）结算全部排队写入与等待中的 `end()`。
    fn error_buffer(&self) {
        let (ready, waiters, end_failure) = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            if core.state.writing {
                return;
            }
            let write_failure = core
                .error
                .clone()
                .unwrap_or(StreamError::Destroyed { operation: "write" });
            let mut ready = Vec::new();
            while let Some(entry) = core.buffered.pop_front() {
                core.state.length = core.state.length.saturating_sub(entry.size);
                core.state.buffered = core.state.buffered.saturating_sub(1);
                ready.extend(core.settle_all(&[entry.sequence], &Err(write_failure.clone())));
            }
            let end_failure = core
                .error
                .clone()
                .unwrap_or(StreamError::Destroyed { operation: "end" });
            (ready, std::mem::take(&mut core.finish_waiters), end_failure)
        };
        resolve_all(ready);
        for waiter in waiters {
            waiter.resolve(Err(end_failure.clone()));
        }
    }

    /// 派发缓冲中的写入：汇支持批量且缓冲多于一个时合并为一次，否则逐个派发直到出现在途写入。
    fn clear_buffer(&self) {
        let vectored = {
            let mut core = self.core_mut();
            if !core.state.can_clear_buffer() {
                return;
            }
            core.state.buffer_processing = true;
            self.inner.vectored && core.buffered.len() > 1
        };

        if vectored {
            let (chunks, token) = {
                let mut guard = self.core_mut();
                let core = &mut *guard;
                let entries: Vec<Buffered<C>> = core.buffered.drain(..).collect();
                core.state.buffered = 0;
                let size = entries.iter().map(|entry| entry.size).sum();
                let sequences: Vec<u64> = entries.iter().map(|entry| entry.sequence).collect();
                let token = sequences[0];
                core.state.writing = true;
                core.in_flight = Some(InFlight {
                    token,
                    sequences,
                    size,
                });
                let chunks: Vec<C> = entries.into_iter().map(|entry| entry.chunk).collect();
                (chunks, token)
            };
            trace!(stream = %self.inner.label, batch = chunks.len(), "vectored write dispatched");
            self.run_sink(SinkOp::DispatchVectored(chunks, self.write_done(token)));
        } else {
            loop {
                let next = {
                    let mut guard = self.core_mut();
                    let core = &mut *guard;
                    if core.state.writing || core.state.destroyed {
                        None
                    } else {
                        core.buffered.pop_front().inspect(|entry| {
                            core.state.buffered = core.state.buffered.saturating_sub(1);
                            core.state.writing = true;
                            core.in_flight = Some(InFlight {
                                token: entry.sequence,
                                sequences: vec![entry.sequence],
                                size: entry.size,
                            });
                        })
                    }
                };
                let Some(entry) = next else {
                    break;
                };
                self.run_sink(SinkOp::Dispatch(entry.chunk, self.write_done(entry.sequence)));
            }
        }
        self.core_mut().state.buffer_processing = false;
    }

    // ---- 结束流程 ----

    fn finish_maybe(&self, sync: bool) {
        if !self.core().state.need_finish() {
            return;
        }
        self.prefinish();
        let idle = self.core().state.pending_callbacks == 0;
        if !idle {
            return;
        }
        if sync {
            self.core_mut().state.pending_callbacks += 1;
            self.schedule(|this| {
                if this.core().state.need_finish() {
                    this.finish();
                } else {
                    let mut core = this.core_mut();
                    core.state.pending_callbacks = core.state.pending_callbacks.saturating_sub(1);
                }
            });
        } else if self.core().state.need_finish() {
            self.core_mut().state.pending_callbacks += 1;
            self.finish();
        }
    }

    fn prefinish(&self) {
        let call_final = {
            let mut core = self.core_mut();
            if core.state.prefinished || core.state.final_called {
                false
            } else if core.state.destroyed {
                core.state.prefinished = true;
                false
            } else {
                core.state.final_called = true;
                true
            }
        };
        if call_final {
            self.call_final();
        }
    }

    fn call_final(&self) {
        self.core_mut().state.pending_callbacks += 1;
        let weak = Rc::downgrade(&self.inner);
        let done = Done::new(
            move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    Writable { inner }.on_final(outcome);
                }
            },
            Done::dropped_finish,
        );
        trace!(stream = %self.inner.label, "sink finish requested");
        self.run_sink(SinkOp::Finish(done));
    }

    fn on_final(&self, outcome: Outcome) {
        {
            let mut core = self.core_mut();
            core.state.pending_callbacks = core.state.pending_callbacks.saturating_sub(1);
        }
        match outcome {
            Err(error) => {
                warn!(stream = %self.inner.label, code = error.code(), %error, "sink finish failed");
                let waiters = std::mem::take(&mut self.core_mut().finish_waiters);
                for waiter in waiters {
                    waiter.resolve(Err(error.clone()));
                }
                self.error_or_destroy(error);
            }
            Ok(()) => {
                let proceed = {
                    let mut core = self.core_mut();
                    if core.state.need_finish() {
                        core.state.prefinished = true;
                        core.state.pending_callbacks += 1;
                        true
                    } else {
                        false
                    }
                };
                if proceed {
                    self.schedule(Self::finish);
                }
            }
        }
    }

    fn finish(&self) {
        let waiters = {
            let mut core = self.core_mut();
            core.state.pending_callbacks = core.state.pending_callbacks.saturating_sub(1);
            if core.state.destroyed || core.state.errored || core.state.finished {
                return;
            }
            core.state.finished = true;
            std::mem::take(&mut core.finish_waiters)
        };
        debug!(stream = %self.inner.label, "writable finished");
        for waiter in waiters {
            waiter.resolve(Ok(()));
        }
        self.emit_unit(UnitEvent::Finish);

        let (auto_destroy, guard) = {
            let core = self.core();
            (core.state.auto_destroy, core.auto_destroy_guard.clone())
        };
        if auto_destroy && guard.is_none_or(|allowed| allowed()) {
            self.destroy(None);
        }
    }

    // ---- 销毁与错误 ----

    /// 按自动销毁配置上报错误：开启时销毁，关闭时仅在下一拍派发 `error`。
    pub(crate) fn error_or_destroy(&self, error: StreamError) {
        let (destroyed, auto_destroy) = {
            let core = self.core();
            (core.state.destroyed, core.state.auto_destroy)
        };
        if destroyed {
            return;
        }
        if auto_destroy {
            self.destroy(Some(error));
        } else {
            self.core_mut().record_error(&error);
            self.schedule(Self::emit_error_once);
        }
    }

    fn release_sink(&self, error: Option<StreamError>) {
        let present = self.inner.sink_busy.get() || self.inner.sink.borrow().is_some();
        if !present {
            self.on_sink_destroyed(Ok(()));
            return;
        }
        let weak = Rc::downgrade(&self.inner);
        let done = Done::new(
            move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    Writable { inner }.on_sink_destroyed(outcome);
                }
            },
            Done::dropped_destroy,
        );
        self.run_sink(SinkOp::Destroy(error, done));
    }

    fn on_sink_destroyed(&self, outcome: Outcome) {
        if let Err(error) = outcome {
            self.core_mut().record_error(&error);
        }
        self.schedule(Self::emit_error_and_close);
    }

    fn emit_error_and_close(&self) {
        self.emit_error_once();
        let emit_close = {
            let mut core = self.core_mut();
            core.state.close_emitted = true;
            core.state.emit_close
        };
        if emit_close {
            self.emit_unit(UnitEvent::Close);
        }
        self.core_mut().events.clear();
    }

    fn emit_error_once(&self) {
        let payload = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            match core.error.clone() {
                Some(error) if !core.state.error_emitted => {
                    core.state.error_emitted = true;
                    Some((error, core.events.error.snapshot()))
                }
                _ => None,
            }
        };
        if let Some((error, listeners)) = payload {
            if listeners.is_empty() {
                warn!(stream = %self.inner.label, code = error.code(), %error, "writable error without listeners");
            }
            for listener in listeners {
                listener(&error);
            }
        }
    }

    fn emit_unit(&self, event: UnitEvent) {
        let listeners = self.core_mut().events.unit(event).snapshot();
        for listener in listeners {
            listener();
        }
    }
}

impl<C: Chunk> fmt::Debug for Writable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writable")
            .field("label", &self.inner.label)
            .field("state", &self.core().state)
            .field("unsettled", &self.core().completions.len())
            .finish()
    }
}
