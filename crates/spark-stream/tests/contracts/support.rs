//! 契约测试的公共夹具：可观察的汇与源、数据收集器、日志捕获。
//!
//! # 模块定位（Why）
//! - 各主题测试都需要“记录收到了什么”“手动决定何时应答”两类能力，集中在此避免每个文件重复拼装；
//! - 夹具只通过 crate 的公开接口与引擎交互，保证契约测试不依赖内部实现。
//!
//! # 使用说明（How）
//! - [`SinkProbe`] 是汇的观察句柄：`RecordingSink::new(mode)` 返回 `(sink, probe)`，
//!   测试通过 `probe` 读取写入记录、逐个释放被扣留的确认；
//! - [`collect`] 注册 `data` 监听器并返回共享记录；
//! - [`capture_logs`] 在闭包执行期间安装一个写入内存的订阅器，返回全部格式化输出。

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use spark_stream::{
    Chunk, Done, Readable, ReadableController, Sink, Source, StreamError, TickQueue,
};

/// 汇的应答方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Ack {
    /// 在 `dispatch` 调用栈内同步确认。
    Sync,
    /// 扣留确认，由测试经 [`SinkProbe::release_next`] 手动释放。
    Hold,
}

struct ProbeState<C> {
    written: RefCell<Vec<C>>,
    batches: RefCell<Vec<usize>>,
    held: RefCell<VecDeque<Done>>,
    finish_calls: Cell<usize>,
    destroy_calls: Cell<usize>,
    fail_at: Cell<Option<usize>>,
}

/// 汇的观察与控制句柄。
pub(crate) struct SinkProbe<C> {
    state: Rc<ProbeState<C>>,
}

impl<C> Clone for SinkProbe<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<C: Clone> SinkProbe<C> {
    /// 汇收到的全部数据单元，按派发顺序。
    pub(crate) fn written(&self) -> Vec<C> {
        self.state.written.borrow().clone()
    }

    /// 每次派发携带的单元个数；非批量派发记为 1。
    pub(crate) fn batches(&self) -> Vec<usize> {
        self.state.batches.borrow().clone()
    }

    /// 被扣留、尚未释放的确认个数。
    pub(crate) fn held(&self) -> usize {
        self.state.held.borrow().len()
    }

    /// 以成功释放最早的一个扣留确认；没有扣留时返回 `false`。
    pub(crate) fn release_next(&self) -> bool {
        let next = self.state.held.borrow_mut().pop_front();
        match next {
            Some(done) => {
                done.succeed();
                true
            }
            None => false,
        }
    }

    /// 以错误释放最早的一个扣留确认。
    pub(crate) fn fail_next(&self, error: StreamError) -> bool {
        let next = self.state.held.borrow_mut().pop_front();
        match next {
            Some(done) => {
                done.fail(error);
                true
            }
            None => false,
        }
    }

    /// 让第 `index` 次派发（从 0 计）同步失败。
    pub(crate) fn fail_at(&self, index: usize) {
        self.state.fail_at.set(Some(index));
    }

    pub(crate) fn finish_calls(&self) -> usize {
        self.state.finish_calls.get()
    }

    pub(crate) fn destroy_calls(&self) -> usize {
        self.state.destroy_calls.get()
    }
}

/// 记录写入的汇，可选同步确认或扣留确认，可选批量派发。
pub(crate) struct RecordingSink<C> {
    state: Rc<ProbeState<C>>,
    ack: Ack,
    vectored: bool,
}

impl<C> RecordingSink<C> {
    pub(crate) fn new(ack: Ack) -> (Self, SinkProbe<C>) {
        let state = Rc::new(ProbeState {
            written: RefCell::new(Vec::new()),
            batches: RefCell::new(Vec::new()),
            held: RefCell::new(VecDeque::new()),
            finish_calls: Cell::new(0),
            destroy_calls: Cell::new(0),
            fail_at: Cell::new(None),
        });
        let probe = SinkProbe {
            state: state.clone(),
        };
        (
            Self {
                state,
                ack,
                vectored: false,
            },
            probe,
        )
    }

    /// 声明支持批量派发。
    pub(crate) fn vectored(mut self) -> Self {
        self.vectored = true;
        self
    }

    fn settle(&self, index: usize, done: Done) {
        if self.state.fail_at.get() == Some(index) {
            done.fail(StreamError::sink_failed(format!("write #{index} refused")));
            return;
        }
        match self.ack {
            Ack::Sync => done.succeed(),
            Ack::Hold => self.state.held.borrow_mut().push_back(done),
        }
    }
}

impl<C: Chunk> Sink<C> for RecordingSink<C> {
    fn dispatch(&mut self, chunk: C, done: Done) {
        let index = self.state.batches.borrow().len();
        self.state.written.borrow_mut().push(chunk);
        self.state.batches.borrow_mut().push(1);
        self.settle(index, done);
    }

    fn is_vectored(&self) -> bool {
        self.vectored
    }

    fn dispatch_vectored(&mut self, chunks: Vec<C>, done: Done) {
        let index = self.state.batches.borrow().len();
        self.state.batches.borrow_mut().push(chunks.len());
        self.state.written.borrow_mut().extend(chunks);
        self.settle(index, done);
    }

    fn finish(&mut self, done: Done) {
        self.state.finish_calls.set(self.state.finish_calls.get() + 1);
        done.succeed();
    }

    fn destroy(&mut self, _error: Option<&StreamError>, done: Done) {
        self.state.destroy_calls.set(self.state.destroy_calls.get() + 1);
        done.succeed();
    }
}

/// 记录 `produce` 调用的源；每次被索取时从脚本中取下一批推送。
///
/// 脚本耗尽后推送结束标记。`calls` 记录 `produce` 被调用的次数，
/// 配合 `answer_later` 验证“同一时刻至多一次未完成的索取”。
pub(crate) struct ScriptedSource<C: Chunk> {
    script: VecDeque<Vec<C>>,
    calls: Rc<Cell<usize>>,
    deferred: Rc<RefCell<Option<ReadableController<C>>>>,
    answer_later: bool,
}

impl<C: Chunk> ScriptedSource<C> {
    pub(crate) fn new(script: Vec<Vec<C>>) -> Self {
        Self {
            script: script.into(),
            calls: Rc::default(),
            deferred: Rc::default(),
            answer_later: false,
        }
    }

    /// 不在 `produce` 内应答，只记下控制器，由测试稍后推送。
    pub(crate) fn answer_later(mut self) -> Self {
        self.answer_later = true;
        self
    }

    pub(crate) fn calls(&self) -> Rc<Cell<usize>> {
        self.calls.clone()
    }

    pub(crate) fn pending_controller(&self) -> Rc<RefCell<Option<ReadableController<C>>>> {
        self.deferred.clone()
    }
}

impl<C: Chunk> Source<C> for ScriptedSource<C> {
    fn produce(&mut self, controller: &ReadableController<C>, _size: usize) {
        self.calls.set(self.calls.get() + 1);
        if self.answer_later {
            *self.deferred.borrow_mut() = Some(controller.clone());
            return;
        }
        match self.script.pop_front() {
            Some(batch) => {
                for chunk in batch {
                    controller.push(chunk);
                }
            }
            None => controller.end(),
        }
    }
}

/// 注册 `data` 监听器并返回收到的数据记录。
pub(crate) fn collect<C: Chunk + Clone>(readable: &Readable<C>) -> Rc<RefCell<Vec<C>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    readable.on_data(move |chunk: &C| sink.borrow_mut().push(chunk.clone()));
    seen
}

/// 统计无参事件的触发次数。
pub(crate) fn counter() -> (Rc<Cell<usize>>, impl Fn() + 'static) {
    let count = Rc::new(Cell::new(0));
    let handle = count.clone();
    (count, move || handle.set(handle.get() + 1))
}

/// 记录错误事件的错误码。
pub(crate) fn error_codes() -> (
    Rc<RefCell<Vec<&'static str>>>,
    impl Fn(&StreamError) + 'static,
) {
    let codes = Rc::new(RefCell::new(Vec::new()));
    let handle = codes.clone();
    (codes, move |error: &StreamError| {
        handle.borrow_mut().push(error.code())
    })
}

pub(crate) fn bytes(text: &'static str) -> Bytes {
    Bytes::from_static(text.as_bytes())
}

/// 把字节数据单元渲染为字符串，便于断言。
pub(crate) fn texts(chunks: &[Bytes]) -> Vec<String> {
    chunks
        .iter()
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

pub(crate) fn queue() -> TickQueue {
    TickQueue::new()
}

#[derive(Clone, Default)]
struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("capture buffer poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 在 `scenario` 执行期间捕获 `spark_stream` 输出的全部日志。
pub(crate) fn capture_logs(scenario: impl FnOnce()) -> String {
    let writer = CaptureWriter::default();
    let buffer = writer.0.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, scenario);
    let captured = buffer.lock().map(|bytes| bytes.clone()).unwrap_or_default();
    String::from_utf8_lossy(&captured).into_owned()
}
