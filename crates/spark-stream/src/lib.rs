#![deny(unsafe_code)]
#![doc = "spark-stream: 单线程协作式的流控引擎。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "- [`Readable`]：生产者推入、消费者以流动或暂停模式取出，缓冲超过高水位时向生产者报告背压；"]
#![doc = "- [`Writable`]：调用方写入、[`Sink`] 逐个（或批量）写出，写入完成严格按写入顺序结算；"]
#![doc = "- [`Transform`]：写入侧与读出侧组成的双工端，背压跨两侧传递；"]
#![doc = "- [`pipe`] / [`Pipeline`]：把可读端接到可写端，自动联动背压、结束与错误；"]
#![doc = "- [`Utf8Decoder`]：把字节流增量解码为文本片段，正确处理跨块的多字节字符。"]
#![doc = ""]
#![doc = "== 运行模型 =="]
#![doc = "所有引擎句柄基于 `Rc`，只能在单线程内使用。需要“下一拍”执行的动作（`end`、`close`、`error` 事件等）"]
#![doc = "经注入的 [`Scheduler`] 登记；[`TickQueue`] 是确定性的参考实现，测试与基准逐拍推进它。"]
#![doc = "引擎在调用任何用户回调（源、汇、监听器、转换函数）之前释放内部借用，回调中可以任意重入引擎。"]
#![doc = ""]
#![doc = "```"]
#![doc = "use bytes::Bytes;"]
#![doc = "use spark_stream::{Readable, ReadableOptions, TickQueue};"]
#![doc = ""]
#![doc = "let queue = TickQueue::new();"]
#![doc = "let readable = Readable::<Bytes>::manual(ReadableOptions::default().with_high_water_mark(2), queue.handle());"]
#![doc = "assert!(readable.push(Bytes::from_static(b\"a\")));"]
#![doc = "assert!(!readable.push(Bytes::from_static(b\"b\")));"]
#![doc = "assert_eq!(readable.read(Some(2)).as_deref(), Some(&b\"ab\"[..]));"]
#![doc = "```"]

pub mod buffer;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod decode;
pub mod duplex;
pub mod error;
pub mod event;
pub mod finished;
pub mod pipe;
pub mod readable;
pub mod state;
pub mod tick;
pub mod transform;
pub mod writable;

pub use buffer::ChunkBuffer;
pub use chunk::{Chunk, ChunkMode, MAX_HIGH_WATER_MARK, Object};
pub use completion::{Completion, Done, Outcome};
pub use config::{
    ConfigError, OverflowPolicy, PipeOptions, ReadableOptions, StreamConfig, TransformOptions,
    WritableOptions,
};
pub use decode::Utf8Decoder;
pub use duplex::Duplex;
pub use error::{Result, StreamError, codes};
pub use event::{Flow, ListenerId};
pub use finished::{Finishable, Pipeline, PipelineCompletion, finished};
pub use pipe::{PipeLink, PipeState, pipe};
pub use readable::{
    LocalStream, ManualSource, Readable, ReadableController, ReadablePhase, ReadableState,
    ReadableStream, Source,
};
pub use state::StateAdvance;
pub use tick::{LocalFuture, Scheduler, SharedScheduler, Task, TickQueue};
pub use transform::{Deferred, PassThrough, Transform, TransformContext, Transformer};
pub use writable::{
    EndCompletion, Sink, Writable, WritablePhase, WritableState, WriteCompletion, WriteOutcome,
};
