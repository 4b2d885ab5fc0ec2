//! # readable 模块说明
//!
//! ## 角色定位（Why）
//! - 可读端是整个流控体系的上游：生产者通过 [`ReadableController`] 推送数据，
//!   消费者以流动（`data` 监听器）或暂停（`read()`）两种协议取数；
//! - 状态判定集中在 [`state`]，引擎 [`Readable`] 只负责执行判定给出的副作用。
//!
//! ## 模块结构（How）
//! - `state`：纯数据的 [`ReadableState`] 与转换函数；
//! - `engine`：引擎句柄、生产者接口 [`Source`] 与推送控制器；
//! - `iter`：`futures::Stream` 适配器 [`ReadableStream`]；
//! - `from`：由迭代器或异步流构造引擎。

mod engine;
mod from;
mod iter;
pub mod state;

pub use engine::{ManualSource, Readable, ReadableController, Source};
pub use from::LocalStream;
pub use iter::ReadableStream;
pub use state::{ReadablePhase, ReadableState};
