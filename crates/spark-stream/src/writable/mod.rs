//! # writable 模块说明
//!
//! ## 角色定位（Why）
//! - 可写端是流控体系的下游：调用方 `write` 数据，引擎负责排队、背压、批量与结束协议，
//!   最终由 [`Sink`] 实现者把数据写到真正的目的地；
//! - 与可读端对称，状态判定集中在 [`state`]，引擎 [`Writable`] 执行副作用。

mod engine;
pub mod state;

pub(crate) use engine::WeakWritable;
pub use engine::{EndCompletion, Sink, Writable, WriteCompletion, WriteOutcome};
pub use state::{WritablePhase, WritableState};
