//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为可读/可写/转换/管道四类引擎提供统一的错误域，保证同一错误可以被多个回调、多个 Future 同时观察；
//! - 每个变体绑定稳定的错误码（[`codes`]），供日志与上层告警按码聚合，而不依赖展示文本。
//!
//! ## 设计要求（What）
//! - [`StreamError`] 必须实现 `Clone`：一次失败要同时送达失败写入、排队写入、`error` 事件与 `end` 完成句柄；
//! - 外部原因统一以 `Arc<dyn Error + Send + Sync>` 保存，既可克隆又保留 `source()` 链；
//! - 不变量违例（如结束后继续推送）一律经错误通道异步上报，绝不同步 panic。

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// 外部原因的共享形态。
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// 以 [`StreamError`] 为默认错误类型的结果别名。
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// 流控引擎的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“调用方违反协议”（推送/写入时机错误）、“对端失败”（源、汇、转换）
///   与“资源被提前拆除”（销毁、提前关闭）三类问题，方便上层选择重试或放弃。
/// - **契约 (What)**：
///   - 所有变体均可 `Clone`，且 `Send + Sync + 'static`；
///   - [`StreamError::code`] 返回的码值在版本间保持稳定；
///   - 外部原因通过 `source()` 暴露，便于日志打印完整链路。
/// - **设计权衡 (Trade-offs)**：外部原因使用 `Arc` 而非 `Box`，多一次原子计数换取零成本克隆。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum StreamError {
    /// 已推送结束标记后再次推送数据。
    ///
    /// - **意图 (Why)**：结束标记之后的数据无法被消费者观察，必须显式告警。
    /// - **风险 (Trade-offs)**：该错误经错误通道异步抛出，调用 `push` 的一方只能看到返回值 `false`。
    #[error("stream.push() after EOF")]
    PushAfterEnd,

    /// `end` 事件发出后再调用 `unshift`。
    #[error("stream.unshift() after end event")]
    UnshiftAfterEnd,

    /// 调用 `end()` 之后继续写入。
    #[error("write after end")]
    WriteAfterEnd,

    /// 在已完成（`finish`）的可写端上再次调用 `end()`。
    #[error("cannot call {operation} after a stream was finished")]
    AlreadyFinished { operation: &'static str },

    /// 引擎已销毁，拒绝新的操作。
    ///
    /// - **契约 (What)**：`operation` 为被拒绝的操作名（如 `write`、`end`）。
    #[error("cannot call {operation} after a stream was destroyed")]
    Destroyed { operation: &'static str },

    /// 对端在正常结束前关闭。
    #[error("premature close")]
    PrematureClose,

    /// 拒绝型溢出策略下，缓冲已达高水位仍被推送。
    #[error("push rejected: buffer holds {length} units with a high water mark of {high_water_mark}")]
    HighWaterMarkExceeded { length: usize, high_water_mark: usize },

    /// `read(n)` 请求的尺寸超出 1 GiB 上限，无法抬升高水位。
    #[error("requested read size {requested} exceeds the 1 GiB high water mark ceiling")]
    HighWaterMarkOutOfRange { requested: usize },

    /// 汇（写入目标）报告失败。
    #[error("sink failed: {0}")]
    Sink(#[source] Cause),

    /// 源（数据生产者）报告失败。
    #[error("source failed: {0}")]
    Source(#[source] Cause),

    /// 转换函数报告失败。
    #[error("transform failed: {0}")]
    Transform(#[source] Cause),

    /// 实现方未提供该能力。
    #[error("operation `{operation}` is not supported by this implementation")]
    Unsupported { operation: &'static str },
}

impl StreamError {
    /// 以任意错误构造汇失败。
    pub fn sink_failed(cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        StreamError::Sink(Arc::from(cause.into()))
    }

    /// 以任意错误构造源失败。
    pub fn source_failed(cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        StreamError::Source(Arc::from(cause.into()))
    }

    /// 以任意错误构造转换失败。
    pub fn transform_failed(cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        StreamError::Transform(Arc::from(cause.into()))
    }

    /// 返回稳定错误码，格式为 `<域>.<语义>`。
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::PushAfterEnd => codes::PUSH_AFTER_EOF,
            StreamError::UnshiftAfterEnd => codes::UNSHIFT_AFTER_END,
            StreamError::WriteAfterEnd => codes::WRITE_AFTER_END,
            StreamError::AlreadyFinished { .. } => codes::ALREADY_FINISHED,
            StreamError::Destroyed { .. } => codes::DESTROYED,
            StreamError::PrematureClose => codes::PREMATURE_CLOSE,
            StreamError::HighWaterMarkExceeded { .. } => codes::HIGH_WATER_MARK_EXCEEDED,
            StreamError::HighWaterMarkOutOfRange { .. } => codes::HIGH_WATER_MARK_OUT_OF_RANGE,
            StreamError::Sink(_) => codes::SINK,
            StreamError::Source(_) => codes::SOURCE,
            StreamError::Transform(_) => codes::TRANSFORM,
            StreamError::Unsupported { .. } => codes::UNSUPPORTED,
        }
    }

    /// 是否属于调用方违反协议的错误（与对端失败相区分）。
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            StreamError::PushAfterEnd
                | StreamError::UnshiftAfterEnd
                | StreamError::WriteAfterEnd
                | StreamError::AlreadyFinished { .. }
                | StreamError::HighWaterMarkExceeded { .. }
                | StreamError::HighWaterMarkOutOfRange { .. }
        )
    }
}

/// 稳定错误码表。
///
/// # 契约说明（What）
/// - 码值一经发布不得修改含义；新增语义需追加新常量；
/// - 命名遵循 `stream.<语义>`，与 [`StreamError::code`] 一一对应。
pub mod codes {
    /// 结束标记后推送。
    pub const PUSH_AFTER_EOF: &str = "stream.push_after_eof";
    /// `end` 事件后回退数据。
    pub const UNSHIFT_AFTER_END: &str = "stream.unshift_after_end";
    /// 结束后写入。
    pub const WRITE_AFTER_END: &str = "stream.write_after_end";
    /// 已完成后再次结束。
    pub const ALREADY_FINISHED: &str = "stream.already_finished";
    /// 已销毁。
    pub const DESTROYED: &str = "stream.destroyed";
    /// 提前关闭。
    pub const PREMATURE_CLOSE: &str = "stream.premature_close";
    /// 拒绝型溢出。
    pub const HIGH_WATER_MARK_EXCEEDED: &str = "stream.high_water_mark_exceeded";
    /// 高水位越界。
    pub const HIGH_WATER_MARK_OUT_OF_RANGE: &str = "stream.high_water_mark_out_of_range";
    /// 汇失败。
    pub const SINK: &str = "stream.sink";
    /// 源失败。
    pub const SOURCE: &str = "stream.source";
    /// 转换失败。
    pub const TRANSFORM: &str = "stream.transform";
    /// 能力缺失。
    pub const UNSUPPORTED: &str = "stream.unsupported";
}
