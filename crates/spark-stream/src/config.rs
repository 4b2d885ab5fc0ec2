//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 引擎的水位、溢出策略、自动销毁与管道行为都属于部署期可调参数，需要能从 TOML 文件加载，
//!   也能在代码里以构建器方式覆写；
//! - 解析与校验集中在此处，引擎构造函数只消费已经校验过的值。
//!
//! ## 契约（What）
//! - 所有结构体均 `#[serde(default)]`：缺省字段取 [`Default`]；未知字段直接报错，避免拼写错误被静默忽略；
//! - 高水位缺省为 `None`，表示按数据单元模式取默认值（字节 64 KiB / 对象 16）；
//! - 高水位上限为 1 GiB，超出时 [`StreamConfig::validate`] 返回 [`ConfigError::HighWaterMarkOutOfRange`]。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::{ChunkMode, MAX_HIGH_WATER_MARK};

/// 缓冲达到高水位后继续推送时的处理策略。
///
/// # 教案式说明
/// - **意图 (Why)**：高水位本质是建议值，守规矩的生产者看到 `push` 返回 `false` 会主动停手；
///   但对接不受控的生产者时，需要一个硬上限防止内存失控。
/// - **契约 (What)**：
///   - `Advisory`（默认）：超过水位的推送照常入队，仅通过返回值提示背压；
///   - `Reject`：缓冲已达到或超过水位时拒绝推送，并经错误通道上报 `HighWaterMarkExceeded`。
/// - **设计权衡 (Trade-offs)**：`Reject` 会销毁引擎（在自动销毁开启时），适合“宁可断流也不超限”的场景。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Advisory,
    Reject,
}

/// 可读引擎配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadableOptions {
    /// 高水位；`None` 表示按模式取默认值。
    pub high_water_mark: Option<usize>,
    /// 溢出策略。
    pub overflow: OverflowPolicy,
    /// `end` 事件后是否自动销毁。
    pub auto_destroy: bool,
    /// 销毁后是否派发 `close` 事件。
    pub emit_close: bool,
    /// 日志中使用的流名称。
    pub label: Option<String>,
}

impl Default for ReadableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            overflow: OverflowPolicy::Advisory,
            auto_destroy: true,
            emit_close: true,
            label: None,
        }
    }
}

impl ReadableOptions {
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = Some(high_water_mark);
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.auto_destroy = auto_destroy;
        self
    }

    pub fn with_emit_close(mut self, emit_close: bool) -> Self {
        self.emit_close = emit_close;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// 按数据单元模式解析最终高水位，并夹紧到上限。
    pub fn resolve_high_water_mark(&self, mode: ChunkMode) -> usize {
        resolve(self.high_water_mark, mode)
    }
}

/// 可写引擎配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WritableOptions {
    pub high_water_mark: Option<usize>,
    /// `finish` 事件后是否自动销毁。
    pub auto_destroy: bool,
    pub emit_close: bool,
    pub label: Option<String>,
}

impl Default for WritableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            auto_destroy: true,
            emit_close: true,
            label: None,
        }
    }
}

impl WritableOptions {
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = Some(high_water_mark);
        self
    }

    pub fn with_auto_destroy(mut self, auto_destroy: bool) -> Self {
        self.auto_destroy = auto_destroy;
        self
    }

    pub fn with_emit_close(mut self, emit_close: bool) -> Self {
        self.emit_close = emit_close;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn resolve_high_water_mark(&self, mode: ChunkMode) -> usize {
        resolve(self.high_water_mark, mode)
    }
}

/// 管道配置。
///
/// - `end`：源结束时是否对目标调用 `end()`；
/// - `propagate_errors`：任一端出错时是否以同一错误销毁另一端。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipeOptions {
    pub end: bool,
    pub propagate_errors: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            end: true,
            propagate_errors: true,
        }
    }
}

impl PipeOptions {
    pub fn with_end(mut self, end: bool) -> Self {
        self.end = end;
        self
    }

    pub fn with_propagate_errors(mut self, propagate_errors: bool) -> Self {
        self.propagate_errors = propagate_errors;
        self
    }
}

/// 转换引擎配置：输入侧（可写）与输出侧（可读）分别配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformOptions {
    pub writable: WritableOptions,
    pub readable: ReadableOptions,
}

/// 顶层配置文档。
///
/// # 使用指引（How）
/// ```
/// use spark_stream::StreamConfig;
///
/// let config = StreamConfig::from_toml_str(
///     r#"
///     [readable]
///     high_water_mark = 4
///     overflow = "reject"
///
///     [pipe]
///     end = false
///     "#,
/// )
/// .expect("配置应可解析");
/// assert_eq!(config.readable.high_water_mark, Some(4));
/// assert!(!config.pipe.end);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub readable: ReadableOptions,
    pub writable: WritableOptions,
    pub transform: TransformOptions,
    pub pipe: PipeOptions,
}

impl StreamConfig {
    /// 解析 TOML 文本并执行校验。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验所有高水位均不超过 1 GiB。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let marks = [
            ("readable.high_water_mark", self.readable.high_water_mark),
            ("writable.high_water_mark", self.writable.high_water_mark),
            (
                "transform.readable.high_water_mark",
                self.transform.readable.high_water_mark,
            ),
            (
                "transform.writable.high_water_mark",
                self.transform.writable.high_water_mark,
            ),
        ];
        for (field, value) in marks {
            if let Some(value) = value.filter(|value| *value > MAX_HIGH_WATER_MARK) {
                return Err(ConfigError::HighWaterMarkOutOfRange { field, value });
            }
        }
        Ok(())
    }
}

/// 配置加载错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 语法错误或字段类型不匹配。
    #[error("failed to parse stream config: {0}")]
    Parse(#[from] toml::de::Error),
    /// 高水位超出 1 GiB 上限。
    #[error("`{field}` = {value} exceeds the 1 GiB high water mark ceiling")]
    HighWaterMarkOutOfRange { field: &'static str, value: usize },
}

fn resolve(configured: Option<usize>, mode: ChunkMode) -> usize {
    configured
        .unwrap_or_else(|| mode.default_high_water_mark())
        .min(MAX_HIGH_WATER_MARK)
}
