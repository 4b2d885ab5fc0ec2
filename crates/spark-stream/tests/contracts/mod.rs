//! spark-stream 契约测试集合。
//!
//! # 模块定位（Why）
//! - 按引擎拆分主题：可读、可写、转换、管道、重入与异步迭代各自一个文件；
//! - 每个用例只经公开接口驱动引擎，并以 [`spark_stream::TickQueue`] 逐拍推进，结果完全确定。
//!
//! # 约定（What）
//! - 夹具集中在 `support`，新增场景优先复用其中的汇、源与收集器；
//! - 断言错误时比较 [`spark_stream::codes`] 中的稳定错误码，而不是错误文本。

mod readable;
mod reentrancy;
mod support;
mod transform;
mod writable;
