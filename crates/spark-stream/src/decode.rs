//! # decode 模块说明
//!
//! ## 角色定位（Why）
//! - 字节流常常承载文本，但多字节字符可能被切在两个数据单元之间；逐块 `from_utf8` 会把
//!   合法字符误判为错误；
//! - [`Utf8Decoder`] 作为转换函数接在字节可读端之后，输出完整的文本片段（对象模式的 `String`）。
//!
//! ## 契约（What）
//! - 每个输入只输出已完整解码的文本，跨块的不完整字符留在解码器内等待后续字节；
//! - 非法字节序列替换为 `U+FFFD`；
//! - 输入结束时 `flush` 输出残留字节（不完整的尾部同样替换为 `U+FFFD`）；
//! - 空文本不产出任何数据单元。

use std::task::Poll;

use bytes::Bytes;
use encoding_rs::{CoderResult, Decoder, UTF_8};
use tracing::trace;

use crate::chunk::Object;
use crate::config::TransformOptions;
use crate::error::StreamError;
use crate::tick::SharedScheduler;
use crate::transform::{Transform, TransformContext, Transformer};

/// 增量 UTF-8 解码转换。
///
/// # 使用指引（How）
/// ```
/// use bytes::Bytes;
/// use spark_stream::{Object, TickQueue, Transform, TransformOptions};
///
/// let queue = TickQueue::new();
/// let decoder = Transform::utf8_decoder(TransformOptions::default(), queue.handle());
/// decoder.write(Bytes::from_static(&[0xE2, 0x82]));
/// decoder.write(Bytes::from_static(&[0xAC]));
/// decoder.end();
/// queue.run_until_idle();
/// assert_eq!(decoder.read(None), Some(Object("€".to_owned())));
/// ```
pub struct Utf8Decoder {
    decoder: Decoder,
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        Self {
            decoder: UTF_8.new_decoder_without_bom_handling(),
        }
    }
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解码一段输入；`last` 为真时冲刷解码器内残留的字节。
    fn decode(&mut self, input: &[u8], last: bool) -> String {
        let mut text = String::new();
        let mut remaining = input;
        loop {
            let needed = self
                .decoder
                .max_utf8_buffer_length(remaining.len())
                .unwrap_or_else(|| remaining.len().saturating_mul(3).saturating_add(4));
            text.reserve(needed);
            let (result, read, replaced) = self.decoder.decode_to_string(remaining, &mut text, last);
            if replaced {
                trace!(read, "malformed utf-8 replaced with U+FFFD");
            }
            remaining = &remaining[read..];
            match result {
                CoderResult::InputEmpty => return text,
                CoderResult::OutputFull => continue,
            }
        }
    }
}

impl Transformer<Bytes, Object<String>> for Utf8Decoder {
    fn transform(
        &mut self,
        chunk: Bytes,
        cx: &mut TransformContext<Object<String>>,
    ) -> Poll<Result<(), StreamError>> {
        let text = self.decode(&chunk, false);
        if !text.is_empty() {
            cx.push(Object(text));
        }
        Poll::Ready(Ok(()))
    }

    fn flush(&mut self, cx: &mut TransformContext<Object<String>>) -> Poll<Result<(), StreamError>> {
        let text = self.decode(&[], true);
        if !text.is_empty() {
            cx.push(Object(text));
        }
        Poll::Ready(Ok(()))
    }
}

impl Transform<Bytes, Object<String>> {
    /// 写入字节、读出 UTF-8 文本片段的转换端。
    pub fn utf8_decoder(options: TransformOptions, scheduler: SharedScheduler) -> Self {
        Self::new(Utf8Decoder::new(), options, scheduler)
    }
}
