use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::Poll;

use bytes::Bytes;
use spark_stream::{
    Deferred, Object, PipeOptions, Readable, ReadableOptions, StreamError, Transform,
    TransformContext, TransformOptions, Transformer, WritableOptions, codes, finished, pipe,
};

use super::support::{bytes, collect, counter, error_codes, queue, texts};

/// 在每个输入后追加 `!`。
struct Exclaim;

impl Transformer<Bytes, Bytes> for Exclaim {
    fn transform(&mut self, chunk: Bytes, cx: &mut TransformContext<Bytes>) -> Poll<Result<(), StreamError>> {
        let mut out = chunk.to_vec();
        out.push(b'!');
        cx.push(Bytes::from(out));
        Poll::Ready(Ok(()))
    }
}

/// 统计输入字节数，结束时产出总数。
#[derive(Default)]
struct ByteCounter {
    total: usize,
}

impl Transformer<Bytes, Object<usize>> for ByteCounter {
    fn transform(
        &mut self,
        chunk: Bytes,
        _cx: &mut TransformContext<Object<usize>>,
    ) -> Poll<Result<(), StreamError>> {
        self.total += chunk.len();
        Poll::Ready(Ok(()))
    }

    fn flush(&mut self, cx: &mut TransformContext<Object<usize>>) -> Poll<Result<(), StreamError>> {
        cx.push(Object(self.total));
        Poll::Ready(Ok(()))
    }
}

/// 把每次转换挂起，交由测试稍后完成。
struct Parked {
    slots: Rc<RefCell<VecDeque<(Bytes, Deferred<Bytes>)>>>,
}

impl Transformer<Bytes, Bytes> for Parked {
    fn transform(&mut self, chunk: Bytes, cx: &mut TransformContext<Bytes>) -> Poll<Result<(), StreamError>> {
        let deferred = cx.defer().expect("首次申请必然成功");
        self.slots.borrow_mut().push_back((chunk, deferred));
        Poll::Pending
    }
}

/// 先暂存一个输出再挂起，挂起句柄交给测试。
struct StageThenPark {
    slot: Rc<RefCell<Option<Deferred<Bytes>>>>,
}

impl Transformer<Bytes, Bytes> for StageThenPark {
    fn transform(&mut self, _chunk: Bytes, cx: &mut TransformContext<Bytes>) -> Poll<Result<(), StreamError>> {
        cx.push(bytes("before defer"));
        *self.slot.borrow_mut() = cx.defer();
        cx.push(bytes("after defer"));
        Poll::Pending
    }
}

/// 以非转换类错误拒绝每个输入。
struct Abrupt;

impl Transformer<Bytes, Bytes> for Abrupt {
    fn transform(&mut self, _chunk: Bytes, _cx: &mut TransformContext<Bytes>) -> Poll<Result<(), StreamError>> {
        Poll::Ready(Err(StreamError::PrematureClose))
    }
}

/// 遇到 `bad` 时失败。
struct Picky;

impl Transformer<Bytes, Bytes> for Picky {
    fn transform(&mut self, chunk: Bytes, cx: &mut TransformContext<Bytes>) -> Poll<Result<(), StreamError>> {
        if &chunk[..] == b"bad" {
            cx.push(bytes("never seen"));
            return Poll::Ready(Err(StreamError::transform_failed("refusing `bad`")));
        }
        cx.push(chunk);
        Poll::Ready(Ok(()))
    }
}

#[test]
fn each_input_is_transformed_and_end_settles_after_outputs_are_pushed() {
    let queue = queue();
    let transform = Transform::new(Exclaim, TransformOptions::default(), queue.handle());
    let seen = collect(transform.readable());
    let (ends, on_end) = counter();
    transform.on_end(on_end);

    transform.write(bytes("a"));
    transform.write(bytes("b"));
    let output_ended_at_settle = Rc::new(Cell::new(false));
    {
        let flag = output_ended_at_settle.clone();
        let readable = transform.readable().clone();
        transform.end().on_settled(move |outcome| {
            assert!(outcome.is_ok());
            flag.set(readable.is_ended());
        });
    }
    queue.run_until_idle();

    assert_eq!(texts(&seen.borrow()), ["a!", "b!"]);
    assert_eq!(ends.get(), 1);
    assert!(
        output_ended_at_settle.get(),
        "end() 结算时两个输出及结束标记都已推送"
    );
    assert!(transform.is_destroyed(), "两侧都完成后自动销毁");
}

#[test]
fn flush_can_emit_trailing_output_of_a_different_type() {
    let queue = queue();
    let transform = Transform::new(
        ByteCounter::default(),
        TransformOptions::default(),
        queue.handle(),
    );

    transform.write(bytes("abc"));
    transform.write(bytes("de"));
    transform.end();
    queue.run_until_idle();

    assert_eq!(transform.read(None), Some(Object(5)));
    queue.run_until_idle();
    assert!(transform.readable().is_end_emitted());
}

#[test]
fn deferred_transform_holds_later_writes_until_completed() {
    let queue = queue();
    let slots = Rc::new(RefCell::new(VecDeque::new()));
    let transform = Transform::new(
        Parked {
            slots: slots.clone(),
        },
        TransformOptions::default(),
        queue.handle(),
    );
    let seen = collect(transform.readable());

    let first = transform.write(bytes("x")).into_completion();
    let second = transform.write(bytes("y")).into_completion();
    queue.run_until_idle();
    assert_eq!(slots.borrow().len(), 1, "前一次转换完成前不派发下一次");
    assert!(!first.is_settled());

    let (chunk, deferred) = slots.borrow_mut().pop_front().expect("x 已挂起");
    deferred.push(Bytes::from(chunk.to_ascii_uppercase()));
    deferred.complete(Ok(()));
    queue.run_until_idle();
    assert!(matches!(first.outcome(), Some(Ok(()))));
    assert_eq!(slots.borrow().len(), 1, "y 随后被派发");

    let (chunk, deferred) = slots.borrow_mut().pop_front().expect("y 已挂起");
    deferred.push(Bytes::from(chunk.to_ascii_uppercase()));
    deferred.complete(Ok(()));
    queue.run_until_idle();

    assert!(matches!(second.outcome(), Some(Ok(()))));
    assert_eq!(texts(&seen.borrow()), ["X", "Y"]);
}

#[test]
fn transform_failure_discards_staged_output_and_destroys_both_sides() {
    let queue = queue();
    let transform = Transform::new(Picky, TransformOptions::default(), queue.handle());
    let seen = collect(transform.readable());
    let (codes_seen, on_error) = error_codes();
    transform.on_error(on_error);

    let good = transform.write(bytes("good")).into_completion();
    let bad = transform.write(bytes("bad")).into_completion();
    queue.run_until_idle();

    assert!(matches!(good.outcome(), Some(Ok(()))));
    let error = bad.outcome().and_then(Result::err).expect("失败的转换应结算为错误");
    assert_eq!(error.code(), codes::TRANSFORM);
    assert_eq!(*codes_seen.borrow(), [codes::TRANSFORM]);
    assert!(seen.borrow().iter().all(|chunk| &chunk[..] != b"never seen"));
    assert!(transform.is_destroyed());
    assert!(transform.writable().is_destroyed());
}

#[test]
fn output_backpressure_holds_input_acknowledgements() {
    let queue = queue();
    let options = TransformOptions {
        writable: WritableOptions::default().with_high_water_mark(1),
        readable: ReadableOptions::default().with_high_water_mark(2),
    };
    let transform = Transform::<Object<u32>, Object<u32>>::pass_through(options, queue.handle());

    let acks: Vec<_> = (1..=3)
        .map(|value| transform.write(Object(value)).into_completion())
        .collect();
    queue.run_until_idle();

    assert!(matches!(acks[0].outcome(), Some(Ok(()))));
    assert!(!acks[1].is_settled(), "输出侧达到水位后扣留写入确认");
    assert!(!acks[2].is_settled());
    assert_eq!(transform.readable().readable_length(), 2);

    let mut outputs = Vec::new();
    while let Some(chunk) = transform.read(None) {
        outputs.push(chunk.0);
        queue.run_until_idle();
        assert!(transform.readable().readable_length() <= 2);
    }

    assert_eq!(outputs, [1, 2, 3]);
    assert!(acks
        .iter()
        .all(|ack| matches!(ack.outcome(), Some(Ok(())))));
}

#[test]
fn pass_through_finishes_when_both_sides_complete() {
    let queue = queue();
    let transform = Transform::<Bytes, Bytes>::pass_through(TransformOptions::default(), queue.handle());
    let seen = collect(transform.readable());
    let done = finished(&transform);

    transform.write(bytes("same"));
    transform.end();
    let outcome = queue.block_on(done).expect("两侧都应完成");

    assert!(outcome.is_ok());
    assert_eq!(texts(&seen.borrow()), ["same"]);
}

fn parked_transform(queue: &spark_stream::TickQueue) -> (Transform<Bytes, Bytes>, Rc<RefCell<Option<Deferred<Bytes>>>>) {
    let slot = Rc::new(RefCell::new(None));
    let transform = Transform::new(
        StageThenPark { slot: slot.clone() },
        TransformOptions::default(),
        queue.handle(),
    );
    (transform, slot)
}

#[test]
fn deferred_output_is_committed_in_order_only_on_success() {
    let queue = queue();
    let (transform, slot) = parked_transform(&queue);
    let seen = collect(transform.readable());

    let ack = transform.write(bytes("x")).into_completion();
    queue.run_until_idle();
    assert!(seen.borrow().is_empty(), "挂起期间不提交任何输出");

    let deferred = slot.borrow_mut().take().expect("转换已挂起");
    deferred.push(bytes("from handle"));
    deferred.complete(Ok(()));
    queue.run_until_idle();

    assert!(matches!(ack.outcome(), Some(Ok(()))));
    assert_eq!(texts(&seen.borrow()), ["before defer", "after defer", "from handle"]);
}

#[test]
fn deferred_failure_emits_none_of_the_write_output() {
    let queue = queue();
    let (transform, slot) = parked_transform(&queue);
    let seen = collect(transform.readable());
    let (codes_seen, on_error) = error_codes();
    transform.on_error(on_error);

    let ack = transform.write(bytes("x")).into_completion();
    queue.run_until_idle();
    let deferred = slot.borrow_mut().take().expect("转换已挂起");
    deferred.push(bytes("partial"));
    deferred.complete(Err(StreamError::transform_failed("boom")));
    queue.run_until_idle();

    let error = ack.outcome().and_then(Result::err).expect("写入应以错误结算");
    assert_eq!(error.code(), codes::TRANSFORM);
    assert!(seen.borrow().is_empty(), "失败的写入不得产出任何数据: {:?}", texts(&seen.borrow()));
    assert_eq!(*codes_seen.borrow(), [codes::TRANSFORM]);
    assert!(transform.is_destroyed());
}

#[test]
fn dropped_deferred_handle_fails_the_write_and_discards_its_output() {
    let queue = queue();
    let (transform, slot) = parked_transform(&queue);
    let seen = collect(transform.readable());

    let ack = transform.write(bytes("x")).into_completion();
    queue.run_until_idle();
    drop(slot.borrow_mut().take());
    queue.run_until_idle();

    let error = ack.outcome().and_then(Result::err).expect("句柄丢弃即失败");
    assert_eq!(error.code(), codes::TRANSFORM);
    assert!(seen.borrow().is_empty());
}

#[test]
fn foreign_errors_from_a_transformer_are_reported_as_transform_errors() {
    let queue = queue();
    let transform = Transform::new(Abrupt, TransformOptions::default(), queue.handle());
    let (codes_seen, on_error) = error_codes();
    transform.on_error(on_error);

    let ack = transform.write(bytes("x")).into_completion();
    queue.run_until_idle();

    let error = ack.outcome().and_then(Result::err).expect("转换失败");
    assert_eq!(error.code(), codes::TRANSFORM);
    let cause = std::error::Error::source(&error)
        .and_then(|cause| cause.downcast_ref::<StreamError>())
        .expect("原错误作为原因保留");
    assert_eq!(cause.code(), codes::PREMATURE_CLOSE);
    assert_eq!(*codes_seen.borrow(), [codes::TRANSFORM]);
}

#[test]
fn utf8_decoder_joins_a_character_split_across_pushes() {
    let queue = queue();
    let source = Readable::<Bytes>::manual(ReadableOptions::default(), queue.handle());
    let decoder = Transform::utf8_decoder(TransformOptions::default(), queue.handle());
    let seen = collect(decoder.readable());
    pipe(&source, decoder.writable(), PipeOptions::default());

    source.push(Bytes::from_static(&[b'h', 0xE2, 0x82]));
    source.push(Bytes::from_static(&[0xAC, b'!']));
    source.end();
    queue.run_until_idle();

    let text: Vec<String> = seen.borrow().iter().map(|chunk| chunk.0.clone()).collect();
    assert_eq!(text, ["h", "€!"]);
    assert!(decoder.readable().is_end_emitted());
}

#[test]
fn utf8_decoder_flushes_a_dangling_sequence_as_replacement() {
    let queue = queue();
    let decoder = Transform::utf8_decoder(TransformOptions::default(), queue.handle());
    let seen = collect(decoder.readable());

    decoder.write(Bytes::from_static(b"ok"));
    decoder.write(Bytes::from_static(&[0xF0, 0x9F]));
    decoder.end();
    queue.run_until_idle();

    let text: Vec<String> = seen.borrow().iter().map(|chunk| chunk.0.clone()).collect();
    assert_eq!(text, ["ok", "\u{FFFD}"]);
}
