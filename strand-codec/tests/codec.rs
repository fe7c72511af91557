//! Scenario tests for frame decoding over pipelines: chunked input, both
//! cumulation strategies, removal semantics and error propagation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strand::{
    EventMask, Handler, HandlerContext, MemoryTransport, Message, Pipeline, PipelineError,
};
use strand_buf::ByteBuf;
use strand_codec::{
    ByteToMessageHandler, CodecError, Cumulate, LengthFieldFrameDecoder, StringCodec,
};
use strand_executor::EventLoopGroup;

/// Collects decoded `String` messages at the application end.
struct Collector {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Handler for Collector {
    fn events(&self) -> EventMask {
        EventMask::READ
    }

    fn handle_read(&mut self, _ctx: &HandlerContext, msg: Message) {
        if let Ok(text) = msg.downcast::<String>() {
            self.seen.lock().push(*text);
        }
    }
}

/// Collects raw byte frames.
struct ByteCollector {
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Handler for ByteCollector {
    fn events(&self) -> EventMask {
        EventMask::READ
    }

    fn handle_read(&mut self, _ctx: &HandlerContext, msg: Message) {
        match msg.downcast::<Vec<u8>>() {
            Ok(bytes) => self.seen.lock().push(*bytes),
            Err(other) => {
                if let Ok(buf) = other.downcast::<ByteBuf>() {
                    let mut buf = *buf;
                    use strand_buf::ReadableBuf;
                    use strand_common::RefCounted;
                    let readable = buf.readable_bytes();
                    if let Ok(bytes) = buf.read_bytes(readable) {
                        self.seen.lock().push(bytes);
                    }
                    buf.release_quiet();
                }
            }
        }
    }
}

/// Collects pipeline errors.
struct ErrorCollector {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Handler for ErrorCollector {
    fn events(&self) -> EventMask {
        EventMask::ERROR
    }

    fn handle_error(&mut self, _ctx: &HandlerContext, error: PipelineError) {
        self.seen.lock().push(error.to_string());
    }
}

fn fixture() -> (EventLoopGroup, Pipeline) {
    let _ = env_logger::builder().is_test(true).try_init();
    let group = EventLoopGroup::new(1);
    let pipeline = Pipeline::builder(group.register())
        .transport(MemoryTransport::new())
        .build();
    (group, pipeline)
}

fn teardown(group: EventLoopGroup) {
    group
        .shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(10))
        .await_termination(Duration::from_secs(10));
}

fn feed(pipeline: &Pipeline, bytes: &[u8]) {
    let mut buf = pipeline
        .allocator()
        .buffer_with(bytes.len().max(1))
        .unwrap();
    buf.write_bytes(bytes).unwrap();
    pipeline.fire_read(Box::new(buf));
}

fn run_chunked_decode(strategy: Cumulate) -> Vec<String> {
    let (group, pipeline) = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));

    pipeline
        .add_last(
            "frame-decoder",
            ByteToMessageHandler::with_strategy(
                Box::new(LengthFieldFrameDecoder::new(2, 1024)),
                strategy,
            ),
        )
        .unwrap();
    pipeline.add_last("string-codec", StringCodec::new()).unwrap();
    pipeline
        .add_last("collector", Collector { seen: seen.clone() })
        .unwrap();

    // One frame split across two separate inbound chunks.
    feed(&pipeline, &[0x00, 0x02]);
    feed(&pipeline, b"hi");

    teardown(group);
    let frames = seen.lock().clone();
    frames
}

#[test]
fn length_prefixed_frame_across_two_chunks_merge() {
    assert_eq!(run_chunked_decode(Cumulate::Merge), vec!["hi"]);
}

#[test]
fn length_prefixed_frame_across_two_chunks_compose() {
    assert_eq!(run_chunked_decode(Cumulate::Compose), vec!["hi"]);
}

#[test]
fn accumulation_is_empty_after_a_complete_frame() {
    let handler = ByteToMessageHandler::new(Box::new(LengthFieldFrameDecoder::new(2, 1024)));

    let (group, pipeline) = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    assert_eq!(handler.buffered_bytes(), 0);
    pipeline.add_last("frame-decoder", handler).unwrap();
    pipeline
        .add_last("collector", ByteCollector { seen: seen.clone() })
        .unwrap();

    feed(&pipeline, &[0x00, 0x02]);
    feed(&pipeline, b"hi");
    // A third, byte-identical exchange confirms nothing lingered from the
    // first frame.
    feed(&pipeline, &[0x00, 0x02, b'h', b'i']);

    teardown(group);
    assert_eq!(seen.lock().clone(), vec![b"hi".to_vec(), b"hi".to_vec()]);
}

#[test]
fn multiple_frames_in_one_chunk() {
    let (group, pipeline) = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    pipeline
        .add_last(
            "frame-decoder",
            ByteToMessageHandler::new(Box::new(LengthFieldFrameDecoder::new(2, 1024))),
        )
        .unwrap();
    pipeline
        .add_last("collector", ByteCollector { seen: seen.clone() })
        .unwrap();

    feed(&pipeline, &[0x00, 0x01, b'a', 0x00, 0x02, b'b', b'c']);
    teardown(group);
    assert_eq!(seen.lock().clone(), vec![b"a".to_vec(), b"bc".to_vec()]);
}

#[test]
fn removal_forwards_the_unread_remainder() {
    let (group, pipeline) = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    pipeline
        .add_last(
            "frame-decoder",
            ByteToMessageHandler::new(Box::new(LengthFieldFrameDecoder::new(2, 1024))),
        )
        .unwrap();
    pipeline
        .add_last("collector", ByteCollector { seen: seen.clone() })
        .unwrap();

    // A partial frame stays buffered in the decoder...
    feed(&pipeline, &[0x00, 0x05, b'p', b'a']);
    // ...and removal must hand it on instead of dropping it.
    pipeline.remove("frame-decoder").unwrap();

    teardown(group);
    assert_eq!(seen.lock().clone(), vec![vec![0x00, 0x05, b'p', b'a']]);
}

#[test]
fn decode_error_propagates_and_pipeline_continues() {
    let (group, pipeline) = fixture();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    pipeline
        .add_last(
            "frame-decoder",
            ByteToMessageHandler::new(Box::new(LengthFieldFrameDecoder::new(2, 4))),
        )
        .unwrap();
    pipeline
        .add_last(
            "errors",
            ErrorCollector {
                seen: errors.clone(),
            },
        )
        .unwrap();
    pipeline
        .add_last(
            "collector",
            ByteCollector {
                seen: frames.clone(),
            },
        )
        .unwrap();

    // Announces five bytes where four are allowed.
    feed(&pipeline, &[0x00, 0x05]);
    // The poisoned input is gone; a well-formed frame still decodes.
    feed(&pipeline, &[0x00, 0x02, b'o', b'k']);

    teardown(group);
    assert_eq!(frames.lock().clone(), vec![b"ok".to_vec()]);
    let errors = errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("exceeds the limit"), "got: {}", errors[0]);
}

#[test]
fn codec_error_stays_downcastable() {
    let error = PipelineError::from(CodecError::FrameTooLong {
        length: 9,
        limit: 4,
    });
    assert_eq!(
        error.downcast_other::<CodecError>(),
        Some(&CodecError::FrameTooLong {
            length: 9,
            limit: 4
        })
    );
}
