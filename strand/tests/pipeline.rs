//! Scenario tests for pipeline ordering, dispatch skipping, lifecycle
//! errors and sentinel defaults.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strand::{
    EventMask, Handler, HandlerContext, MemoryTransport, Message, Pipeline, PipelineError,
};
use strand_buf::ByteBuf;
use strand_common::{AttributeKey, Completion, RefCounted};
use strand_executor::EventLoopGroup;

type Trace = Arc<Mutex<Vec<String>>>;

/// Records its invocations and forwards everything.
struct Tracer {
    label: &'static str,
    trace: Trace,
}

impl Tracer {
    fn new(label: &'static str, trace: &Trace) -> Self {
        Self {
            label,
            trace: trace.clone(),
        }
    }

    fn record(&self, event: &str) {
        self.trace.lock().push(format!("{}:{}", self.label, event));
    }
}

impl Handler for Tracer {
    fn handle_read(&mut self, ctx: &HandlerContext, msg: Message) {
        self.record("read");
        ctx.fire_read(msg);
    }

    fn handle_write(&mut self, ctx: &HandlerContext, msg: Message, completion: Completion) {
        self.record("write");
        ctx.write_next(msg, completion);
    }

    fn channel_active(&mut self, ctx: &HandlerContext) {
        self.record("active");
        ctx.fire_channel_active();
    }

    fn handler_removed(&mut self, _ctx: &HandlerContext) {
        self.record("removed");
    }
}

/// Declares (and implements) only outbound write.
struct WriteOnly {
    trace: Trace,
}

impl Handler for WriteOnly {
    fn events(&self) -> EventMask {
        EventMask::WRITE
    }

    fn handle_write(&mut self, ctx: &HandlerContext, msg: Message, completion: Completion) {
        self.trace.lock().push(String::from("write-only:write"));
        ctx.write_next(msg, completion);
    }
}

fn fixture() -> (EventLoopGroup, Pipeline, MemoryTransport) {
    let _ = env_logger::builder().is_test(true).try_init();
    let group = EventLoopGroup::new(1);
    let transport = MemoryTransport::new();
    let pipeline = Pipeline::builder(group.register())
        .transport(transport.clone())
        .build();
    (group, pipeline, transport)
}

fn teardown(group: EventLoopGroup) {
    group
        .shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(10))
        .await_termination(Duration::from_secs(10));
}

fn buf_of(pipeline: &Pipeline, bytes: &[u8]) -> ByteBuf {
    let mut buf = pipeline
        .allocator()
        .buffer_with(bytes.len().max(1))
        .unwrap();
    buf.write_bytes(bytes).unwrap();
    buf
}

#[test]
fn inbound_head_to_tail_outbound_tail_to_head() {
    let (group, pipeline, _transport) = fixture();
    let trace: Trace = Arc::default();

    pipeline.add_last("a", Tracer::new("a", &trace)).unwrap();
    pipeline.add_last("b", Tracer::new("b", &trace)).unwrap();
    pipeline.add_last("c", Tracer::new("c", &trace)).unwrap();

    let msg = buf_of(&pipeline, b"in");
    pipeline.fire_read(Box::new(msg));

    let out = buf_of(&pipeline, b"out");
    pipeline.write(Box::new(out)).wait();

    teardown(group);
    assert_eq!(
        trace.lock().clone(),
        vec!["a:read", "b:read", "c:read", "c:write", "b:write", "a:write"]
    );
}

#[test]
fn dispatch_skips_handlers_without_the_event_bit() {
    let (group, pipeline, _transport) = fixture();
    let trace: Trace = Arc::default();

    pipeline.add_last("a", Tracer::new("a", &trace)).unwrap();
    pipeline
        .add_last(
            "write-only",
            WriteOnly {
                trace: trace.clone(),
            },
        )
        .unwrap();
    pipeline.add_last("c", Tracer::new("c", &trace)).unwrap();

    let msg = buf_of(&pipeline, b"x");
    pipeline.fire_read(Box::new(msg));
    teardown(group);

    // The write-only handler never sees the read; a and c both do.
    assert_eq!(trace.lock().clone(), vec!["a:read", "c:read"]);
}

#[test]
fn lifecycle_errors_are_synchronous() {
    let (group, pipeline, _transport) = fixture();
    let trace: Trace = Arc::default();

    pipeline.add_last("a", Tracer::new("a", &trace)).unwrap();
    assert!(matches!(
        pipeline.add_last("a", Tracer::new("dup", &trace)),
        Err(PipelineError::DuplicateName(name)) if name == "a"
    ));
    assert!(matches!(
        pipeline.remove("ghost"),
        Err(PipelineError::NotFound(name)) if name == "ghost"
    ));
    assert!(matches!(
        pipeline.add_before("ghost", "b", Tracer::new("b", &trace)),
        Err(PipelineError::NotFound(_))
    ));
    teardown(group);
}

#[test]
fn add_positions_are_respected() {
    let (group, pipeline, _transport) = fixture();
    let trace: Trace = Arc::default();

    pipeline.add_last("b", Tracer::new("b", &trace)).unwrap();
    pipeline.add_first("a", Tracer::new("a", &trace)).unwrap();
    pipeline.add_after("b", "d", Tracer::new("d", &trace)).unwrap();
    pipeline.add_before("d", "c", Tracer::new("c", &trace)).unwrap();

    assert_eq!(pipeline.names(), vec!["a", "b", "c", "d"]);
    teardown(group);
}

#[test]
fn removed_handler_fires_removed_callback_and_stops_seeing_events() {
    let (group, pipeline, _transport) = fixture();
    let trace: Trace = Arc::default();

    pipeline.add_last("a", Tracer::new("a", &trace)).unwrap();
    pipeline.add_last("b", Tracer::new("b", &trace)).unwrap();
    pipeline.remove("a").unwrap();

    let msg = buf_of(&pipeline, b"x");
    pipeline.fire_read(Box::new(msg));
    teardown(group);

    assert_eq!(trace.lock().clone(), vec!["a:removed", "b:read"]);
    assert!(!pipeline.contains("a"));
}

#[test]
fn unhandled_read_reaches_tail_and_requests_more_data() {
    let (group, pipeline, transport) = fixture();

    let msg = buf_of(&pipeline, b"nobody wants me");
    let observer = msg.retained_duplicate().unwrap();
    pipeline.fire_read(Box::new(msg));
    teardown(group);

    // The tail released the unhandled buffer and asked for more data.
    assert_eq!(observer.ref_count(), 1);
    assert!(transport.read_requests() >= 1);
    observer.release().unwrap();
}

#[test]
fn unhandled_error_closes_the_endpoint() {
    let (group, pipeline, transport) = fixture();
    let trace: Trace = Arc::default();
    pipeline.add_last("a", Tracer::new("a", &trace)).unwrap();

    pipeline.fire_error(PipelineError::UnexpectedMessage(String::from("a")));
    teardown(group);

    assert!(transport.is_closed());
    assert!(pipeline.is_closed());
}

#[test]
fn writes_reach_the_transport_and_resolve_completions() {
    let (group, pipeline, transport) = fixture();

    let buf = buf_of(&pipeline, b"hello");
    let completion = pipeline.write_and_flush(Box::new(buf));
    assert!(completion.wait().is_success());

    teardown(group);
    assert_eq!(transport.written(), b"hello");
    assert!(transport.flushes() >= 1);
}

#[test]
fn write_after_close_fails_the_completion() {
    let (group, pipeline, transport) = fixture();
    pipeline.close();
    // Ensure the close ran on the loop before writing.
    pipeline.executor().submit(|| {}).unwrap().wait();
    assert!(transport.is_closed());

    let buf = buf_of(&pipeline, b"late");
    let completion = pipeline.write(Box::new(buf));
    assert!(!completion.wait().is_success());
    teardown(group);
}

#[test]
fn attributes_live_on_the_endpoint() {
    let (group, pipeline, _transport) = fixture();
    let key = AttributeKey::<u64>::value_of("pipeline.test.counter");
    pipeline.attribute(&key).set(9);
    assert_eq!(pipeline.attribute(&key).get(), Some(9));
    teardown(group);
}

/// A handler that echoes reads back out through its own position.
struct Echo;

impl Handler for Echo {
    fn events(&self) -> EventMask {
        EventMask::READ
    }

    fn handle_read(&mut self, ctx: &HandlerContext, msg: Message) {
        ctx.write(msg);
        ctx.flush_next();
    }
}

#[test]
fn handler_can_write_from_within_a_read() {
    let (group, pipeline, transport) = fixture();
    pipeline.add_last("echo", Echo).unwrap();

    let buf = buf_of(&pipeline, b"ping");
    pipeline.fire_read(Box::new(buf));
    teardown(group);

    assert_eq!(transport.written(), b"ping");
}

#[test]
fn events_fired_off_loop_are_marshalled_in_order() {
    let (group, pipeline, _transport) = fixture();
    let trace: Trace = Arc::default();
    pipeline.add_last("a", Tracer::new("a", &trace)).unwrap();

    for _ in 0..50 {
        let msg = buf_of(&pipeline, b"m");
        pipeline.fire_read(Box::new(msg));
    }
    teardown(group);

    let observed = trace.lock().clone();
    assert_eq!(observed.len(), 50);
    assert!(observed.iter().all(|entry| entry == "a:read"));
}
