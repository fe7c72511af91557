//! Internal pipeline machinery: contexts, linking, dispatch and the
//! head/tail sentinels.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use strand_buf::{Allocator, ByteBuf, CompositeBuf};
use strand_common::{AttributeMap, Completion, RefCounted};
use strand_executor::EventExecutor;

use crate::error::PipelineError;
use crate::handler::{EventMask, Handler, Message};
use crate::pipeline::Pipeline;
use crate::transport::Transport;

/// Name of the head sentinel; reserved.
pub(crate) const HEAD_NAME: &str = "strand::head";
/// Name of the tail sentinel; reserved.
pub(crate) const TAIL_NAME: &str = "strand::tail";

const ADDED: u8 = 1;
const REMOVED: u8 = 2;

/// An event travelling through the pipeline, owning its payload.
pub(crate) enum Event {
    HandlerAdded,
    HandlerRemoved,
    ChannelActive,
    ChannelInactive,
    Read(Message),
    ReadComplete,
    UserEvent(Message),
    Error(PipelineError),
    Write(Message, Completion),
    Flush,
    Close,
}

impl Event {
    /// The capability bit a handler needs for this event to reach it.
    pub(crate) fn mask_bit(&self) -> EventMask {
        match self {
            Event::ChannelActive => EventMask::CHANNEL_ACTIVE,
            Event::ChannelInactive => EventMask::CHANNEL_INACTIVE,
            Event::Read(_) => EventMask::READ,
            Event::ReadComplete => EventMask::READ_COMPLETE,
            Event::UserEvent(_) => EventMask::USER_EVENT,
            Event::Error(_) => EventMask::ERROR,
            Event::Write(..) => EventMask::WRITE,
            Event::Flush => EventMask::FLUSH,
            Event::Close => EventMask::CLOSE,
            Event::HandlerAdded | Event::HandlerRemoved => EventMask::NONE,
        }
    }
}

/// Releases whatever refcounted payload a discarded message carries.
pub(crate) fn release_message(msg: Message) {
    if let Some(buf) = msg.downcast_ref::<ByteBuf>() {
        buf.release_quiet();
    } else if let Some(composite) = msg.downcast_ref::<CompositeBuf>() {
        composite.release_quiet();
    }
}

pub(crate) fn release_event(event: Event) {
    match event {
        Event::Read(msg) | Event::UserEvent(msg) => release_message(msg),
        Event::Write(msg, completion) => {
            completion.fail("pipeline event discarded");
            release_message(msg);
        }
        _ => {}
    }
}

/// One node of the handler chain.
///
/// Contexts are doubly linked: `next` pointers are strong and form the
/// head-to-tail chain; `prev` pointers are weak so the chain never cycles.
/// A removed context keeps its own links, so an event that was mid-flight
/// when the removal happened continues past it.
///
/// # Safety
///
/// The handler itself lives in an `UnsafeCell`. This is sound because
/// every invocation happens on the endpoint's bound executor (asserted in
/// debug builds) and the `entered` flag defers re-entrant invocations of
/// the same handler as a task on that executor, so no two mutable borrows
/// of one handler can exist.
pub struct HandlerContext {
    name: String,
    mask: EventMask,
    handler: UnsafeCell<Box<dyn Handler>>,
    entered: AtomicBool,
    state: AtomicU8,
    prev: Mutex<Option<Weak<HandlerContext>>>,
    next: Mutex<Option<Arc<HandlerContext>>>,
    pipeline: Weak<PipelineShared>,
}

unsafe impl Send for HandlerContext {}
unsafe impl Sync for HandlerContext {}

impl HandlerContext {
    fn new(
        name: &str,
        mask: EventMask,
        handler: Box<dyn Handler>,
        pipeline: Weak<PipelineShared>,
    ) -> Self {
        Self {
            name: String::from(name),
            mask,
            handler: UnsafeCell::new(handler),
            entered: AtomicBool::new(false),
            state: AtomicU8::new(ADDED),
            prev: Mutex::new(None),
            next: Mutex::new(None),
            pipeline,
        }
    }

    /// The handler's registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handler was removed from the pipeline.
    pub fn is_removed(&self) -> bool {
        self.state.load(Ordering::Acquire) == REMOVED
    }

    /// The pipeline this context belongs to, while it is alive.
    pub fn pipeline(&self) -> Option<Pipeline> {
        self.shared().map(Pipeline::from_shared)
    }

    pub(crate) fn shared(&self) -> Option<Arc<PipelineShared>> {
        self.pipeline.upgrade()
    }

    pub(crate) fn next_ctx(&self) -> Option<Arc<HandlerContext>> {
        self.next.lock().clone()
    }

    pub(crate) fn prev_ctx(&self) -> Option<Arc<HandlerContext>> {
        self.prev.lock().as_ref().and_then(Weak::upgrade)
    }

    // ---- inbound propagation -------------------------------------------

    /// Forwards the channel-active event to the next handler.
    pub fn fire_channel_active(&self) {
        if let Some(next) = find_inbound(self.next_ctx(), EventMask::CHANNEL_ACTIVE) {
            next.invoke(Event::ChannelActive);
        }
    }

    /// Forwards the channel-inactive event to the next handler.
    pub fn fire_channel_inactive(&self) {
        if let Some(next) = find_inbound(self.next_ctx(), EventMask::CHANNEL_INACTIVE) {
            next.invoke(Event::ChannelInactive);
        }
    }

    /// Forwards an inbound message to the next handler.
    pub fn fire_read(&self, msg: Message) {
        match find_inbound(self.next_ctx(), EventMask::READ) {
            Some(next) => next.invoke(Event::Read(msg)),
            None => release_message(msg),
        }
    }

    /// Forwards the read-complete event to the next handler.
    pub fn fire_read_complete(&self) {
        if let Some(next) = find_inbound(self.next_ctx(), EventMask::READ_COMPLETE) {
            next.invoke(Event::ReadComplete);
        }
    }

    /// Forwards a user event to the next handler.
    pub fn fire_user_event(&self, event: Message) {
        match find_inbound(self.next_ctx(), EventMask::USER_EVENT) {
            Some(next) => next.invoke(Event::UserEvent(event)),
            None => release_message(event),
        }
    }

    /// Forwards an error to the next handler.
    pub fn fire_error(&self, error: PipelineError) {
        if let Some(next) = find_inbound(self.next_ctx(), EventMask::ERROR) {
            next.invoke(Event::Error(error));
        }
    }

    // ---- outbound propagation ------------------------------------------

    /// Starts an outbound write from this handler's position, returning its
    /// completion.
    pub fn write(&self, msg: Message) -> Completion {
        let completion = Completion::new();
        self.write_next(msg, completion.clone());
        completion
    }

    /// Forwards an outbound message (and its completion) to the previous
    /// handler.
    pub fn write_next(&self, msg: Message, completion: Completion) {
        match find_outbound(self.prev_ctx(), EventMask::WRITE) {
            Some(prev) => prev.invoke(Event::Write(msg, completion)),
            None => {
                completion.fail("pipeline has no transport head");
                release_message(msg);
            }
        }
    }

    /// Forwards the flush event to the previous handler.
    pub fn flush_next(&self) {
        if let Some(prev) = find_outbound(self.prev_ctx(), EventMask::FLUSH) {
            prev.invoke(Event::Flush);
        }
    }

    /// Forwards the close event to the previous handler.
    pub fn close_next(&self) {
        if let Some(prev) = find_outbound(self.prev_ctx(), EventMask::CLOSE) {
            prev.invoke(Event::Close);
        }
    }

    // ---- dispatch ------------------------------------------------------

    pub(crate) fn invoke(self: &Arc<Self>, event: Event) {
        let Some(shared) = self.shared() else {
            release_event(event);
            return;
        };
        debug_assert!(
            shared.executor.in_event_loop(),
            "handler invoked off its event loop"
        );
        if self.entered.swap(true, Ordering::Relaxed) {
            // This very handler is already on the stack (an outbound walk
            // re-entered the handler that fired it). Running later on the
            // same executor preserves per-endpoint ordering and keeps the
            // handler borrow unique.
            let ctx = Arc::clone(self);
            if shared.executor.execute(move || ctx.invoke(event)).is_err() {
                warn!("executor rejected deferred pipeline event");
            }
            return;
        }
        // Reset on every exit path; a panicking handler must not wedge the
        // context with the flag stuck.
        struct EnteredGuard<'a>(&'a AtomicBool);
        impl Drop for EnteredGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Relaxed);
            }
        }
        let _entered = EnteredGuard(&self.entered);
        // Safety: see the type-level invariant; `entered` is our borrow
        // flag and this is the owning executor thread.
        let handler = unsafe { &mut *self.handler.get() };
        self.dispatch(handler.as_mut(), event);
    }

    fn dispatch(self: &Arc<Self>, handler: &mut dyn Handler, event: Event) {
        match event {
            Event::HandlerAdded => handler.handler_added(self),
            Event::HandlerRemoved => {
                handler.handler_removed(self);
                handler.on_detach();
            }
            Event::ChannelActive => handler.channel_active(self),
            Event::ChannelInactive => handler.channel_inactive(self),
            Event::Read(msg) => handler.handle_read(self, msg),
            Event::ReadComplete => handler.read_complete(self),
            Event::UserEvent(msg) => handler.user_event(self, msg),
            Event::Error(error) => handler.handle_error(self, error),
            Event::Write(msg, completion) => handler.handle_write(self, msg, completion),
            Event::Flush => handler.handle_flush(self),
            Event::Close => handler.handle_close(self),
        }
    }
}

/// Walks forward from `start` to the first live handler implementing the
/// event.
pub(crate) fn find_inbound(
    start: Option<Arc<HandlerContext>>,
    bit: EventMask,
) -> Option<Arc<HandlerContext>> {
    let mut cursor = start;
    while let Some(ctx) = cursor {
        if !ctx.is_removed() && ctx.mask.contains(bit) {
            return Some(ctx);
        }
        cursor = ctx.next_ctx();
    }
    None
}

/// Walks backward from `start` to the first live handler implementing the
/// event.
pub(crate) fn find_outbound(
    start: Option<Arc<HandlerContext>>,
    bit: EventMask,
) -> Option<Arc<HandlerContext>> {
    let mut cursor = start;
    while let Some(ctx) = cursor {
        if !ctx.is_removed() && ctx.mask.contains(bit) {
            return Some(ctx);
        }
        cursor = ctx.prev_ctx();
    }
    None
}

// ---- shared pipeline state ---------------------------------------------

pub(crate) struct PipelineShared {
    pub(crate) executor: EventExecutor,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) attributes: AttributeMap,
    pub(crate) transport: Mutex<Box<dyn Transport>>,
    pub(crate) closed: AtomicBool,
    head: OnceLock<Arc<HandlerContext>>,
    tail: OnceLock<Arc<HandlerContext>>,
    /// Serializes structural mutation so lifecycle errors are synchronous.
    structure: Mutex<()>,
}

impl PipelineShared {
    pub(crate) fn new(
        executor: EventExecutor,
        allocator: Arc<dyn Allocator>,
        transport: Box<dyn Transport>,
    ) -> Arc<Self> {
        let shared = Arc::new(Self {
            executor,
            allocator,
            attributes: AttributeMap::new(),
            transport: Mutex::new(transport),
            closed: AtomicBool::new(false),
            head: OnceLock::new(),
            tail: OnceLock::new(),
            structure: Mutex::new(()),
        });
        let head = Arc::new(HandlerContext::new(
            HEAD_NAME,
            EventMask::OUTBOUND,
            Box::new(HeadHandler),
            Arc::downgrade(&shared),
        ));
        let tail = Arc::new(HandlerContext::new(
            TAIL_NAME,
            EventMask::INBOUND,
            Box::new(TailHandler),
            Arc::downgrade(&shared),
        ));
        *head.next.lock() = Some(Arc::clone(&tail));
        *tail.prev.lock() = Some(Arc::downgrade(&head));
        shared
            .head
            .set(head)
            .unwrap_or_else(|_| unreachable!("head initialized once"));
        shared
            .tail
            .set(tail)
            .unwrap_or_else(|_| unreachable!("tail initialized once"));
        shared
    }

    pub(crate) fn head(&self) -> &Arc<HandlerContext> {
        self.head.get().expect("pipeline head initialized")
    }

    pub(crate) fn tail(&self) -> &Arc<HandlerContext> {
        self.tail.get().expect("pipeline tail initialized")
    }

    pub(crate) fn endpoint_name(&self) -> String {
        self.transport.lock().endpoint_name()
    }

    /// Runs `f` on the bound executor: inline when already there,
    /// marshalled as a task otherwise. Returns whether `f` will run.
    pub(crate) fn run_on_loop(&self, f: impl FnOnce() + Send + 'static) -> bool {
        if self.executor.in_event_loop() {
            f();
            true
        } else {
            match self.executor.execute(f) {
                Ok(()) => true,
                Err(err) => {
                    warn!("pipeline event dropped: {err}");
                    false
                }
            }
        }
    }

    fn find_by_name(&self, name: &str) -> Option<Arc<HandlerContext>> {
        let mut cursor = Some(Arc::clone(self.head()));
        while let Some(ctx) = cursor {
            if ctx.name() == name && !ctx.is_removed() {
                return Some(ctx);
            }
            cursor = ctx.next_ctx();
        }
        None
    }

    /// All user handler names, head to tail.
    pub(crate) fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut cursor = self.head().next_ctx();
        while let Some(ctx) = cursor {
            if !ctx.is_removed() && ctx.name() != TAIL_NAME {
                names.push(String::from(ctx.name()));
            }
            cursor = ctx.next_ctx();
        }
        names
    }

    /// Inserts `handler` immediately before `anchor`.
    pub(crate) fn insert_before(
        self: &Arc<Self>,
        anchor: &Arc<HandlerContext>,
        name: &str,
        mut handler: Box<dyn Handler>,
        mask: EventMask,
    ) -> Result<(), PipelineError> {
        let _guard = self.structure.lock();
        if name == HEAD_NAME || name == TAIL_NAME || self.find_by_name(name).is_some() {
            return Err(PipelineError::DuplicateName(String::from(name)));
        }
        handler.on_attach(name)?;

        let ctx = Arc::new(HandlerContext::new(
            name,
            mask,
            handler,
            Arc::downgrade(self),
        ));
        let prev = anchor
            .prev_ctx()
            .expect("anchor always has a predecessor");
        *ctx.prev.lock() = Some(Arc::downgrade(&prev));
        *ctx.next.lock() = Some(Arc::clone(anchor));
        *prev.next.lock() = Some(Arc::clone(&ctx));
        *anchor.prev.lock() = Some(Arc::downgrade(&ctx));
        drop(_guard);

        self.run_on_loop(move || ctx.invoke(Event::HandlerAdded));
        Ok(())
    }

    pub(crate) fn anchor_for_add_before(
        &self,
        name: &str,
    ) -> Result<Arc<HandlerContext>, PipelineError> {
        self.find_by_name(name)
            .filter(|ctx| ctx.name() != HEAD_NAME && ctx.name() != TAIL_NAME)
            .ok_or_else(|| PipelineError::NotFound(String::from(name)))
    }

    /// Unlinks the named handler. Its own links stay intact so in-flight
    /// events continue past it.
    pub(crate) fn remove_by_name(self: &Arc<Self>, name: &str) -> Result<(), PipelineError> {
        if name == HEAD_NAME || name == TAIL_NAME {
            return Err(PipelineError::NotFound(String::from(name)));
        }
        let _guard = self.structure.lock();
        let ctx = self
            .find_by_name(name)
            .ok_or_else(|| PipelineError::NotFound(String::from(name)))?;
        let prev = ctx.prev_ctx().expect("user handler has a predecessor");
        let next = ctx.next_ctx().expect("user handler has a successor");
        *prev.next.lock() = Some(Arc::clone(&next));
        *next.prev.lock() = Some(Arc::downgrade(&prev));
        ctx.state.store(REMOVED, Ordering::Release);
        drop(_guard);

        self.run_on_loop(move || ctx.invoke(Event::HandlerRemoved));
        Ok(())
    }
}

// ---- sentinels ---------------------------------------------------------

/// Outbound terminus: performs the actual transport operation.
struct HeadHandler;

impl Handler for HeadHandler {
    fn events(&self) -> EventMask {
        EventMask::OUTBOUND
    }

    fn handle_write(&mut self, ctx: &HandlerContext, msg: Message, completion: Completion) {
        let Some(shared) = ctx.shared() else {
            completion.fail("pipeline already dropped");
            release_message(msg);
            return;
        };
        match msg.downcast::<ByteBuf>() {
            Ok(buf) => {
                let result = shared.transport.lock().write(*buf);
                match result {
                    Ok(()) => {
                        completion.succeed();
                    }
                    Err(err) => {
                        let reason = err.to_string();
                        completion.fail(reason);
                        ctx.fire_error(PipelineError::other(err));
                    }
                }
            }
            Err(other) => {
                warn!(
                    "unencoded message reached the transport head of \"{}\"",
                    shared.endpoint_name()
                );
                completion.fail("unencoded message reached the transport head");
                release_message(other);
            }
        }
    }

    fn handle_flush(&mut self, ctx: &HandlerContext) {
        if let Some(shared) = ctx.shared() {
            if let Err(err) = shared.transport.lock().flush() {
                ctx.fire_error(PipelineError::other(err));
            }
        }
    }

    fn handle_close(&mut self, ctx: &HandlerContext) {
        let Some(shared) = ctx.shared() else {
            return;
        };
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing endpoint \"{}\"", shared.endpoint_name());
        if let Err(err) = shared.transport.lock().close() {
            warn!(
                "error closing endpoint \"{}\": {}",
                shared.endpoint_name(),
                err
            );
        }
        // A closed stream is an inactive endpoint.
        ctx.fire_channel_inactive();
    }
}

/// Inbound terminus: the safety net for whatever nothing else handled.
struct TailHandler;

impl Handler for TailHandler {
    fn events(&self) -> EventMask {
        EventMask::INBOUND
    }

    fn channel_active(&mut self, ctx: &HandlerContext) {
        if let Some(shared) = ctx.shared() {
            trace!("endpoint \"{}\" active", shared.endpoint_name());
        }
    }

    fn channel_inactive(&mut self, ctx: &HandlerContext) {
        if let Some(shared) = ctx.shared() {
            trace!("endpoint \"{}\" inactive", shared.endpoint_name());
        }
    }

    fn handle_read(&mut self, ctx: &HandlerContext, msg: Message) {
        // Nothing consumed the message: release it and ask the transport
        // for more data so the endpoint does not stall.
        release_message(msg);
        if let Some(shared) = ctx.shared() {
            debug!(
                "inbound message reached the tail of \"{}\" unhandled",
                shared.endpoint_name()
            );
            shared.transport.lock().request_read();
        }
    }

    fn read_complete(&mut self, ctx: &HandlerContext) {
        if let Some(shared) = ctx.shared() {
            shared.transport.lock().request_read();
        }
    }

    fn user_event(&mut self, _ctx: &HandlerContext, event: Message) {
        release_message(event);
    }

    fn handle_error(&mut self, ctx: &HandlerContext, error: PipelineError) {
        // Fail fast: an unhandled error closes the endpoint rather than
        // limp along with half-decoded state.
        if let Some(shared) = ctx.shared() {
            error!(
                "unhandled error on endpoint \"{}\": {}; closing",
                shared.endpoint_name(),
                error
            );
        }
        ctx.close_next();
    }
}
