//! The handler contract and its capability masks.

use std::any::{Any, TypeId};
use std::ops::BitOr;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use strand_common::Completion;

use crate::error::PipelineError;
use crate::pipeline_internal::HandlerContext;

/// A message flowing through a pipeline.
///
/// Messages are dynamically typed; codec handlers narrow them at the seams
/// (bytes in, structured messages out) and anything crossing executor
/// threads must be `Send`.
pub type Message = Box<dyn Any + Send>;

/// The set of events a handler actually implements.
///
/// The mask is declared explicitly by [`Handler::events`], computed once
/// per concrete handler type when it is first added and cached by type
/// identity. Propagation skips handlers whose mask lacks the event's bit,
/// so a pass-through default method is never even invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    /// The endpoint became active.
    pub const CHANNEL_ACTIVE: EventMask = EventMask(1 << 0);
    /// The endpoint became inactive.
    pub const CHANNEL_INACTIVE: EventMask = EventMask(1 << 1);
    /// An inbound message arrived.
    pub const READ: EventMask = EventMask(1 << 2);
    /// A batch of reads finished.
    pub const READ_COMPLETE: EventMask = EventMask(1 << 3);
    /// A user event was broadcast.
    pub const USER_EVENT: EventMask = EventMask(1 << 4);
    /// An error is propagating.
    pub const ERROR: EventMask = EventMask(1 << 5);
    /// An outbound message is being written.
    pub const WRITE: EventMask = EventMask(1 << 6);
    /// Written messages are being flushed.
    pub const FLUSH: EventMask = EventMask(1 << 7);
    /// The endpoint is closing.
    pub const CLOSE: EventMask = EventMask(1 << 8);

    /// No events.
    pub const NONE: EventMask = EventMask(0);
    /// Every inbound event.
    pub const INBOUND: EventMask = EventMask(
        Self::CHANNEL_ACTIVE.0
            | Self::CHANNEL_INACTIVE.0
            | Self::READ.0
            | Self::READ_COMPLETE.0
            | Self::USER_EVENT.0
            | Self::ERROR.0,
    );
    /// Every outbound event.
    pub const OUTBOUND: EventMask =
        EventMask(Self::WRITE.0 | Self::FLUSH.0 | Self::CLOSE.0);
    /// Every event.
    pub const ALL: EventMask = EventMask(Self::INBOUND.0 | Self::OUTBOUND.0);

    /// Whether all bits of `other` are set in `self`.
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

fn mask_cache() -> &'static DashMap<TypeId, EventMask> {
    static CACHE: OnceLock<DashMap<TypeId, EventMask>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Resolves the capability mask for a concrete handler type, computing it
/// on first use and serving it from the type-identity cache afterwards.
pub(crate) fn mask_for<H: Handler>(handler: &H) -> EventMask {
    *mask_cache()
        .entry(TypeId::of::<H>())
        .or_insert_with(|| handler.events())
}

/// A unit of pipeline logic.
///
/// Every method has a default implementation that forwards the event to the
/// next handler in its direction, so implementations only override what
/// they care about - and declare exactly that in [`events`](Handler::events)
/// so the dispatcher can skip them everywhere else.
///
/// All methods are invoked on the endpoint's bound executor, one at a time,
/// in fire order. Handlers therefore need no internal locking.
///
/// # Example
///
/// ```rust
/// use strand::{EventMask, Handler, HandlerContext, Message};
///
/// struct LoggingHandler;
///
/// impl Handler for LoggingHandler {
///     fn events(&self) -> EventMask {
///         EventMask::READ
///     }
///
///     fn handle_read(&mut self, ctx: &HandlerContext, msg: Message) {
///         println!("inbound message on {}", ctx.name());
///         ctx.fire_read(msg);
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait Handler: Send + 'static {
    /// Declares which events this handler implements. Defaults to all.
    fn events(&self) -> EventMask {
        EventMask::ALL
    }

    /// Whether one instance may be attached at several positions at once.
    fn is_shareable(&self) -> bool {
        false
    }

    /// Called once the handler is attached and visible in the pipeline.
    fn handler_added(&mut self, ctx: &HandlerContext) {}

    /// Called after the handler was unlinked. Buffered state must be
    /// forwarded or released here, never silently dropped.
    fn handler_removed(&mut self, ctx: &HandlerContext) {}

    /// The endpoint became active.
    fn channel_active(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_active();
    }

    /// The endpoint became inactive.
    fn channel_inactive(&mut self, ctx: &HandlerContext) {
        ctx.fire_channel_inactive();
    }

    /// An inbound message arrived. Ownership of `msg` transfers here:
    /// forward it, or release any refcounted payload it carries.
    fn handle_read(&mut self, ctx: &HandlerContext, msg: Message) {
        ctx.fire_read(msg);
    }

    /// The current batch of reads finished.
    fn read_complete(&mut self, ctx: &HandlerContext) {
        ctx.fire_read_complete();
    }

    /// A user event was broadcast.
    fn user_event(&mut self, ctx: &HandlerContext, event: Message) {
        ctx.fire_user_event(event);
    }

    /// An error is propagating inbound. Unhandled errors reach the tail,
    /// which logs them and closes the endpoint.
    fn handle_error(&mut self, ctx: &HandlerContext, error: PipelineError) {
        ctx.fire_error(error);
    }

    /// An outbound message is on its way to the transport. `completion`
    /// resolves when the head performed the transport operation.
    fn handle_write(&mut self, ctx: &HandlerContext, msg: Message, completion: Completion) {
        ctx.write_next(msg, completion);
    }

    /// Written messages should be flushed.
    fn handle_flush(&mut self, ctx: &HandlerContext) {
        ctx.flush_next();
    }

    /// The endpoint is closing.
    fn handle_close(&mut self, ctx: &HandlerContext) {
        ctx.close_next();
    }

    /// Hook invoked at add time, before the handler becomes visible.
    #[doc(hidden)]
    fn on_attach(&mut self, name: &str) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Hook invoked at removal, after the handler was unlinked.
    #[doc(hidden)]
    fn on_detach(&mut self) {}
}

struct SharedInner<H: Handler> {
    handler: Mutex<H>,
    attached: AtomicUsize,
}

/// Wraps a handler so one instance can be attached at several positions or
/// pipelines.
///
/// The wrapped handler still decides whether that is allowed: attaching a
/// `Shared` whose inner handler is not [`Handler::is_shareable`] to more
/// than one position at a time fails with
/// [`PipelineError::NotShareable`].
pub struct Shared<H: Handler> {
    inner: Arc<SharedInner<H>>,
}

impl<H: Handler> Clone for Shared<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Handler> Shared<H> {
    /// Wraps `handler` for shared attachment.
    pub fn new(handler: H) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                handler: Mutex::new(handler),
                attached: AtomicUsize::new(0),
            }),
        }
    }
}

impl<H: Handler> Handler for Shared<H> {
    fn events(&self) -> EventMask {
        self.inner.handler.lock().events()
    }

    fn is_shareable(&self) -> bool {
        self.inner.handler.lock().is_shareable()
    }

    fn on_attach(&mut self, name: &str) -> Result<(), PipelineError> {
        let previous = self.inner.attached.fetch_add(1, Ordering::AcqRel);
        if previous > 0 && !self.is_shareable() {
            self.inner.attached.fetch_sub(1, Ordering::AcqRel);
            return Err(PipelineError::NotShareable(String::from(name)));
        }
        Ok(())
    }

    fn on_detach(&mut self) {
        self.inner.attached.fetch_sub(1, Ordering::AcqRel);
    }

    fn handler_added(&mut self, ctx: &HandlerContext) {
        self.inner.handler.lock().handler_added(ctx);
    }

    fn handler_removed(&mut self, ctx: &HandlerContext) {
        self.inner.handler.lock().handler_removed(ctx);
    }

    fn channel_active(&mut self, ctx: &HandlerContext) {
        self.inner.handler.lock().channel_active(ctx);
    }

    fn channel_inactive(&mut self, ctx: &HandlerContext) {
        self.inner.handler.lock().channel_inactive(ctx);
    }

    fn handle_read(&mut self, ctx: &HandlerContext, msg: Message) {
        self.inner.handler.lock().handle_read(ctx, msg);
    }

    fn read_complete(&mut self, ctx: &HandlerContext) {
        self.inner.handler.lock().read_complete(ctx);
    }

    fn user_event(&mut self, ctx: &HandlerContext, event: Message) {
        self.inner.handler.lock().user_event(ctx, event);
    }

    fn handle_error(&mut self, ctx: &HandlerContext, error: PipelineError) {
        self.inner.handler.lock().handle_error(ctx, error);
    }

    fn handle_write(&mut self, ctx: &HandlerContext, msg: Message, completion: Completion) {
        self.inner.handler.lock().handle_write(ctx, msg, completion);
    }

    fn handle_flush(&mut self, ctx: &HandlerContext) {
        self.inner.handler.lock().handle_flush(ctx);
    }

    fn handle_close(&mut self, ctx: &HandlerContext) {
        self.inner.handler.lock().handle_close(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnly;

    impl Handler for ReadOnly {
        fn events(&self) -> EventMask {
            EventMask::READ | EventMask::ERROR
        }
    }

    #[test]
    fn mask_combination_and_containment() {
        let mask = EventMask::READ | EventMask::WRITE;
        assert!(mask.contains(EventMask::READ));
        assert!(mask.contains(EventMask::WRITE));
        assert!(!mask.contains(EventMask::FLUSH));
        assert!(EventMask::ALL.contains(EventMask::INBOUND));
        assert!(EventMask::ALL.contains(EventMask::OUTBOUND));
    }

    #[test]
    fn mask_is_cached_by_type_identity() {
        let first = mask_for(&ReadOnly);
        let second = mask_for(&ReadOnly);
        assert_eq!(first, EventMask::READ | EventMask::ERROR);
        assert_eq!(first, second);
    }

    #[test]
    fn shared_non_shareable_rejects_second_attach() {
        let shared = Shared::new(ReadOnly);
        let mut first = shared.clone();
        let mut second = shared;
        first.on_attach("a").unwrap();
        assert!(matches!(
            second.on_attach("b"),
            Err(PipelineError::NotShareable(_))
        ));
        first.on_detach();
        second.on_attach("b").unwrap();
    }
}
