//! The public pipeline surface.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use strand_buf::{Allocator, Unpooled};
use strand_common::{Attribute, AttributeKey, AttributeMap, Completion};
use strand_executor::EventExecutor;

use crate::error::PipelineError;
use crate::handler::{mask_for, Handler, Message};
use crate::pipeline_internal::{
    find_inbound, release_event, release_message, Event, PipelineShared,
};
use crate::transport::{NullTransport, Transport};

/// An ordered chain of handlers bound to one endpoint.
///
/// The pipeline is the endpoint abstraction of the framework: it owns the
/// endpoint's attribute map, its allocator handle and its transport
/// binding, and it is bound to exactly one [`EventExecutor`] for its whole
/// lifetime. Every handler callback and every structural mutation callback
/// runs on that executor, one at a time - handlers never need locks.
///
/// Inbound events propagate head to tail, outbound events tail to head.
/// Propagation skips handlers whose capability mask does not include the
/// event and stops at the first handler that does not forward; whatever
/// reaches the sentinels gets the default treatment (release-and-request-
/// more for reads, log-and-close for errors, the transport operation for
/// writes).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use strand::{Handler, Pipeline};
/// use strand_executor::EventLoopGroup;
///
/// struct Noop;
/// impl Handler for Noop {}
///
/// let group = EventLoopGroup::new(1);
/// let pipeline = Pipeline::builder(group.register()).build();
/// pipeline.add_last("noop", Noop).unwrap();
/// pipeline.fire_channel_active();
///
/// group
///     .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
///     .await_termination(Duration::from_secs(5));
/// ```
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<PipelineShared>,
}

impl Pipeline {
    /// Starts building a pipeline bound to `executor`.
    pub fn builder(executor: EventExecutor) -> PipelineBuilder {
        PipelineBuilder {
            executor,
            allocator: None,
            transport: None,
        }
    }

    pub(crate) fn from_shared(shared: Arc<PipelineShared>) -> Self {
        Self { shared }
    }

    /// The executor this endpoint is bound to.
    pub fn executor(&self) -> &EventExecutor {
        &self.shared.executor
    }

    /// The endpoint's allocator.
    pub fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.shared.allocator)
    }

    /// The endpoint's attribute map.
    pub fn attributes(&self) -> &AttributeMap {
        &self.shared.attributes
    }

    /// Shorthand for looking up an attribute holder on this endpoint.
    pub fn attribute<T: Clone + Send + Sync + 'static>(
        &self,
        key: &AttributeKey<T>,
    ) -> Attribute<T> {
        self.shared.attributes.attr(key)
    }

    /// Whether the endpoint was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    // ---- structural mutation -------------------------------------------

    /// Appends a handler just before the tail sentinel.
    pub fn add_last(&self, name: &str, handler: impl Handler) -> Result<(), PipelineError> {
        let mask = mask_for(&handler);
        let tail = Arc::clone(self.shared.tail());
        self.shared
            .insert_before(&tail, name, Box::new(handler), mask)
    }

    /// Inserts a handler just after the head sentinel.
    pub fn add_first(&self, name: &str, handler: impl Handler) -> Result<(), PipelineError> {
        let mask = mask_for(&handler);
        let anchor = self
            .shared
            .head()
            .next_ctx()
            .expect("head always has a successor");
        self.shared
            .insert_before(&anchor, name, Box::new(handler), mask)
    }

    /// Inserts a handler before the named one.
    pub fn add_before(
        &self,
        existing: &str,
        name: &str,
        handler: impl Handler,
    ) -> Result<(), PipelineError> {
        let mask = mask_for(&handler);
        let anchor = self.shared.anchor_for_add_before(existing)?;
        self.shared
            .insert_before(&anchor, name, Box::new(handler), mask)
    }

    /// Inserts a handler after the named one.
    pub fn add_after(
        &self,
        existing: &str,
        name: &str,
        handler: impl Handler,
    ) -> Result<(), PipelineError> {
        let mask = mask_for(&handler);
        let anchor = self
            .shared
            .anchor_for_add_before(existing)?
            .next_ctx()
            .expect("user handler always has a successor");
        self.shared
            .insert_before(&anchor, name, Box::new(handler), mask)
    }

    /// Removes the named handler, firing its removed callback on the
    /// executor. Absent names fail synchronously.
    pub fn remove(&self, name: &str) -> Result<(), PipelineError> {
        self.shared.remove_by_name(name)
    }

    /// User handler names, head to tail.
    pub fn names(&self) -> Vec<String> {
        self.shared.names()
    }

    /// Whether a handler with this name is attached.
    pub fn contains(&self, name: &str) -> bool {
        self.shared.names().iter().any(|n| n == name)
    }

    // ---- inbound entry points (called by the transport) ----------------

    fn fire(&self, event: Event) {
        let shared = Arc::clone(&self.shared);
        self.shared.run_on_loop(move || {
            let bit = event.mask_bit();
            match find_inbound(shared.head().next_ctx(), bit) {
                Some(ctx) => ctx.invoke(event),
                None => release_event(event),
            }
        });
    }

    /// Signals that the endpoint became active.
    pub fn fire_channel_active(&self) {
        self.fire(Event::ChannelActive);
    }

    /// Signals that the endpoint became inactive.
    pub fn fire_channel_inactive(&self) {
        self.fire(Event::ChannelInactive);
    }

    /// Feeds one inbound message into the pipeline.
    ///
    /// Invoked handlers see the message on the owning executor, in arrival
    /// order, positioned at the unread region when it carries a buffer.
    pub fn fire_read(&self, msg: Message) {
        self.fire(Event::Read(msg));
    }

    /// Signals that the current read batch is complete.
    pub fn fire_read_complete(&self) {
        self.fire(Event::ReadComplete);
    }

    /// Broadcasts a user event through the pipeline.
    pub fn fire_user_event(&self, event: Message) {
        self.fire(Event::UserEvent(event));
    }

    /// Propagates an error through the pipeline.
    pub fn fire_error(&self, error: PipelineError) {
        self.fire(Event::Error(error));
    }

    // ---- outbound entry points (called by the application) -------------

    /// Sends a message outbound through the pipeline, tail to head. The
    /// returned completion resolves once the head performed the transport
    /// operation.
    pub fn write(&self, msg: Message) -> Completion {
        let completion = Completion::new();
        if self.is_closed() {
            completion.fail(PipelineError::Closed.to_string());
            release_message(msg);
            return completion;
        }
        let shared = Arc::clone(&self.shared);
        let resolver = completion.clone();
        let accepted = self.shared.run_on_loop(move || {
            shared.tail().write_next(msg, resolver);
        });
        if !accepted {
            completion.fail("executor rejected outbound write");
        }
        completion
    }

    /// Flushes written messages towards the transport.
    pub fn flush(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.run_on_loop(move || {
            shared.tail().flush_next();
        });
    }

    /// Writes and immediately flushes.
    pub fn write_and_flush(&self, msg: Message) -> Completion {
        let completion = self.write(msg);
        self.flush();
        completion
    }

    /// Closes the endpoint through the outbound chain.
    pub fn close(&self) {
        let shared = Arc::clone(&self.shared);
        self.shared.run_on_loop(move || {
            shared.tail().close_next();
        });
    }
}

/// Configures and builds a [`Pipeline`].
pub struct PipelineBuilder {
    executor: EventExecutor,
    allocator: Option<Arc<dyn Allocator>>,
    transport: Option<Box<dyn Transport>>,
}

impl PipelineBuilder {
    /// Sets the endpoint's allocator; defaults to [`Unpooled`].
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Sets the transport binding; defaults to a transport that discards
    /// everything.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Builds the pipeline.
    pub fn build(self) -> Pipeline {
        let allocator = self.allocator.unwrap_or_else(|| Arc::new(Unpooled));
        let transport = self
            .transport
            .unwrap_or_else(|| Box::new(NullTransport));
        Pipeline {
            shared: PipelineShared::new(self.executor, allocator, transport),
        }
    }
}
