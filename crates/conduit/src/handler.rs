use bytes::Bytes;

use crate::message::{Message, Topic};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The embedded execution context behind a runtime.
///
/// A runtime owns exactly one handler and calls it from a single consumer at a
/// time, so implementations get `&mut self` and need no locking of their own.
/// Handlers must not call back into the bridge for their own runtime.
#[async_trait::async_trait]
pub trait Handler: Send + 'static {
    /// Executes a request. The returned bytes become the payload of the
    /// response delivered to the requesting channel; an error is delivered to
    /// that channel as an execution failure.
    async fn on_request(
        &mut self,
        request: &Message,
        events: &mut Events,
    ) -> core::result::Result<Bytes, BoxError>;

    /// Handles an event sent by a channel. Ignored by default.
    async fn on_event(
        &mut self,
        event: &Message,
        events: &mut Events,
    ) -> core::result::Result<(), BoxError> {
        _ = (event, events);
        Ok(())
    }
}

/// Events emitted by a handler while processing one message. They are
/// broadcast to every channel bound to the runtime once the handler returns.
#[derive(Debug, Default)]
pub struct Events {
    pending: Vec<Message>,
}

impl Events {
    /// Emits an event on [`Topic::DEFAULT`].
    pub fn emit(&mut self, payload: impl Into<Bytes>) {
        self.emit_on(Topic::DEFAULT, payload);
    }

    pub fn emit_on(&mut self, topic: impl Into<Topic>, payload: impl Into<Bytes>) {
        self.pending
            .push(Message::event(payload).with_topic(topic.into()));
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn into_messages(self) -> Vec<Message> {
        self.pending
    }
}

/// Answers every request with its own payload and rebroadcasts every event
/// on its topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

#[async_trait::async_trait]
impl Handler for Echo {
    async fn on_request(
        &mut self,
        request: &Message,
        _events: &mut Events,
    ) -> core::result::Result<Bytes, BoxError> {
        Ok(request.payload().clone())
    }

    async fn on_event(
        &mut self,
        event: &Message,
        events: &mut Events,
    ) -> core::result::Result<(), BoxError> {
        events.emit_on(event.topic(), event.payload().clone());
        Ok(())
    }
}
