use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::{
    channel::{Channel, Timeout},
    config::{BridgeConfig, RuntimeConfig},
    envelope::Envelope,
    error::{Error, Result},
    handle::{Handle, HandleKind, HandleTable},
    handler::{Echo, Handler},
    mailbox::Mailbox,
    message::{Message, MessageKind, Topic},
    runtime::{Runtime, RuntimeInfo},
};

type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Registry of live runtimes and channels.
///
/// Every operation addresses objects by [`Handle`]; a handle is valid from
/// its creation until the matching destroy/close, and never again after that.
/// All methods block the calling thread where documented and must not be
/// called from inside an async context or from a handler on its own runtime.
pub struct Bridge {
    config: BridgeConfig,
    runtimes: HandleTable<Arc<Runtime>>,
    channels: HandleTable<Arc<Channel>>,
    handlers: HandlerFactory,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl Bridge {
    /// A bridge whose runtimes run the [`Echo`] handler.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_handler(config, || Box::new(Echo))
    }

    /// A bridge that builds one handler per runtime with `factory`.
    pub fn with_handler<F>(config: BridgeConfig, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Handler> + Send + Sync + 'static,
    {
        Self {
            runtimes: HandleTable::with_capacity_limit(HandleKind::Runtime, config.max_runtimes),
            channels: HandleTable::new(HandleKind::Channel),
            handlers: Arc::new(factory),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn runtime(&self, runtime: Handle) -> Result<Arc<Runtime>> {
        self.runtimes
            .resolve(runtime)
            .map_err(|_| Error::InvalidRuntime(runtime))
    }

    fn channel(&self, channel: Handle) -> Result<Arc<Channel>> {
        self.channels
            .resolve(channel)
            .map_err(|_| Error::InvalidChannel(channel))
    }

    /// The runtime a channel is bound to, if it is still alive.
    fn bound_runtime(&self, channel: &Channel) -> Result<Arc<Runtime>> {
        self.runtimes
            .resolve(channel.runtime)
            .map_err(|_| Error::RuntimeUnavailable(channel.runtime))
    }

    /// Creates a runtime with the bridge's default configuration.
    pub fn create_runtime(&self) -> Result<Handle> {
        self.create_runtime_with_config(self.config.runtime.clone())
    }

    pub fn create_runtime_with_config(&self, config: RuntimeConfig) -> Result<Handle> {
        self.create_runtime_with_handler(config, (self.handlers)())
    }

    pub fn create_runtime_with_handler(
        &self,
        config: RuntimeConfig,
        handler: Box<dyn Handler>,
    ) -> Result<Handle> {
        config
            .validate()
            .map_err(|err| Error::Initialization(err.to_string()))?;
        let mode = config.mode;
        let handle = self
            .runtimes
            .allocate_with(|handle| Runtime::start(handle, config, handler).map(Arc::new))?;
        info!(runtime = %handle, mode = mode.as_str(), "Runtime created");
        Ok(handle)
    }

    /// Destroys a runtime, cancelling in-flight work and invalidating every
    /// channel bound to it. Destroying it again returns `NotFound`.
    pub fn destroy_runtime(&self, runtime: Handle) -> Result<()> {
        if runtime.kind() != Some(HandleKind::Runtime) {
            return Err(Error::InvalidRuntime(runtime));
        }
        let instance = self.runtimes.release(runtime)?;
        instance.shutdown();
        Ok(())
    }

    /// Processes up to `max` pending messages of a cooperative runtime on the
    /// calling thread and returns how many were processed.
    pub fn step(&self, runtime: Handle, max: usize) -> Result<usize> {
        self.runtime(runtime)?.step(max)
    }

    /// Broadcasts an event on [`Topic::DEFAULT`] to every channel bound to
    /// `runtime`.
    pub fn publish(&self, runtime: Handle, payload: impl Into<Bytes>) -> Result<u64> {
        self.publish_on(runtime, Topic::DEFAULT, payload)
    }

    pub fn publish_on(
        &self,
        runtime: Handle,
        topic: Topic,
        payload: impl Into<Bytes>,
    ) -> Result<u64> {
        self.runtime(runtime)?.publish(topic, payload.into())
    }

    pub fn runtime_info(&self, runtime: Handle) -> Result<RuntimeInfo> {
        Ok(self.runtime(runtime)?.info())
    }

    /// Handles of all live runtimes.
    #[must_use]
    pub fn runtimes(&self) -> Vec<Handle> {
        self.runtimes.handles()
    }

    /// Creates a channel bound to `runtime`.
    pub fn create_client(&self, runtime: Handle) -> Result<Handle> {
        let instance = self.runtime(runtime)?;
        let config = instance.config();
        let (events, responses) = (config.event_backlog, config.response_backlog);
        let handle = self.channels.allocate_with(|channel| {
            let mailbox = Arc::new(Mailbox::new(channel, runtime, events, responses));
            instance.register(channel, &mailbox)?;
            Ok(Arc::new(Channel { runtime, mailbox }))
        })?;
        debug!(channel = %handle, runtime = %runtime, "Channel created");
        Ok(handle)
    }

    /// Enqueues a request or event without waiting for it to run. Returns the
    /// message id; the response to a request carries the same id.
    pub fn send(
        &self,
        channel: Handle,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> Result<u64> {
        self.send_message(channel, Message::new(kind, payload))
    }

    /// Sends an event on `topic` to the runtime's handler.
    pub fn send_event(
        &self,
        channel: Handle,
        topic: Topic,
        payload: impl Into<Bytes>,
    ) -> Result<u64> {
        self.send_message(channel, Message::event(payload).with_topic(topic))
    }

    fn send_message(&self, channel: Handle, message: Message) -> Result<u64> {
        let endpoint = self.channel(channel)?;
        self.bound_runtime(&endpoint)?
            .send(&endpoint.mailbox, message)
    }

    /// Shorthand for sending a [`MessageKind::Request`].
    pub fn request(&self, channel: Handle, payload: impl Into<Bytes>) -> Result<u64> {
        self.send(channel, MessageKind::Request, payload)
    }

    /// Waits for the next response, error or event on `channel`.
    pub fn receive(&self, channel: Handle, timeout: impl Into<Timeout>) -> Envelope<Message> {
        self.try_receive(channel, timeout.into()).into()
    }

    fn try_receive(&self, channel: Handle, timeout: Timeout) -> Result<Message> {
        let endpoint = self.channel(channel)?;
        self.bound_runtime(&endpoint)?
            .receive(&endpoint.mailbox, timeout)
    }

    /// Wakes every receiver currently blocked on `channel` with `Cancelled`.
    pub fn interrupt(&self, channel: Handle) -> Result<()> {
        self.channel(channel)?.mailbox.interrupt();
        Ok(())
    }

    /// Routes events for `channel` on `topic` (every topic when `None`) to
    /// `callback` instead of its queue and returns the subscription id.
    ///
    /// A channel may hold any number of subscriptions; each matching event
    /// goes to all of them. Callbacks run on the runtime's dispatcher, never
    /// on the calling thread. Matching events already queued are handed to
    /// the first new subscription before any later event. A
    /// [`Topic::KILL`] event ends every subscription of the channel.
    pub fn subscribe<F>(&self, channel: Handle, topic: Option<Topic>, callback: F) -> Result<u64>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let endpoint = self.channel(channel)?;
        let runtime = self.bound_runtime(&endpoint)?;
        let (subscription, pending) = endpoint.mailbox.subscribe(topic, Arc::new(callback))?;
        if pending {
            runtime.activate(&endpoint.mailbox);
        }
        debug!(%channel, subscription, pending, "Subscribed to events");
        Ok(subscription)
    }

    /// Ends a subscription. Outside a dispatcher this also waits for a
    /// callback of the subscription that is running right now.
    pub fn unsubscribe(&self, channel: Handle, subscription: u64) -> Result<()> {
        self.channel(channel)?.mailbox.unsubscribe(subscription)
    }

    /// Closes a channel and wakes its blocked receivers. Closing it again
    /// returns `NotFound`.
    pub fn close(&self, channel: Handle) -> Result<()> {
        if channel.kind() != Some(HandleKind::Channel) {
            return Err(Error::InvalidChannel(channel));
        }
        let endpoint = self.channels.release(channel)?;
        if let Ok(runtime) = self.runtimes.resolve(endpoint.runtime) {
            runtime.deregister(channel);
        }
        let discarded = endpoint.mailbox.close();
        debug!(channel = %channel, discarded, "Channel closed");
        Ok(())
    }

    /// Closes every channel and destroys every runtime.
    pub fn shutdown(&self) {
        let channels = self.channels.drain();
        for (_, endpoint) in &channels {
            endpoint.mailbox.close();
        }
        let runtimes = self.runtimes.drain();
        for (_, runtime) in &runtimes {
            runtime.shutdown();
        }
        if !channels.is_empty() || !runtimes.is_empty() {
            info!(
                channels = channels.len(),
                runtimes = runtimes.len(),
                "Bridge shut down"
            );
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn wrong_kind_handles_are_rejected() {
        let bridge = Bridge::default();
        let runtime = bridge.create_runtime().expect("runtime");
        let channel = bridge.create_client(runtime).expect("channel");

        assert_eq!(
            bridge.create_client(channel).expect_err("channel as runtime").kind(),
            ErrorKind::InvalidRuntime
        );
        assert_eq!(
            bridge.request(runtime, "x").expect_err("runtime as channel").kind(),
            ErrorKind::InvalidChannel
        );
        assert_eq!(
            bridge.destroy_runtime(channel).expect_err("destroy channel").kind(),
            ErrorKind::InvalidRuntime
        );
        assert_eq!(
            bridge.close(runtime).expect_err("close runtime").kind(),
            ErrorKind::InvalidChannel
        );
    }

    #[test]
    fn invalid_config_fails_initialization() {
        let bridge = Bridge::default();
        let err = bridge
            .create_runtime_with_config(RuntimeConfig {
                inbound_capacity: 0,
                ..RuntimeConfig::default()
            })
            .expect_err("zero capacity");
        assert_eq!(err.kind(), ErrorKind::Initialization);
        assert!(bridge.runtimes().is_empty());
    }

    #[test]
    fn responses_are_rejected_as_outbound_kind() {
        let bridge = Bridge::default();
        let runtime = bridge.create_runtime().expect("runtime");
        let channel = bridge.create_client(runtime).expect("channel");
        let err = bridge
            .send(channel, MessageKind::Response, "x")
            .expect_err("response kind");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn shutdown_invalidates_everything() {
        let bridge = Bridge::default();
        let runtime = bridge.create_runtime().expect("runtime");
        let channel = bridge.create_client(runtime).expect("channel");
        bridge.shutdown();
        assert!(bridge.runtimes().is_empty());
        assert_eq!(
            bridge.request(channel, "x").expect_err("closed").kind(),
            ErrorKind::InvalidChannel
        );
        assert_eq!(
            bridge.destroy_runtime(runtime).expect_err("gone").kind(),
            ErrorKind::NotFound
        );
    }
}
