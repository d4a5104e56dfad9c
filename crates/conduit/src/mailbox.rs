use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Instant,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    handle::Handle,
    message::{Message, MessageKind, Topic},
};

/// Callback receiving events for one channel, invoked on the dispatcher
/// thread.
pub type EventCallback = Arc<dyn Fn(Message) + Send + Sync + 'static>;

type Delivery = Result<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    /// The runtime went away; everything fails with `RuntimeUnavailable`.
    Orphaned,
    /// The channel was closed; blocked receivers fail with `Cancelled`.
    Closed,
}

struct Subscription {
    id: u64,
    /// `None` matches every topic.
    topic: Option<Topic>,
    callback: EventCallback,
    /// Cleared once the dispatcher has handed it the queued events it
    /// matches. Live events only go to active subscriptions.
    pending: bool,
}

impl Subscription {
    fn wants(&self, delivery: &Delivery) -> bool {
        matches!(
            delivery,
            Ok(message) if message.kind() == MessageKind::Event
                && !message.topic().is_kill()
                && self.topic.is_none_or(|topic| topic == message.topic())
        )
    }
}

struct State {
    queue: VecDeque<Delivery>,
    queued_events: usize,
    status: Status,
    interrupts: u64,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    /// Requests sent from this channel whose response was not taken yet.
    outstanding: usize,
}

/// Events handed to one subscription in a single dispatcher pass.
type Batch = (EventCallback, Vec<Message>);

/// Outbound queue of one channel endpoint.
pub(crate) struct Mailbox {
    channel: Handle,
    runtime: Handle,
    event_backlog: usize,
    response_backlog: usize,
    state: Mutex<State>,
    ready: Condvar,
    /// Held by the dispatcher while it runs subscriber callbacks.
    callbacks: Mutex<()>,
}

fn is_event(delivery: &Delivery) -> bool {
    matches!(delivery, Ok(message) if message.kind() == MessageKind::Event)
}

/// Whether a caller may wait for running callbacks to finish. Callbacks run
/// inside the dispatcher, and waiting there could deadlock.
fn may_wait_for_callbacks() -> bool {
    tokio::runtime::Handle::try_current().is_err()
}

impl Mailbox {
    pub(crate) fn new(
        channel: Handle,
        runtime: Handle,
        event_backlog: usize,
        response_backlog: usize,
    ) -> Self {
        Self {
            channel,
            runtime,
            event_backlog,
            response_backlog,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                queued_events: 0,
                status: Status::Open,
                interrupts: 0,
                subscriptions: Vec::new(),
                next_subscription: 1,
                outstanding: 0,
            }),
            ready: Condvar::new(),
            callbacks: Mutex::new(()),
        }
    }

    /// Counts a request whose response will land here. Fails with
    /// `QueueFull` once `response_backlog` responses are outstanding.
    pub(crate) fn reserve_response(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if state.outstanding >= self.response_backlog {
            return Err(Error::QueueFull(self.response_backlog));
        }
        state.outstanding += 1;
        Ok(())
    }

    /// Returns a reservation whose request never made it to the runtime.
    pub(crate) fn cancel_response(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    /// Queues a response, error or event, or hands an event to the matching
    /// subscriptions. Dispatcher only. Returns `false` if the mailbox no
    /// longer accepts deliveries.
    pub(crate) fn deliver(&self, delivery: Delivery) -> bool {
        let mut state = self.state.lock();
        if state.status != Status::Open {
            return false;
        }
        if !is_event(&delivery) {
            state.queue.push_back(delivery);
            drop(state);
            self.ready.notify_one();
            return true;
        }

        let batches = Self::take_backlog(&mut state);
        let is_kill = matches!(&delivery, Ok(message) if message.topic().is_kill());
        if is_kill && !state.subscriptions.is_empty() {
            debug!(
                channel = %self.channel,
                subscriptions = state.subscriptions.len(),
                "Kill event ended subscriptions"
            );
            state.subscriptions.clear();
        }
        let targets: Vec<EventCallback> = state
            .subscriptions
            .iter()
            .filter(|subscription| subscription.wants(&delivery))
            .map(|subscription| Arc::clone(&subscription.callback))
            .collect();

        if targets.is_empty() {
            self.queue_event(&mut state, delivery);
            drop(state);
            self.ready.notify_one();
            self.run(batches);
        } else {
            drop(state);
            self.run(batches);
            if let Ok(message) = delivery {
                self.run(targets.into_iter().map(|callback| (callback, vec![message.clone()])));
            }
        }
        true
    }

    fn queue_event(&self, state: &mut State, event: Delivery) {
        if state.queued_events >= self.event_backlog
            && let Some(oldest) = state.queue.iter().position(is_event)
        {
            state.queue.remove(oldest);
            state.queued_events -= 1;
            warn!(
                channel = %self.channel,
                backlog = self.event_backlog,
                "Event backlog full; dropped oldest event"
            );
        }
        state.queued_events += 1;
        state.queue.push_back(event);
    }

    /// Activates pending subscriptions, moving the queued events each one
    /// matches out of the queue.
    fn take_backlog(state: &mut State) -> Vec<Batch> {
        let State {
            queue,
            queued_events,
            subscriptions,
            ..
        } = state;
        let mut batches = Vec::new();
        for subscription in subscriptions.iter_mut().filter(|s| s.pending) {
            subscription.pending = false;
            let (matching, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(queue)
                .into_iter()
                .partition(|delivery| subscription.wants(delivery));
            *queue = rest;
            *queued_events -= matching.len();
            let events: Vec<_> = matching.into_iter().flatten().collect();
            if !events.is_empty() {
                batches.push((Arc::clone(&subscription.callback), events));
            }
        }
        batches
    }

    /// Hands queued events to subscriptions registered since the last
    /// delivery. Dispatcher only.
    pub(crate) fn activate(&self) {
        let batches = Self::take_backlog(&mut self.state.lock());
        self.run(batches);
    }

    fn run(&self, batches: impl IntoIterator<Item = Batch>) {
        let _running = self.callbacks.lock();
        for (callback, events) in batches {
            for event in events {
                let id = event.id();
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                    warn!(
                        channel = %self.channel,
                        event = id,
                        panic = %crate::dispatcher::panic_message(panic.as_ref()),
                        "Event subscriber panicked"
                    );
                }
            }
        }
    }

    /// Registers a subscription for `topic` (every topic when `None`) and
    /// returns its id, plus whether queued events are waiting for the
    /// dispatcher to hand them over.
    pub(crate) fn subscribe(
        &self,
        topic: Option<Topic>,
        callback: EventCallback,
    ) -> Result<(u64, bool)> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let id = state.next_subscription;
        state.next_subscription += 1;
        let mut subscription = Subscription {
            id,
            topic,
            callback,
            pending: false,
        };
        let pending = state.queue.iter().any(|d| subscription.wants(d));
        subscription.pending = pending;
        state.subscriptions.push(subscription);
        Ok((id, pending))
    }

    /// Removes a subscription. Called outside the dispatcher, it also waits
    /// for a callback that is running right now.
    pub(crate) fn unsubscribe(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let Some(index) = state.subscriptions.iter().position(|s| s.id == id) else {
            return Err(Error::InvalidArgument(format!(
                "unknown subscription {id} on {}",
                self.channel
            )));
        };
        state.subscriptions.remove(index);
        drop(state);
        if may_wait_for_callbacks() {
            drop(self.callbacks.lock());
        }
        Ok(())
    }

    /// Counter bumped by [`Mailbox::interrupt`]; receivers snapshot it when
    /// they start waiting.
    pub(crate) fn interrupt_epoch(&self) -> u64 {
        self.state.lock().interrupts
    }

    pub(crate) fn interrupt(&self) {
        self.state.lock().interrupts += 1;
        self.ready.notify_all();
    }

    /// Invalidates the mailbox because its runtime was destroyed. Returns the
    /// number of undelivered messages discarded.
    pub(crate) fn orphan(&self) -> usize {
        self.shut(Status::Orphaned)
    }

    pub(crate) fn close(&self) -> usize {
        let discarded = self.shut(Status::Closed);
        if may_wait_for_callbacks() {
            drop(self.callbacks.lock());
        }
        discarded
    }

    fn shut(&self, status: Status) -> usize {
        let mut state = self.state.lock();
        if state.status != Status::Open {
            return 0;
        }
        state.status = status;
        state.subscriptions.clear();
        state.queued_events = 0;
        state.outstanding = 0;
        let discarded = state.queue.len();
        state.queue.clear();
        drop(state);
        self.ready.notify_all();
        if discarded > 0 {
            debug!(channel = %self.channel, discarded, "Discarded undelivered messages");
        }
        discarded
    }

    fn check_open(&self, state: &State) -> Result<()> {
        match state.status {
            Status::Open => Ok(()),
            Status::Orphaned => Err(Error::RuntimeUnavailable(self.runtime)),
            Status::Closed => Err(Error::Cancelled),
        }
    }

    fn take(&self, state: &mut State, epoch: u64) -> Result<Option<Message>> {
        self.check_open(state)?;
        if state.interrupts != epoch {
            return Err(Error::Cancelled);
        }
        match state.queue.pop_front() {
            Some(delivery) => {
                if is_event(&delivery) {
                    state.queued_events -= 1;
                } else {
                    state.outstanding = state.outstanding.saturating_sub(1);
                }
                delivery.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Takes the next delivery without waiting.
    pub(crate) fn poll(&self, epoch: u64) -> Result<Option<Message>> {
        let mut state = self.state.lock();
        self.take(&mut state, epoch)
    }

    /// Waits for the next delivery until `deadline` (`None` waits until woken
    /// by a delivery, an interrupt, or invalidation). `Ok(None)` means the
    /// deadline passed.
    pub(crate) fn wait(&self, epoch: u64, deadline: Option<Instant>) -> Result<Option<Message>> {
        let mut state = self.state.lock();
        loop {
            if let Some(message) = self.take(&mut state, epoch)? {
                return Ok(Some(message));
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    self.ready.wait_until(&mut state, deadline);
                }
                None => self.ready.wait(&mut state),
            }
        }
    }
}
