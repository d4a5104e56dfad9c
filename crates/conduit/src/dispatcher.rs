use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::{
    error::Error,
    handle::Handle,
    handler::{Events, Handler},
    mailbox::Mailbox,
    message::Message,
};

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Work item on a runtime's inbound queue.
pub(crate) enum Inbound {
    /// Answered into `reply_to`, if that channel is still around.
    Request {
        message: Message,
        reply_to: Weak<Mailbox>,
    },
    /// Sent by a channel, handed to [`Handler::on_event`].
    Event { message: Message },
    /// Published by the host, delivered to every bound channel as is.
    Broadcast(Message),
    /// Hands queued events to the channel's new subscriptions.
    Activate(Weak<Mailbox>),
}

#[derive(Default)]
struct Members {
    closed: bool,
    mailboxes: HashMap<Handle, Weak<Mailbox>>,
}

/// Channels bound to a runtime. Non-owning: it only exists so that events
/// can be fanned out and destruction can invalidate every endpoint.
#[derive(Default)]
pub(crate) struct EndpointSet {
    members: Mutex<Members>,
}

impl EndpointSet {
    /// Returns `false` once the set was closed by runtime destruction.
    pub(crate) fn register(&self, channel: Handle, mailbox: &Arc<Mailbox>) -> bool {
        let mut members = self.members.lock();
        if members.closed {
            return false;
        }
        members.mailboxes.insert(channel, Arc::downgrade(mailbox));
        true
    }

    pub(crate) fn deregister(&self, channel: Handle) {
        self.members.lock().mailboxes.remove(&channel);
    }

    pub(crate) fn len(&self) -> usize {
        self.members.lock().mailboxes.len()
    }

    fn snapshot(&self) -> Vec<Arc<Mailbox>> {
        let mut members = self.members.lock();
        members.mailboxes.retain(|_, mailbox| mailbox.strong_count() > 0);
        members.mailboxes.values().filter_map(Weak::upgrade).collect()
    }

    /// Closes the set and hands back every live member.
    pub(crate) fn close(&self) -> Vec<Arc<Mailbox>> {
        let mut members = self.members.lock();
        members.closed = true;
        members
            .mailboxes
            .drain()
            .filter_map(|(_, mailbox)| mailbox.upgrade())
            .collect()
    }
}

/// Where handler output goes: responses to their requesting channel, events
/// to every bound channel under a fresh id.
#[derive(Clone)]
struct Outlet {
    runtime: Handle,
    endpoints: Arc<EndpointSet>,
    ids: Arc<AtomicU64>,
}

impl Outlet {
    fn emit(&self, events: Events) {
        for event in events.into_messages() {
            let id = self.ids.fetch_add(1, Ordering::Relaxed);
            self.fan_out(&event.with_id(id));
        }
    }

    fn fan_out(&self, event: &Message) {
        let mailboxes = self.endpoints.snapshot();
        debug!(
            runtime = %self.runtime,
            event = event.id(),
            topic = %event.topic(),
            channels = mailboxes.len(),
            "Broadcasting event"
        );
        for mailbox in mailboxes {
            mailbox.deliver(Ok(event.clone()));
        }
    }
}

/// Runs one item to completion and hands the handler back.
async fn dispatch(
    mut handler: Box<dyn Handler>,
    item: Inbound,
    outlet: Outlet,
) -> Box<dyn Handler> {
    let runtime = outlet.runtime;
    let mut events = Events::default();
    match item {
        Inbound::Request { message, reply_to } => {
            let outcome = AssertUnwindSafe(handler.on_request(&message, &mut events))
                .catch_unwind()
                .await;
            let delivery = match outcome {
                Ok(Ok(payload)) => Ok(Message::response(message.id(), payload)),
                Ok(Err(err)) => {
                    debug!(%runtime, request = message.id(), %err, "Request failed");
                    Err(Error::Execution(err.to_string()))
                }
                Err(panic) => {
                    let panic = panic_message(panic.as_ref());
                    warn!(%runtime, request = message.id(), %panic, "Handler panicked");
                    Err(Error::Execution(format!("handler panicked: {panic}")))
                }
            };
            match reply_to.upgrade() {
                Some(mailbox) if mailbox.deliver(delivery) => {}
                _ => debug!(
                    %runtime,
                    request = message.id(),
                    "Requesting channel is gone; dropped response"
                ),
            }
        }
        Inbound::Event { message } => {
            let outcome = AssertUnwindSafe(handler.on_event(&message, &mut events))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(%runtime, event = message.id(), %err, "Event handler failed");
                }
                Err(panic) => {
                    let panic = panic_message(panic.as_ref());
                    warn!(%runtime, event = message.id(), %panic, "Handler panicked");
                }
            }
        }
        Inbound::Broadcast(message) => outlet.fan_out(&message),
        Inbound::Activate(mailbox) => {
            if let Some(mailbox) = mailbox.upgrade() {
                mailbox.activate();
            }
        }
    }
    outlet.emit(events);
    handler
}

type InFlight = Pin<Box<dyn Future<Output = Box<dyn Handler>> + Send>>;

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Single consumer of a runtime's inbound queue and sole owner of its
/// handler. Threaded runtimes move it into a task ([`Dispatcher::run`]);
/// cooperative runtimes keep it behind the driver lock ([`Dispatcher::drive`]).
///
/// The handler moves into the item being processed and comes back when it
/// completes, so an item interrupted by a deadline resumes on the next call.
pub(crate) struct Dispatcher {
    outlet: Outlet,
    inbound: mpsc::Receiver<Inbound>,
    handler: Option<Box<dyn Handler>>,
    in_flight: Option<InFlight>,
}

impl Dispatcher {
    pub(crate) fn new(
        runtime: Handle,
        inbound: mpsc::Receiver<Inbound>,
        handler: Box<dyn Handler>,
        endpoints: Arc<EndpointSet>,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            outlet: Outlet {
                runtime,
                endpoints,
                ids,
            },
            inbound,
            handler: Some(handler),
            in_flight: None,
        }
    }

    fn begin(&mut self, item: Inbound) {
        if let Some(handler) = self.handler.take() {
            self.in_flight = Some(Box::pin(dispatch(handler, item, self.outlet.clone())));
        }
    }

    /// Completes the item in flight, if any. Dropping the returned future
    /// keeps the item in flight.
    async fn finish(&mut self) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            let handler = in_flight.await;
            self.in_flight = None;
            self.handler = Some(handler);
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let runtime = self.outlet.runtime;
        debug!(%runtime, "Dispatcher started");
        loop {
            if self.in_flight.is_none() {
                let item = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    item = self.inbound.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                self.begin(item);
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!(%runtime, "Cancelled in-flight message");
                    break;
                }
                () = self.finish() => {}
            }
        }
        debug!(%runtime, "Dispatcher stopped");
    }

    /// Processes up to `max` items and returns how many completed.
    ///
    /// Without a `deadline` it returns as soon as the queue is empty. With
    /// one, it waits for work until the deadline, starts nothing new once
    /// the deadline passed, and leaves an item still running at the deadline
    /// in flight for the next call.
    pub(crate) async fn drive(
        &mut self,
        max: usize,
        deadline: Option<Instant>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> usize {
        let mut processed = 0;
        while processed < max && !*shutdown.borrow() {
            if self.in_flight.is_none() {
                if processed > 0 && deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    break;
                }
                let item = match self.inbound.try_recv() {
                    Ok(item) => item,
                    Err(mpsc::error::TryRecvError::Empty) => {
                        let Some(deadline) = deadline.filter(|_| processed == 0) else {
                            break;
                        };
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => break,
                            item = self.inbound.recv() => match item {
                                Some(item) => item,
                                None => break,
                            },
                            () = expire(Some(deadline)) => break,
                        }
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                };
                self.begin(item);
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                () = self.finish() => processed += 1,
                () = expire(deadline) => break,
            }
        }
        processed
    }
}
