use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    channel::Timeout,
    config::{RuntimeConfig, RuntimeMode},
    dispatcher::{Dispatcher, EndpointSet, Inbound},
    error::{Error, Result},
    handle::Handle,
    handler::Handler,
    mailbox::Mailbox,
    message::{Message, MessageKind, Topic},
};

/// Longest a cooperative receiver drives the runtime before re-checking its
/// own mailbox and deadline.
const DRIVE_SLICE: Duration = Duration::from_millis(10);

/// Snapshot of a live runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub mode: RuntimeMode,
    /// Channels currently bound to the runtime.
    pub channels: usize,
    /// Messages waiting in the inbound queue.
    pub pending: usize,
}

enum Engine {
    Threaded {
        rt: tokio::runtime::Runtime,
        task: JoinHandle<()>,
    },
    Cooperative {
        rt: tokio::runtime::Runtime,
        dispatcher: Dispatcher,
    },
}

pub(crate) struct Runtime {
    handle: Handle,
    config: RuntimeConfig,
    terminated: AtomicBool,
    inbound: mpsc::Sender<Inbound>,
    endpoints: Arc<EndpointSet>,
    ids: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    /// `None` once destroyed. In cooperative mode this is also the driver
    /// lock: whoever holds it runs the dispatcher.
    engine: Mutex<Option<Engine>>,
}

impl Runtime {
    pub(crate) fn start(
        handle: Handle,
        config: RuntimeConfig,
        handler: Box<dyn Handler>,
    ) -> Result<Self> {
        let (inbound, receiver) = mpsc::channel(config.inbound_capacity);
        let endpoints = Arc::new(EndpointSet::default());
        let ids = Arc::new(AtomicU64::new(1));
        let (shutdown, _) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            handle,
            receiver,
            handler,
            Arc::clone(&endpoints),
            Arc::clone(&ids),
        );

        let engine = match config.mode {
            RuntimeMode::Threaded => {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(config.worker_threads)
                    .thread_name(config.thread_name.clone())
                    .enable_all()
                    .build()
                    .map_err(|e| Error::Initialization(e.to_string()))?;
                let task = rt.spawn(dispatcher.run(shutdown.subscribe()));
                Engine::Threaded { rt, task }
            }
            RuntimeMode::Cooperative => {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| Error::Initialization(e.to_string()))?;
                Engine::Cooperative { rt, dispatcher }
            }
        };

        Ok(Self {
            handle,
            config,
            terminated: AtomicBool::new(false),
            inbound,
            endpoints,
            ids,
            shutdown,
            engine: Mutex::new(Some(engine)),
        })
    }

    pub(crate) const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::RuntimeUnavailable(self.handle));
        }
        Ok(())
    }

    fn enqueue(&self, item: Inbound) -> Result<()> {
        self.ensure_running()?;
        self.inbound.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull(self.config.inbound_capacity),
            mpsc::error::TrySendError::Closed(_) => Error::RuntimeUnavailable(self.handle),
        })
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Binds a channel's mailbox to this runtime.
    pub(crate) fn register(&self, channel: Handle, mailbox: &Arc<Mailbox>) -> Result<()> {
        if self.endpoints.register(channel, mailbox) {
            Ok(())
        } else {
            Err(Error::InvalidRuntime(self.handle))
        }
    }

    pub(crate) fn deregister(&self, channel: Handle) {
        self.endpoints.deregister(channel);
    }

    /// Enqueues a request or event from `mailbox`'s channel and returns the
    /// id assigned to it.
    pub(crate) fn send(&self, mailbox: &Arc<Mailbox>, message: Message) -> Result<u64> {
        let kind = message.kind();
        if kind == MessageKind::Response {
            return Err(Error::InvalidArgument(
                "channels cannot send responses".to_string(),
            ));
        }
        self.ensure_running()?;
        let id = self.next_id();
        let message = message.with_id(id);
        let item = if kind == MessageKind::Request {
            mailbox.reserve_response()?;
            Inbound::Request {
                message,
                reply_to: Arc::downgrade(mailbox),
            }
        } else {
            Inbound::Event { message }
        };
        if let Err(err) = self.enqueue(item) {
            if kind == MessageKind::Request {
                mailbox.cancel_response();
            }
            return Err(err);
        }
        debug!(runtime = %self.handle, id, kind = kind.as_str(), "Message enqueued");
        Ok(id)
    }

    /// Enqueues a host event that is broadcast to every bound channel.
    pub(crate) fn publish(&self, topic: Topic, payload: Bytes) -> Result<u64> {
        self.ensure_running()?;
        let id = self.next_id();
        let event = Message::event(payload).with_id(id).with_topic(topic);
        self.enqueue(Inbound::Broadcast(event))?;
        Ok(id)
    }

    /// Asks the dispatcher to hand queued events to `mailbox`'s new
    /// subscriptions. With the inbound queue full, the next event delivered
    /// to the channel does it instead.
    pub(crate) fn activate(&self, mailbox: &Arc<Mailbox>) {
        if let Err(err) = self.enqueue(Inbound::Activate(Arc::downgrade(mailbox))) {
            debug!(runtime = %self.handle, %err, "Subscription activation deferred");
        }
    }

    /// Runs up to `max` pending messages on the calling thread. Threaded
    /// runtimes drive themselves and always report 0.
    pub(crate) fn step(&self, max: usize) -> Result<usize> {
        self.ensure_running()?;
        Ok(self.drive(max, None, true)?.unwrap_or(0))
    }

    /// Runs the cooperative dispatcher on the calling thread until `max`
    /// items completed or `deadline` passed. Returns `None` when there is
    /// nothing to drive: the runtime is threaded, or `wait_for_driver` is
    /// unset and another thread is driving it.
    fn drive(
        &self,
        max: usize,
        deadline: Option<Instant>,
        wait_for_driver: bool,
    ) -> Result<Option<usize>> {
        if self.config.mode == RuntimeMode::Threaded {
            return Ok(None);
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::InvalidArgument(
                "cooperative runtimes cannot be driven from inside an async context".to_string(),
            ));
        }
        let mut engine = if wait_for_driver {
            self.engine.lock()
        } else {
            let Some(engine) = self.engine.try_lock() else {
                return Ok(None);
            };
            engine
        };
        let processed = match engine.as_mut() {
            None => return Err(Error::RuntimeUnavailable(self.handle)),
            Some(Engine::Threaded { .. }) => return Ok(None),
            Some(Engine::Cooperative { rt, dispatcher }) => {
                let mut shutdown = self.shutdown.subscribe();
                rt.block_on(dispatcher.drive(max, deadline, &mut shutdown))
            }
        };
        drop(engine);
        self.reap();
        Ok(Some(processed))
    }

    /// Waits for the next delivery to `mailbox`. In cooperative mode the
    /// caller drives the runtime while it waits, one item per slice, so an
    /// idle channel still times out on schedule.
    pub(crate) fn receive(&self, mailbox: &Mailbox, timeout: Timeout) -> Result<Message> {
        self.ensure_running()?;
        let epoch = mailbox.interrupt_epoch();
        let deadline = timeout.deadline(Instant::now());

        if self.config.mode == RuntimeMode::Threaded {
            return mailbox
                .wait(epoch, deadline)?
                .ok_or(Error::Timeout(timeout.duration()));
        }

        let mut driven = false;
        loop {
            if let Some(message) = mailbox.poll(epoch)? {
                return Ok(message);
            }
            self.ensure_running()?;
            let now = Instant::now();
            if driven && deadline.is_some_and(|deadline| now >= deadline) {
                return Err(Error::Timeout(timeout.duration()));
            }
            let slice_end = deadline.map_or(now + DRIVE_SLICE, |d| d.min(now + DRIVE_SLICE));
            driven = true;
            if self.drive(1, Some(slice_end), false)?.is_none()
                && let Some(message) = mailbox.wait(epoch, Some(slice_end))?
            {
                return Ok(message);
            }
        }
    }

    #[must_use]
    pub(crate) fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            mode: self.config.mode,
            channels: self.endpoints.len(),
            pending: self.pending(),
        }
    }

    fn pending(&self) -> usize {
        self.inbound.max_capacity() - self.inbound.capacity()
    }

    /// Fences and tears down the runtime. In-flight work is cancelled and
    /// undelivered messages are discarded. Idempotent, and safe to call from
    /// subscriber callbacks: a runtime being driven on this thread is torn
    /// down by its driver once the drive returns.
    pub(crate) fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);

        let orphaned = self.endpoints.close();
        let discarded: usize = orphaned.iter().map(|mailbox| mailbox.orphan()).sum();
        let pending = self.pending();

        let engine = if tokio::runtime::Handle::try_current().is_ok() {
            match self.engine.try_lock() {
                Some(mut engine) => engine.take(),
                None => {
                    debug!(runtime = %self.handle, "Runtime is being driven; teardown deferred");
                    None
                }
            }
        } else {
            // Blocks until a cooperative driver notices the shutdown signal.
            self.engine.lock().take()
        };
        if let Some(engine) = engine {
            self.teardown(engine);
        }

        info!(
            runtime = %self.handle,
            channels = orphaned.len(),
            discarded,
            pending,
            "Runtime destroyed"
        );
    }

    /// Finishes a teardown that [`Runtime::shutdown`] had to defer.
    fn reap(&self) {
        if !self.terminated.load(Ordering::Acquire) {
            return;
        }
        if let Some(engine) = self.engine.try_lock().and_then(|mut engine| engine.take()) {
            self.teardown(engine);
        }
    }

    fn teardown(&self, engine: Engine) {
        let rt = match engine {
            Engine::Threaded { rt, task } => {
                task.abort();
                rt
            }
            Engine::Cooperative { rt, dispatcher } => {
                drop(dispatcher);
                rt
            }
        };
        // Waiting for worker threads is not allowed inside an async context.
        if tokio::runtime::Handle::try_current().is_ok() {
            rt.shutdown_background();
        } else {
            rt.shutdown_timeout(self.config.shutdown_timeout());
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(engine) = self.engine.get_mut().take() {
            self.teardown(engine);
        }
    }
}
