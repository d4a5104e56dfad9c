use std::{
    collections::HashSet,
    sync::{
        Arc, Barrier, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use conduit::{
    BoxError, Bridge, BridgeConfig, ErrorKind, Events, Handle, Handler, Message, MessageKind,
    RuntimeConfig, RuntimeMode, Timeout, Topic,
};

const SECOND: Duration = Duration::from_secs(1);

fn threaded() -> Bridge {
    Bridge::new(BridgeConfig::default())
}

fn cooperative() -> Bridge {
    Bridge::new(BridgeConfig {
        runtime: RuntimeConfig::cooperative(),
        ..BridgeConfig::default()
    })
}

fn receive(bridge: &Bridge, channel: Handle, timeout: impl Into<Timeout>) -> Result<Message> {
    Ok(bridge.receive(channel, timeout).into_result()?)
}

fn error_kind(bridge: &Bridge, channel: Handle, timeout: impl Into<Timeout>) -> Option<ErrorKind> {
    bridge
        .receive(channel, timeout)
        .error()
        .map(conduit::Error::kind)
}

fn scripted(config: RuntimeConfig) -> Bridge {
    Bridge::with_handler(
        BridgeConfig {
            runtime: config,
            ..BridgeConfig::default()
        },
        || Box::new(Scripted),
    )
}

/// Polls `slot` until something was recorded in it.
fn wait_for<T: Clone>(slot: &Mutex<Option<T>>) -> Option<T> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Some(value) = slot.lock().expect("lock").clone() {
            return Some(value);
        }
        thread::sleep(Duration::from_millis(5));
    }
    None
}

type Seen = Arc<Mutex<Vec<(Topic, Bytes)>>>;

fn recorder() -> (Seen, impl Fn(Message) + Send + Sync + 'static) {
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    (seen, move |event: Message| {
        sink.lock()
            .expect("lock")
            .push((event.topic(), event.into_payload()));
    })
}

/// Answers `fail` with an error, `slow` after a long delay, `nap` after a
/// short one, and emits an event for `announce`.
struct Scripted;

#[async_trait]
impl Handler for Scripted {
    async fn on_request(
        &mut self,
        request: &Message,
        events: &mut Events,
    ) -> std::result::Result<Bytes, BoxError> {
        match request.payload().as_ref() {
            b"fail" => Err(std::io::Error::other("script failed").into()),
            b"slow" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Bytes::from_static(b"too late"))
            }
            b"nap" => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Bytes::from_static(b"rested"))
            }
            b"announce" => {
                events.emit("announcement");
                Ok(Bytes::from_static(b"announced"))
            }
            other => Ok(Bytes::copy_from_slice(other)),
        }
    }
}

#[test]
fn ping_then_destroy() -> Result<()> {
    let bridge = threaded();
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;

    let id = bridge.request(channel, "ping")?;
    let start = Instant::now();
    let response = receive(&bridge, channel, SECOND)?;
    assert!(start.elapsed() < SECOND);
    assert_eq!(response.kind(), MessageKind::Response);
    assert_eq!(response.id(), id);
    assert_eq!(response.payload().as_ref(), b"ping");

    bridge.destroy_runtime(runtime)?;
    let err = bridge.request(channel, "ping").expect_err("runtime is gone");
    assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);
    assert_eq!(
        error_kind(&bridge, channel, Timeout::Poll),
        Some(ErrorKind::RuntimeUnavailable)
    );

    // the orphaned channel can still be closed, once
    bridge.close(channel)?;
    assert_eq!(
        bridge.close(channel).expect_err("second close").kind(),
        ErrorKind::NotFound
    );
    Ok(())
}

#[test]
fn live_runtime_handles_are_distinct() -> Result<()> {
    let bridge = threaded();
    let handles = (0..8)
        .map(|_| {
            bridge.create_runtime_with_config(RuntimeConfig {
                worker_threads: 1,
                ..RuntimeConfig::default()
            })
        })
        .collect::<conduit::Result<Vec<_>>>()?;
    let unique: HashSet<_> = handles.iter().copied().collect();
    assert_eq!(unique.len(), handles.len());
    assert!(handles.iter().all(|h| !h.is_null()));
    Ok(())
}

#[test]
fn create_client_on_unknown_runtime_fails() -> Result<()> {
    let bridge = threaded();
    let bogus = Handle::from_raw(0xdead_beef);
    let err = bridge.create_client(bogus).expect_err("never created");
    assert_eq!(err.kind(), ErrorKind::InvalidRuntime);
    let err = bridge.create_client(Handle::NULL).expect_err("null handle");
    assert_eq!(err.kind(), ErrorKind::InvalidRuntime);

    let runtime = bridge.create_runtime()?;
    bridge.destroy_runtime(runtime)?;
    let err = bridge.create_client(runtime).expect_err("destroyed");
    assert_eq!(err.kind(), ErrorKind::InvalidRuntime);
    Ok(())
}

#[test]
fn stale_runtime_handle_does_not_alias_new_runtime() -> Result<()> {
    let bridge = threaded();
    let old = bridge.create_runtime()?;
    bridge.destroy_runtime(old)?;
    let new = bridge.create_runtime()?;
    assert_ne!(old, new);
    assert_eq!(
        bridge.destroy_runtime(old).expect_err("stale").kind(),
        ErrorKind::NotFound
    );
    bridge.destroy_runtime(new)?;
    Ok(())
}

#[test]
fn receive_times_out_when_nothing_arrives() -> Result<()> {
    let bridge = threaded();
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;

    let start = Instant::now();
    assert_eq!(
        error_kind(&bridge, channel, Duration::from_millis(50)),
        Some(ErrorKind::Timeout)
    );
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(
        error_kind(&bridge, channel, Timeout::Poll),
        Some(ErrorKind::Timeout)
    );
    Ok(())
}

#[test]
fn receive_wakes_when_concurrent_send_lands() -> Result<()> {
    let bridge = Arc::new(threaded());
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;

    let sender = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            bridge.request(channel, "late")
        })
    };
    let response = receive(&bridge, channel, Duration::from_secs(5))?;
    sender.join().expect("sender thread")?;
    assert_eq!(response.payload().as_ref(), b"late");
    Ok(())
}

#[test]
fn responses_arrive_in_send_order() -> Result<()> {
    let bridge = threaded();
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;

    let sent = (0..50)
        .map(|i| bridge.request(channel, format!("msg-{i}")))
        .collect::<conduit::Result<Vec<_>>>()?;
    for (i, id) in sent.into_iter().enumerate() {
        let response = receive(&bridge, channel, SECOND)?;
        assert_eq!(response.id(), id);
        assert_eq!(response.payload().as_ref(), format!("msg-{i}").as_bytes());
    }
    Ok(())
}

#[test]
fn concurrent_destroy_succeeds_exactly_once() -> Result<()> {
    const THREADS: usize = 8;

    let bridge = Arc::new(threaded());
    let runtime = bridge.create_runtime()?;
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                bridge.destroy_runtime(runtime)
            })
        })
        .collect();
    let results: Vec<_> = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker thread"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.kind() == ErrorKind::NotFound)
    );
    Ok(())
}

#[test]
fn forever_receive_is_released_by_interrupt_close_and_destroy() -> Result<()> {
    let bridge = Arc::new(threaded());
    let runtime = bridge.create_runtime()?;

    let blocked = |channel: Handle| {
        let bridge = Arc::clone(&bridge);
        let waiter = thread::spawn(move || error_kind(&bridge, channel, Timeout::Forever));
        thread::sleep(Duration::from_millis(30));
        waiter
    };

    let channel = bridge.create_client(runtime)?;
    let waiter = blocked(channel);
    bridge.interrupt(channel)?;
    assert_eq!(waiter.join().expect("waiter"), Some(ErrorKind::Cancelled));

    let waiter = blocked(channel);
    bridge.close(channel)?;
    assert_eq!(waiter.join().expect("waiter"), Some(ErrorKind::Cancelled));

    let channel = bridge.create_client(runtime)?;
    let waiter = blocked(channel);
    bridge.destroy_runtime(runtime)?;
    assert_eq!(
        waiter.join().expect("waiter"),
        Some(ErrorKind::RuntimeUnavailable)
    );
    Ok(())
}

#[test]
fn destroy_cancels_in_flight_request() -> Result<()> {
    let bridge = Arc::new(Bridge::with_handler(BridgeConfig::default(), || {
        Box::new(Scripted)
    }));
    let runtime = bridge.create_runtime_with_config(RuntimeConfig {
        shutdown_timeout_ms: 100,
        ..RuntimeConfig::default()
    })?;
    let channel = bridge.create_client(runtime)?;
    bridge.request(channel, "slow")?;
    bridge.request(channel, "queued behind slow")?;

    let start = Instant::now();
    thread::sleep(Duration::from_millis(20));
    bridge.destroy_runtime(runtime)?;
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(
        error_kind(&bridge, channel, Timeout::Poll),
        Some(ErrorKind::RuntimeUnavailable)
    );
    Ok(())
}

#[test]
fn handler_failure_only_affects_its_request() -> Result<()> {
    let bridge = Bridge::with_handler(BridgeConfig::default(), || Box::new(Scripted));
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;

    bridge.request(channel, "before")?;
    bridge.request(channel, "fail")?;
    bridge.request(channel, "after")?;

    assert_eq!(receive(&bridge, channel, SECOND)?.payload().as_ref(), b"before");
    let err = bridge
        .receive(channel, SECOND)
        .into_result()
        .expect_err("handler failed");
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.to_string().contains("script failed"));
    assert_eq!(receive(&bridge, channel, SECOND)?.payload().as_ref(), b"after");
    Ok(())
}

#[test]
fn cooperative_runtime_runs_only_when_driven() -> Result<()> {
    let bridge = cooperative();
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;

    for i in 0..3 {
        bridge.request(channel, format!("job-{i}"))?;
    }
    assert_eq!(bridge.runtime_info(runtime)?.pending, 3);
    assert_eq!(bridge.step(runtime, 2)?, 2);
    assert_eq!(bridge.runtime_info(runtime)?.pending, 1);

    let first = receive(&bridge, channel, Timeout::Poll)?;
    assert_eq!(first.payload().as_ref(), b"job-0");
    // the receiver drives the remaining job itself
    assert_eq!(receive(&bridge, channel, SECOND)?.payload().as_ref(), b"job-1");
    assert_eq!(receive(&bridge, channel, SECOND)?.payload().as_ref(), b"job-2");
    assert_eq!(bridge.step(runtime, 10)?, 0);
    Ok(())
}

#[test]
fn cooperative_receive_times_out_and_drives_concurrently() -> Result<()> {
    let bridge = Arc::new(cooperative());
    let runtime = bridge.create_runtime()?;
    assert_eq!(bridge.runtime_info(runtime)?.mode, RuntimeMode::Cooperative);

    let start = Instant::now();
    let idle = bridge.create_client(runtime)?;
    assert_eq!(
        error_kind(&bridge, idle, Duration::from_millis(40)),
        Some(ErrorKind::Timeout)
    );
    assert!(start.elapsed() >= Duration::from_millis(40));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || -> Result<Bytes> {
                let channel = bridge.create_client(runtime)?;
                bridge.request(channel, format!("worker-{i}"))?;
                Ok(receive(&bridge, channel, Duration::from_secs(5))?.into_payload())
            })
        })
        .collect();
    for (i, worker) in workers.into_iter().enumerate() {
        let payload = worker.join().expect("worker thread")?;
        assert_eq!(payload.as_ref(), format!("worker-{i}").as_bytes());
    }
    Ok(())
}

#[test]
fn threaded_step_is_a_no_op() -> Result<()> {
    let bridge = threaded();
    let runtime = bridge.create_runtime()?;
    assert_eq!(bridge.step(runtime, 16)?, 0);
    Ok(())
}

#[test]
fn events_fan_out_to_every_channel() -> Result<()> {
    let bridge = Bridge::with_handler(BridgeConfig::default(), || Box::new(Scripted));
    let runtime = bridge.create_runtime()?;
    let speaker = bridge.create_client(runtime)?;
    let listener = bridge.create_client(runtime)?;
    assert_eq!(bridge.runtime_info(runtime)?.channels, 2);

    bridge.request(speaker, "announce")?;
    let response = receive(&bridge, speaker, SECOND)?;
    assert_eq!(response.payload().as_ref(), b"announced");
    for channel in [speaker, listener] {
        let event = receive(&bridge, channel, SECOND)?;
        assert_eq!(event.kind(), MessageKind::Event);
        assert_eq!(event.payload().as_ref(), b"announcement");
    }

    let id = bridge.publish(runtime, "from host")?;
    for channel in [speaker, listener] {
        let event = receive(&bridge, channel, SECOND)?;
        assert_eq!(event.id(), id);
        assert_eq!(event.payload().as_ref(), b"from host");
    }

    bridge.close(listener)?;
    assert_eq!(bridge.runtime_info(runtime)?.channels, 1);
    Ok(())
}

#[test]
fn subscriber_gets_events_and_survives_panics() -> Result<()> {
    let bridge = threaded();
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let seen = Arc::clone(&seen);
        let calls = Arc::clone(&calls);
        bridge.subscribe(channel, None, move |event: Message| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert_ne!(event.payload().as_ref(), b"boom", "subscriber rejects boom");
            seen.lock().expect("lock").push(event.into_payload());
        })?
    };

    bridge.send(channel, MessageKind::Event, "boom")?;
    bridge.send(channel, MessageKind::Event, "hello")?;
    // requests still come back through receive
    bridge.request(channel, "sync")?;
    assert_eq!(receive(&bridge, channel, SECOND)?.payload().as_ref(), b"sync");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(*seen.lock().expect("lock"), vec![Bytes::from_static(b"hello")]);

    bridge.unsubscribe(channel, subscription)?;
    assert_eq!(
        bridge.unsubscribe(channel, subscription).expect_err("already gone").kind(),
        ErrorKind::InvalidArgument
    );
    bridge.publish(runtime, "queued")?;
    let event = receive(&bridge, channel, SECOND)?;
    assert_eq!(event.payload().as_ref(), b"queued");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn full_inbound_queue_rejects_send() -> Result<()> {
    let bridge = cooperative();
    let runtime = bridge.create_runtime_with_config(RuntimeConfig {
        inbound_capacity: 2,
        ..RuntimeConfig::cooperative()
    })?;
    let channel = bridge.create_client(runtime)?;
    bridge.request(channel, "a")?;
    bridge.request(channel, "b")?;
    let err = bridge.request(channel, "c").expect_err("queue is full");
    assert_eq!(err.kind(), ErrorKind::QueueFull);

    assert_eq!(bridge.step(runtime, usize::MAX)?, 2);
    bridge.request(channel, "c")?;
    Ok(())
}

#[test]
fn runtime_limit_reports_initialization_error() -> Result<()> {
    let bridge = Bridge::new(BridgeConfig {
        max_runtimes: Some(1),
        ..BridgeConfig::default()
    });
    let first = bridge.create_runtime()?;
    let err = bridge.create_runtime().expect_err("limit reached");
    assert_eq!(err.kind(), ErrorKind::Initialization);

    bridge.destroy_runtime(first)?;
    bridge
        .create_runtime()
        .context("slot should be free again")?;
    Ok(())
}

#[test]
fn cooperative_receive_on_idle_channel_keeps_its_deadline() -> Result<()> {
    let bridge = scripted(RuntimeConfig::cooperative());
    let runtime = bridge.create_runtime()?;
    let idle = bridge.create_client(runtime)?;
    let busy = bridge.create_client(runtime)?;
    for _ in 0..20 {
        bridge.request(busy, "nap")?;
    }

    let start = Instant::now();
    assert_eq!(error_kind(&bridge, idle, Timeout::Poll), Some(ErrorKind::Timeout));
    assert!(start.elapsed() < Duration::from_millis(100));

    let start = Instant::now();
    assert_eq!(
        error_kind(&bridge, idle, Duration::from_millis(100)),
        Some(ErrorKind::Timeout)
    );
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");

    // the queued work still completes, in order
    for _ in 0..20 {
        let response = receive(&bridge, busy, Duration::from_secs(5))?;
        assert_eq!(response.payload().as_ref(), b"rested");
    }
    Ok(())
}

#[test]
fn cooperative_forever_receive_is_released_by_destroy() -> Result<()> {
    let bridge = Arc::new(scripted(RuntimeConfig::cooperative()));
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;
    bridge.request(channel, "slow")?;

    let waiter = {
        let bridge = Arc::clone(&bridge);
        thread::spawn(move || error_kind(&bridge, channel, Timeout::Forever))
    };
    // the waiter is now driving the slow request
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    bridge.destroy_runtime(runtime)?;
    assert_eq!(
        waiter.join().expect("waiter"),
        Some(ErrorKind::RuntimeUnavailable)
    );
    assert!(start.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[test]
fn subscriber_may_destroy_runtimes() -> Result<()> {
    let bridge = Arc::new(threaded());
    let host = bridge.create_runtime()?;
    let other = bridge.create_runtime()?;
    let channel = bridge.create_client(host)?;

    let outcome = Arc::new(Mutex::new(None));
    {
        let inner = Arc::clone(&bridge);
        let outcome = Arc::clone(&outcome);
        bridge.subscribe(channel, None, move |_| {
            let destroyed = (inner.destroy_runtime(other), inner.destroy_runtime(host));
            *outcome.lock().expect("lock") = Some(destroyed);
        })?;
    }
    bridge.publish(host, "tear down")?;

    let (other_result, host_result) = wait_for(&outcome).context("callback never ran")?;
    other_result?;
    host_result?;
    assert!(bridge.runtimes().is_empty());
    assert_eq!(
        error_kind(&bridge, channel, Timeout::Poll),
        Some(ErrorKind::RuntimeUnavailable)
    );
    Ok(())
}

#[test]
fn cooperative_subscriber_may_destroy_its_runtime() -> Result<()> {
    let bridge = Arc::new(cooperative());
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;

    let outcome = Arc::new(Mutex::new(None));
    {
        let inner = Arc::clone(&bridge);
        let outcome = Arc::clone(&outcome);
        bridge.subscribe(channel, None, move |_| {
            let stepped = inner.step(runtime, 1).map_err(|err| err.kind());
            let destroyed = inner.destroy_runtime(runtime).map_err(|err| err.kind());
            *outcome.lock().expect("lock") = Some((stepped, destroyed));
        })?;
    }
    bridge.publish(runtime, "tear down")?;
    assert_eq!(bridge.step(runtime, 1)?, 1);

    let recorded = outcome.lock().expect("lock").clone();
    assert_eq!(recorded, Some((Err(ErrorKind::InvalidArgument), Ok(()))));
    assert!(bridge.runtimes().is_empty());
    assert_eq!(
        bridge.step(runtime, 1).expect_err("destroyed").kind(),
        ErrorKind::InvalidRuntime
    );
    Ok(())
}

#[test]
fn subscriptions_filter_by_topic_and_end_on_kill() -> Result<()> {
    let bridge = threaded();
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;

    let (everything, on_everything) = recorder();
    let (alerts, on_alert) = recorder();
    let (more_alerts, on_more_alerts) = recorder();
    bridge.subscribe(channel, None, on_everything)?;
    bridge.subscribe(channel, Some(Topic(7)), on_alert)?;
    bridge.subscribe(channel, Some(Topic(7)), on_more_alerts)?;

    bridge.publish_on(runtime, Topic(7), "alert")?;
    bridge.publish_on(runtime, Topic(1), "note")?;
    bridge.publish_on(runtime, Topic::KILL, "stop")?;
    bridge.publish_on(runtime, Topic(7), "after kill")?;

    let kill = receive(&bridge, channel, SECOND)?;
    assert_eq!(kill.topic(), Topic::KILL);
    assert_eq!(kill.payload().as_ref(), b"stop");
    let after = receive(&bridge, channel, SECOND)?;
    assert_eq!(after.payload().as_ref(), b"after kill");

    let alert = (Topic(7), Bytes::from_static(b"alert"));
    let note = (Topic(1), Bytes::from_static(b"note"));
    assert_eq!(*everything.lock().expect("lock"), vec![alert.clone(), note]);
    assert_eq!(*alerts.lock().expect("lock"), vec![alert.clone()]);
    assert_eq!(*more_alerts.lock().expect("lock"), vec![alert]);
    Ok(())
}

#[test]
fn queued_events_reach_new_subscriber_through_the_dispatcher() -> Result<()> {
    let bridge = cooperative();
    let runtime = bridge.create_runtime()?;
    let channel = bridge.create_client(runtime)?;
    for i in 0..3 {
        bridge.publish(runtime, format!("early-{i}"))?;
    }
    bridge.request(channel, "sync")?;
    assert_eq!(bridge.step(runtime, usize::MAX)?, 4);

    let (seen, on_event) = recorder();
    bridge.subscribe(channel, None, on_event)?;
    // nothing runs until the runtime is driven
    assert!(seen.lock().expect("lock").is_empty());

    bridge.publish(runtime, "live")?;
    bridge.step(runtime, usize::MAX)?;
    let payloads: Vec<_> = seen
        .lock()
        .expect("lock")
        .iter()
        .map(|(_, payload)| payload.clone())
        .collect();
    assert_eq!(payloads, vec!["early-0", "early-1", "early-2", "live"]);
    // the response stayed queued for receive
    assert_eq!(receive(&bridge, channel, Timeout::Poll)?.payload().as_ref(), b"sync");
    Ok(())
}

#[test]
fn unanswered_requests_are_bounded_per_channel() -> Result<()> {
    let bridge = cooperative();
    let runtime = bridge.create_runtime_with_config(RuntimeConfig {
        response_backlog: 2,
        ..RuntimeConfig::cooperative()
    })?;
    let channel = bridge.create_client(runtime)?;
    let other = bridge.create_client(runtime)?;

    bridge.request(channel, "a")?;
    bridge.request(channel, "b")?;
    let err = bridge.request(channel, "c").expect_err("two responses outstanding");
    assert_eq!(err.kind(), ErrorKind::QueueFull);
    bridge.request(other, "x")?;
    bridge.send(channel, MessageKind::Event, "events are not limited")?;

    assert_eq!(bridge.step(runtime, usize::MAX)?, 4);
    // delivered but not yet received still counts
    let err = bridge.request(channel, "c").expect_err("responses not taken");
    assert_eq!(err.kind(), ErrorKind::QueueFull);

    assert_eq!(receive(&bridge, channel, Timeout::Poll)?.payload().as_ref(), b"a");
    bridge.request(channel, "c")?;
    Ok(())
}
