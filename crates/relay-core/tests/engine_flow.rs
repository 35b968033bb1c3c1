use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_core::app::{EngineBuilder, EngineHandle, EngineStatus, InputQueue};
use relay_core::domain::{DefaultMessage, DeliveryTag, Message, ProcessingError};
use relay_core::flow::{FlowBuilder, FlowStatus};
use relay_core::impls::{BrokerEvent, BrokerSnapshot, InMemoryBroker, InMemoryLockBackend};
use relay_core::lock::{LockError, LockManager};
use relay_core::ports::{Broker, BrokerError, Deliveries, LockBackend, ProcessReport};

const WAIT: Duration = Duration::from_secs(5);

fn body(id: &str, tracing_id: &str) -> Vec<u8> {
    serde_json::to_vec(&DefaultMessage::new(id).with_tracing_id(tracing_id)).unwrap()
}

fn decode(bytes: &[u8]) -> DefaultMessage {
    serde_json::from_slice(bytes).unwrap()
}

/// Status once every worker is back, the last ack races the permit return.
async fn idle(handle: &EngineHandle<DefaultMessage>, workers: usize) -> EngineStatus {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = handle.status().await;
        if (status.processing == 0 && status.available_workers == workers)
            || tokio::time::Instant::now() >= deadline
        {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct RecordingReport {
    succeeded: Mutex<Vec<String>>,
    failed: Mutex<Vec<(String, u32, String)>>,
}

impl ProcessReport<DefaultMessage> for RecordingReport {
    fn report_success(&self, message: &DefaultMessage) {
        self.succeeded.lock().unwrap().push(message.id().to_string());
    }

    fn report_fail(&self, message: &DefaultMessage, error: &ProcessingError) {
        self.failed.lock().unwrap().push((
            message.id().to_string(),
            message.envelope().retries(),
            error.to_string(),
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn always_failing_message_is_tried_three_times_then_failed() {
    let broker = Arc::new(InMemoryBroker::new());
    let report = Arc::new(RecordingReport::default());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
        .reader(move |m: &DefaultMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(m.id().to_string())
        })
        .consume(|_id: String| Err(ProcessingError::retry("always fails")))
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .report(report.clone())
        .input(
            InputQueue::new("in")
                .max_retries(2)
                .dead_letter_wait(Duration::from_millis(20)),
        )
        .threads(2)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    broker.send("in", body("m1", "t1"));
    assert!(broker.wait_for(WAIT, |s| s.stored("in.failed").len() == 1).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.stop().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let snapshot = broker.snapshot();
    assert_eq!(snapshot.dead_lettered(), 2);
    assert_eq!(snapshot.acked(), 1);
    assert_eq!(snapshot.unacked, 0);

    let failed = decode(&snapshot.stored("in.failed")[0]);
    assert_eq!(failed.id(), "m1");
    assert_eq!(failed.envelope().retries(), 3);

    let reports = report.failed.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "m1");
    assert_eq!(reports[0].1, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_error_skips_the_remaining_retries() {
    let broker = Arc::new(InMemoryBroker::new());
    let report = Arc::new(RecordingReport::default());
    let flow = FlowBuilder::message_processor::<DefaultMessage, DefaultMessage>()
        .process(|_| Err(ProcessingError::stop("cannot ever work")))
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .report(report.clone())
        .input(InputQueue::new("in").failed_routing_key("in.dead"))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    broker.send("in", body("m1", "t1"));
    assert!(broker.wait_for(WAIT, |s| s.stored("in.dead").len() == 1).await);
    handle.stop().await;

    let snapshot = broker.snapshot();
    assert_eq!(snapshot.dead_lettered(), 0);
    assert_eq!(snapshot.acked(), 1);
    let reports = report.failed.lock().unwrap();
    assert_eq!(reports[0].1, 0);
    assert!(reports[0].2.contains("cannot ever work"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_pipeline_is_retried_and_cleanup_still_runs() {
    let broker = Arc::new(InMemoryBroker::new());
    let cleanups = Arc::new(AtomicUsize::new(0));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let (c, s) = (Arc::clone(&cleanups), Arc::clone(&statuses));

    let flow = FlowBuilder::message_processor::<DefaultMessage, DefaultMessage>()
        .process(|m| {
            if m.envelope().retries() == 0 {
                panic!("first attempt explodes");
            }
            Ok(m.clone())
        })
        .cleanup(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .metrics(move |info| s.lock().unwrap().push(info.status))
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .input(InputQueue::new("in").dead_letter_wait(Duration::from_millis(20)))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    broker.send("in", body("m1", "t1"));
    assert!(broker.wait_for(WAIT, |s| s.acked() == 1).await);
    handle.stop().await;

    assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![FlowStatus::ErrorRetry, FlowStatus::Success]
    );
    assert_eq!(broker.snapshot().dead_lettered(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outgoing_messages_are_published_with_the_incoming_tracing_id() {
    let broker = Arc::new(InMemoryBroker::new());
    let report = Arc::new(RecordingReport::default());
    let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
        .reader(|m: &DefaultMessage| Ok(m.id().to_string()))
        .transformer(|id: String| Ok(id.to_uppercase()))
        .writer(|id: String| Ok(Some(DefaultMessage::new(id))))
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .report(report.clone())
        .input(InputQueue::new("in"))
        .write_to("out")
        .threads(2)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    for (id, tracing_id) in [("a", "1"), ("b", "2"), ("c", "3")] {
        broker.send("in", body(id, tracing_id));
    }
    assert!(broker.wait_for(WAIT, |s| s.acked() == 3).await);
    handle.stop().await;

    let snapshot = broker.snapshot();
    let published: HashMap<String, Option<String>> = snapshot
        .stored("out")
        .iter()
        .map(|bytes| {
            let m = decode(bytes);
            (m.id().to_string(), m.tracing_id().map(str::to_string))
        })
        .collect();
    assert_eq!(published.len(), 3);
    assert_eq!(published["A"].as_deref(), Some("1"));
    assert_eq!(published["C"].as_deref(), Some("3"));
    assert_eq!(report.succeeded.lock().unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_more_tasks_in_flight_than_workers() {
    const WORKERS: usize = 3;
    let broker = Arc::new(InMemoryBroker::new());
    let running = Arc::new(AtomicUsize::new(0));
    let most = Arc::new(AtomicUsize::new(0));
    let (r, m) = (Arc::clone(&running), Arc::clone(&most));

    let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
        .reader(move |_: &DefaultMessage| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            m.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .consume(|()| Ok(()))
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .input(InputQueue::new("in"))
        .threads(WORKERS)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    for i in 0..20 {
        broker.send("in", body(&format!("m{i}"), "t"));
    }
    assert!(broker.wait_for(WAIT, |s| s.acked() == 20).await);
    let status = idle(&handle, WORKERS).await;
    handle.stop().await;

    assert!(most.load(Ordering::SeqCst) <= WORKERS);
    assert!(status.peak_processing <= WORKERS);
    assert!(status.peak_processing >= 1);
    assert_eq!(status.processing, 0);
    assert_eq!(status.queued, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_finishes_in_flight_work_and_requeues_the_rest() {
    let broker = Arc::new(InMemoryBroker::new());
    let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
        .reader(|_: &DefaultMessage| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        })
        .consume(|()| Ok(()))
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .input(InputQueue::new("in"))
        .threads(1)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    for i in 0..3 {
        broker.send("in", body(&format!("m{i}"), "t"));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status().await.processing, 1);
    handle.stop().await;

    let snapshot = broker.snapshot();
    assert_eq!(snapshot.acked(), 1);
    assert_eq!(snapshot.stored("in").len(), 2);
    assert_eq!(snapshot.unacked, 0);
    assert!(
        snapshot
            .events
            .iter()
            .all(|e| !matches!(e, BrokerEvent::Rejected { requeue: false, .. }))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_message_waits_for_the_lock_held_by_the_first() {
    let broker = Arc::new(InMemoryBroker::new());
    let locks = Arc::new(LockManager::local());
    let waits = Arc::new(Mutex::new(HashMap::new()));
    let recorded = Arc::clone(&waits);

    let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
        .reader(|m: &DefaultMessage| Ok(m.tracing_id().map(str::to_string)))
        .consume(|tracing_id: Option<String>| {
            if tracing_id.as_deref() == Some("1") {
                std::thread::sleep(Duration::from_millis(1100));
            }
            Ok(())
        })
        .lock_key(|_| Some("123".to_string()))
        .metrics(move |info| {
            if let Some(tracing_id) = &info.tracing_id {
                recorded
                    .lock()
                    .unwrap()
                    .insert(tracing_id.clone(), info.lock_wait);
            }
        })
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .lock_manager(Arc::clone(&locks))
        .input(InputQueue::new("in"))
        .threads(2)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    broker.send("in", body("a", "1"));
    let deadline = tokio::time::Instant::now() + WAIT;
    while !locks.is_locked("123") {
        assert!(tokio::time::Instant::now() < deadline, "first message never took the lock");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    broker.send("in", body("b", "2"));

    assert!(broker.wait_for(WAIT, |s| s.acked() == 2).await);
    handle.stop().await;

    let waits = waits.lock().unwrap();
    assert!(waits["1"] < Duration::from_millis(1000), "1 waited {:?}", waits["1"]);
    assert!(waits["2"] >= Duration::from_millis(1000), "2 waited {:?}", waits["2"]);
    assert_eq!(locks.locks_acquired(), 2);
    assert!(locks.waited_for_locks() >= Duration::from_millis(1000));
    assert!(locks.locks_held() >= Duration::from_millis(1100));
    assert!(!locks.is_locked("123"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_engines_sharing_a_lock_store_exclude_each_other() {
    let store = Arc::new(InMemoryLockBackend::new());
    let running = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    let mut brokers = Vec::new();
    for _ in 0..2 {
        let broker = Arc::new(InMemoryBroker::new());
        let (r, o) = (Arc::clone(&running), Arc::clone(&overlapped));
        let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
            .reader(move |_: &DefaultMessage| {
                if r.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(30));
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .consume(|()| Ok(()))
            .lock_key(|m| Some(m.id().to_string()))
            .build();
        let backend: Arc<dyn LockBackend> = store.clone();
        let handle = EngineBuilder::new()
            .broker(broker.clone())
            .flow(flow)
            .lock_manager(Arc::new(LockManager::new(backend)))
            .input(InputQueue::new("in"))
            .threads(2)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        handles.push(handle);
        brokers.push(broker);
    }

    for broker in &brokers {
        for _ in 0..4 {
            broker.send("in", body("same-business-key", "t"));
        }
    }
    for broker in &brokers {
        assert!(broker.wait_for(WAIT, |s| s.acked() == 4).await);
    }
    for handle in handles {
        handle.stop().await;
    }
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
}

struct UnreachableBackend;

impl LockBackend for UnreachableBackend {
    fn try_acquire(&self, _id: &str, _timeout: Duration) -> Result<bool, LockError> {
        Err(LockError::Backend("connection refused".into()))
    }

    fn release(&self, _id: &str) -> Result<(), LockError> {
        Ok(())
    }

    fn is_held(&self, _id: &str) -> Result<bool, LockError> {
        Err(LockError::Backend("connection refused".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_lock_backend_fails_the_message_without_retry() {
    let broker = Arc::new(InMemoryBroker::new());
    let report = Arc::new(RecordingReport::default());
    let flow = FlowBuilder::message_processor::<DefaultMessage, DefaultMessage>()
        .process(|m| Ok(m.clone()))
        .lock_key(|m| Some(m.id().to_string()))
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .report(report.clone())
        .lock_manager(Arc::new(LockManager::new(Arc::new(UnreachableBackend))))
        .input(InputQueue::new("in"))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    broker.send("in", body("m1", "t1"));
    assert!(broker.wait_for(WAIT, |s| s.stored("in.failed").len() == 1).await);
    handle.stop().await;

    let snapshot = broker.snapshot();
    assert_eq!(snapshot.dead_lettered(), 0);
    assert_eq!(snapshot.acked(), 1);
    assert!(report.failed.lock().unwrap()[0].2.contains("connection refused"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn poison_messages_do_not_shrink_worker_capacity() {
    let broker = Arc::new(InMemoryBroker::new());
    let report = Arc::new(RecordingReport::default());
    let flow = FlowBuilder::message_processor::<DefaultMessage, DefaultMessage>()
        .process(|m| Ok(m.clone()))
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .report(report.clone())
        .input(InputQueue::new("in"))
        .threads(1)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    for _ in 0..3 {
        broker.send("in", b"{definitely not json".to_vec());
    }
    broker.send("in", body("good", "t"));

    assert!(broker.wait_for(WAIT, |s| s.acked() == 4).await);
    let status = idle(&handle, 1).await;
    handle.stop().await;
    assert_eq!(status.available_workers, 1);
    assert_eq!(*report.succeeded.lock().unwrap(), vec!["good".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_held_longer_than_the_wait_is_retried_not_failed() {
    let broker = Arc::new(InMemoryBroker::new());
    let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
        .reader(|_: &DefaultMessage| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .consume(|()| Ok(()))
        .lock_key(|_| Some("123".to_string()))
        .build();

    let handle = EngineBuilder::new()
        .broker(broker.clone())
        .flow(flow)
        .lock_manager(Arc::new(
            LockManager::local().with_lock_wait(Duration::from_millis(100)),
        ))
        .input(InputQueue::new("in").dead_letter_wait(Duration::from_millis(50)))
        .threads(2)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    broker.send("in", body("a", "1"));
    broker.send("in", body("b", "2"));
    assert!(broker.wait_for(WAIT, |s| s.acked() == 2).await);
    handle.stop().await;

    let snapshot = broker.snapshot();
    assert!(snapshot.dead_lettered() >= 1);
    assert!(snapshot.stored("in.failed").is_empty());
}

/// In-memory broker with parts of it switched off.
struct FlakyBroker {
    inner: Arc<InMemoryBroker>,
    dead_letter_down: bool,
    unreachable_route: Option<&'static str>,
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn consume(&self, queue: &str) -> Result<Deliveries, BrokerError> {
        self.inner.consume(queue).await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.inner.ack(tag).await
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.inner.reject(tag, requeue).await
    }

    async fn dead_letter(
        &self,
        queue: &str,
        tag: DeliveryTag,
        body: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        if self.dead_letter_down {
            return Err(BrokerError::Connection("dead-letter exchange down".into()));
        }
        self.inner.dead_letter(queue, tag, body, ttl).await
    }

    async fn publish(&self, route: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        if self.unreachable_route == Some(route) {
            return Err(BrokerError::Connection(format!("{route} unreachable")));
        }
        self.inner.publish(route, body).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_dead_lettering_hands_the_delivery_back() {
    let broker = Arc::new(InMemoryBroker::new());
    let flow = FlowBuilder::message_processor::<DefaultMessage, DefaultMessage>()
        .process(|_| Err(ProcessingError::retry("downstream unavailable")))
        .build();

    let handle = EngineBuilder::new()
        .broker(Arc::new(FlakyBroker {
            inner: broker.clone(),
            dead_letter_down: true,
            unreachable_route: None,
        }))
        .flow(flow)
        .input(InputQueue::new("in"))
        .threads(1)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    broker.send("in", body("m1", "t1"));
    let requeued = |s: &BrokerSnapshot| {
        s.count(|e| matches!(e, BrokerEvent::Rejected { requeue: true, .. }))
    };
    assert!(broker.wait_for(WAIT, |s| requeued(s) >= 1).await);
    handle.stop().await;

    let snapshot = broker.snapshot();
    assert_eq!(snapshot.unacked, 0);
    assert_eq!(snapshot.acked(), 0);
    assert_eq!(snapshot.dead_lettered(), 0);
    assert_eq!(snapshot.stored("in").len(), 1);
    assert!(snapshot.stored("in.failed").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metrics_see_an_output_publish_failure_as_a_failed_attempt() {
    let broker = Arc::new(InMemoryBroker::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);
    let flow = FlowBuilder::message_processor::<DefaultMessage, DefaultMessage>()
        .process(|m| Ok(m.clone()))
        .metrics(move |info| recorded.lock().unwrap().push((info.status, info.retries)))
        .build();

    let handle = EngineBuilder::new()
        .broker(Arc::new(FlakyBroker {
            inner: broker.clone(),
            dead_letter_down: false,
            unreachable_route: Some("out"),
        }))
        .flow(flow)
        .input(
            InputQueue::new("in")
                .max_retries(1)
                .dead_letter_wait(Duration::from_millis(20)),
        )
        .write_to("out")
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    broker.send("in", body("m1", "t1"));
    assert!(broker.wait_for(WAIT, |s| s.stored("in.failed").len() == 1).await);
    handle.stop().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(FlowStatus::ErrorRetry, 1), (FlowStatus::ErrorStop, 2)]
    );
    assert_eq!(decode(&broker.snapshot().stored("in.failed")[0]).envelope().retries(), 2);
}

#[test]
fn higher_priority_queue_is_served_first() {
    // One blocking thread runs the attempts in the order the workers popped them.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(1)
        .build()
        .unwrap();

    runtime.block_on(async {
        let broker = Arc::new(InMemoryBroker::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let flow = FlowBuilder::flow::<DefaultMessage, DefaultMessage>()
            .reader(move |m: &DefaultMessage| {
                seen.lock().unwrap().push(m.id().to_string());
                Ok(())
            })
            .consume(|()| Ok(()))
            .build();

        broker.send("bulk", body("bulk-1", "t"));
        broker.send("bulk", body("bulk-2", "t"));
        broker.send("urgent", body("urgent-1", "t"));

        let handle = EngineBuilder::new()
            .broker(broker.clone())
            .flow(flow)
            .input(InputQueue::new("bulk"))
            .input(InputQueue::new("urgent").priority(10))
            .threads(3)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(broker.wait_for(WAIT, |s| s.acked() == 3).await);
        handle.stop().await;
        assert_eq!(*order.lock().unwrap(), vec!["urgent-1", "bulk-1", "bulk-2"]);
    });
}
