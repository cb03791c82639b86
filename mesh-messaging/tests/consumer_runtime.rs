//! Consumer runtime behaviour against the in-memory broker.

use async_trait::async_trait;
use mesh_messaging::*;
use mesh_telemetry::{ObservabilityContext, TelemetryBuilder};
use opentelemetry::Context;
use opentelemetry::trace::{SpanId, SpanKind, Status, TraceContextExt};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

async fn telemetry() -> (Arc<ObservabilityContext>, InMemorySpanExporter) {
    let exporter = InMemorySpanExporter::default();
    let obs = TelemetryBuilder::new("consumer-it")
        .with_span_exporter(exporter.clone())
        .install_global(false)
        .build()
        .await
        .unwrap();
    (Arc::new(obs), exporter)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn consume_spans(exporter: &InMemorySpanExporter) -> Vec<SpanData> {
    exporter
        .get_finished_spans()
        .unwrap()
        .into_iter()
        .filter(|s| s.name == CONSUME_SPAN_NAME)
        .collect()
}

/// Records what it saw; fails on payload "fail", panics on "panic".
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(i64, Option<i64>)>>,
    contexts: Mutex<Vec<Context>>,
    broker: Option<InMemoryBroker>,
}

impl Recorder {
    fn watching(broker: &InMemoryBroker) -> Self {
        Self {
            broker: Some(broker.clone()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn process(&self, cx: &Context, message: &ConsumerMessage) -> Result<(), HandlerError> {
        let committed = self
            .broker
            .as_ref()
            .and_then(|b| b.committed("billing", &message.topic, message.partition));
        self.seen.lock().push((message.offset, committed));
        self.contexts.lock().push(cx.clone());

        match message.payload_str() {
            Some("fail") => Err("payment declined".into()),
            Some("panic") => panic!("handler exploded"),
            _ => Ok(()),
        }
    }
}

fn consumer(group: &Arc<InMemoryGroup>, obs: Arc<ObservabilityContext>) -> Consumer {
    Consumer::new(group.clone(), obs).with_signal_handling(false)
}

#[tokio::test]
async fn test_message_without_headers_starts_root_span() {
    let (obs, exporter) = telemetry().await;
    let broker = InMemoryBroker::new();
    let group = Arc::new(broker.group("billing").with_initial_offset(InitialOffset::Oldest));
    let handler = Arc::new(Recorder::watching(&broker));

    broker.publish(ProducerMessage::new("orders", "first").with_key("o-1"));
    broker.publish(ProducerMessage::new("orders", "second").with_key("o-2"));

    let cancel = CancellationToken::new();
    let consumer = consumer(&group, obs);
    let run = consumer.consume(&cancel, ["orders"], handler.clone());
    let stop = async {
        wait_until(|| broker.marked().len() == 2).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, stop);
    result.unwrap();

    // The first offset was committed before the second message was handed out.
    assert_eq!(*handler.seen.lock(), vec![(0, None), (1, Some(1))]);

    let spans = consume_spans(&exporter);
    assert_eq!(spans.len(), 2);
    let first = &spans[0];
    assert_eq!(first.span_kind, SpanKind::Consumer);
    assert_eq!(first.parent_span_id, SpanId::INVALID);
    assert_eq!(first.status, Status::Ok);
    for key in ["kafka.topic", "kafka.partition", "kafka.offset"] {
        assert!(first.attributes.iter().any(|kv| kv.key.as_str() == key));
    }

    // The handler saw the consumer span as the active span.
    let cx = handler.contexts.lock()[0].clone();
    assert_eq!(cx.span().span_context().span_id(), first.span_context.span_id());

    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert_eq!(group.close_calls(), 1);
}

#[tokio::test]
async fn test_trace_continues_from_producer() {
    let (obs, exporter) = telemetry().await;
    let broker = InMemoryBroker::new();
    let group = Arc::new(broker.group("billing").with_initial_offset(InitialOffset::Oldest));

    let producer = TracedProducer::new(broker.clone(), obs.clone());
    producer
        .send_with_context(&Context::new(), ProducerMessage::new("orders", "ok").with_key("o-1"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let consumer = consumer(&group, obs);
    let run = consumer.consume(&cancel, ["orders"], Arc::new(Recorder::default()));
    let stop = async {
        wait_until(|| broker.marked().len() == 1).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, stop);
    result.unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    let produce = spans.iter().find(|s| s.name == PRODUCE_SPAN_NAME).unwrap();
    let consume = spans.iter().find(|s| s.name == CONSUME_SPAN_NAME).unwrap();

    assert_eq!(
        consume.span_context.trace_id(),
        produce.span_context.trace_id()
    );
    assert_eq!(consume.parent_span_id, produce.span_context.span_id());
}

#[tokio::test]
async fn test_panic_is_contained_and_next_message_committed() {
    let (obs, exporter) = telemetry().await;
    let broker = InMemoryBroker::new();
    let group = Arc::new(broker.group("billing").with_initial_offset(InitialOffset::Oldest));
    let handler = Arc::new(Recorder::default());

    broker.publish(ProducerMessage::new("orders", "panic"));
    broker.publish(ProducerMessage::new("orders", "ok"));

    let cancel = CancellationToken::new();
    let consumer = consumer(&group, obs);
    let run = consumer.consume(&cancel, ["orders"], handler.clone());
    let stop = async {
        wait_until(|| broker.marked().len() == 2).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, stop);
    result.unwrap();

    let offsets: Vec<i64> = broker.marked().iter().map(|m| m.offset).collect();
    assert_eq!(offsets, vec![0, 1]);
    assert_eq!(group.joins(), 1);

    let spans = consume_spans(&exporter);
    assert_eq!(spans[0].status, Status::error("panic"));
    assert!(
        spans[0]
            .events
            .iter()
            .any(|e| e.name == "exception")
    );
    assert_eq!(spans[1].status, Status::Ok);
}

#[tokio::test]
async fn test_handler_error_marks_once() {
    let (obs, exporter) = telemetry().await;
    let broker = InMemoryBroker::new();
    let group = Arc::new(broker.group("billing").with_initial_offset(InitialOffset::Oldest));

    broker.publish(ProducerMessage::new("orders", "fail"));

    let cancel = CancellationToken::new();
    let consumer = consumer(&group, obs);
    let run = consumer.consume(&cancel, ["orders"], Arc::new(Recorder::default()));
    let stop = async {
        wait_until(|| !broker.marked().is_empty()).await;
        // give a duplicate mark the chance to show up
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, stop);

    // Handler errors never surface from consume.
    result.unwrap();
    assert_eq!(broker.marked().len(), 1);
    assert_eq!(broker.committed("billing", "orders", 0), Some(1));
    assert_eq!(consume_spans(&exporter)[0].status, Status::error("payment declined"));
}

#[tokio::test]
async fn test_interrupt_mid_poll_closes_once() {
    let (obs, _exporter) = telemetry().await;
    let broker = InMemoryBroker::new();
    let group = Arc::new(broker.group("billing"));
    let (interrupt, signal) = oneshot::channel::<()>();

    let consumer = Consumer::new(group.clone(), obs).with_shutdown_signal(async move {
        let _ = signal.await;
    });

    let cancel = CancellationToken::new();
    let run = consumer.consume(&cancel, ["orders"], Arc::new(Recorder::default()));
    let fire = async {
        // the session is joined and waiting for messages
        wait_until(|| group.joins() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        interrupt.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(run, fire);

    result.unwrap();
    assert!(!cancel.is_cancelled());
    assert_eq!(group.close_calls(), 1);
    assert_eq!(consumer.state(), ConsumerState::Closed);
}

#[tokio::test]
async fn test_group_failure_is_returned() {
    let (obs, _exporter) = telemetry().await;
    let broker = InMemoryBroker::new();
    let group = Arc::new(broker.group("billing"));
    group.fail_next_join(MessagingError::Connection("broker unreachable".into()));

    let consumer = consumer(&group, obs);
    let err = consumer
        .consume(&CancellationToken::new(), ["orders"], Arc::new(Recorder::default()))
        .await
        .unwrap_err();

    assert!(matches!(err, MessagingError::Connection(_)));
    assert_eq!(group.close_calls(), 1);
    assert_eq!(consumer.state(), ConsumerState::Closed);

    let again = consumer
        .consume(&CancellationToken::new(), ["orders"], Arc::new(Recorder::default()))
        .await
        .unwrap_err();
    assert!(matches!(again, MessagingError::InvalidState(_)));
    assert_eq!(group.close_calls(), 1);
}

#[tokio::test]
async fn test_group_closed_is_clean_exit() {
    let (obs, _exporter) = telemetry().await;
    let group = Arc::new(InMemoryBroker::new().group("billing"));
    group.fail_next_join(MessagingError::GroupClosed);

    let consumer = consumer(&group, obs);
    consumer
        .consume(&CancellationToken::new(), ["orders"], Arc::new(Recorder::default()))
        .await
        .unwrap();

    assert_eq!(group.close_calls(), 1);
}

#[tokio::test]
async fn test_rebalance_rejoins_from_committed_offset() {
    let (obs, _exporter) = telemetry().await;
    let broker = InMemoryBroker::new();
    let group = Arc::new(broker.group("billing").with_initial_offset(InitialOffset::Oldest));
    let handler = Arc::new(Recorder::default());

    broker.publish(ProducerMessage::new("orders", "a"));

    let cancel = CancellationToken::new();
    let consumer = consumer(&group, obs);
    let run = consumer.consume(&cancel, ["orders"], handler.clone());
    let drive = async {
        wait_until(|| broker.marked().len() == 1).await;
        group.rebalance();
        wait_until(|| group.joins() == 2).await;
        broker.publish(ProducerMessage::new("orders", "b"));
        wait_until(|| broker.marked().len() == 2).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, drive);
    result.unwrap();

    let offsets: Vec<i64> = handler.seen.lock().iter().map(|(o, _)| *o).collect();
    assert_eq!(offsets, vec![0, 1]);
}

#[tokio::test]
async fn test_partitions_consumed_concurrently() {
    let (obs, _exporter) = telemetry().await;
    let broker = InMemoryBroker::with_partitions(3);
    let group = Arc::new(broker.group("billing").with_initial_offset(InitialOffset::Oldest));

    for i in 0..9 {
        broker.publish(ProducerMessage::new("orders", format!("m{i}")));
    }

    let cancel = CancellationToken::new();
    let consumer = consumer(&group, obs);
    let run = consumer.consume(&cancel, ["orders"], Arc::new(Recorder::default()));
    let stop = async {
        wait_until(|| broker.marked().len() == 9).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(run, stop);
    result.unwrap();

    for partition in 0..3 {
        assert_eq!(broker.committed("billing", "orders", partition), Some(3));
    }
}

#[tokio::test]
async fn test_empty_topic_list_rejected() {
    let (obs, _exporter) = telemetry().await;
    let group = Arc::new(InMemoryBroker::new().group("billing"));
    let consumer = consumer(&group, obs);

    let err = consumer
        .consume(
            &CancellationToken::new(),
            Vec::<String>::new(),
            Arc::new(Recorder::default()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, MessagingError::Configuration(_)));
    assert_eq!(group.joins(), 0);
    assert_eq!(group.close_calls(), 0);
    assert_eq!(consumer.state(), ConsumerState::Idle);
}

#[tokio::test]
async fn test_dropped_consume_still_closes_group() {
    let (obs, _exporter) = telemetry().await;
    let group = Arc::new(InMemoryBroker::new().group("billing"));
    let consumer = consumer(&group, obs);

    let timed_out = tokio::time::timeout(
        Duration::from_millis(50),
        consumer.consume(&CancellationToken::new(), ["orders"], Arc::new(Recorder::default())),
    )
    .await;
    assert!(timed_out.is_err());

    wait_until(|| group.close_calls() == 1).await;
    wait_until(|| consumer.state() == ConsumerState::Closed).await;

    // Closing again is a no-op.
    consumer.close().await;
    assert_eq!(group.close_calls(), 1);
}
