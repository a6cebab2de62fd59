//! Integration tests for the SmartMessage core

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use smartmessage::config::{CircuitSettings, DdqSettings, DdqStorage, FallbackPolicy};
use smartmessage::{
    Dispatcher, DispatcherConfig, Envelope, FnHandler, InMemoryBackend, InMemoryTransport,
    JsonSerializer, Message, MessageHandler, MessageHeader, MessageSchema, MsgPackSerializer,
    PoolMode, PropertySpec, QueueTransport, Result, SchemaRegistry, Serializer,
    SmartMessageError, Subscription, SubscriptionFilter, Transport, TransportStats, ANY_CLASS,
};
use smartmessage_config::TransportSettings;
use smartmessage_errors::internal_error;

// =============================================================================
// TEST SUPPORT
// =============================================================================

fn counting_handler(id: &str, counter: Arc<AtomicUsize>) -> Arc<FnHandler> {
    Arc::new(FnHandler::with_id(id, move |_msg| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }))
}

/// Transport stub whose publish always fails.
struct FailingTransport {
    dispatcher: Arc<Dispatcher>,
    serializer: Arc<dyn Serializer>,
}

impl FailingTransport {
    fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            serializer: Arc::new(JsonSerializer),
        })
    }
}

#[async_trait]
impl Transport for FailingTransport {
    fn name(&self) -> &str {
        "broken"
    }

    fn serializer(&self) -> Arc<dyn Serializer> {
        self.serializer.clone()
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    async fn publish(&self, _message: &Message) -> Result<()> {
        Err(SmartMessageError::Connection {
            message: "simulated outage".to_string(),
            endpoint: None,
            code: "CONNECTION_ERROR".to_string(),
        })
    }

    async fn subscribe(
        &self,
        _message_class: &str,
        _handler: Arc<dyn MessageHandler>,
        _filter: SubscriptionFilter,
    ) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _message_class: &str, _handler_id: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn connected(&self) -> bool {
        true
    }

    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

async fn settle(dispatcher: &Dispatcher) {
    tokio::time::sleep(Duration::from_millis(30)).await;
    dispatcher.quiesce().await;
}

// =============================================================================
// HEADER IDENTITY
// =============================================================================

#[tokio::test]
async fn published_headers_are_unique_and_well_formed() {
    let dispatcher = Dispatcher::with_defaults();
    let transport = InMemoryTransport::with_defaults(dispatcher.clone());

    let seen: Arc<Mutex<Vec<MessageHeader>>> = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        Arc::new(FnHandler::with_id("identity.capture", move |msg: Message| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(msg.header().clone());
                Ok(())
            }
        }))
    };
    transport
        .subscribe("it.identity.Ping", handler, SubscriptionFilter::new())
        .await
        .unwrap();

    let schema = MessageSchema::builder("it.identity.Ping")
        .with_version(3)
        .with_from("pinger")
        .with_property(PropertySpec::new("n"))
        .with_transport(transport)
        .register()
        .unwrap();

    for n in 0..20 {
        Message::from_json(schema.clone(), json!({ "n": n }))
            .unwrap()
            .publish()
            .await
            .unwrap();
    }
    settle(&dispatcher).await;

    let headers = seen.lock().unwrap();
    assert_eq!(headers.len(), 20);

    let unique: std::collections::HashSet<Uuid> = headers.iter().map(|h| h.uuid()).collect();
    assert_eq!(unique.len(), 20, "uuids must be unique across a run");

    for header in headers.iter() {
        assert!(!header.from().is_empty());
        assert_eq!(header.version(), 3);
        assert!(header.published_at().is_some());
    }

    SchemaRegistry::unregister("it.identity.Ping");
}

// =============================================================================
// MULTI-TRANSPORT PUBLISHING
// =============================================================================

#[tokio::test]
async fn publish_succeeds_when_any_transport_accepts() {
    let dispatcher = Dispatcher::with_defaults();
    let a = InMemoryTransport::with_defaults(dispatcher.clone());
    let b = FailingTransport::new(dispatcher.clone());
    let c = InMemoryTransport::with_defaults(dispatcher.clone());

    let schema = MessageSchema::builder("it.fanout.Event")
        .with_from("svc")
        .with_transport(a.clone())
        .with_transport(b)
        .with_transport(c.clone())
        .build()
        .unwrap();

    let accepted = Message::from_json(schema, json!({}))
        .unwrap()
        .publish()
        .await
        .unwrap();

    assert_eq!(accepted, 2);
    assert_eq!(a.stats().published, 1);
    assert_eq!(c.stats().published, 1);
}

#[tokio::test]
async fn publish_fails_only_when_every_transport_fails() {
    let dispatcher = Dispatcher::with_defaults();
    let schema = MessageSchema::builder("it.fanout.Doomed")
        .with_from("svc")
        .with_transport(FailingTransport::new(dispatcher.clone()))
        .with_transport(FailingTransport::new(dispatcher.clone()))
        .with_transport(FailingTransport::new(dispatcher))
        .build()
        .unwrap();

    match Message::from_json(schema, json!({})).unwrap().publish().await {
        Err(SmartMessageError::PublishFailed { failures, .. }) => {
            assert_eq!(failures.len(), 3);
            for failure in &failures {
                assert_eq!(failure.transport, "broken");
                assert!(failure.error.contains("simulated outage"));
            }
        }
        other => panic!("expected PublishFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn instance_transport_override_replaces_class_list() {
    let dispatcher = Dispatcher::with_defaults();
    let class_transport = InMemoryTransport::with_defaults(dispatcher.clone());
    let override_transport = InMemoryTransport::with_defaults(dispatcher);

    let schema = MessageSchema::builder("it.fanout.Override")
        .with_from("svc")
        .with_transport(class_transport.clone())
        .build()
        .unwrap();

    let message = Message::from_json(schema, json!({})).unwrap();
    assert!(message.single_transport());

    message
        .with_transports(vec![override_transport.clone()])
        .publish()
        .await
        .unwrap();

    assert_eq!(class_transport.stats().published, 0);
    assert_eq!(override_transport.stats().published, 1);
}

// =============================================================================
// FILTERED BROADCAST AND POINT-TO-POINT DELIVERY
// =============================================================================

#[tokio::test]
async fn broadcast_reaches_broadcast_subscriber_only() {
    let dispatcher = Dispatcher::with_defaults();
    let transport = InMemoryTransport::with_defaults(dispatcher.clone());

    let a_calls = Arc::new(AtomicUsize::new(0));
    let b_calls = Arc::new(AtomicUsize::new(0));

    transport
        .subscribe(
            "it.broadcast.Announcement",
            counting_handler("broadcast.subscriber_a", a_calls.clone()),
            SubscriptionFilter::new().broadcast(true),
        )
        .await
        .unwrap();
    transport
        .subscribe(
            "it.broadcast.Announcement",
            counting_handler("broadcast.subscriber_b", b_calls.clone()),
            SubscriptionFilter::new().to("alpha"),
        )
        .await
        .unwrap();

    let schema = MessageSchema::builder("it.broadcast.Announcement")
        .with_from("admin")
        .with_property(PropertySpec::new("text"))
        .with_transport(transport)
        .register()
        .unwrap();

    Message::from_json(schema, json!({ "text": "hi" }))
        .unwrap()
        .publish()
        .await
        .unwrap();
    settle(&dispatcher).await;

    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);

    SchemaRegistry::unregister("it.broadcast.Announcement");
}

#[tokio::test]
async fn point_to_point_delivers_typed_message() {
    let dispatcher = Dispatcher::with_defaults();
    let transport = InMemoryTransport::with_defaults(dispatcher.clone());

    let received: Arc<Mutex<Option<(String, u32, String)>>> = Arc::new(Mutex::new(None));
    let handler = {
        let received = received.clone();
        Arc::new(FnHandler::with_id("p2p.fulfil", move |msg: Message| {
            let received = received.clone();
            async move {
                *received.lock().unwrap() = Some((
                    msg.get("id").unwrap().as_str().unwrap().to_string(),
                    msg.header().version(),
                    msg.header().from().to_string(),
                ));
                Ok(())
            }
        }))
    };

    transport
        .subscribe(
            "it.p2p.Order",
            handler,
            SubscriptionFilter::new().to("fulfil"),
        )
        .await
        .unwrap();

    let schema = MessageSchema::builder("it.p2p.Order")
        .with_version(2)
        .with_from("orders")
        .with_to("fulfil")
        .with_property(PropertySpec::new("id").required())
        .with_transport(transport)
        .register()
        .unwrap();

    Message::from_json(schema, json!({ "id": "O-1" }))
        .unwrap()
        .publish()
        .await
        .unwrap();
    settle(&dispatcher).await;

    let received = received.lock().unwrap().clone().expect("handler ran");
    assert_eq!(received, ("O-1".to_string(), 2, "orders".to_string()));

    SchemaRegistry::unregister("it.p2p.Order");
}

// =============================================================================
// VERSION MISMATCH REJECTION
// =============================================================================

#[tokio::test]
async fn version_mismatch_rejects_before_dispatch() {
    let dispatcher = Dispatcher::with_defaults();
    let calls = Arc::new(AtomicUsize::new(0));

    dispatcher
        .subscribe(Subscription::new(
            "it.versioned.Order",
            counting_handler("versioned.handler", calls.clone()),
            SubscriptionFilter::new(),
        ))
        .await
        .unwrap();

    MessageSchema::builder("it.versioned.Order")
        .with_version(2)
        .with_from("orders")
        .register()
        .unwrap();

    // Envelope declares version 1 against a class declared at version 2.
    let stale = Envelope::new(
        MessageHeader::new("it.versioned.Order", "orders", None, None, 1),
        serde_json::Map::new(),
    );
    dispatcher.route(stale).await.unwrap();
    settle(&dispatcher).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.stats().version_rejected, 1);

    SchemaRegistry::unregister("it.versioned.Order");
}

// =============================================================================
// DEDUPLICATION ORDER AND EVICTION
// =============================================================================

#[tokio::test]
async fn ddq_eviction_allows_reprocessing() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        pool: PoolMode::Single,
        ..DispatcherConfig::default()
    });

    let invocations: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let invocations = invocations.clone();
        Arc::new(FnHandler::with_id("dedup.handler", move |msg: Message| {
            let invocations = invocations.clone();
            async move {
                invocations.lock().unwrap().push(msg.header().uuid());
                Ok(())
            }
        }))
    };

    dispatcher
        .subscribe(Subscription::new(
            "it.dedup.Event",
            handler,
            SubscriptionFilter::new(),
        ))
        .await
        .unwrap();

    MessageSchema::builder("it.dedup.Event")
        .with_from("svc")
        .with_ddq(DdqSettings {
            enabled: true,
            size: 3,
            storage: DdqStorage::Memory,
        })
        .register()
        .unwrap();

    let make = || {
        Envelope::new(
            MessageHeader::new("it.dedup.Event", "svc", None, None, 1),
            serde_json::Map::new(),
        )
    };
    let u1 = make();
    let u2 = make();
    let u3 = make();
    let u4 = make();

    // Delivery sequence: u1, u2, u3, u1 (dup), u4 (evicts u1), u1 (again).
    for env in [&u1, &u2, &u3, &u1, &u4, &u1] {
        dispatcher.route(env.clone()).await.unwrap();
    }
    settle(&dispatcher).await;

    let order = invocations.lock().unwrap().clone();
    assert_eq!(
        order,
        vec![
            u1.header.uuid(),
            u2.header.uuid(),
            u3.header.uuid(),
            u4.header.uuid(),
            u1.header.uuid()
        ]
    );
    assert_eq!(dispatcher.stats().duplicates_skipped, 1);

    SchemaRegistry::unregister("it.dedup.Event");
}

#[tokio::test]
async fn ddq_scopes_are_per_handler() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        pool: PoolMode::Single,
        ..DispatcherConfig::default()
    });

    let h1_calls = Arc::new(AtomicUsize::new(0));
    let h2_calls = Arc::new(AtomicUsize::new(0));

    dispatcher
        .subscribe(Subscription::new(
            "it.ddq.Scoped",
            counting_handler("ddq.h1", h1_calls.clone()),
            SubscriptionFilter::new(),
        ))
        .await
        .unwrap();
    dispatcher
        .subscribe(Subscription::new(
            "it.ddq.Scoped",
            counting_handler("ddq.h2", h2_calls.clone()),
            SubscriptionFilter::new(),
        ))
        .await
        .unwrap();

    MessageSchema::builder("it.ddq.Scoped")
        .with_from("svc")
        .register()
        .unwrap();

    let envelope = Envelope::new(
        MessageHeader::new("it.ddq.Scoped", "svc", None, None, 1),
        serde_json::Map::new(),
    );

    // First delivery: both handlers run. Second: both skip.
    dispatcher.route(envelope.clone()).await.unwrap();
    settle(&dispatcher).await;
    dispatcher.route(envelope).await.unwrap();
    settle(&dispatcher).await;

    assert_eq!(h1_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h2_calls.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.stats().duplicates_skipped, 2);

    SchemaRegistry::unregister("it.ddq.Scoped");
}

// =============================================================================
// ROUND TRIP ACROSS SERIALIZERS
// =============================================================================

#[tokio::test]
async fn every_serializer_round_trips_all_header_fields() {
    let schema = MessageSchema::builder("it.roundtrip.Full")
        .with_version(5)
        .with_from("origin")
        .with_to("target")
        .with_reply_to("replies")
        .with_property(PropertySpec::new("id"))
        .with_property(PropertySpec::new("qty"))
        .build()
        .unwrap();

    let message = Message::from_json(schema.clone(), json!({ "id": "R-1", "qty": 7 })).unwrap();

    let serializers: Vec<Arc<dyn Serializer>> =
        vec![Arc::new(JsonSerializer), Arc::new(MsgPackSerializer)];

    for serializer in serializers {
        let bytes = serializer.encode(&message).unwrap();
        let decoded = serializer.decode(&bytes).unwrap();

        assert_eq!(decoded.header, *message.header(), "{}", serializer.name());
        assert_eq!(decoded.properties.get("id"), Some(&json!("R-1")));
        assert_eq!(decoded.properties.get("qty"), Some(&json!(7)));
    }
}

// =============================================================================
// CIRCUIT TRIP AND DLQ FALLBACK
// =============================================================================

#[tokio::test]
async fn circuit_trip_routes_to_dlq_instead_of_handler() {
    let dir = tempfile::tempdir().unwrap();
    let dlq = Arc::new(
        smartmessage::DeadLetterQueue::new(dir.path().join("dead.jsonl")).unwrap(),
    );

    let mut circuit = CircuitSettings {
        threshold: 3,
        window_ms: 60_000,
        cooldown_ms: 60_000,
        fallback: FallbackPolicy::Dlq,
        ..CircuitSettings::default()
    };
    circuit.retry.max_attempts = 1;

    let dispatcher = Dispatcher::new(DispatcherConfig {
        pool: PoolMode::Single,
        circuit,
        dlq: Some(dlq.clone()),
        ..DispatcherConfig::default()
    });

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        Arc::new(FnHandler::with_id("trip.handler", move |_msg| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(internal_error!("always fails"))
            }
        }))
    };

    dispatcher
        .subscribe(Subscription::new(
            "it.trip.Job",
            handler,
            SubscriptionFilter::new(),
        ))
        .await
        .unwrap();

    MessageSchema::builder("it.trip.Job")
        .with_from("svc")
        .register()
        .unwrap();

    for _ in 0..4 {
        let envelope = Envelope::new(
            MessageHeader::new("it.trip.Job", "svc", None, None, 1),
            serde_json::Map::new(),
        );
        dispatcher.route(envelope).await.unwrap();
        settle(&dispatcher).await;
    }

    // Three failing invocations open the circuit; the fourth route goes
    // straight to the dead-letter queue.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(dispatcher.stats().rejected_by_circuit, 1);
    assert_eq!(dlq.size().unwrap(), 4);

    let circuit_stats = dispatcher.circuit_stats("it.trip.Job", "trip.handler").unwrap();
    assert_eq!(circuit_stats.state, smartmessage::CircuitState::Open);

    SchemaRegistry::unregister("it.trip.Job");
}

// =============================================================================
// CONSUMER GROUP FAN-OUT
// =============================================================================

#[tokio::test]
async fn same_group_delivers_to_exactly_one_consumer() {
    let backend = InMemoryBackend::new();
    let settings = TransportSettings {
        queue_prefix: "test".to_string(),
        consumer_group: "g1".to_string(),
        ..TransportSettings::default()
    };

    let d1 = Dispatcher::with_defaults();
    let d2 = Dispatcher::with_defaults();
    let t1 = QueueTransport::new(d1.clone(), backend.clone(), settings.clone());
    let t2 = QueueTransport::new(d2.clone(), backend.clone(), settings);

    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));

    t1.subscribe_pattern(
        "#.*.payment",
        ANY_CLASS,
        counting_handler("payment.consumer1", c1.clone()),
        SubscriptionFilter::new(),
        None,
    )
    .await
    .unwrap();
    t2.subscribe_pattern(
        "#.*.payment",
        ANY_CLASS,
        counting_handler("payment.consumer2", c2.clone()),
        SubscriptionFilter::new(),
        None,
    )
    .await
    .unwrap();

    let schema = MessageSchema::builder("it.payment.Charge")
        .with_from("orders")
        .with_to("payment")
        .with_transport(t1.clone())
        .build()
        .unwrap();

    Message::from_json(schema, json!({}))
        .unwrap()
        .publish()
        .await
        .unwrap();

    // Wait for one of the competing consumers to pop the envelope.
    for _ in 0..100 {
        if c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    d1.quiesce().await;
    d2.quiesce().await;

    assert_eq!(
        c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst),
        1,
        "exactly one group member receives the envelope"
    );

    t1.disconnect().await.unwrap();
    t2.disconnect().await.unwrap();
}

#[tokio::test]
async fn same_group_on_one_transport_load_balances_handlers() {
    let backend = InMemoryBackend::new();
    let settings = TransportSettings {
        queue_prefix: "test".to_string(),
        consumer_group: "g1".to_string(),
        ..TransportSettings::default()
    };

    let dispatcher = Dispatcher::with_defaults();
    let transport = QueueTransport::new(dispatcher.clone(), backend, settings);

    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));

    // Two members of the same group on the same transport instance.
    transport
        .where_()
        .to("ledger")
        .consumer_group("g1")
        .handler(counting_handler("ledger.handler1", c1.clone()))
        .subscribe()
        .await
        .unwrap();
    transport
        .where_()
        .to("ledger")
        .consumer_group("g1")
        .handler(counting_handler("ledger.handler2", c2.clone()))
        .subscribe()
        .await
        .unwrap();

    let schema = MessageSchema::builder("it.ledger.Entry")
        .with_from("orders")
        .with_to("ledger")
        .with_transport(transport.clone())
        .build()
        .unwrap();

    for _ in 0..4 {
        Message::from_json(schema.clone(), json!({}))
            .unwrap()
            .publish()
            .await
            .unwrap();
    }

    for _ in 0..200 {
        if c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst) == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    dispatcher.quiesce().await;

    // Each envelope reaches exactly one member; round-robin splits the
    // four deliveries evenly.
    assert_eq!(c1.load(Ordering::SeqCst) + c2.load(Ordering::SeqCst), 4);
    assert_eq!(c1.load(Ordering::SeqCst), 2);
    assert_eq!(c2.load(Ordering::SeqCst), 2);

    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn distinct_groups_each_receive_the_envelope() {
    let backend = InMemoryBackend::new();
    let base = TransportSettings {
        queue_prefix: "test".to_string(),
        ..TransportSettings::default()
    };

    let d1 = Dispatcher::with_defaults();
    let d2 = Dispatcher::with_defaults();
    let t1 = QueueTransport::new(
        d1.clone(),
        backend.clone(),
        TransportSettings {
            consumer_group: "ga".to_string(),
            ..base.clone()
        },
    );
    let t2 = QueueTransport::new(
        d2.clone(),
        backend.clone(),
        TransportSettings {
            consumer_group: "gb".to_string(),
            ..base
        },
    );

    let ca = Arc::new(AtomicUsize::new(0));
    let cb = Arc::new(AtomicUsize::new(0));

    t1.subscribe_pattern(
        "#.billing",
        ANY_CLASS,
        counting_handler("groups.a", ca.clone()),
        SubscriptionFilter::new(),
        None,
    )
    .await
    .unwrap();
    t2.subscribe_pattern(
        "#.billing",
        ANY_CLASS,
        counting_handler("groups.b", cb.clone()),
        SubscriptionFilter::new(),
        None,
    )
    .await
    .unwrap();

    let schema = MessageSchema::builder("it.groups.Invoice")
        .with_from("orders")
        .with_to("billing")
        .with_transport(t1.clone())
        .build()
        .unwrap();

    Message::from_json(schema, json!({}))
        .unwrap()
        .publish()
        .await
        .unwrap();

    for _ in 0..100 {
        if ca.load(Ordering::SeqCst) == 1 && cb.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(ca.load(Ordering::SeqCst), 1, "group ga sees the envelope");
    assert_eq!(cb.load(Ordering::SeqCst), 1, "group gb sees the envelope");

    t1.disconnect().await.unwrap();
    t2.disconnect().await.unwrap();
}

// =============================================================================
// DEAD LETTER REPLAY
// =============================================================================

#[tokio::test]
async fn replay_all_republishes_in_order_through_override() {
    let dir = tempfile::tempdir().unwrap();
    let dlq = smartmessage::DeadLetterQueue::new(dir.path().join("dead.jsonl")).unwrap();

    let dispatcher = Dispatcher::with_defaults();
    let override_transport = InMemoryTransport::new(
        dispatcher,
        smartmessage::MemoryTransportConfig {
            auto_process: false,
            capacity: None,
            overflow: smartmessage::MemoryOverflowPolicy::DropOldest,
        },
    );

    MessageSchema::builder("it.replay.Order")
        .with_from("orders")
        .with_property(PropertySpec::new("id"))
        .register()
        .unwrap();

    let header_a = MessageHeader::new("it.replay.Order", "orders", None, None, 1);
    let header_b = MessageHeader::new("it.replay.Order", "orders", None, None, 1);

    let mut props_a = serde_json::Map::new();
    props_a.insert("id".to_string(), json!("A"));
    let mut props_b = serde_json::Map::new();
    props_b.insert("id".to_string(), json!("B"));

    dlq.enqueue_envelope(
        &Envelope::new(header_a.clone(), props_a),
        "json",
        "handler exploded",
        "queue",
        3,
    )
    .unwrap();
    dlq.enqueue_envelope(
        &Envelope::new(header_b.clone(), props_b),
        "json",
        "handler exploded",
        "queue",
        3,
    )
    .unwrap();

    let override_dyn: Arc<dyn Transport> = override_transport.clone();
    let replayed = dlq.replay_all(Some(&override_dyn)).await.unwrap();

    assert_eq!(replayed, 2);
    assert_eq!(dlq.size().unwrap(), 0);

    let buffered = override_transport.buffered().await;
    assert_eq!(buffered.len(), 2);
    assert_eq!(buffered[0].properties.get("id"), Some(&json!("A")));
    assert_eq!(buffered[1].properties.get("id"), Some(&json!("B")));

    // Replay restores every header field, including identity.
    assert_eq!(buffered[0].header, header_a);
    assert_eq!(buffered[1].header, header_b);

    SchemaRegistry::unregister("it.replay.Order");
}
