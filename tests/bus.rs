use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier::outbox::{Outbox, Scope, Store};
use courier::transport::{ConfirmMode, InMemoryBroker, InMemoryProvider, Provider};
use courier::{Bus, BusError, Context, Envelope, HandlerResult, InMemoryStore, Options, Policy};
use tracing_subscriber::EnvFilter;

type TestBus = Bus<InMemoryStore, InMemoryProvider>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options() -> Options {
    Options::default()
        .with_subscribers(2)
        .with_ackers(2)
        .with_retry_interval(Duration::from_millis(1))
        .with_scan_interval(Duration::from_millis(20))
}

fn new_bus(service: &str, store: &InMemoryStore, broker: &InMemoryBroker, options: Options) -> TestBus {
    init_tracing();
    Bus::new(
        service,
        Arc::new(store.clone()),
        Arc::new(broker.connect()),
        options,
    )
}

/// Route `orders/created` to a handler counting its calls.
fn route(bus: &mut TestBus, calls: &Arc<AtomicUsize>, fail: bool) {
    let calls = calls.clone();
    bus.subscribe("orders")
        .handler("created", move |_ctx: &mut Context| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if fail {
                    HandlerResult::Err("boom".into())
                } else {
                    Ok(())
                }
            })
        });
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn table(service: &str) -> String {
    format!("courier_{service}_outbox")
}

#[tokio::test]
async fn confirmed_publish_is_handled_once_and_leaves_no_record() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus("svc_a", &store, &broker, options());
    route(&mut bus, &calls, false);
    let bus = bus.start().await.unwrap();

    bus.publish("orders", "created", b"hello".to_vec(), Policy::default())
        .await
        .unwrap();

    eventually("delivery ack", || broker.acked("svc_a") == 1).await;
    eventually("outbox cleanup", || store.count(&table("svc_a")) == 0).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(broker.dead_letters("svc_a").is_empty());

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_handler_is_retried_then_rejected() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus("svc_b", &store, &broker, options().with_retry_count(3));
    route(&mut bus, &calls, true);
    let bus = bus.start().await.unwrap();

    bus.publish("orders", "created", b"hello".to_vec(), Policy::default())
        .await
        .unwrap();

    eventually("dead letter", || broker.dead_letters("svc_b").len() == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(broker.acked("svc_b"), 0);
    // the publish itself was confirmed
    eventually("outbox cleanup", || store.count(&table("svc_b")) == 0).await;

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn purge_on_startup_drops_pending_messages() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();

    // leftovers of a previous run: a queued message and an unconfirmed record
    let previous = broker.connect();
    previous
        .init("svc_c", false, &["orders".to_owned()])
        .await
        .unwrap();
    previous
        .publish(&Envelope::new("orders", "created", b"old".to_vec(), Policy::fire_and_forget()))
        .await
        .unwrap();
    let outbox = Outbox::new(Arc::new(store.clone()), "svc_c");
    outbox.migrate().await.unwrap();
    let mut stale = Envelope::new("orders", "created", b"stale".to_vec(), Policy::default());
    outbox.stage(Scope::Owned, &mut stale).await.unwrap();
    assert_eq!(broker.queued("svc_c"), 1);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus(
        "svc_c",
        &store,
        &broker,
        options()
            .with_purge_on_startup(true)
            .with_scan_min_age(Duration::ZERO),
    );
    route(&mut bus, &calls, false);
    let bus = bus.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.count(&table("svc_c")), 0);
    assert_eq!(broker.queued("svc_c"), 0);

    bus.shutdown().await.unwrap();
}

#[derive(Debug)]
#[allow(dead_code)]
enum AppError {
    Bus(BusError),
    OutOfStock,
}

impl From<BusError> for AppError {
    fn from(err: BusError) -> Self {
        AppError::Bus(err)
    }
}

#[tokio::test]
async fn failed_transaction_publishes_nothing() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus("svc_d", &store, &broker, options());
    route(&mut bus, &calls, false);
    let bus = bus.start().await.unwrap();

    let tx = store.begin().await.unwrap();
    let result = bus
        .transaction(tx, |tx_bus| async move {
            tx_bus.transaction().await?.insert("orders", b"order-1".to_vec());
            tx_bus
                .publish("orders", "created", b"order-1".to_vec(), Policy::default())
                .await?;
            Err::<(), _>(AppError::OutOfStock)
        })
        .await;

    assert!(matches!(result, Err(AppError::OutOfStock)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.count("orders"), 0);
    assert_eq!(store.count(&table("svc_d")), 0);
    assert_eq!(broker.published(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn committed_transaction_publishes_after_commit() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus("svc_e", &store, &broker, options());
    route(&mut bus, &calls, false);
    let bus = bus.start().await.unwrap();

    let tx = store.begin().await.unwrap();
    let order_id = bus
        .transaction(tx, |tx_bus| async move {
            let id = tx_bus.transaction().await?.insert("orders", b"order-1".to_vec());
            tx_bus
                .publish("orders", "created", b"order-1".to_vec(), Policy::default())
                .await?;
            tx_bus
                .publish("orders", "created", b"audit".to_vec(), Policy::fire_and_forget())
                .await?;
            Ok::<_, AppError>(id)
        })
        .await
        .unwrap();

    assert_eq!(store.rows("orders")[0].0, order_id);
    eventually("both deliveries", || broker.acked("svc_e") == 2).await;
    eventually("outbox cleanup", || store.count(&table("svc_e")) == 0).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn nacked_publish_is_recovered_by_rescan() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    broker.set_confirm_mode(ConfirmMode::Nack);
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus(
        "svc_f",
        &store,
        &broker,
        options().with_scan_min_age(Duration::from_millis(50)),
    );
    route(&mut bus, &calls, false);
    let bus = bus.start().await.unwrap();

    bus.publish("orders", "created", b"hello".to_vec(), Policy::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.count(&table("svc_f")), 1);

    broker.set_confirm_mode(ConfirmMode::Ack);
    eventually("redelivery", || calls.load(Ordering::SeqCst) >= 1).await;
    eventually("outbox cleanup", || store.count(&table("svc_f")) == 0).await;

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_submission_is_recovered_by_rescan() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    broker.fail_publishes(true);
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus(
        "svc_g",
        &store,
        &broker,
        options().with_scan_min_age(Duration::from_millis(30)),
    );
    route(&mut bus, &calls, false);
    let bus = bus.start().await.unwrap();

    // staging succeeds even though the broker refuses the message
    bus.publish("orders", "created", b"hello".to_vec(), Policy::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.count(&table("svc_g")), 1);

    broker.fail_publishes(false);
    eventually("delivery", || calls.load(Ordering::SeqCst) >= 1).await;
    eventually("outbox cleanup", || store.count(&table("svc_g")) == 0).await;

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn records_left_by_a_crash_are_delivered_after_restart() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    let outbox = Outbox::new(Arc::new(store.clone()), "svc_h");
    outbox.migrate().await.unwrap();
    let mut orphan = Envelope::new("orders", "created", b"orphan".to_vec(), Policy::default())
        .with_service("svc_h");
    outbox.stage(Scope::Owned, &mut orphan).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus(
        "svc_h",
        &store,
        &broker,
        options().with_scan_min_age(Duration::from_millis(30)),
    );
    route(&mut bus, &calls, false);
    let bus = bus.start().await.unwrap();

    eventually("delivery", || calls.load(Ordering::SeqCst) >= 1).await;
    eventually("outbox cleanup", || store.count(&table("svc_h")) == 0).await;

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn fire_and_forget_skips_the_outbox() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus("svc_i", &store, &broker, options().with_looper(false));
    route(&mut bus, &calls, false);
    let bus = bus.start().await.unwrap();

    bus.publish("orders", "created", b"hello".to_vec(), Policy::fire_and_forget())
        .await
        .unwrap();

    eventually("delivery", || calls.load(Ordering::SeqCst) == 1).await;
    assert_eq!(store.count(&table("svc_i")), 0);

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn middleware_sees_every_delivery_of_its_topic() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    let seen = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus("svc_j", &store, &broker, options().with_retry_count(0));
    let counter = seen.clone();
    bus.subscribe("orders")
        .middleware(move |ctx: &mut Context| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { ctx.next().await })
        })
        .handler("created", |_ctx: &mut Context| Box::pin(async { Ok(()) }));
    let bus = bus.start().await.unwrap();

    bus.publish("orders", "created", b"1".to_vec(), Policy::default())
        .await
        .unwrap();
    // no handler for this name: the middleware runs, the delivery is rejected
    bus.publish("orders", "cancelled", b"2".to_vec(), Policy::default())
        .await
        .unwrap();

    eventually("settlements", || {
        broker.acked("svc_j") == 1 && broker.dead_letters("svc_j").len() == 1
    })
    .await;
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(broker.dead_letters("svc_j")[0].handler, "cancelled");

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_consuming() {
    let store = InMemoryStore::default();
    let broker = InMemoryBroker::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut bus = new_bus("svc_k", &store, &broker, options());
    route(&mut bus, &calls, false);
    let bus = bus.start().await.unwrap();
    bus.shutdown().await.unwrap();

    let producer = broker.connect();
    producer
        .init("svc_k", false, &["orders".to_owned()])
        .await
        .unwrap();
    producer
        .publish(&Envelope::new("orders", "created", b"late".to_vec(), Policy::fire_and_forget()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(broker.queued("svc_k"), 1);
}
