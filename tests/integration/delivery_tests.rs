use statusrelay::channel::{
    Consumer, DeliveryOutcome, MemoryBroker, MessageSink, MessageSource, RecordPublisher,
    RedeliveryPolicy,
};
use statusrelay::pipeline::{apply_record, run_consume};
use statusrelay::record::{ModuleEntry, ModuleState, StatusRecord};
use statusrelay::signal::ShutdownHandler;
use statusrelay::store::{ModuleStateStore, StoreError};
use std::time::Duration;
use tempfile::tempdir;

const WAIT: Duration = Duration::from_millis(20);

fn record(entries: &[(&str, ModuleState)]) -> StatusRecord {
    StatusRecord::new(
        Some("pkg".to_string()),
        entries
            .iter()
            .map(|(id, state)| ModuleEntry::new(*id, *state))
            .collect(),
    )
}

fn fast_policy(max_deliveries: u32) -> RedeliveryPolicy {
    RedeliveryPolicy {
        max_deliveries,
        requeue_delay: Duration::ZERO,
    }
}

#[test]
fn test_unacked_delivery_survives_consumer_crash() {
    let dir = tempdir().unwrap();
    let store = ModuleStateStore::open(&dir.path().join("db.sqlite")).unwrap();
    let broker = MemoryBroker::new();
    let publisher = RecordPublisher::new(broker.clone());
    publisher
        .publish_record(&record(&[("M1", ModuleState::Run)]))
        .unwrap();

    // The first consumer receives the message and dies before acknowledging.
    let mut crashed = broker.clone();
    let delivery = crashed.next_delivery(WAIT).unwrap().unwrap();
    assert!(!delivery.redelivered);
    drop(crashed);
    assert_eq!(broker.unacked_len(), 1);

    assert_eq!(broker.recover(), 1);

    let mut consumer = Consumer::new(broker.clone(), fast_policy(3), ShutdownHandler::new());
    let mut apply = |r: &StatusRecord| -> Result<(), StoreError> { apply_record(&store, r) };
    assert_eq!(
        consumer.process_next(WAIT, &mut apply).unwrap(),
        Some(DeliveryOutcome::Acked)
    );
    assert_eq!(store.get("M1").unwrap(), Some(ModuleState::Run));
    assert_eq!(broker.ready_len() + broker.unacked_len(), 0);
}

#[test]
fn test_crash_after_commit_redelivery_is_harmless() {
    let dir = tempdir().unwrap();
    let store = ModuleStateStore::open(&dir.path().join("db.sqlite")).unwrap();
    let broker = MemoryBroker::new();
    let message = record(&[("M1", ModuleState::Offline), ("M2", ModuleState::Run)]);
    broker.publish(&message.to_wire().unwrap()).unwrap();

    // Applied, but the process died before the ack went out.
    let mut crashed = broker.clone();
    let delivery = crashed.next_delivery(WAIT).unwrap().unwrap();
    let decoded = StatusRecord::from_wire(&delivery.payload).unwrap();
    apply_record(&store, &decoded).unwrap();
    let before = store.list().unwrap();
    broker.recover();

    let mut consumer = Consumer::new(broker.clone(), fast_policy(3), ShutdownHandler::new());
    let mut apply = |r: &StatusRecord| -> Result<(), StoreError> { apply_record(&store, r) };
    consumer.process_next(WAIT, &mut apply).unwrap();

    let after = store.list().unwrap();
    assert_eq!(after.len(), 2);
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.module_id, b.module_id);
        assert_eq!(a.state, b.state);
    }
}

#[test]
fn test_store_failure_requeues_until_dead_letter() {
    let broker = MemoryBroker::new();
    broker
        .publish(&record(&[("M1", ModuleState::Run)]).to_wire().unwrap())
        .unwrap();

    let mut consumer = Consumer::new(broker.clone(), fast_policy(2), ShutdownHandler::new());
    let mut failing = |_: &StatusRecord| -> Result<(), String> { Err("disk full".to_string()) };

    assert_eq!(
        consumer.process_next(WAIT, &mut failing).unwrap(),
        Some(DeliveryOutcome::Requeued)
    );
    assert_eq!(
        consumer.process_next(WAIT, &mut failing).unwrap(),
        Some(DeliveryOutcome::DeadLettered)
    );
    assert_eq!(broker.dead_letters().len(), 1);
    assert_eq!(broker.ready_len() + broker.unacked_len(), 0);
}

#[test]
fn test_run_consume_drains_until_closed() {
    let dir = tempdir().unwrap();
    let store = ModuleStateStore::open(&dir.path().join("db.sqlite")).unwrap();
    let broker = MemoryBroker::new();
    let publisher = RecordPublisher::new(broker.clone());

    publisher
        .publish_record(&record(&[("M1", ModuleState::Online)]))
        .unwrap();
    publisher
        .publish_record(&record(&[("M1", ModuleState::Run), ("M2", ModuleState::NotReady)]))
        .unwrap();
    broker.publish(b"{ not json").unwrap();
    broker.close();

    let mut consumer = Consumer::new(broker.clone(), fast_policy(1), ShutdownHandler::new());
    let stats = run_consume(&mut consumer, &store);

    assert_eq!(stats.acked, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(store.get("M1").unwrap(), Some(ModuleState::Run));
    assert_eq!(store.get("M2").unwrap(), Some(ModuleState::NotReady));
}
