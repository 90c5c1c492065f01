use filetime::{set_file_mtime, FileTime};
use statusrelay::channel::{Consumer, DeliveryOutcome, MemoryBroker, RecordPublisher, RedeliveryPolicy};
use statusrelay::pipeline::{apply_record, FileRelay};
use statusrelay::record::{ModuleState, RecordProducer, StatusRecord};
use statusrelay::scanner::{DirectoryPoller, PollerConfig};
use statusrelay::signal::ShutdownHandler;
use statusrelay::store::{ModuleStateStore, StoreError};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const WAIT: Duration = Duration::from_millis(20);

fn snapshot(package_id: &str, module_id: &str, state: &str) -> String {
    format!(
        "<InstrumentStatus><PackageID>{package_id}</PackageID><DeviceStatus>\
         <ModuleCategoryID>{module_id}</ModuleCategoryID><IndexWithinRole>0</IndexWithinRole>\
         <RapidControlStatus>&lt;Status&gt;&lt;ModuleState&gt;{state}&lt;/ModuleState&gt;&lt;/Status&gt;</RapidControlStatus>\
         </DeviceStatus></InstrumentStatus>"
    )
}

struct Harness {
    input: TempDir,
    _db_dir: TempDir,
    broker: MemoryBroker,
    poller: DirectoryPoller,
    relay: FileRelay<MemoryBroker>,
    store: ModuleStateStore,
}

impl Harness {
    fn new(use_hash: bool) -> Self {
        let input = tempdir().unwrap();
        let db_dir = tempdir().unwrap();
        let broker = MemoryBroker::new();
        let poller = DirectoryPoller::new(
            PollerConfig::new(input.path()).with_hash(use_hash).with_workers(2),
            ShutdownHandler::new(),
        )
        .unwrap();
        let relay = FileRelay::new(RecordProducer::new(), RecordPublisher::new(broker.clone()));
        let store = ModuleStateStore::open(&db_dir.path().join("instrument.db")).unwrap();

        Self {
            input,
            _db_dir: db_dir,
            broker,
            poller,
            relay,
            store,
        }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.input.path().join(name)
    }

    fn poll(&self) -> statusrelay::scanner::TickSummary {
        self.poller.tick(&|path: &Path| self.relay.relay(path).map(|_| ())).unwrap()
    }

    /// Drain every ready message into the store.
    fn consume_all(&self) -> usize {
        let mut consumer = Consumer::new(
            self.broker.clone(),
            RedeliveryPolicy::default(),
            ShutdownHandler::new(),
        );
        let mut applied = 0;
        let mut apply = |record: &StatusRecord| -> Result<(), StoreError> {
            apply_record(&self.store, record)
        };
        while let Some(outcome) = consumer.process_next(WAIT, &mut apply).unwrap() {
            assert_eq!(outcome, DeliveryOutcome::Acked);
            applied += 1;
        }
        applied
    }
}

#[test]
fn test_new_file_is_published_and_persisted() {
    let harness = Harness::new(false);
    fs::write(harness.path("a.xml"), snapshot("pkg", "M1", "Run")).unwrap();

    let summary = harness.poll();
    assert_eq!(summary.processed, 1);
    assert_eq!(harness.broker.published_count(), 1);

    assert_eq!(harness.consume_all(), 1);
    assert_eq!(harness.store.get("M1").unwrap(), Some(ModuleState::Run));

    // Nothing changed, nothing is published again.
    let summary = harness.poll();
    assert_eq!(summary.unchanged, 1);
    assert_eq!(harness.broker.published_count(), 1);
}

#[test]
fn test_same_size_same_mtime_rewrite_detected_with_hash() {
    let harness = Harness::new(true);
    let path = harness.path("a.xml");

    let first = snapshot("pkgAAAA", "M1", "Run");
    let second = snapshot("pkg", "M1", "Offline");
    assert_eq!(first.len(), second.len());

    let pinned = FileTime::from_unix_time(1_700_000_000, 0);
    fs::write(&path, &first).unwrap();
    set_file_mtime(&path, pinned).unwrap();

    harness.poll();
    harness.consume_all();
    assert_eq!(harness.store.get("M1").unwrap(), Some(ModuleState::Run));

    fs::write(&path, &second).unwrap();
    set_file_mtime(&path, pinned).unwrap();

    let summary = harness.poll();
    assert_eq!(summary.processed, 1);
    assert_eq!(harness.broker.published_count(), 2);

    harness.consume_all();
    assert_eq!(harness.store.get("M1").unwrap(), Some(ModuleState::Offline));
}

#[test]
fn test_same_size_same_mtime_rewrite_missed_without_hash() {
    let harness = Harness::new(false);
    let path = harness.path("a.xml");

    let pinned = FileTime::from_unix_time(1_700_000_000, 0);
    fs::write(&path, snapshot("pkgAAAA", "M1", "Run")).unwrap();
    set_file_mtime(&path, pinned).unwrap();
    harness.poll();

    fs::write(&path, snapshot("pkg", "M1", "Offline")).unwrap();
    set_file_mtime(&path, pinned).unwrap();

    let summary = harness.poll();
    assert_eq!(summary.unchanged, 1);
    assert_eq!(harness.broker.published_count(), 1);
}

#[test]
fn test_deleted_file_is_pruned_without_callback() {
    let harness = Harness::new(false);
    let kept = harness.path("a.xml");
    let deleted = harness.path("b.xml");
    fs::write(&kept, snapshot("p", "M1", "Run")).unwrap();
    fs::write(&deleted, snapshot("p", "M2", "Run")).unwrap();

    harness.poll();
    assert!(harness.poller.cache().contains(&deleted));

    fs::remove_file(&deleted).unwrap();

    let seen = std::sync::Mutex::new(Vec::new());
    let summary = harness
        .poller
        .tick(&|path: &Path| -> Result<(), String> {
            seen.lock().unwrap().push(path.to_path_buf());
            Ok(())
        })
        .unwrap();

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(summary.evicted, 1);
    assert!(!harness.poller.cache().contains(&deleted));
    assert!(harness.poller.cache().contains(&kept));
}

#[test]
fn test_malformed_file_publishes_nothing() {
    let harness = Harness::new(false);
    fs::write(harness.path("broken.xml"), "<InstrumentStatus><DeviceStatus>").unwrap();

    let summary = harness.poll();

    // The file was handled (and will not be retried), but produced no record.
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(harness.broker.published_count(), 0);
    assert_eq!(harness.consume_all(), 0);
    assert!(harness.store.is_empty().unwrap());
}

#[test]
fn test_publish_failure_retries_next_tick() {
    let harness = Harness::new(false);
    fs::write(harness.path("a.xml"), snapshot("p", "M1", "NotReady")).unwrap();
    harness.broker.fail_next_publishes(1);

    let summary = harness.poll();
    assert_eq!(summary.failed, 1);
    assert_eq!(harness.broker.published_count(), 0);

    let summary = harness.poll();
    assert_eq!(summary.processed, 1);
    assert_eq!(harness.broker.published_count(), 1);

    harness.consume_all();
    assert_eq!(harness.store.get("M1").unwrap(), Some(ModuleState::NotReady));
}
