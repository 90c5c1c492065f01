use statusrelay::channel::{MemoryBroker, RecordPublisher};
use statusrelay::pipeline::{run_watch, FileRelay};
use statusrelay::record::RecordProducer;
use statusrelay::scanner::{DirectoryPoller, PollerConfig};
use statusrelay::signal::ShutdownHandler;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const SNAPSHOT: &str = "<InstrumentStatus><PackageID>p</PackageID><DeviceStatus>\
    <ModuleCategoryID>PUMP</ModuleCategoryID></DeviceStatus></InstrumentStatus>";

#[test]
fn test_many_files_each_processed_once() {
    let dir = tempdir().unwrap();
    for i in 0..50 {
        fs::write(dir.path().join(format!("file{:02}.xml", i)), format!("<n>{}</n>", i)).unwrap();
    }

    let poller = DirectoryPoller::new(
        PollerConfig::new(dir.path()).with_workers(4),
        ShutdownHandler::new(),
    )
    .unwrap();
    let calls: Mutex<HashMap<PathBuf, usize>> = Mutex::new(HashMap::new());
    let handler = |path: &Path| -> Result<(), String> {
        *calls.lock().unwrap().entry(path.to_path_buf()).or_default() += 1;
        Ok(())
    };

    let first = poller.tick(&handler).unwrap();
    let second = poller.tick(&handler).unwrap();

    assert_eq!(first.listed, 50);
    assert_eq!(first.processed, 50);
    assert_eq!(second.unchanged, 50);
    let calls = calls.into_inner().unwrap();
    assert_eq!(calls.len(), 50);
    assert!(calls.values().all(|&n| n == 1));
}

#[test]
fn test_only_matching_top_level_files_are_listed() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.xml"), "<a/>").unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
    fs::create_dir(dir.path().join("archive")).unwrap();
    fs::write(dir.path().join("archive").join("old.xml"), "<old/>").unwrap();

    let poller = DirectoryPoller::new(PollerConfig::new(dir.path()), ShutdownHandler::new()).unwrap();
    let seen = Mutex::new(Vec::new());
    let summary = poller
        .tick(&|path: &Path| -> Result<(), String> {
            seen.lock().unwrap().push(path.file_name().unwrap().to_owned());
            Ok(())
        })
        .unwrap();

    assert_eq!(summary.listed, 1);
    assert_eq!(seen.into_inner().unwrap(), vec![std::ffi::OsString::from("a.xml")]);
}

#[test]
fn test_custom_pattern() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.xml"), "<a/>").unwrap();
    fs::write(dir.path().join("b.status"), "<b/>").unwrap();

    let poller = DirectoryPoller::new(
        PollerConfig::new(dir.path()).with_pattern("*.status"),
        ShutdownHandler::new(),
    )
    .unwrap();
    let summary = poller.tick(&|_: &Path| -> Result<(), String> { Ok(()) }).unwrap();

    assert_eq!(summary.listed, 1);
    assert!(poller.cache().contains(&dir.path().join("b.status")));
}

#[test]
fn test_watch_picks_up_files_written_while_running() {
    let dir = tempdir().unwrap();
    let shutdown = ShutdownHandler::new();
    let poller = DirectoryPoller::new(
        PollerConfig::new(dir.path()).with_interval(Duration::from_millis(10)),
        shutdown.clone(),
    )
    .unwrap();
    let broker = MemoryBroker::new();
    let relay = FileRelay::new(RecordProducer::new(), RecordPublisher::new(broker.clone()));

    let stats = thread::scope(|scope| {
        let watcher = scope.spawn(|| run_watch(&poller, &relay));

        fs::write(dir.path().join("late.xml"), SNAPSHOT).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while broker.published_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.request_shutdown();

        watcher.join().unwrap()
    });

    assert!(stats.poller.ticks >= 1);
    assert_eq!(stats.published, 1);
    assert_eq!(stats.publish_failures, 0);
    assert_eq!(broker.ready_len(), 1);
}
