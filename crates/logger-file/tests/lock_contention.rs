//! Writers sharing one set of log files

use pretty_assertions::assert_eq;
use serial_test::serial;
use spool_logger::{Log, Registry};
use spool_logger_file::{FileLog, LockFile, MemoryPlatform};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

fn read_all(log: &FileLog) -> Vec<String> {
    log.log_files()
        .iter()
        .rev()
        .filter_map(|path| fs::read_to_string(path).ok())
        .flat_map(|contents| contents.lines().map(str::to_string).collect::<Vec<_>>())
        .collect()
}

#[test]
#[serial]
fn test_held_log_lock_delays_write() {
    let dir = tempfile::tempdir().unwrap();
    let platform = MemoryPlatform::new();
    let log = Arc::new(
        FileLog::builder(dir.path())
            .platform(Arc::new(platform.clone()))
            .build()
            .unwrap(),
    );
    let other = LockFile::open(&platform, log.files().lock_file()).unwrap();
    let held = other.try_lock_log().unwrap().unwrap();

    let registry = Registry::shared();
    assert!(registry.install(log.clone()).unwrap());

    let logger = registry.logger(None, "Held").unwrap();
    let writer = thread::spawn(move || logger.wtf("waited for the lock"));

    thread::sleep(Duration::from_millis(300));
    assert!(!writer.is_finished());
    assert_eq!(fs::read_to_string(&log.log_files()[0]).unwrap(), "");

    held.release().unwrap();
    assert_eq!(writer.join().unwrap(), 1);
    assert!(read_all(&log)[0].ends_with("Held: waited for the lock"));

    assert!(registry.uninstall(log.uid()).unwrap());
    assert!(log.join_blocking(TIMEOUT));
    assert_eq!(platform.held_ranges(log.files().lock_file()), 0);
}

#[test]
#[serial]
fn test_concurrent_writers_lose_nothing() {
    const WRITERS: usize = 2;
    const LINES: usize = 50;

    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MemoryPlatform::new());
    let writers = (0..WRITERS)
        .map(|_| {
            let log = Arc::new(
                FileLog::builder(dir.path())
                    .max_logs(20)
                    .max_log_size_unchecked(1_000)
                    .platform(platform.clone())
                    .build()
                    .unwrap(),
            );
            let registry = Registry::shared();
            assert!(registry.install(log.clone()).unwrap());
            (registry, log)
        })
        .collect::<Vec<_>>();

    let handles = writers
        .iter()
        .enumerate()
        .map(|(w, (registry, _))| {
            let logger = registry.logger(Some("shared"), "Writer").unwrap();
            thread::spawn(move || {
                for i in 0..LINES {
                    assert_eq!(logger.i(format!("writer {w} line {i}")), 1);
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    for (registry, log) in &writers {
        assert!(registry.uninstall(log.uid()).unwrap());
        assert!(log.join_blocking(TIMEOUT));
    }

    let log = &writers[0].1;
    let lines = read_all(log);
    assert_eq!(lines.len(), WRITERS * LINES);
    for w in 0..WRITERS {
        let mine = lines
            .iter()
            .filter(|line| line.contains(&format!("[shared]Writer: writer {w} line ")))
            .count();
        assert_eq!(mine, LINES);
    }
    // Rotation happened and never left a file far past the limit.
    assert!(log.log_files()[1].exists());
    for path in log.log_files().iter().filter(|path| path.exists()) {
        assert!(fs::metadata(path).unwrap().len() < 1_000 + 200);
    }
    assert!(!log.files().rotate_marker().exists());
}
