use r4_core::config::VolumeConfig;
use r4_core::test_utils::mock_super_block_with;
use r4_core::Completion;
use r4_daemon::Ktxnmgrd;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_kick_during_scan_rescans_without_sleeping() {
    let mut config = VolumeConfig::default();
    // long enough that a second scan can only come from the rescan path
    config.ktxnmgrd.timeout_ms = 600_000;
    let (sb, txn, _) = mock_super_block_with("ktxnmgrd-rescan", config);

    let entered = Arc::new(Completion::new());
    let gate = Arc::new(Completion::new());
    {
        let entered = Arc::clone(&entered);
        let gate = Arc::clone(&gate);
        txn.on_commit(move || {
            entered.complete();
            gate.wait();
        });
    }

    let daemon = Ktxnmgrd::start(&sb).unwrap();
    daemon.kick().unwrap();
    assert!(entered.wait_timeout(Duration::from_secs(10)));

    // mid-scan
    daemon.kick().unwrap();
    gate.complete();

    wait_for(|| txn.stats().commit_calls == 2);
    let stats = daemon.stats();
    assert_eq!(stats.scans, 2);
    assert_eq!(stats.rescans, 1);

    daemon.stop();
    assert_eq!(txn.stats().commit_calls, 2);
}

#[test]
fn test_kick_while_idle_scans_once() {
    let mut config = VolumeConfig::default();
    config.ktxnmgrd.timeout_ms = 600_000;
    let (sb, txn, _) = mock_super_block_with("ktxnmgrd-idle", config);

    let daemon = Ktxnmgrd::start(&sb).unwrap();
    daemon.kick().unwrap();
    wait_for(|| daemon.stats().scans == 1);
    thread::sleep(Duration::from_millis(20));

    let stats = daemon.stats();
    assert_eq!(stats.scans, 1);
    assert_eq!(stats.rescans, 0);
    assert_eq!(txn.stats().commit_calls, 1);
}
