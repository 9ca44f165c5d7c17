//! Restart-mode invariant: a deliberate termination never cancels the
//! session, even when the old process's exit callback fires after the
//! replacement has already launched.

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shufflebox::ProcessSupervisor;
use tempfile::tempdir;

#[tokio::test]
async fn restart_mode_suppresses_cancellation_across_relaunch() {
    let dir = tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(
        "sleep",
        dir.path().to_path_buf(),
        dir.path().join("port.txt"),
    )
    .with_args(["30"]);

    let cancelled = Arc::new(AtomicBool::new(false));
    let exits = Arc::new(AtomicUsize::new(0));
    {
        let cancelled = Arc::clone(&cancelled);
        let exits = Arc::clone(&exits);
        supervisor.on_exit(Arc::new(move |_code, expected| {
            exits.fetch_add(1, Ordering::SeqCst);
            if !expected {
                cancelled.store(true, Ordering::SeqCst);
            }
        }));
    }

    supervisor.launch(40001).unwrap();
    assert!(supervisor.is_running());

    // Deliberate termination with the replacement launched right away, so
    // the old process's exit callback fires after the new launch
    supervisor.set_restart_mode(true);
    supervisor.terminate().await;
    supervisor.relaunch(40001).unwrap();

    // Give the old monitor callback time to fire
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while exits.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(exits.load(Ordering::SeqCst), 1, "old process exit not observed");
    assert!(
        !cancelled.load(Ordering::SeqCst),
        "restart-mode exit must not cancel the session"
    );
    assert!(supervisor.is_running(), "replacement process should be alive");

    // The flag was consumed by the suppressed exit: a genuine termination
    // of the replacement is reported as unexpected
    supervisor.terminate().await;
    assert!(supervisor.wait_exited(Duration::from_secs(5)).await);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while exits.load(Ordering::SeqCst) < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(cancelled.load(Ordering::SeqCst));
}

#[tokio::test]
async fn launch_clears_restart_mode() {
    let dir = tempdir().unwrap();
    let supervisor = ProcessSupervisor::new(
        "sleep",
        dir.path().to_path_buf(),
        dir.path().join("port.txt"),
    )
    .with_args(["30"]);

    supervisor.set_restart_mode(true);
    supervisor.launch(40002).unwrap();
    assert!(!supervisor.restart_mode(), "user-initiated launch clears the flag");

    supervisor.set_restart_mode(true);
    supervisor.terminate().await;
    assert!(supervisor.wait_exited(Duration::from_secs(5)).await);
}
