//! Speech dispatcher process tests
//!
//! A shell stands in for the OS speak command.

#![cfg(unix)]

use std::time::{Duration, Instant};

use bible_voice::voice::{SpeechCommand, SpeechDispatcher, SpeechHandle, Speaker};

fn shell(script: &str) -> SpeechCommand {
    SpeechCommand::new("sh", vec!["-c".to_string(), script.to_string()])
}

fn is_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_cancel_removes_process_and_file() {
    let dispatcher =
        SpeechDispatcher::new(shell("exec sleep 30"), Duration::from_millis(500)).unwrap();

    for text in ["", "Hey", "And God said, Let there be light: and there was light."] {
        let mut job = dispatcher.spawn(text).unwrap();
        let pid = job.id().unwrap();
        let path = job.text_path().unwrap().to_path_buf();
        assert!(path.exists());

        tokio_test::assert_ok!(job.cancel().await);

        assert!(!path.exists(), "text file left behind");
        assert!(!is_alive(pid), "speech process still running");
        assert!(job.is_cancelled());

        // Cleanup is idempotent
        tokio_test::assert_ok!(job.cancel().await);
    }
}

#[tokio::test]
async fn test_cancel_kills_after_grace_period() {
    let grace = Duration::from_millis(200);
    let dispatcher = SpeechDispatcher::new(shell("trap '' TERM; sleep 5"), grace).unwrap();

    let mut job = dispatcher.spawn("stubborn").unwrap();
    let pid = job.id().unwrap();
    // Let the shell install its trap
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    job.cancel().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= grace, "killed before the grace period: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "cancel took {elapsed:?}");
    assert!(!is_alive(pid));
}

#[tokio::test]
async fn test_natural_completion_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let seen = dir.path().join("seen.txt");
    let dispatcher = SpeechDispatcher::new(
        shell(&format!("cat \"$1\" >> {}", seen.display())),
        Duration::from_millis(200),
    )
    .unwrap();

    let mut job = dispatcher.spawn("Noah built the ark.").unwrap();
    let first = job.text_path().unwrap().to_path_buf();
    job.wait().await.unwrap();
    assert!(!first.exists());

    let mut job = dispatcher.spawn(" And the rain came.").unwrap();
    let second = job.text_path().unwrap().to_path_buf();
    job.wait().await.unwrap();
    assert!(!second.exists());

    assert_eq!(
        std::fs::read_to_string(&seen).unwrap(),
        "Noah built the ark. And the rain came."
    );
}

#[tokio::test]
async fn test_speaker_trait_waits_for_exit() {
    let dir = tempfile::tempdir().unwrap();
    let seen = dir.path().join("seen.txt");
    let dispatcher = SpeechDispatcher::new(
        shell(&format!("cp \"$1\" {}", seen.display())),
        Duration::from_millis(200),
    )
    .unwrap();

    let mut handle = dispatcher.speak("Let there be light.").await.unwrap();
    handle.wait().await.unwrap();

    assert_eq!(std::fs::read_to_string(&seen).unwrap(), "Let there be light.");
}

#[tokio::test]
async fn test_noisy_stderr_does_not_block_wait() {
    let dispatcher = SpeechDispatcher::new(
        shell("head -c 262144 /dev/zero >&2; exit 0"),
        Duration::from_millis(200),
    )
    .unwrap();

    let mut job = dispatcher.spawn("loud").unwrap();
    let path = job.text_path().unwrap().to_path_buf();

    let finished = tokio::time::timeout(Duration::from_secs(5), job.wait()).await;
    tokio_test::assert_ok!(finished.expect("wait blocked on a full stderr pipe"));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_failing_command_with_noisy_stderr_still_returns() {
    let dispatcher = SpeechDispatcher::new(
        shell("head -c 262144 /dev/zero >&2; exit 3"),
        Duration::from_millis(200),
    )
    .unwrap();

    let mut job = dispatcher.spawn("loud").unwrap();
    let finished = tokio::time::timeout(Duration::from_secs(5), job.wait()).await;
    tokio_test::assert_ok!(finished.expect("wait blocked on a full stderr pipe"));
}

#[tokio::test]
async fn test_dropped_job_leaves_no_file() {
    let dispatcher =
        SpeechDispatcher::new(shell("exec sleep 30"), Duration::from_millis(200)).unwrap();

    let job = dispatcher.spawn("dropped").unwrap();
    let path = job.text_path().unwrap().to_path_buf();
    drop(job);

    assert!(!path.exists());
}
