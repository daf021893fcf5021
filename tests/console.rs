//! Console surface driven from an in-memory script

use std::time::Duration;

use bible_voice::console;

mod common;
use common::spawn_daemon;

#[tokio::test]
async fn test_console_saves_key_and_quits() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, store, daemon) = spawn_daemon(&dir);

    let input: &[u8] = b"help\nkey AIza-console-key\nq\n";
    console::run_with(handle.clone(), input).await.unwrap();

    assert_eq!(store.load().api_key.as_deref(), Some("AIza-console-key"));

    // Quitting the console shuts the daemon down
    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon did not exit")
        .unwrap()
        .unwrap();
    assert!(handle.toggle().await.is_err());
}

#[tokio::test]
async fn test_console_end_of_input_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let (handle, _, daemon) = spawn_daemon(&dir);

    let input: &[u8] = b"bogus\n";
    console::run_with(handle, input).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .expect("daemon did not exit")
        .unwrap()
        .unwrap();
}
