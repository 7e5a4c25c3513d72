//! System-message filter and reconnect-policy tests.

use paperflow::channel::protocol::{
    is_system_message, should_reconnect, ChannelTuning, CLOSE_IDLE_TIMEOUT, CLOSE_NORMAL,
    CLOSE_SUPERSEDED,
};
use paperflow::config::TimeoutConfig;
use paperflow::models::progress::{ProgressMessage, ProgressStatus};

#[test]
fn tagged_keepalive_is_system() {
    assert!(is_system_message(&ProgressMessage::keepalive("s1", "ping")));
}

#[test]
fn sentinel_progress_is_system() {
    let mut msg = ProgressMessage::stage("s1", ProgressStatus::Generating, 50, "rendering");
    msg.progress = -1;
    assert!(is_system_message(&msg));
}

#[test]
fn housekeeping_phrases_are_system_even_untagged() {
    for phrase in ["ping", "pong", "keepalive", "Connection established"] {
        let msg = ProgressMessage::stage("s1", ProgressStatus::Generating, 50, phrase);
        assert!(is_system_message(&msg), "phrase {phrase:?} not filtered");
    }
}

#[test]
fn phrase_match_ignores_case_and_whitespace() {
    let msg = ProgressMessage::stage("s1", ProgressStatus::Generating, 50, "  PONG  ");
    assert!(is_system_message(&msg));
}

#[test]
fn real_progress_is_not_system() {
    let msg = ProgressMessage::stage("s1", ProgressStatus::Generating, 80, "rendering sheet 3");
    assert!(!is_system_message(&msg));

    // A message merely containing a housekeeping word is still progress.
    let msg = ProgressMessage::stage("s1", ProgressStatus::Generating, 80, "pinging the renderer");
    assert!(!is_system_message(&msg));
}

#[test]
fn normal_close_never_reconnects() {
    assert!(!should_reconnect(Some(CLOSE_NORMAL)));
}

#[test]
fn abnormal_closes_reconnect() {
    assert!(should_reconnect(None));
    assert!(should_reconnect(Some(CLOSE_IDLE_TIMEOUT)));
    assert!(should_reconnect(Some(CLOSE_SUPERSEDED)));
    assert!(should_reconnect(Some(1006)));
}

#[test]
fn tuning_derives_from_timeout_config() {
    let timeouts = TimeoutConfig::default();
    let tuning = ChannelTuning::from(&timeouts);
    assert_eq!(tuning.ping_interval, timeouts.ping_interval());
    assert_eq!(tuning.reconnect_delay, timeouts.reconnect_delay());
    assert_eq!(
        tuning.max_reconnect_attempts,
        timeouts.max_reconnect_attempts
    );
    // Client pings strictly more often than the server's idle cadence.
    assert!(tuning.ping_interval < std::time::Duration::from_secs(timeouts.idle_interval_seconds));
}
