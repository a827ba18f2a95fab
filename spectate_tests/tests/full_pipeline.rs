// End-to-end tests for the spectate pipeline.
//
// Each test starts a real relay server and connects real `RelayClient`
// instances (via `TestClient`), verifying the full path:
// player -> relay -> frame log -> controller and spectators, plus the story
// and roster state every client builds from the relay's notices.

use std::thread;
use std::time::Duration;

use flipped_protocol::{DEFAULT_NAME, Role};
use flipped_relay::client::ClientConfig;
use flipped_relay::server::{RelayConfig, RelayHandle, start_relay};
use spectate_tests::TestClient;

fn start() -> (RelayHandle, std::net::SocketAddr) {
    start_relay(RelayConfig {
        port: 0,
        ..RelayConfig::default()
    })
    .unwrap()
}

fn controller(addr: std::net::SocketAddr, name: &str, story: &str) -> TestClient {
    TestClient::connect_with(
        addr,
        ClientConfig {
            name: name.into(),
            role: Role::Controller,
            story_name: Some(story.into()),
            time_limit: Some(30),
            ..ClientConfig::default()
        },
    )
}

fn frames(prefix: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("{prefix}-{i}").into_bytes())
        .collect()
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

/// Controller, player and spectator join; the player's frames reach the
/// other two in order, and the story name set by the controller reaches
/// everyone.
#[test]
fn frames_fan_out_to_watchers() {
    let (handle, addr) = start();
    let mut gm = controller(addr, "GM", "Quest");
    gm.wait_for_peers(1);
    let mut pat = TestClient::connect(addr, "Pat", Role::Player);
    let mut viv = TestClient::connect(addr, "Viv", Role::Spectator);
    for client in [&mut gm, &mut pat, &mut viv] {
        client.wait_for_peers(3);
        client.wait_for_story_name("Quest");
    }

    let sent = frames("img", 3);
    pat.client().send_frames(&sent).unwrap();
    assert_eq!(viv.wait_for_frames(3), sent.as_slice());
    assert_eq!(gm.wait_for_frames(3), sent.as_slice());

    // The player never gets its own frames back.
    thread::sleep(Duration::from_millis(100));
    assert!(pat.frames().is_empty());

    handle.stop();
}

/// A spectator joining mid-session gets the whole history before anything
/// live, with nothing missing or repeated.
#[test]
fn late_joiner_sees_history_then_live() {
    let (handle, addr) = start();
    let mut pat = TestClient::connect(addr, "Pat", Role::Player);
    pat.wait_for_peers(1);

    let history = frames("old", 5);
    pat.client().send_frames(&history).unwrap();
    for _ in 0..500 {
        if handle.frame_count() == 5 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(handle.frame_count(), 5);

    let mut viv = TestClient::connect(addr, "Viv", Role::Spectator);
    assert_eq!(viv.wait_for_frames(5), history.as_slice());

    pat.client().send_frames(&[b"new-0"]).unwrap();
    let all = viv.wait_for_frames(6).to_vec();
    assert_eq!(all.len(), 6);
    assert_eq!(&all[..5], history.as_slice());
    assert_eq!(all[5], b"new-0");

    handle.stop();
}

/// Frames sent while spectators keep joining are seen by each of them
/// exactly once, in order.
#[test]
fn joins_during_streaming_stay_consistent() {
    let (handle, addr) = start();
    let mut pat = TestClient::connect(addr, "Pat", Role::Player);
    pat.wait_for_peers(1);

    let sent = frames("live", 40);
    let streamer = {
        let sent = sent.clone();
        thread::spawn(move || {
            for chunk in sent.chunks(4) {
                pat.client().send_frames(chunk).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
            pat
        })
    };
    let mut watchers: Vec<TestClient> = (0..4)
        .map(|i| {
            thread::sleep(Duration::from_millis(10));
            TestClient::connect(addr, &format!("Viv {i}"), Role::Spectator)
        })
        .collect();
    let _pat = streamer.join().unwrap();

    for viv in &mut watchers {
        assert_eq!(viv.wait_for_frames(40), sent.as_slice());
    }

    handle.stop();
}

/// The player's story start reaches everyone, carrying the story name and
/// the exact start time.
#[test]
fn story_start_announced_with_name() {
    let (handle, addr) = start();
    let mut gm = controller(addr, "GM", "Night Shift");
    gm.wait_for_story_name("Night Shift");
    let mut pat = TestClient::connect(addr, "Pat", Role::Player);
    let mut viv = TestClient::connect(addr, "Viv", Role::Spectator);
    pat.wait_for_story_name("Night Shift");
    viv.wait_for_story_name("Night Shift");

    let started_at = pat.client().send_story_started();
    let expected = ("Night Shift".to_owned(), started_at);
    assert_eq!(viv.wait_for_story_start(), expected);
    assert_eq!(gm.wait_for_story_start(), expected);
    assert_eq!(viv.client().story_started_at(), Some(started_at));

    // Someone arriving afterwards learns the start time on join.
    let mut late = TestClient::connect(addr, "Late", Role::Spectator);
    assert_eq!(late.wait_for_story_start(), expected);

    handle.stop();
}

/// Spectators see who holds each role, and forget a role holder who leaves.
#[test]
fn roster_tracks_roles_and_departures() {
    let (handle, addr) = start();
    let gm = controller(addr, "GM", "Quest");
    let pat = TestClient::connect_with(
        addr,
        ClientConfig {
            name: "Pat".into(),
            role: Role::Player,
            time_limit: Some(60),
            ..ClientConfig::default()
        },
    );
    let mut viv = TestClient::connect(addr, "Viv", Role::Spectator);
    viv.wait_for_peers(3);

    let view = viv.client();
    assert_eq!(view.controller_name(), "GM");
    assert_eq!(view.controller_time_limit(), 30);
    assert_eq!(view.player_name(), "Pat");
    assert_eq!(view.player_time_limit(), 60);
    assert_eq!(view.name(), "Viv");

    pat.client().quit(None);
    viv.wait_until("player to leave", |c| c.client().player().is_none());
    assert_eq!(viv.client().player_name(), DEFAULT_NAME);
    assert_eq!(viv.client().peers().len(), 2);

    gm.client().close();
    viv.wait_for_peers(1);
    assert!(viv.client().controller().is_none());

    handle.stop();
}

/// A relay that asks for a password still lets clients in; the password is
/// passed along, not checked.
#[test]
fn password_protected_relay_accepts_login() {
    let (handle, addr) = start_relay(RelayConfig {
        port: 0,
        password: Some("sesame".into()),
        ..RelayConfig::default()
    })
    .unwrap();
    let mut viv = TestClient::connect_with(
        addr,
        ClientConfig {
            name: "Viv".into(),
            password: Some("sesame".into()),
            ..ClientConfig::default()
        },
    );
    viv.wait_for_peers(1);
    assert!(!viv.client().is_closed());

    handle.stop();
}

/// Stopping the relay closes every client.
#[test]
fn relay_stop_closes_clients() {
    let (handle, addr) = start();
    let mut viv = TestClient::connect(addr, "Viv", Role::Spectator);
    viv.wait_for_peers(1);

    handle.stop();
    viv.wait_for_close();
    assert!(viv.client().is_closed());
}
