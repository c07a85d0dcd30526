//! Main-layer lifecycle: start, pause/resume, seek, stop, volume invariants

mod helpers;

use std::time::Duration;

use helpers::{test_config, Fixture};
use lumiere::error::Error;
use lumiere::types::{PlayerState, RepeatMode};

#[tokio::test(start_paused = true)]
async fn start_requires_playlist() {
    let fixture = Fixture::new(0, 0.0, test_config(3.0, RepeatMode::Off));
    let err = fixture
        .player
        .start_playing(Duration::ZERO)
        .await
        .unwrap_err();
    assert_eq!(err, Error::EmptyPlaylist);
    assert_eq!(fixture.player.state(), PlayerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn start_plays_first_track() {
    let fixture = Fixture::new(2, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(2).await;

    assert_eq!(fixture.player.state(), PlayerState::Playing);
    assert!(fixture.slot_playing('a'));
    assert!(!fixture.slot_playing('b'));
    let track = fixture.player.current_track().unwrap();
    assert_eq!(track.uri, "track-0");
    assert!((track.duration().unwrap() - 30.0).abs() < 0.05);
    // format info gained on load
    assert_eq!(track.info.unwrap().sample_rate, helpers::RATE);
}

#[tokio::test(start_paused = true)]
async fn start_twice_is_invalid() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;
    let err = fixture
        .player
        .start_playing(Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[tokio::test(start_paused = true)]
async fn missing_file_surfaces_load_error() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture
        .player
        .load_playlist(vec![lumiere::types::Track::new("nonexistent")])
        .await
        .unwrap();
    let err = fixture
        .player
        .start_playing(Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FileLoadFailed { .. }));
    assert_eq!(fixture.player.state(), PlayerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn volume_invariant_holds() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;

    fixture.player.set_volume(0.6);
    assert!((fixture.player.volume() - 0.6).abs() < 1e-6);
    assert!((fixture.main_mixer_volume() - 0.6).abs() < 1e-6);
    assert!((fixture.slot_mixer_volume('a') - 0.6).abs() < 1e-6);

    // clamping
    fixture.player.set_volume(1.5);
    assert_eq!(fixture.player.volume(), 1.0);
    fixture.player.set_volume(-0.2);
    assert_eq!(fixture.player.volume(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn pause_then_resume_preserves_position() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    fixture.player.pause().await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Paused);
    assert!(!fixture.slot_playing('a'));

    let paused_at = fixture.player.position().current_time;
    assert!((paused_at - 5.0).abs() < 0.6, "paused at {paused_at}");

    tokio::time::sleep(Duration::from_secs(10)).await;
    fixture.player.resume().await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Playing);
    assert!(fixture.slot_playing('a'));

    tokio::time::sleep(Duration::from_millis(600)).await;
    let resumed = fixture.player.position().current_time;
    // the subject ticks at 0.5 s, so allow mirror lag on top of the fades
    assert!(
        (resumed - paused_at).abs() < 1.5,
        "resumed at {resumed}, paused at {paused_at}"
    );
    // mixer restored to target after the resume fade
    assert!((fixture.slot_mixer_volume('a') - 1.0).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn pause_is_idempotent() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;
    fixture.player.pause().await.unwrap();
    fixture.player.pause().await.unwrap();
    fixture.player.resume().await.unwrap();
    fixture.player.resume().await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Playing);
}

#[tokio::test(start_paused = true)]
async fn stop_lands_in_finished_with_everything_zeroed() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    fixture.player.stop(Duration::from_millis(500)).await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Finished);
    assert!(fixture.player.current_track().is_none());
    assert_eq!(fixture.player.position().current_time, 0.0);
    assert!(!fixture.slot_playing('a'));
    assert!(!fixture.slot_playing('b'));
    assert_eq!(fixture.slot_mixer_volume('a'), 0.0);
    assert_eq!(fixture.slot_mixer_volume('b'), 0.0);

    // stop in terminal state still succeeds
    fixture.player.stop(Duration::ZERO).await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Finished);
}

#[tokio::test(start_paused = true)]
async fn finish_requires_active_playback() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    let err = fixture.player.finish(Duration::from_secs(3)).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    fixture.start(1).await;
    fixture.player.finish(Duration::from_millis(300)).await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Finished);
}

#[tokio::test(start_paused = true)]
async fn seek_reports_position_within_tolerance() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    fixture
        .player
        .seek(Duration::from_secs(20), Duration::from_millis(100))
        .await
        .unwrap();

    // the position subject reports the new position within half a second
    tokio::time::sleep(Duration::from_millis(500)).await;
    let position = fixture.player.position().current_time;
    assert!(
        (position - 20.0).abs() < 1.0,
        "position after seek: {position}"
    );
    // seek past the end clamps
    fixture
        .player
        .seek(Duration::from_secs(90), Duration::ZERO)
        .await
        .unwrap();
    assert!(fixture.player.position().current_time <= 30.0);
}

#[tokio::test(start_paused = true)]
async fn skip_forward_moves_by_interval() {
    let fixture = Fixture::new(1, 60.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    fixture
        .player
        .skip_forward(Duration::from_secs(15))
        .await
        .unwrap();
    let position = fixture.player.position().current_time;
    assert!((position - 25.0).abs() < 1.2, "position {position}");

    fixture
        .player
        .skip_backward(Duration::from_secs(15))
        .await
        .unwrap();
    let position = fixture.player.position().current_time;
    assert!((position - 10.0).abs() < 1.5, "position {position}");
}

#[tokio::test(start_paused = true)]
async fn natural_end_with_repeat_off_finishes() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;

    // the host reports the file fully played
    fixture
        .graph
        .player("player-a")
        .unwrap()
        .finish_scheduled();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(fixture.player.state(), PlayerState::Finished);
    assert!(fixture.player.current_track().is_none());
}

#[tokio::test(start_paused = true)]
async fn natural_end_advances_playlist() {
    let fixture = Fixture::new(3, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(3).await;

    fixture
        .graph
        .player("player-a")
        .unwrap()
        .finish_scheduled();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(fixture.player.state(), PlayerState::Playing);
    assert_eq!(fixture.player.current_track().unwrap().uri, "track-1");
}

#[tokio::test(start_paused = true)]
async fn update_configuration_stops_playback() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;

    let mut config = test_config(8.0, RepeatMode::Playlist);
    config.volume = 0.5;
    fixture.player.update_configuration(config).await.unwrap();

    assert_eq!(fixture.player.state(), PlayerState::Finished);
    assert!((fixture.player.volume() - 0.5).abs() < 1e-6);
    let stored = fixture.player.configuration().await;
    assert_eq!(stored.repeat_mode, RepeatMode::Playlist);
    assert_eq!(stored.crossfade_duration, Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn invalid_configuration_rejected() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    let mut config = test_config(3.0, RepeatMode::Off);
    config.crossfade_duration = Duration::from_millis(100);
    let err = fixture.player.update_configuration(config).await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration { .. }));
}
