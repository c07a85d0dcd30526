//! Transition behavior through the facade: gapless loops, skips with rate
//! limiting, pause during crossfade, playlist replacement mid-fade

mod helpers;

use std::time::Duration;

use helpers::{test_config, Fixture};
use lumiere::error::Error;
use lumiere::types::{CrossfadePhase, PlayerState, RepeatMode};

#[tokio::test(start_paused = true)]
async fn single_track_loops_gaplessly() {
    // 10 s track, 3 s crossfade: the loop transition arms at t = 7 s
    let fixture = Fixture::new(1, 10.0, test_config(3.0, RepeatMode::SingleTrack));
    fixture.start(1).await;

    tokio::time::sleep(Duration::from_secs_f64(7.3)).await;
    let progress = fixture.player.subscribe_crossfade_progress();
    assert!(
        matches!(progress.borrow().phase, CrossfadePhase::Fading(_)),
        "expected loop crossfade near t=7, got {:?}",
        progress.borrow().phase
    );
    // the incoming iteration plays on the other slot
    assert!(fixture.slot_playing('a'));
    assert!(fixture.slot_playing('b'));

    tokio::time::sleep(Duration::from_secs_f64(3.5)).await;
    // fade done: flipped to B, outgoing slot silenced
    assert_eq!(progress.borrow().phase, CrossfadePhase::Idle);
    assert!(fixture.slot_playing('b'));
    assert!(!fixture.slot_playing('a'));
    assert_eq!(fixture.slot_mixer_volume('a'), 0.0);
    assert!((fixture.slot_mixer_volume('b') - 1.0).abs() < 1e-6);

    // position restarted: the new iteration is ~3.5 s in, far from the old 10 s
    let position = fixture.player.position().current_time;
    assert!(position < 4.5, "position after loop: {position}");
    assert_eq!(fixture.player.state(), PlayerState::Playing);
}

#[tokio::test(start_paused = true)]
async fn completing_slot_never_surfaces_after_switch() {
    let fixture = Fixture::new(1, 10.0, test_config(3.0, RepeatMode::SingleTrack));
    fixture.start(1).await;

    // run through the automatic loop switch
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(fixture.slot_playing('b'));

    // the old slot's file "runs out" at the host level; its completion is
    // stale and must not retrigger anything
    fixture.graph.player("player-a").unwrap().finish_scheduled();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fixture.slot_playing('b'));
    assert_eq!(fixture.player.state(), PlayerState::Playing);
}

#[tokio::test(start_paused = true)]
async fn skip_rate_limit() {
    let fixture = Fixture::new(4, 30.0, test_config(3.0, RepeatMode::Playlist));
    fixture.start(4).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let first = fixture.player.skip_to_next().await.unwrap();
    assert_eq!(first.uri, "track-1");

    // 0.3 s later: rejected
    tokio::time::sleep(Duration::from_millis(300)).await;
    let err = fixture.player.skip_to_next().await.unwrap_err();
    assert!(matches!(err, Error::RateLimited(_)), "got {err:?}");

    // 0.6 s after that: accepted
    tokio::time::sleep(Duration::from_millis(600)).await;
    let third = fixture.player.skip_to_next().await.unwrap();
    assert_eq!(third.uri, "track-2");
}

#[tokio::test(start_paused = true)]
async fn skip_past_end_with_repeat_off() {
    let fixture = Fixture::new(1, 30.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let err = fixture.player.skip_to_next().await.unwrap_err();
    assert_eq!(err, Error::NoNextTrack);
    // sit out the rate-limit window before the next attempt
    tokio::time::sleep(Duration::from_millis(600)).await;
    let err = fixture.player.skip_to_previous().await.unwrap_err();
    assert_eq!(err, Error::NoPreviousTrack);
}

#[tokio::test(start_paused = true)]
async fn pause_mid_crossfade_then_resume() {
    let fixture = Fixture::new(2, 60.0, test_config(5.0, RepeatMode::Off));
    fixture.start(2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    fixture.player.skip_to_next().await.unwrap();
    // 2 s into the 5 s fade
    tokio::time::sleep(Duration::from_secs(2)).await;
    fixture.player.pause().await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Paused);
    // both players halted mid-fade, volumes held
    assert!(!fixture.slot_playing('a'));
    assert!(!fixture.slot_playing('b'));
    let held_a = fixture.slot_mixer_volume('a');
    let held_b = fixture.slot_mixer_volume('b');
    assert!(held_a > 0.2 && held_a < 0.9, "active held at {held_a}");
    assert!(held_b > 0.1 && held_b < 0.8, "inactive held at {held_b}");

    // resume finishes the remaining ~3 s and switches
    tokio::time::sleep(Duration::from_secs(3)).await;
    fixture.player.resume().await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Playing);
    tokio::time::sleep(Duration::from_secs_f64(3.5)).await;

    assert!(fixture.slot_playing('b'));
    assert!(!fixture.slot_playing('a'));
    assert_eq!(fixture.slot_mixer_volume('a'), 0.0);
    assert!((fixture.slot_mixer_volume('b') - 1.0).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn stop_during_paused_crossfade_discards_snapshot() {
    let fixture = Fixture::new(2, 60.0, test_config(5.0, RepeatMode::Off));
    fixture.start(2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    fixture.player.skip_to_next().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    fixture.player.pause().await.unwrap();

    fixture.player.stop(Duration::ZERO).await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Finished);

    // resume after stop stays in the terminal state
    fixture.player.resume().await.unwrap();
    assert_eq!(fixture.player.state(), PlayerState::Finished);
}

#[tokio::test(start_paused = true)]
async fn replace_playlist_mid_crossfade_fast_forwards() {
    let fixture = Fixture::new(4, 60.0, test_config(5.0, RepeatMode::Off));
    fixture.start(2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    fixture.player.skip_to_next().await.unwrap();
    // drive to mid-fade (p ≈ 0.5)
    tokio::time::sleep(Duration::from_secs_f64(2.5)).await;

    // swapping the playlist mid-fade completes the old fade early, then
    // crossfades from the new active into the replacement's first track
    fixture
        .player
        .replace_playlist(fixture.tracks(3))
        .await
        .unwrap();
    assert_eq!(fixture.player.current_track().unwrap().uri, "track-0");

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(fixture.player.state(), PlayerState::Playing);
    // exactly one slot playing after everything settles
    assert!(fixture.slot_playing('a') ^ fixture.slot_playing('b'));
}

#[tokio::test(start_paused = true)]
async fn seek_cancels_active_crossfade() {
    let fixture = Fixture::new(2, 60.0, test_config(5.0, RepeatMode::Off));
    fixture.start(2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    fixture.player.skip_to_next().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // early in the fade: the seek rolls the transition back and stays on
    // the outgoing track
    fixture
        .player
        .seek(Duration::from_secs(30), Duration::from_millis(100))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(fixture.slot_playing('a'));
    assert!(!fixture.slot_playing('b'));
    assert!((fixture.slot_mixer_volume('a') - 1.0).abs() < 1e-6);
    let position = fixture.player.position().current_time;
    assert!((position - 30.0).abs() < 2.0, "position {position}");
}

#[tokio::test(start_paused = true)]
async fn playlist_advance_uses_full_configured_fade_on_short_tracks() {
    // 5 s tracks with a 3 s crossfade: the 40% loop cap (2 s) must NOT apply
    // to playlist advances, so the transition arms at t = 5 − 3 = 2 s and
    // ramps over the full 3 s
    let fixture = Fixture::new(2, 5.0, test_config(3.0, RepeatMode::Playlist));
    fixture.start(2).await;

    let progress = fixture.player.subscribe_crossfade_progress();
    tokio::time::sleep(Duration::from_secs_f64(1.5)).await;
    assert_eq!(
        progress.borrow().phase,
        CrossfadePhase::Idle,
        "advance must not arm before duration − configured"
    );

    tokio::time::sleep(Duration::from_secs_f64(0.9)).await;
    let snapshot = *progress.borrow();
    assert!(
        matches!(snapshot.phase, CrossfadePhase::Fading(_)),
        "expected advance crossfade near t=2, got {:?}",
        snapshot.phase
    );
    assert_eq!(
        snapshot.duration,
        Duration::from_secs(3),
        "playlist advance must ramp over the configured duration, uncapped"
    );
    assert_eq!(fixture.player.current_track().unwrap().uri, "track-1");

    // configured ramp runs to ~t=5; settled shortly after
    tokio::time::sleep(Duration::from_secs_f64(3.4)).await;
    assert_eq!(progress.borrow().phase, CrossfadePhase::Idle);
    assert!(fixture.slot_playing('b'));
    assert!(!fixture.slot_playing('a'));
    assert_eq!(fixture.player.state(), PlayerState::Playing);
}

#[tokio::test(start_paused = true)]
async fn single_track_loop_caps_fade_on_short_material() {
    // 5 s track, 3 s configured crossfade: the loop fade is capped at
    // 0.4·5 = 2 s, so it arms at t = 3 s, not t = 2 s
    let fixture = Fixture::new(1, 5.0, test_config(3.0, RepeatMode::SingleTrack));
    fixture.start(1).await;

    let progress = fixture.player.subscribe_crossfade_progress();
    tokio::time::sleep(Duration::from_secs_f64(2.5)).await;
    assert_eq!(
        progress.borrow().phase,
        CrossfadePhase::Idle,
        "loop must not arm before duration − capped fade"
    );

    tokio::time::sleep(Duration::from_secs_f64(0.9)).await;
    let snapshot = *progress.borrow();
    assert!(
        matches!(snapshot.phase, CrossfadePhase::Fading(_)),
        "expected loop crossfade near t=3, got {:?}",
        snapshot.phase
    );
    assert_eq!(
        snapshot.duration,
        Duration::from_secs(2),
        "loop fade must be capped to 40% of the material"
    );

    tokio::time::sleep(Duration::from_secs_f64(2.4)).await;
    assert_eq!(progress.borrow().phase, CrossfadePhase::Idle);
    assert!(fixture.slot_playing('b'));
    assert_eq!(fixture.player.state(), PlayerState::Playing);
}

#[tokio::test(start_paused = true)]
async fn end_guard_advances_when_natural_end_is_absent() {
    // single track, repeat off: there is nothing to crossfade into, and the
    // sim host never fires a natural end on its own. The half-second end
    // guard must still finish playback instead of hanging at the end.
    let fixture = Fixture::new(1, 5.0, test_config(3.0, RepeatMode::Off));
    fixture.start(1).await;

    tokio::time::sleep(Duration::from_secs_f64(4.8)).await;
    assert_eq!(fixture.player.state(), PlayerState::Finished);
    assert!(fixture.player.current_track().is_none());
}

#[tokio::test(start_paused = true)]
async fn playlist_repeat_wraps_to_first_track() {
    let fixture = Fixture::new(2, 10.0, test_config(3.0, RepeatMode::Playlist));
    fixture.start(2).await;

    // first automatic advance at ~7 s
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(fixture.player.current_track().unwrap().uri, "track-1");

    // second advance wraps to track 0
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(fixture.player.current_track().unwrap().uri, "track-0");
    assert_eq!(fixture.player.state(), PlayerState::Playing);
}
