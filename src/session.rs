//! Audio session coordination
//!
//! One component owns every interaction with the process-wide session. In
//! Managed mode it configures and activates exactly once and the session
//! stays active for the process lifetime. In External mode it never mutates
//! the session, only validates and reports. Host notifications are rehomed
//! onto a coordinator task and re-emitted as typed signals the facade acts
//! on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionMode;
use crate::error::{Error, Result};
use crate::events::PlayerEvent;
use crate::host::{
    RouteChangeReason, SessionCategory, SessionHost, SessionHostEvent, SessionOptions,
};
use crate::state::SharedState;

/// Preferred I/O buffer duration in Managed mode
const PREFERRED_IO_BUFFER: Duration = Duration::from_millis(20);
/// Preferred hardware sample rate in Managed mode
const PREFERRED_SAMPLE_RATE: f64 = 44100.0;
/// Settle window for non-urgent route changes
const ROUTE_CHANGE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Result of validating an externally-managed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum SessionValidation {
    Valid,
    /// The session category is not one the engine can play under
    CategoryChanged { current: String, expected: String },
}

/// Signals the facade turns into pause/resume/recovery
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Interruption began: pause everything
    InterruptionPause,
    /// Interruption ended with the resume hint set
    InterruptionResume,
    /// Output route disappeared (unplug): pause everything immediately
    RouteLost,
    /// The session category became incompatible: pause and notify
    CategoryIncompatible(SessionValidation),
    /// Media services were reset: rebuild the audio stack
    Recover,
}

/// Callback surface for category changes the engine did not make
pub trait SessionDelegate: Send + Sync {
    fn session_category_did_change(&self, validation: SessionValidation);
}

/// The session coordinator
pub struct SessionCoordinator {
    host: Arc<dyn SessionHost>,
    shared: Arc<SharedState>,
    mode: std::sync::Mutex<SessionMode>,
    configured_options: std::sync::Mutex<Option<SessionOptions>>,
    is_activating: AtomicBool,
    activated: AtomicBool,
    delegate: std::sync::Mutex<Option<Arc<dyn SessionDelegate>>>,
    signal_tx: mpsc::UnboundedSender<SessionSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionSignal>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCoordinator {
    pub fn new(
        host: Arc<dyn SessionHost>,
        shared: Arc<SharedState>,
        mode: SessionMode,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            host,
            shared,
            mode: std::sync::Mutex::new(mode),
            configured_options: std::sync::Mutex::new(None),
            is_activating: AtomicBool::new(false),
            activated: AtomicBool::new(false),
            delegate: std::sync::Mutex::new(None),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            event_task: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> SessionMode {
        *self.mode.lock().expect("mode lock")
    }

    pub fn set_mode(&self, mode: SessionMode) {
        *self.mode.lock().expect("mode lock") = mode;
    }

    pub fn set_delegate(&self, delegate: Arc<dyn SessionDelegate>) {
        *self.delegate.lock().expect("delegate lock") = Some(delegate);
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// The facade takes this once and drives pause/resume/recovery from it
    pub async fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<SessionSignal>> {
        self.signal_rx.lock().await.take()
    }

    /// Configure the session for playback.
    ///
    /// Managed mode: first configuration wins; a later call with different
    /// options is a warning, not an error, unless `force` is set (recovery
    /// path). External mode: validation only, never mutates.
    pub fn configure(&self, options: SessionOptions, force: bool) -> Result<()> {
        match self.mode() {
            SessionMode::Managed => {
                {
                    let configured = self.configured_options.lock().expect("options lock");
                    if let Some(existing) = *configured {
                        if !force {
                            if existing != options {
                                warn!("session already configured; new options ignored");
                                self.warn_event("session already configured; first configuration wins");
                            }
                            return Ok(());
                        }
                    }
                }
                self.host
                    .set_preferred_io_buffer_duration(PREFERRED_IO_BUFFER.as_secs_f64())
                    .map_err(|reason| Error::SessionConfigurationFailed { reason })?;
                self.host
                    .set_preferred_sample_rate(PREFERRED_SAMPLE_RATE)
                    .map_err(|reason| Error::SessionConfigurationFailed { reason })?;
                self.host
                    .set_category(SessionCategory::Playback, options)
                    .map_err(|reason| Error::SessionConfigurationFailed { reason })?;
                *self.configured_options.lock().expect("options lock") = Some(options);
                info!("session configured for playback");
                Ok(())
            }
            SessionMode::External => match self.validate() {
                SessionValidation::Valid => Ok(()),
                SessionValidation::CategoryChanged { current, expected } => {
                    Err(Error::SessionConfigurationFailed {
                        reason: format!(
                            "external session category '{current}' is incompatible (expected '{expected}')"
                        ),
                    })
                }
            },
        }
    }

    /// Activate the session (Managed mode). Reentrancy-guarded; once active,
    /// the session stays active for the process lifetime.
    pub fn activate(&self) -> Result<()> {
        if self.mode() == SessionMode::External {
            // the embedder owns activation
            if !self.host.is_active() {
                self.warn_event("external session is not active");
            }
            return Ok(());
        }
        if self.is_activated() {
            return Ok(());
        }
        if self
            .is_activating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("activation already in flight");
            return Ok(());
        }
        let result = self
            .host
            .set_active(true)
            .map_err(|reason| Error::SessionConfigurationFailed { reason });
        self.is_activating.store(false, Ordering::SeqCst);
        result?;
        self.activated.store(true, Ordering::SeqCst);
        info!("session activated");
        Ok(())
    }

    /// Force a fresh activation after a media-services reset
    pub fn reactivate(&self) -> Result<()> {
        self.activated.store(false, Ordering::SeqCst);
        self.activate()
    }

    /// Deactivation is deliberately a no-op: other audio on the device keeps
    /// flowing and reactivation storms are worse than an idle session.
    pub fn deactivate(&self) {
        warn!("session deactivation requested; ignoring (session stays active for process lifetime)");
    }

    /// Validate an externally-managed session and collect warnings
    pub fn validate(&self) -> SessionValidation {
        let category = self.host.category();
        let compatible = matches!(
            category,
            SessionCategory::Playback | SessionCategory::PlayAndRecord | SessionCategory::MultiRoute
        );
        if !compatible {
            return SessionValidation::CategoryChanged {
                current: category.as_str().to_string(),
                expected: SessionCategory::Playback.as_str().to_string(),
            };
        }

        let options = self.host.options();
        if !options.allow_bluetooth {
            self.warn_event("bluetooth output is not enabled on the session");
        }
        if category == SessionCategory::PlayAndRecord && !options.default_to_speaker {
            self.warn_event("play-and-record session does not default to the speaker");
        }
        if !self.host.is_active() {
            self.warn_event("session is not active");
        }
        SessionValidation::Valid
    }

    fn warn_event(&self, message: &str) {
        warn!("{message}");
        self.shared.events.emit(PlayerEvent::SessionWarning {
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn notify_category_change(&self, validation: SessionValidation) {
        self.shared.events.emit(PlayerEvent::SessionCategoryChanged {
            validation: validation.clone(),
            timestamp: Utc::now(),
        });
        let delegate = self.delegate.lock().expect("delegate lock").clone();
        if let Some(delegate) = delegate {
            delegate.session_category_did_change(validation);
        }
    }

    /// Subscribe to host notifications and start the rehoming task
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.event_task.lock().await;
        if task.is_some() {
            return;
        }
        let mut events = self.host.subscribe_events();
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut debounce_deadline: Option<tokio::time::Instant> = None;
            loop {
                // copy so the timer future does not hold a borrow the event
                // handler needs mutably
                let deadline = debounce_deadline;
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        this.handle_host_event(event, &mut debounce_deadline);
                    }
                    _ = async {
                        tokio::time::sleep_until(deadline.expect("deadline checked")).await
                    }, if deadline.is_some() => {
                        debounce_deadline = None;
                        debug!("route change settled");
                        if this.mode() == SessionMode::External {
                            let validation = this.validate();
                            if let SessionValidation::CategoryChanged { .. } = validation {
                                // fell out of compatibility while the route moved
                                this.notify_category_change(validation.clone());
                                let _ = this.signal_tx.send(SessionSignal::CategoryIncompatible(validation));
                            }
                        }
                    }
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
    }

    fn handle_host_event(
        &self,
        event: SessionHostEvent,
        debounce_deadline: &mut Option<tokio::time::Instant>,
    ) {
        match event {
            SessionHostEvent::InterruptionBegan => {
                info!("session interruption began");
                let _ = self.signal_tx.send(SessionSignal::InterruptionPause);
            }
            SessionHostEvent::InterruptionEnded { should_resume } => match should_resume {
                Some(true) => {
                    info!("session interruption ended, resuming");
                    let _ = self.signal_tx.send(SessionSignal::InterruptionResume);
                }
                // absent hint is an assistant-style pause: stay paused
                _ => info!("session interruption ended without resume hint"),
            },
            SessionHostEvent::RouteChanged { reason } => match reason {
                RouteChangeReason::OldDeviceUnavailable => {
                    info!("output route lost");
                    let _ = self.signal_tx.send(SessionSignal::RouteLost);
                }
                RouteChangeReason::NewDeviceAvailable | RouteChangeReason::Override => {
                    debug!(?reason, "route changed, debouncing");
                    *debounce_deadline =
                        Some(tokio::time::Instant::now() + ROUTE_CHANGE_DEBOUNCE);
                }
                RouteChangeReason::CategoryChange => {
                    let validation = self.validate();
                    if let SessionValidation::CategoryChanged { .. } = validation {
                        warn!("session category changed to an incompatible value");
                        self.notify_category_change(validation.clone());
                        let _ = self
                            .signal_tx
                            .send(SessionSignal::CategoryIncompatible(validation));
                    }
                }
                RouteChangeReason::Unknown => debug!("route changed (unknown reason)"),
            },
            SessionHostEvent::MediaServicesReset => {
                warn!("media services reset");
                let _ = self.signal_tx.send(SessionSignal::Recover);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimSession;

    fn fixture(mode: SessionMode) -> (Arc<SessionCoordinator>, Arc<SimSession>, Arc<SharedState>) {
        let session = SimSession::new();
        let shared = Arc::new(SharedState::new());
        let coordinator = SessionCoordinator::new(
            Arc::clone(&session) as Arc<dyn SessionHost>,
            Arc::clone(&shared),
            mode,
        );
        (coordinator, session, shared)
    }

    #[tokio::test]
    async fn managed_configures_once() {
        let (coordinator, session, _) = fixture(SessionMode::Managed);
        coordinator.configure(SessionOptions::default(), false).unwrap();
        assert_eq!(session.set_category_calls(), 1);
        assert_eq!(session.category(), SessionCategory::Playback);
        assert!((session.preferred_sample_rate() - 44100.0).abs() < 1e-9);
        assert!((session.preferred_io_buffer() - 0.020).abs() < 1e-9);

        // second configuration with different options is ignored with a warning
        let mut other = SessionOptions::default();
        other.mix_with_others = true;
        coordinator.configure(other, false).unwrap();
        assert_eq!(session.set_category_calls(), 1);

        // force reconfigures (recovery)
        coordinator.configure(other, true).unwrap();
        assert_eq!(session.set_category_calls(), 2);
    }

    #[tokio::test]
    async fn activation_happens_once() {
        let (coordinator, session, _) = fixture(SessionMode::Managed);
        coordinator.configure(SessionOptions::default(), false).unwrap();
        coordinator.activate().unwrap();
        coordinator.activate().unwrap();
        assert_eq!(session.set_active_calls(), 1);
        assert!(coordinator.is_activated());
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn activation_failure_surfaces() {
        let (coordinator, session, _) = fixture(SessionMode::Managed);
        session.fail_next_activation("busy");
        let err = coordinator.activate().unwrap_err();
        assert!(matches!(err, Error::SessionConfigurationFailed { .. }));
        assert!(!coordinator.is_activated());
        // a later attempt succeeds
        coordinator.activate().unwrap();
        assert!(coordinator.is_activated());
    }

    #[tokio::test]
    async fn deactivate_is_noop() {
        let (coordinator, session, _) = fixture(SessionMode::Managed);
        coordinator.activate().unwrap();
        coordinator.deactivate();
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn external_never_mutates() {
        let (coordinator, session, _) = fixture(SessionMode::External);
        session.script(SessionCategory::Playback, SessionOptions::default(), true);
        coordinator.configure(SessionOptions::default(), false).unwrap();
        coordinator.activate().unwrap();
        assert_eq!(session.set_category_calls(), 0);
        assert_eq!(session.set_active_calls(), 0);
    }

    #[tokio::test]
    async fn external_incompatible_category_fails() {
        let (coordinator, session, _) = fixture(SessionMode::External);
        session.script(SessionCategory::Record, SessionOptions::default(), true);
        let err = coordinator
            .configure(SessionOptions::default(), false)
            .unwrap_err();
        match err {
            Error::SessionConfigurationFailed { reason } => {
                assert!(reason.contains("record"), "reason: {reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn interruption_signals() {
        let (coordinator, session, _) = fixture(SessionMode::Managed);
        coordinator.start().await;
        let mut signals = coordinator.take_signals().await.unwrap();

        session.post(SessionHostEvent::InterruptionBegan);
        assert_eq!(signals.recv().await, Some(SessionSignal::InterruptionPause));

        session.post(SessionHostEvent::InterruptionEnded {
            should_resume: Some(true),
        });
        assert_eq!(signals.recv().await, Some(SessionSignal::InterruptionResume));

        // no hint: nothing arrives
        session.post(SessionHostEvent::InterruptionEnded { should_resume: None });
        session.post(SessionHostEvent::MediaServicesReset);
        assert_eq!(signals.recv().await, Some(SessionSignal::Recover));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn unplug_signals_immediately() {
        let (coordinator, session, _) = fixture(SessionMode::Managed);
        coordinator.start().await;
        let mut signals = coordinator.take_signals().await.unwrap();
        session.post(SessionHostEvent::RouteChanged {
            reason: RouteChangeReason::OldDeviceUnavailable,
        });
        assert_eq!(signals.recv().await, Some(SessionSignal::RouteLost));
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_device_is_debounced() {
        let (coordinator, session, _) = fixture(SessionMode::Managed);
        coordinator.start().await;
        let mut signals = coordinator.take_signals().await.unwrap();
        session.post(SessionHostEvent::RouteChanged {
            reason: RouteChangeReason::NewDeviceAvailable,
        });
        // nothing urgent comes out of a debounced route gain
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(signals.try_recv().is_err());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn category_change_notifies_delegate() {
        struct Recorder(std::sync::Mutex<Vec<SessionValidation>>);
        impl SessionDelegate for Recorder {
            fn session_category_did_change(&self, validation: SessionValidation) {
                self.0.lock().unwrap().push(validation);
            }
        }

        let (coordinator, session, _) = fixture(SessionMode::External);
        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        coordinator.set_delegate(Arc::clone(&recorder) as Arc<dyn SessionDelegate>);
        coordinator.start().await;
        let mut signals = coordinator.take_signals().await.unwrap();

        session.script(SessionCategory::Record, SessionOptions::default(), true);
        session.post(SessionHostEvent::RouteChanged {
            reason: RouteChangeReason::CategoryChange,
        });

        match signals.recv().await {
            Some(SessionSignal::CategoryIncompatible(SessionValidation::CategoryChanged {
                current,
                ..
            })) => assert_eq!(current, "record"),
            other => panic!("unexpected signal {other:?}"),
        }
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        coordinator.shutdown().await;
    }
}
