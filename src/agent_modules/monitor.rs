//! The monitoring worker: pause check, probe, login, cooldown, repeat.
use chrono::{DateTime, Local, TimeZone, Timelike};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::config::{ConfigError, MonitorConfig};
use super::connectivity::ConnectivityProber;
use super::events::LogSink;
use super::session::{AuthenticationOutcome, Authenticator, AutomationBackend};
use super::utils::{format_uptime, panic_message, sleep_cancellable, RunFlag};

/// Failed logins in a row that trigger the cooldown.
pub const LOGIN_FAILURE_THRESHOLD: u64 = 3;

/// Wait lengths used by the cycle. Every wait is split into poll steps, and
/// the longest step bounds how long a stop request can go unnoticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTimings {
    pub pause_recheck: Duration,
    pub pause_poll: Duration,
    pub login_cooldown: Duration,
    pub cooldown_poll: Duration,
    pub error_recovery: Duration,
    pub recovery_poll: Duration,
    /// Upper bound for the check-interval poll step.
    pub max_interval_poll: Duration,
}

impl Default for CycleTimings {
    fn default() -> Self {
        Self {
            pause_recheck: Duration::from_secs(600),
            pause_poll: Duration::from_secs(30),
            login_cooldown: Duration::from_secs(120),
            cooldown_poll: Duration::from_secs(10),
            error_recovery: Duration::from_secs(60),
            recovery_poll: Duration::from_secs(10),
            max_interval_poll: Duration::from_secs(30),
        }
    }
}

impl CycleTimings {
    /// A tenth of the interval, kept within one second and `max_interval_poll`.
    pub fn interval_poll(&self, interval: Duration) -> Duration {
        let floor = Duration::from_secs(1);
        (interval / 10).max(floor).min(self.max_interval_poll.max(floor))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Read-only view of the run counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub monitoring: bool,
    pub network_check_count: u64,
    pub login_attempt_count: u64,
    pub consecutive_failures: u64,
    pub start_time: Option<DateTime<Local>>,
    pub last_check_time: Option<DateTime<Local>>,
    pub uptime_seconds: u64,
}

/// Counters of the current run. Written only by the worker (and reset by
/// `start`); readers may observe a mix of old and new values.
#[derive(Debug, Default)]
struct RuntimeState {
    network_check_count: AtomicU64,
    login_attempt_count: AtomicU64,
    consecutive_failures: AtomicU64,
    // Unix millis; 0 means unset.
    start_time_ms: AtomicI64,
    last_check_ms: AtomicI64,
    stopped_ms: AtomicI64,
}

impl RuntimeState {
    fn reset(&self, started_ms: i64) {
        self.network_check_count.store(0, Ordering::Relaxed);
        self.login_attempt_count.store(0, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_check_ms.store(0, Ordering::Relaxed);
        self.stopped_ms.store(0, Ordering::Relaxed);
        self.start_time_ms.store(started_ms, Ordering::Relaxed);
    }

    fn record_check(&self, at_ms: i64) -> u64 {
        self.last_check_ms.store(at_ms, Ordering::Relaxed);
        self.network_check_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn clear_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.login_attempt_count.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) -> u64 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_login_failure(&self) -> u64 {
        self.login_attempt_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn clear_login_attempts(&self) {
        self.login_attempt_count.store(0, Ordering::Relaxed);
    }

    fn mark_stopped(&self, at_ms: i64) {
        self.stopped_ms.store(at_ms, Ordering::Relaxed);
    }

    fn snapshot(&self, monitoring: bool) -> StatusSnapshot {
        let started = self.start_time_ms.load(Ordering::Relaxed);
        let stopped = self.stopped_ms.load(Ordering::Relaxed);
        let uptime_seconds = if started == 0 {
            0
        } else {
            let end = if monitoring || stopped == 0 { now_ms() } else { stopped };
            u64::try_from((end - started) / 1000).unwrap_or(0)
        };
        StatusSnapshot {
            monitoring,
            network_check_count: self.network_check_count.load(Ordering::Relaxed),
            login_attempt_count: self.login_attempt_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            start_time: local_from_ms(started),
            last_check_time: local_from_ms(self.last_check_ms.load(Ordering::Relaxed)),
            uptime_seconds,
        }
    }
}

fn now_ms() -> i64 {
    Local::now().timestamp_millis()
}

fn local_from_ms(ms: i64) -> Option<DateTime<Local>> {
    if ms == 0 {
        return None;
    }
    Local.timestamp_millis_opt(ms).single()
}

type HourSource = Arc<dyn Fn() -> u32 + Send + Sync>;

#[derive(Default)]
struct Control {
    flag: Option<RunFlag>,
    worker: Option<JoinHandle<()>>,
}

/// Owns the run/stop lifecycle and the single background worker.
pub struct Monitor<B: AutomationBackend> {
    config: MonitorConfig,
    prober: Arc<dyn ConnectivityProber>,
    authenticator: Authenticator<B>,
    sink: LogSink,
    state: Arc<RuntimeState>,
    timings: CycleTimings,
    hour_source: HourSource,
    control: Mutex<Control>,
}

impl<B: AutomationBackend> Monitor<B> {
    pub fn new(
        config: MonitorConfig,
        prober: Arc<dyn ConnectivityProber>,
        backend: Arc<B>,
        sink: LogSink,
    ) -> Self {
        let authenticator = Authenticator::new(
            backend,
            config.credentials.clone(),
            config.session.clone(),
            config.retry,
        );
        Self {
            config,
            prober,
            authenticator,
            sink,
            state: Arc::new(RuntimeState::default()),
            timings: CycleTimings::default(),
            hour_source: Arc::new(|| Local::now().hour()),
            control: Mutex::new(Control::default()),
        }
    }

    pub fn with_timings(mut self, timings: CycleTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Replaces the wall-clock hour used for the pause window.
    pub fn with_hour_source(mut self, source: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        self.hour_source = Arc::new(source);
        self
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock_control().flag.as_ref().is_some_and(RunFlag::is_active)
    }

    /// Spawns the worker. Must be called within a tokio runtime.
    ///
    /// A second call while running changes nothing. Configuration problems
    /// are reported here and no worker is started.
    pub fn start(&self) -> Result<StartOutcome, ConfigError> {
        let mut control = self.lock_control();
        if control.flag.as_ref().is_some_and(RunFlag::is_active) {
            info!("Start requested while monitoring is already running.");
            self.sink.emit("Monitoring is already running.");
            return Ok(StartOutcome::AlreadyRunning);
        }

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Refusing to start monitoring.");
            self.sink.emit(format!("Cannot start monitoring: {e}"));
            return Err(e);
        }

        if let Some(stale) = control.worker.take() {
            if !stale.is_finished() {
                warn!("Previous worker still winding down; aborting it.");
                stale.abort();
            }
        }

        self.state.reset(now_ms());
        let flag = RunFlag::new(true);
        let worker = Worker {
            config: self.config.clone(),
            prober: self.prober.clone(),
            authenticator: self.authenticator.clone(),
            sink: self.sink.clone(),
            state: self.state.clone(),
            timings: self.timings,
            hour_source: self.hour_source.clone(),
            flag: flag.clone(),
        };
        control.worker = Some(tokio::spawn(worker.run()));
        control.flag = Some(flag);
        Ok(StartOutcome::Started)
    }

    /// Asks the worker to stop. It exits at its next poll step; a login
    /// already in flight is not interrupted.
    pub fn stop(&self) -> bool {
        let control = self.lock_control();
        match control.flag.as_ref() {
            Some(flag) if flag.is_active() => {
                flag.lower();
                self.state.mark_stopped(now_ms());
                info!("Stop requested.");
                self.sink.emit("Stopping monitoring...");
                true
            }
            _ => {
                info!("Stop requested but monitoring is not running.");
                false
            }
        }
    }

    /// Waits for the worker of the last run to exit.
    pub async fn wait_stopped(&self) {
        let worker = self.lock_control().worker.take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Monitoring worker panicked.");
                }
            }
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        self.state.snapshot(self.is_monitoring())
    }

    /// One bare login attempt, as triggered by hand. Leaves the run counters
    /// alone and may overlap with a login made by the worker.
    pub async fn attempt_login(&self) -> AuthenticationOutcome {
        self.authenticator.attempt_once().await
    }

    /// A login with the configured retry policy. Leaves the run counters alone.
    pub async fn authenticate(&self) -> AuthenticationOutcome {
        self.authenticator.authenticate(&RunFlag::new(true)).await
    }

    pub async fn test_connection(&self) -> AuthenticationOutcome {
        self.authenticator.test_connection().await
    }
}

impl<B: AutomationBackend> Drop for Monitor<B> {
    fn drop(&mut self) {
        if let Some(flag) = self.lock_control().flag.as_ref() {
            flag.lower();
        }
    }
}

enum CycleEnd {
    Continue,
    Stopped,
}

struct Worker<B: AutomationBackend> {
    config: MonitorConfig,
    prober: Arc<dyn ConnectivityProber>,
    authenticator: Authenticator<B>,
    sink: LogSink,
    state: Arc<RuntimeState>,
    timings: CycleTimings,
    hour_source: HourSource,
    flag: RunFlag,
}

impl<B: AutomationBackend> Worker<B> {
    async fn run(self) {
        let interval = self.config.check_interval;
        info!(
            interval_secs = interval.as_secs(),
            pause_window = %self.config.pause_window.describe(),
            "Monitoring worker started."
        );
        self.sink.emit(format!(
            "Monitoring started; checking every {}s.",
            interval.as_secs()
        ));

        while self.flag.is_active() {
            let cycle = AssertUnwindSafe(self.run_cycle()).catch_unwind().await;
            match cycle {
                Ok(CycleEnd::Continue) => {}
                Ok(CycleEnd::Stopped) => break,
                Err(panic) => {
                    let details = panic_message(&*panic);
                    error!(error = %details, "Monitoring cycle faulted.");
                    if !self.flag.is_active() {
                        break;
                    }
                    self.state.record_failure();
                    self.sink.emit(format!(
                        "Monitoring error: {details}; resuming in {}s.",
                        self.timings.error_recovery.as_secs()
                    ));
                    if self.sleep(self.timings.error_recovery, self.timings.recovery_poll).await {
                        break;
                    }
                }
            }
        }

        let status = self.state.snapshot(false);
        let uptime = format_uptime(status.uptime_seconds);
        info!(
            uptime = %uptime,
            network_checks = status.network_check_count,
            "Monitoring worker exited."
        );
        self.sink.emit(format!(
            "Monitoring stopped. Uptime {uptime}, {} network checks.",
            status.network_check_count
        ));
    }

    /// `true` when the wait was cut short by a stop.
    async fn sleep(&self, total: Duration, poll: Duration) -> bool {
        sleep_cancellable(total, poll, || !self.flag.is_active()).await
    }

    async fn run_cycle(&self) -> CycleEnd {
        let window = self.config.pause_window;
        let hour = (self.hour_source)();
        if window.is_paused_at_hour(hour) {
            info!(hour, window = %window.describe(), "Inside the pause window; skipping this check.");
            self.sink.emit(format!(
                "Inside the pause window ({}); next look in {} minutes.",
                window.describe(),
                self.timings.pause_recheck.as_secs() / 60
            ));
            return self.wait(self.timings.pause_recheck, self.timings.pause_poll).await;
        }

        if !self.flag.is_active() {
            return CycleEnd::Stopped;
        }
        let check = self.state.record_check(now_ms());
        info!(check, "Checking network.");
        let reachable = self
            .prober
            .probe(&self.config.probe.targets, self.config.probe.timeout)
            .await;
        if !self.flag.is_active() {
            return CycleEnd::Stopped;
        }

        if reachable {
            self.state.clear_failures();
            self.sink.emit(format!("Check #{check}: network is reachable."));
        } else {
            let failures = self.state.record_failure();
            warn!(check, consecutive_failures = failures, "Network unreachable.");
            self.sink.emit(format!(
                "Check #{check}: network unreachable ({failures} in a row); logging in to the portal."
            ));

            let outcome = self.authenticator.authenticate(&self.flag).await;
            if !self.flag.is_active() {
                info!("Stopped during login; result discarded.");
                return CycleEnd::Stopped;
            }

            if outcome.success {
                self.state.clear_failures();
                self.sink.emit(format!("Login succeeded: {}", outcome.message));
            } else {
                let attempts = self.state.record_login_failure();
                self.sink.emit(format!(
                    "Login failed ({attempts}/{LOGIN_FAILURE_THRESHOLD}): {}",
                    outcome.message
                ));
                if attempts >= LOGIN_FAILURE_THRESHOLD {
                    let cooldown = self.timings.login_cooldown;
                    warn!(attempts, cooldown_secs = cooldown.as_secs(), "Too many failed logins; cooling down.");
                    self.sink.emit(format!(
                        "{attempts} failed logins in a row; cooling down for {}s.",
                        cooldown.as_secs()
                    ));
                    if self.sleep(cooldown, self.timings.cooldown_poll).await {
                        return CycleEnd::Stopped;
                    }
                    self.state.clear_login_attempts();
                    self.sink.emit("Cooldown finished; resuming checks.");
                    return CycleEnd::Continue;
                }
            }
        }

        let interval = self.config.check_interval;
        self.wait(interval, self.timings.interval_poll(interval)).await
    }

    async fn wait(&self, total: Duration, poll: Duration) -> CycleEnd {
        if self.sleep(total, poll).await {
            CycleEnd::Stopped
        } else {
            CycleEnd::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_poll_is_bounded() {
        let timings = CycleTimings::default();
        assert_eq!(timings.interval_poll(Duration::from_secs(240)), Duration::from_secs(24));
        assert_eq!(timings.interval_poll(Duration::from_secs(3600)), Duration::from_secs(30));
        assert_eq!(timings.interval_poll(Duration::from_secs(1)), Duration::from_secs(1));

        let zero_cap = CycleTimings {
            max_interval_poll: Duration::ZERO,
            ..CycleTimings::default()
        };
        assert_eq!(zero_cap.interval_poll(Duration::from_secs(240)), Duration::from_secs(1));
    }

    #[test]
    fn test_state_counters() {
        let state = RuntimeState::default();
        state.reset(now_ms());
        assert_eq!(state.record_check(now_ms()), 1);
        assert_eq!(state.record_failure(), 1);
        assert_eq!(state.record_login_failure(), 1);
        assert_eq!(state.record_login_failure(), 2);

        let snapshot = state.snapshot(true);
        assert!(snapshot.monitoring);
        assert_eq!(snapshot.network_check_count, 1);
        assert_eq!(snapshot.login_attempt_count, 2);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert!(snapshot.start_time.is_some());
        assert!(snapshot.last_check_time.is_some());

        state.clear_failures();
        let snapshot = state.snapshot(false);
        assert_eq!(snapshot.login_attempt_count, 0);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.network_check_count, 1);
    }

    #[test]
    fn test_fresh_state_has_no_times() {
        let snapshot = RuntimeState::default().snapshot(false);
        assert_eq!(snapshot.start_time, None);
        assert_eq!(snapshot.last_check_time, None);
        assert_eq!(snapshot.uptime_seconds, 0);
    }

    #[test]
    fn test_uptime_freezes_at_stop() {
        let state = RuntimeState::default();
        let started = now_ms() - 3_723_000;
        state.reset(started);
        state.mark_stopped(started + 3_661_000);
        assert_eq!(state.snapshot(false).uptime_seconds, 3661);
        assert!(state.snapshot(true).uptime_seconds >= 3723);
    }
}
