//! Connection service: the state machine that keeps the MIDI link alive.
//!
//! # Shape
//!
//! The service is an actor.  [`ConnectionService::spawn`] starts one driver
//! task that exclusively owns the transport and all connection state.  Public
//! operations send a command to that task and wait for its acknowledgement,
//! so callers never see transport errors and two transitions can never
//! interleave: the driver handles commands, health ticks and the backoff
//! deadline one at a time from a single `select!` loop.
//!
//! ```text
//!  connect() ─┐
//!  disconnect()├─► command queue ─┐
//!  send_*()  ─┘                   ▼
//!                  ┌───────── driver task ─────────┐
//!  health tick ───►│ status, metrics, attempt      │──► status / metrics /
//!  backoff due ───►│ transport (owned)             │    error / backoff events
//!                  └───────────────────────────────┘
//! ```
//!
//! # Timers
//!
//! - The health interval runs only while the status is `connected` or
//!   `degraded`.  Its first tick fires one full period after connecting.
//! - At most one reconnect deadline exists.  Scheduling a new one replaces
//!   it; `connect()` and `disconnect()` clear it.
//!
//! # Backoff
//!
//! Delay is `min(base * 2^attempt, max)`.  The attempt counter goes up each
//! time a scheduled reconnect fires and returns to zero on every successful
//! connect.
//!
//! # Clock
//!
//! A requested MIDI clock tempo is kept until `stop_clock()` or an explicit
//! `disconnect()`.  It is (re)started on the transport whenever the link
//! comes up, so a clock survives automatic reconnects.  A clock that fails
//! to start is logged; it never counts against the link.

use std::sync::Arc;
use std::time::Duration;

use pedal_link_core::domain::now_unix_ms;
use pedal_link_core::midi::tick_interval;
use pedal_link_core::{
    BackoffPolicy, BackoffState, ConnectionMetrics, ConnectionStatus, Listeners, MessageLog,
    MidiDirection, MidiMessage, MidiMessageType, NewLogEntry, Subscription,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::infrastructure::transport::{MidiTransport, TransportError};

/// Tuning for the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Time between health probes while linked.
    pub health_interval: Duration,
    /// Probes slower than this mark the link degraded.
    pub degraded_threshold: Duration,
    /// Upper bound on one probe, on top of any transport timeout.
    pub probe_timeout: Duration,
    /// Reconnect delays.
    pub backoff: BackoffPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_millis(2500),
            degraded_threshold: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(1000),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-kind listener lists for the service's observability events.
///
/// Listeners run on the driver task, in emission order, and must not block.
#[derive(Default)]
pub struct ConnectionEvents {
    pub(crate) status: Listeners<ConnectionStatus>,
    pub(crate) metrics: Listeners<ConnectionMetrics>,
    pub(crate) error: Listeners<String>,
    pub(crate) backoff: Listeners<Option<BackoffState>>,
}

impl ConnectionEvents {
    #[must_use = "dropping the Subscription unsubscribes the listener immediately"]
    pub fn on_status<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.status.subscribe(listener)
    }

    #[must_use = "dropping the Subscription unsubscribes the listener immediately"]
    pub fn on_metrics<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionMetrics) + Send + Sync + 'static,
    {
        self.metrics.subscribe(listener)
    }

    #[must_use = "dropping the Subscription unsubscribes the listener immediately"]
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.error.subscribe(listener)
    }

    /// `Some` when a reconnect is scheduled, `None` when it is cleared.
    #[must_use = "dropping the Subscription unsubscribes the listener immediately"]
    pub fn on_backoff<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Option<BackoffState>) + Send + Sync + 'static,
    {
        self.backoff.subscribe(listener)
    }
}

impl std::fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("status", &self.status.len())
            .field("metrics", &self.metrics.len())
            .field("error", &self.error.len())
            .field("backoff", &self.backoff.len())
            .finish()
    }
}

type Ack = oneshot::Sender<()>;

enum Command {
    Connect(Ack),
    Disconnect(Ack),
    Reconnect(Ack),
    Send(MidiMessage, Ack),
    StartClock(f64, Ack),
    StopClock(Ack),
    Shutdown(Ack),
}

/// Handle to a running connection service.
///
/// Create it once at startup and share it by reference (or `Arc`).
/// Dropping the last handle stops the driver after it releases the
/// transport.
pub struct ConnectionService {
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<ConnectionEvents>,
    driver: JoinHandle<()>,
}

impl ConnectionService {
    /// Starts the driver task.  Must be called from within a Tokio runtime.
    ///
    /// The service starts `disconnected`; nothing happens until
    /// [`connect`](Self::connect).
    pub fn spawn<T>(config: ServiceConfig, log: Arc<MessageLog>, transport: T) -> Self
    where
        T: MidiTransport + 'static,
    {
        let events = Arc::new(ConnectionEvents::default());
        let (commands, queue) = mpsc::unbounded_channel();
        let driver = Driver {
            config,
            transport,
            log,
            events: Arc::clone(&events),
            status: ConnectionStatus::Disconnected,
            metrics: ConnectionMetrics::default(),
            attempt: 0,
            health: None,
            reconnect_at: None,
            backoff: None,
            clock_bpm: None,
        };
        let driver = tokio::spawn(driver.run(queue));
        Self {
            commands,
            events,
            driver,
        }
    }

    /// Starts the service with the transport returned by `probe`, the
    /// capability check run once at startup.
    pub fn from_probe<T, F>(config: ServiceConfig, log: Arc<MessageLog>, probe: F) -> Self
    where
        T: MidiTransport + 'static,
        F: FnOnce() -> T,
    {
        Self::spawn(config, log, probe())
    }

    /// Observability channels.  Subscribing mid-flight sees only later events.
    pub fn events(&self) -> &ConnectionEvents {
        &self.events
    }

    /// Opens the link unless it is already connecting or connected.
    ///
    /// Clears any scheduled reconnect.  Resolves once the attempt has
    /// succeeded or failed.
    pub async fn connect(&self) {
        self.request(Command::Connect).await;
    }

    /// Stops health checks, cancels any scheduled reconnect and releases the
    /// transport.  Nothing reconnects afterwards until `connect()`.
    pub async fn disconnect(&self) {
        self.request(Command::Disconnect).await;
    }

    /// Disconnects, zeroes the metrics and backoff counter, then connects.
    pub async fn reconnect(&self) {
        self.request(Command::Reconnect).await;
    }

    /// Sends a Control Change.  Logged as `out` on success and as `error`
    /// otherwise; a failed send counts as a dropped link.
    pub async fn send_control_change(&self, channel: u8, control: u8, value: u8) {
        let message = MidiMessage::control_change(channel, control, value);
        self.request(|ack| Command::Send(message, ack)).await;
    }

    /// Sends a Program Change.  Same logging and failure handling as
    /// [`send_control_change`](Self::send_control_change).
    pub async fn send_program_change(&self, channel: u8, program: u8) {
        let message = MidiMessage::program_change(channel, program);
        self.request(|ack| Command::Send(message, ack)).await;
    }

    /// Sends MIDI clock at `bpm` while linked, starting now if the link is
    /// up and again after every reconnect.  A non-positive tempo is logged
    /// as `error` and ignored.
    pub async fn start_clock(&self, bpm: f64) {
        self.request(|ack| Command::StartClock(bpm, ack)).await;
    }

    /// Stops MIDI clock.  A no-op when none was requested.
    pub async fn stop_clock(&self) {
        self.request(Command::StopClock).await;
    }

    /// Disconnects and stops the driver task.
    pub async fn shutdown(self) {
        self.request(Command::Shutdown).await;
        if let Err(e) = self.driver.await {
            warn!("connection driver ended abnormally: {e}");
        }
    }

    async fn request(&self, command: impl FnOnce(Ack) -> Command) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(command(ack)).is_err() {
            debug!("connection driver already stopped");
            return;
        }
        let _ = done.await;
    }
}

impl std::fmt::Debug for ConnectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionService")
            .field("events", &self.events)
            .field("running", &!self.driver.is_finished())
            .finish()
    }
}

// ── Driver ────────────────────────────────────────────────────────────────────

struct Driver<T> {
    config: ServiceConfig,
    transport: T,
    log: Arc<MessageLog>,
    events: Arc<ConnectionEvents>,
    status: ConnectionStatus,
    metrics: ConnectionMetrics,
    attempt: u32,
    health: Option<Interval>,
    reconnect_at: Option<Instant>,
    /// Last backoff state emitted, so clearing is announced once.
    backoff: Option<BackoffState>,
    /// Requested clock tempo, restarted on every successful connect.
    clock_bpm: Option<f64>,
}

impl<T: MidiTransport> Driver<T> {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        // A command pulled off the queue while coalescing connects.
        let mut deferred: Option<Command> = None;
        loop {
            if let Some(command) = deferred.take() {
                if !self.handle(command, &mut queue, &mut deferred).await {
                    break;
                }
                continue;
            }
            tokio::select! {
                command = queue.recv() => match command {
                    Some(command) => {
                        if !self.handle(command, &mut queue, &mut deferred).await {
                            break;
                        }
                    }
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                _ = next_tick(&mut self.health) => self.health_check().await,
                _ = deadline(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.attempt = self.attempt.saturating_add(1);
                    debug!(attempt = self.attempt, "scheduled reconnect firing");
                    self.connect().await;
                }
            }
        }
        debug!("connection driver stopped");
    }

    /// Runs one command.  Returns `false` once the driver should stop.
    async fn handle(
        &mut self,
        command: Command,
        queue: &mut mpsc::UnboundedReceiver<Command>,
        deferred: &mut Option<Command>,
    ) -> bool {
        match command {
            Command::Connect(ack) => {
                let mut acks = vec![ack];
                take_queued_connects(queue, &mut acks, deferred);
                self.connect().await;
                // Connects that queued up during the attempt were issued
                // while connecting, so they join it instead of retrying.
                if deferred.is_none() {
                    take_queued_connects(queue, &mut acks, deferred);
                }
                if acks.len() > 1 {
                    debug!(joined = acks.len() - 1, "connect requests coalesced");
                }
                for ack in acks {
                    let _ = ack.send(());
                }
            }
            Command::Disconnect(ack) => {
                self.clock_bpm = None;
                self.disconnect().await;
                let _ = ack.send(());
            }
            Command::Reconnect(ack) => {
                self.reconnect().await;
                let _ = ack.send(());
            }
            Command::Send(message, ack) => {
                self.send(message).await;
                let _ = ack.send(());
            }
            Command::StartClock(bpm, ack) => {
                self.start_clock(bpm).await;
                let _ = ack.send(());
            }
            Command::StopClock(ack) => {
                self.stop_clock().await;
                let _ = ack.send(());
            }
            Command::Shutdown(ack) => {
                self.disconnect().await;
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    async fn connect(&mut self) {
        if matches!(
            self.status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        ) {
            debug!(status = %self.status, "connect ignored");
            return;
        }

        self.cancel_reconnect();
        if self.status == ConnectionStatus::Degraded {
            self.stop_health_checks();
            self.transport.disconnect().await;
        }
        self.set_status(ConnectionStatus::Connecting);

        match self.transport.connect().await {
            Ok(()) => {
                self.attempt = 0;
                self.set_status(ConnectionStatus::Connected);
                self.start_health_checks();
                self.resume_clock().await;
            }
            Err(e) => {
                warn!("connect failed: {e}");
                self.fail(&e);
                self.schedule_reconnect();
            }
        }
    }

    async fn disconnect(&mut self) {
        self.stop_health_checks();
        self.cancel_reconnect();
        self.transport.disconnect().await;
        self.set_status(ConnectionStatus::Disconnected);
    }

    async fn reconnect(&mut self) {
        info!("reconnecting from scratch");
        self.disconnect().await;
        self.metrics = ConnectionMetrics::default();
        self.events.metrics.emit(&self.metrics);
        self.attempt = 0;
        self.connect().await;
    }

    async fn health_check(&mut self) {
        if !self.status.is_linked() {
            self.stop_health_checks();
            return;
        }

        if !self.transport.is_connected() {
            warn!("link lost");
            self.stop_health_checks();
            self.set_status(ConnectionStatus::Disconnected);
            self.schedule_reconnect();
            return;
        }

        let probe = time::timeout(self.config.probe_timeout, self.transport.send_test()).await;
        match probe {
            Ok(Ok(latency)) => {
                self.metrics.record_success(latency, now_unix_ms());
                self.events.metrics.emit(&self.metrics);
                let next = if latency > self.config.degraded_threshold {
                    ConnectionStatus::Degraded
                } else {
                    ConnectionStatus::Connected
                };
                debug!(latency_ms = self.metrics.latency_ms, "probe ok");
                self.set_status(next);
            }
            Ok(Err(e)) => self.link_failed(e).await,
            Err(_) => {
                self.link_failed(TransportError::Timeout {
                    operation: "probe",
                    after: self.config.probe_timeout,
                })
                .await
            }
        }
    }

    async fn send(&mut self, message: MidiMessage) {
        if !self.status.is_linked() {
            debug!(%message, status = %self.status, "send while not connected");
            self.log.log(error_entry(&message, "not connected"));
            return;
        }

        match self.transport.send(&message).await {
            Ok(()) => {
                self.log.log(message.log_entry(MidiDirection::Out));
            }
            Err(e) => {
                self.log.log(error_entry(&message, &e.to_string()));
                let e = if matches!(e, TransportError::SendFailed(_)) {
                    e
                } else {
                    TransportError::SendFailed(e.to_string())
                };
                self.link_failed(e).await;
            }
        }
    }

    async fn start_clock(&mut self, bpm: f64) {
        if tick_interval(bpm).is_none() {
            warn!(bpm, "clock tempo rejected");
            self.log.log(NewLogEntry::new(
                MidiDirection::Error,
                MidiMessageType::Clock,
                format!("Clock not started: invalid tempo {bpm}"),
            ));
            return;
        }
        self.clock_bpm = Some(bpm);
        if self.status.is_linked() {
            self.resume_clock().await;
        } else {
            debug!(bpm, "clock waits for the link");
        }
    }

    /// Starts the requested clock on the transport, if one was requested.
    async fn resume_clock(&mut self) {
        let Some(bpm) = self.clock_bpm else {
            return;
        };
        match self.transport.start_clock(bpm).await {
            Ok(()) => {
                self.log.log(
                    NewLogEntry::new(
                        MidiDirection::Out,
                        MidiMessageType::Clock,
                        format!("Clock started at {bpm:.1} bpm"),
                    )
                    .with_detail("fa"),
                );
            }
            Err(e) => {
                warn!("clock start failed: {e}");
                self.log.log(NewLogEntry::new(
                    MidiDirection::Error,
                    MidiMessageType::Clock,
                    format!("Clock at {bpm:.1} bpm not started: {e}"),
                ));
            }
        }
    }

    async fn stop_clock(&mut self) {
        if self.clock_bpm.take().is_none() {
            return;
        }
        if self.status.is_linked() {
            self.transport.stop_clock().await;
            self.log.log(
                NewLogEntry::new(MidiDirection::Out, MidiMessageType::Clock, "Clock stopped")
                    .with_detail("fc"),
            );
        }
    }

    /// A probe or send failed on an established link.
    async fn link_failed(&mut self, error: TransportError) {
        warn!("link failed: {error}");
        self.stop_health_checks();
        self.transport.disconnect().await;
        self.metrics.record_drop();
        self.events.metrics.emit(&self.metrics);
        self.fail(&error);
        self.schedule_reconnect();
    }

    fn fail(&mut self, error: &TransportError) {
        self.set_status(ConnectionStatus::Error);
        self.events.error.emit(&error.to_string());
    }

    fn set_status(&mut self, next: ConnectionStatus) {
        if self.status == next {
            return;
        }
        info!(from = %self.status, to = %next, "connection status");
        self.status = next;
        self.events.status.emit(&next);
    }

    fn start_health_checks(&mut self) {
        let period = self.config.health_interval;
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.health = Some(interval);
    }

    fn stop_health_checks(&mut self) {
        self.health = None;
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.config.backoff.delay_for(self.attempt);
        let state = self.config.backoff.state_for(self.attempt);
        self.reconnect_at = Some(Instant::now() + delay);
        self.backoff = Some(state);
        info!(delay_ms = state.delay_ms, attempt = state.attempt, "reconnect scheduled");
        self.events.backoff.emit(&Some(state));
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_at = None;
        if self.backoff.take().is_some() {
            self.events.backoff.emit(&None);
        }
    }
}

fn error_entry(message: &MidiMessage, reason: &str) -> NewLogEntry {
    NewLogEntry::new(
        MidiDirection::Error,
        message.kind(),
        format!("{message} not sent: {reason}"),
    )
    .with_detail(pedal_link_core::midi::hex_bytes(&message.to_bytes()))
}

/// Moves every `Connect` at the head of the queue into `acks`.  The first
/// other command is parked in `deferred` so ordering is kept.
fn take_queued_connects(
    queue: &mut mpsc::UnboundedReceiver<Command>,
    acks: &mut Vec<Ack>,
    deferred: &mut Option<Command>,
) {
    while let Ok(next) = queue.try_recv() {
        match next {
            Command::Connect(ack) => acks.push(ack),
            other => {
                *deferred = Some(other);
                return;
            }
        }
    }
}

async fn next_tick(health: &mut Option<Interval>) {
    match health {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::MockTransport;
    use std::sync::Mutex;

    /// Records every event in emission order.
    #[derive(Clone, Default)]
    struct Recorder {
        statuses: Arc<Mutex<Vec<ConnectionStatus>>>,
        backoffs: Arc<Mutex<Vec<Option<BackoffState>>>>,
        errors: Arc<Mutex<Vec<String>>>,
        metrics: Arc<Mutex<Vec<ConnectionMetrics>>>,
    }

    impl Recorder {
        fn attach(&self, events: &ConnectionEvents) -> Vec<Subscription> {
            let statuses = Arc::clone(&self.statuses);
            let backoffs = Arc::clone(&self.backoffs);
            let errors = Arc::clone(&self.errors);
            let metrics = Arc::clone(&self.metrics);
            vec![
                events.on_status(move |s| statuses.lock().unwrap().push(*s)),
                events.on_backoff(move |b| backoffs.lock().unwrap().push(*b)),
                events.on_error(move |e| errors.lock().unwrap().push(e.clone())),
                events.on_metrics(move |m| metrics.lock().unwrap().push(*m)),
            ]
        }

        fn statuses(&self) -> Vec<ConnectionStatus> {
            self.statuses.lock().unwrap().clone()
        }

        fn scheduled_delays(&self) -> Vec<u64> {
            self.backoffs
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .map(|b| b.delay_ms)
                .collect()
        }

        fn last_metrics(&self) -> Option<ConnectionMetrics> {
            self.metrics.lock().unwrap().last().copied()
        }
    }

    fn start(mock: &MockTransport) -> (ConnectionService, Recorder, Vec<Subscription>, Arc<MessageLog>) {
        let log = Arc::new(MessageLog::new());
        let service = ConnectionService::spawn(ServiceConfig::default(), Arc::clone(&log), mock.clone());
        let recorder = Recorder::default();
        let subs = recorder.attach(service.events());
        (service, recorder, subs, log)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success_reaches_connected() {
        // Arrange
        let mock = MockTransport::new();
        let (service, recorder, _subs, _log) = start(&mock);

        // Act
        service.connect().await;

        // Assert
        assert_eq!(
            recorder.statuses(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        assert_eq!(mock.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_double_and_cap_across_failed_reconnects() {
        // Arrange
        let mock = MockTransport::new();
        mock.fail_connects(Some(TransportError::NoDeviceFound));
        let (service, recorder, _subs, _log) = start(&mock);

        // Act: 1 + 2 + 4 + 8 + 15 seconds of retries, plus slack.
        service.connect().await;
        time::sleep(Duration::from_millis(30_500)).await;

        // Assert
        assert_eq!(
            recorder.scheduled_delays(),
            vec![1000, 2000, 4000, 8000, 15000, 15000]
        );
        assert_eq!(mock.connect_calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_attempt_numbers_are_one_based() {
        let mock = MockTransport::new();
        mock.fail_connects(Some(TransportError::Unavailable("no backend".into())));
        let (service, recorder, _subs, _log) = start(&mock);

        service.connect().await;
        time::sleep(Duration::from_millis(1_500)).await;

        let attempts: Vec<u32> = recorder
            .backoffs
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|b| b.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_successful_connect() {
        // Arrange: two failures, then success.
        let mock = MockTransport::new();
        mock.push_connect(Err(TransportError::NoDeviceFound))
            .push_connect(Err(TransportError::NoDeviceFound))
            .push_connect(Ok(()));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;
        time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Connected));

        // Act: the next probe fails.
        mock.push_probe(Err(TransportError::SendFailed("unplugged".into())));
        time::sleep(Duration::from_millis(2_600)).await;

        // Assert
        assert_eq!(recorder.scheduled_delays(), vec![1000, 2000, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_invoke_transport_once() {
        // Arrange
        let mock = MockTransport::new();
        let (service, _recorder, _subs, _log) = start(&mock);

        // Act
        tokio::join!(service.connect(), service.connect());

        // Assert
        assert_eq!(mock.connect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_join_a_failed_attempt() {
        // Arrange
        let mock = MockTransport::new();
        mock.push_connect(Err(TransportError::NoDeviceFound))
            .push_connect(Err(TransportError::NoDeviceFound));
        let (service, recorder, _subs, _log) = start(&mock);

        // Act
        tokio::join!(service.connect(), service.connect());

        // Assert: one attempt, one scheduled retry.
        assert_eq!(mock.connect_calls(), 1);
        assert_eq!(recorder.scheduled_delays(), vec![1000]);
        assert_eq!(
            recorder.statuses(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Error]
        );

        // The retry is the only further attempt.
        time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(mock.connect_calls(), 2);
        assert_eq!(recorder.scheduled_delays(), vec![1000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_queued_behind_disconnect_is_not_coalesced() {
        // Arrange
        let mock = MockTransport::new();
        let (service, recorder, _subs, _log) = start(&mock);

        // Act
        tokio::join!(service.connect(), service.disconnect(), service.connect());

        // Assert
        assert_eq!(mock.connect_calls(), 2);
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        // Arrange
        let mock = MockTransport::new();
        mock.fail_connects(Some(TransportError::NoDeviceFound));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;
        assert_eq!(recorder.scheduled_delays(), vec![1000]);

        // Act
        service.disconnect().await;
        time::sleep(Duration::from_secs(60)).await;

        // Assert
        assert_eq!(mock.connect_calls(), 1);
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Disconnected));
        assert_eq!(recorder.backoffs.lock().unwrap().last(), Some(&None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_connect_supersedes_pending_reconnect() {
        // Arrange
        let mock = MockTransport::new();
        mock.push_connect(Err(TransportError::NoDeviceFound));
        let (service, _recorder, _subs, _log) = start(&mock);
        service.connect().await;

        // Act: connect before the 1 s retry fires.
        time::sleep(Duration::from_millis(200)).await;
        service.connect().await;
        time::sleep(Duration::from_secs(5)).await;

        // Assert: the retry timer did not fire a third attempt.
        assert_eq!(mock.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_over_threshold_is_degraded() {
        // Arrange
        let mock = MockTransport::new();
        mock.push_probe(Ok(Duration::from_millis(201)));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;

        // Act
        time::sleep(Duration::from_millis(2_600)).await;

        // Assert
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Degraded));
        assert_eq!(recorder.last_metrics().unwrap().latency_ms, Some(201));
        assert_eq!(recorder.last_metrics().unwrap().dropped, 0);
        assert!(recorder.scheduled_delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_at_threshold_stays_connected() {
        let mock = MockTransport::new();
        mock.push_probe(Ok(Duration::from_millis(200)));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;

        time::sleep(Duration::from_millis(2_600)).await;

        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Connected));
        assert_eq!(mock.probe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steadily_slow_link_stays_degraded_without_drops() {
        // Arrange
        let mock = MockTransport::new();
        mock.set_default_latency(Duration::from_millis(250));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;

        // Act: three probes.
        time::sleep(Duration::from_millis(7_600)).await;

        // Assert
        assert_eq!(mock.probe_calls(), 3);
        assert_eq!(
            recorder.statuses(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Degraded,
            ]
        );
        let metrics = recorder.last_metrics().unwrap();
        assert_eq!(metrics.latency_ms, Some(250));
        assert_eq!(metrics.dropped, 0);
        assert!(recorder.scheduled_delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_recovers_to_connected() {
        let mock = MockTransport::new();
        mock.push_probe(Ok(Duration::from_millis(450)))
            .push_probe(Ok(Duration::from_millis(20)));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;

        time::sleep(Duration::from_millis(5_100)).await;

        assert_eq!(
            recorder.statuses(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Degraded,
                ConnectionStatus::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_counts_drop_and_schedules_reconnect() {
        // Arrange
        let mock = MockTransport::new();
        mock.push_probe(Err(TransportError::SendFailed("cable pulled".into())));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;

        // Act
        time::sleep(Duration::from_millis(2_600)).await;

        // Assert
        assert_eq!(recorder.last_metrics().unwrap().dropped, 1);
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Error));
        assert_eq!(
            recorder.errors.lock().unwrap().as_slice(),
            ["send failed: cable pulled".to_string()]
        );
        assert_eq!(recorder.scheduled_delays(), vec![1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_is_cut_off_by_probe_timeout() {
        let mock = MockTransport::new();
        mock.set_probe_delay(Duration::from_secs(30));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;

        time::sleep(Duration::from_millis(3_600)).await;

        assert_eq!(recorder.last_metrics().unwrap().dropped, 1);
        assert_eq!(
            recorder.errors.lock().unwrap().as_slice(),
            ["probe timed out after 1000ms".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_goes_disconnected_and_retries_immediately() {
        // Arrange
        let mock = MockTransport::new();
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;

        // Act
        mock.drop_link();
        time::sleep(Duration::from_millis(2_600)).await;

        // Assert: no probe was attempted on the dead link.
        assert_eq!(mock.probe_calls(), 0);
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Disconnected));
        assert_eq!(recorder.scheduled_delays(), vec![1000]);

        // The scheduled reconnect brings the link back.
        time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Connected));
        assert_eq!(mock.connect_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_clears_backoff_when_attempt_begins() {
        let mock = MockTransport::new();
        mock.push_connect(Err(TransportError::NoDeviceFound));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;

        time::sleep(Duration::from_millis(1_100)).await;

        let backoffs = recorder.backoffs.lock().unwrap().clone();
        assert_eq!(
            backoffs,
            vec![
                Some(BackoffState {
                    delay_ms: 1000,
                    attempt: 1
                }),
                None
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_metrics() {
        // Arrange: accumulate one drop.
        let mock = MockTransport::new();
        mock.push_probe(Err(TransportError::SendFailed("x".into())));
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;
        time::sleep(Duration::from_millis(2_600)).await;
        assert_eq!(recorder.last_metrics().unwrap().dropped, 1);

        // Act
        service.reconnect().await;

        // Assert
        assert_eq!(recorder.last_metrics(), Some(ConnectionMetrics::default()));
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_connected_logs_out_entry() {
        // Arrange
        let mock = MockTransport::new();
        let (service, _recorder, _subs, log) = start(&mock);
        service.connect().await;

        // Act
        service.send_control_change(1, 11, 64).await;
        service.send_program_change(1, 5).await;

        // Assert
        assert_eq!(
            mock.sent(),
            vec![
                MidiMessage::control_change(1, 11, 64),
                MidiMessage::program_change(1, 5)
            ]
        );
        let snapshot = log.get_snapshot();
        let kinds: Vec<_> = snapshot.entries.iter().map(|e| (e.direction, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (MidiDirection::Out, MidiMessageType::Cc),
                (MidiDirection::Out, MidiMessageType::Pc)
            ]
        );
        assert_eq!(snapshot.entries[0].detail.as_deref(), Some("b0 0b 40"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_logs_error_without_transition() {
        let mock = MockTransport::new();
        let (service, recorder, _subs, log) = start(&mock);

        service.send_program_change(1, 5).await;

        assert!(mock.sent().is_empty());
        assert!(recorder.statuses().is_empty());
        let snapshot = log.get_snapshot();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].direction, MidiDirection::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_a_dropped_link() {
        // Arrange
        let mock = MockTransport::new();
        let (service, recorder, _subs, log) = start(&mock);
        service.connect().await;
        mock.fail_sends(Some(TransportError::SendFailed("pipe broken".into())));

        // Act
        service.send_control_change(1, 1, 1).await;

        // Assert
        assert_eq!(recorder.last_metrics().unwrap().dropped, 1);
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Error));
        assert_eq!(recorder.scheduled_delays(), vec![1000]);
        assert_eq!(log.get_snapshot().entries[0].direction, MidiDirection::Error);
    }

    // ── Clock ─────────────────────────────────────────────────────────────────

    fn clock_entries(log: &MessageLog) -> Vec<(MidiDirection, String)> {
        log.get_snapshot()
            .entries
            .iter()
            .filter(|e| e.kind == MidiMessageType::Clock)
            .map(|e| (e.direction, e.summary.clone()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_starts_and_stops_on_a_live_link() {
        // Arrange
        let mock = MockTransport::new();
        let (service, _recorder, _subs, log) = start(&mock);
        service.connect().await;

        // Act
        service.start_clock(120.0).await;
        let running = mock.clock_bpm();
        service.stop_clock().await;

        // Assert
        assert_eq!(running, Some(120.0));
        assert_eq!(mock.clock_bpm(), None);
        assert_eq!(
            clock_entries(&log),
            vec![
                (MidiDirection::Out, "Clock started at 120.0 bpm".to_string()),
                (MidiDirection::Out, "Clock stopped".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_requested_before_connect_starts_with_the_link() {
        let mock = MockTransport::new();
        let (service, _recorder, _subs, _log) = start(&mock);

        service.start_clock(90.0).await;
        assert!(mock.clock_starts().is_empty());
        service.connect().await;

        assert_eq!(mock.clock_starts(), vec![90.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_resumes_after_automatic_reconnect() {
        // Arrange
        let mock = MockTransport::new();
        let (service, recorder, _subs, _log) = start(&mock);
        service.connect().await;
        service.start_clock(120.0).await;

        // Act: the link drops, the health check notices, the retry fires.
        mock.drop_link();
        time::sleep(Duration::from_millis(2_600)).await;
        assert_eq!(mock.clock_bpm(), None);
        time::sleep(Duration::from_millis(1_000)).await;

        // Assert
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Connected));
        assert_eq!(mock.clock_starts(), vec![120.0, 120.0]);
        assert_eq!(mock.clock_bpm(), Some(120.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_forgets_the_clock() {
        let mock = MockTransport::new();
        let (service, _recorder, _subs, _log) = start(&mock);
        service.connect().await;
        service.start_clock(120.0).await;

        service.disconnect().await;
        service.connect().await;

        assert_eq!(mock.clock_starts(), vec![120.0]);
        assert_eq!(mock.clock_bpm(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_clock_tempo_is_logged_and_ignored() {
        let mock = MockTransport::new();
        let (service, _recorder, _subs, log) = start(&mock);
        service.connect().await;

        service.start_clock(0.0).await;
        service.start_clock(f64::NAN).await;

        assert!(mock.clock_starts().is_empty());
        let entries = clock_entries(&log);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(d, _)| *d == MidiDirection::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_failure_does_not_drop_the_link() {
        // Arrange
        let mock = MockTransport::new();
        mock.fail_clock(Some(TransportError::Clock("no MIDI output selected".into())));
        let (service, recorder, _subs, log) = start(&mock);
        service.connect().await;

        // Act
        service.start_clock(120.0).await;

        // Assert
        assert_eq!(recorder.statuses().last(), Some(&ConnectionStatus::Connected));
        assert!(recorder.scheduled_delays().is_empty());
        assert!(recorder.errors.lock().unwrap().is_empty());
        assert_eq!(
            clock_entries(&log),
            vec![(
                MidiDirection::Error,
                "Clock at 120.0 bpm not started: clock failed: no MIDI output selected".to_string()
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_subscriber_sees_only_later_events() {
        let mock = MockTransport::new();
        let log = Arc::new(MessageLog::new());
        let service = ConnectionService::spawn(ServiceConfig::default(), log, mock.clone());
        service.connect().await;

        let recorder = Recorder::default();
        let _subs = recorder.attach(service.events());
        service.disconnect().await;

        assert_eq!(recorder.statuses(), vec![ConnectionStatus::Disconnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_transport() {
        let mock = MockTransport::new();
        let (service, _recorder, _subs, _log) = start(&mock);
        service.connect().await;

        service.shutdown().await;

        assert_eq!(mock.disconnect_calls(), 1);
        assert!(!mock.is_connected());
    }

    #[test]
    fn test_service_config_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.health_interval, Duration::from_millis(2500));
        assert_eq!(config.degraded_threshold, Duration::from_millis(200));
        assert_eq!(config.backoff, BackoffPolicy::default());
    }
}
