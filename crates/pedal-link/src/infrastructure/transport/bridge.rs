//! IPC-brokered transport: MIDI output owned by a separate bridge host.
//!
//! # Wire format
//!
//! One JSON object per line in each direction.  Every request carries a
//! fresh UUID and the host echoes it in the response, so a reply can be
//! matched to the call that caused it:
//!
//! ```text
//! → {"id":"6f1c…","command":"send_midi_cc","channel":1,"control":0,"value":0}
//! ← {"id":"6f1c…","status":"sent"}
//! → {"id":"a2d9…","command":"list_midi_outputs"}
//! ← {"id":"a2d9…","status":"outputs","names":["DL4 MkII"]}
//! ```
//!
//! Failures come back as `{"status":"error","message":…}`.
//!
//! Clock commands (`start_midi_clock_send`, `stop_midi_clock_send`,
//! `enable_midi_clock_follow`, `disable_midi_clock_follow`,
//! `midi_clock_status`) keep state on the host for as long as the link
//! lives; follow and status calls answer with
//! `{"status":"clock_status","running":…,"bpm":…}`.
//!
//! # Roles
//!
//! - [`BridgeHost`] is the host side: it reads requests, drives an
//!   [`OutputDevice`] plus the clock sender and follower, and writes
//!   responses.  The binary's `bridge-host` subcommand runs it over
//!   stdin/stdout through [`serve_bridge`].
//! - [`BridgeTransport`] is the client side.  It opens a [`BridgeLink`]
//!   through a [`BridgeConnector`] (a spawned host process in production, an
//!   in-memory pipe in tests) and bounds every call with a timeout.
//!
//! A call that fails at the link level (closed pipe, timeout, garbled reply)
//! drops the link, which is what `is_connected` reports from then on.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pedal_link_core::midi::is_valid_midi_message;
use pedal_link_core::MidiMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{MidiTransport, OutputSelector, TransportError};
use crate::infrastructure::clock_out::ClockSender;
use crate::infrastructure::device::OutputDevice;
use crate::infrastructure::inbound::ClockFollowInput;

/// Default upper bound for a single bridge call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Errors on the bridge link itself.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed bridge message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("bridge link closed")]
    Closed,

    #[error("failed to start bridge host {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ── Protocol ──────────────────────────────────────────────────────────────────

/// Operations the bridge host performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum BridgeCommand {
    ListMidiOutputs,
    SelectMidiOutput { index: usize },
    SendMidiCc { channel: u8, control: u8, value: u8 },
    SendMidiPc { channel: u8, program: u8 },
    SendMidiRaw { bytes: Vec<u8> },
    StartMidiClockSend { bpm: f64 },
    StopMidiClockSend,
    EnableMidiClockFollow { index: usize },
    DisableMidiClockFollow,
    MidiClockStatus,
}

impl BridgeCommand {
    /// The command that sends `message`.
    pub fn for_message(message: &MidiMessage) -> Self {
        match *message {
            MidiMessage::ControlChange {
                channel,
                control,
                value,
            } => BridgeCommand::SendMidiCc {
                channel,
                control,
                value,
            },
            MidiMessage::ProgramChange { channel, program } => {
                BridgeCommand::SendMidiPc { channel, program }
            }
            MidiMessage::Realtime { .. } => BridgeCommand::SendMidiRaw {
                bytes: message.to_bytes(),
            },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            BridgeCommand::ListMidiOutputs => "list_midi_outputs",
            BridgeCommand::SelectMidiOutput { .. } => "select_midi_output",
            BridgeCommand::SendMidiCc { .. } => "send_midi_cc",
            BridgeCommand::SendMidiPc { .. } => "send_midi_pc",
            BridgeCommand::SendMidiRaw { .. } => "send_midi_raw",
            BridgeCommand::StartMidiClockSend { .. } => "start_midi_clock_send",
            BridgeCommand::StopMidiClockSend => "stop_midi_clock_send",
            BridgeCommand::EnableMidiClockFollow { .. } => "enable_midi_clock_follow",
            BridgeCommand::DisableMidiClockFollow => "disable_midi_clock_follow",
            BridgeCommand::MidiClockStatus => "midi_clock_status",
        }
    }
}

/// A request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: Uuid,
    #[serde(flatten)]
    pub command: BridgeCommand,
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BridgeResult {
    Outputs { names: Vec<String> },
    Selected { index: Option<usize> },
    Sent,
    ClockStatus { running: bool, bpm: Option<f64> },
    Error { message: String },
}

/// A response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub id: Uuid,
    #[serde(flatten)]
    pub result: BridgeResult,
}

// ── Host side ─────────────────────────────────────────────────────────────────

/// Host-side state: the output device plus clock sender and follower.
pub struct BridgeHost {
    device: Arc<dyn OutputDevice>,
    client_name: String,
    clock: Option<ClockSender>,
    follow: Option<ClockFollowInput>,
}

impl BridgeHost {
    /// `client_name` names the MIDI client opened for clock follow.
    pub fn new(device: Arc<dyn OutputDevice>, client_name: impl Into<String>) -> Self {
        Self {
            device,
            client_name: client_name.into(),
            clock: None,
            follow: None,
        }
    }

    /// Serves requests from `reader` until end of input, answering on
    /// `writer`.  Returns the number of requests answered.
    ///
    /// Lines that do not parse are logged and skipped; without an id they
    /// cannot be answered.
    pub async fn serve<R, W>(&mut self, reader: R, mut writer: W) -> Result<usize, BridgeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut served = 0usize;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let request: BridgeRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("ignoring malformed bridge request: {e}");
                    continue;
                }
            };
            debug!(id = %request.id, command = request.command.name(), "bridge request");

            let response = BridgeResponse {
                id: request.id,
                result: self.handle(request.command),
            };
            let mut json = serde_json::to_string(&response)?;
            json.push('\n');
            writer.write_all(json.as_bytes()).await?;
            writer.flush().await?;
            served += 1;
        }

        debug!(served, "bridge input closed");
        Ok(served)
    }

    /// Executes one command.  Clock sends need a Tokio runtime.
    pub fn handle(&mut self, command: BridgeCommand) -> BridgeResult {
        let device = self.device.as_ref();
        let outcome = match command {
            BridgeCommand::ListMidiOutputs => device
                .list_outputs()
                .map(|names| BridgeResult::Outputs { names }),
            BridgeCommand::SelectMidiOutput { index } => {
                // The clock belongs to the output it was started on.
                self.stop_clock();
                self.device
                    .select_output(index)
                    .map(|index| BridgeResult::Selected { index })
            }
            BridgeCommand::SendMidiCc {
                channel,
                control,
                value,
            } => device
                .send(&MidiMessage::control_change(channel, control, value).to_bytes())
                .map(|()| BridgeResult::Sent),
            BridgeCommand::SendMidiPc { channel, program } => device
                .send(&MidiMessage::program_change(channel, program).to_bytes())
                .map(|()| BridgeResult::Sent),
            BridgeCommand::SendMidiRaw { bytes } => {
                if !is_valid_midi_message(&bytes) {
                    return BridgeResult::Error {
                        message: format!("invalid MIDI message ({} bytes)", bytes.len()),
                    };
                }
                device.send(&bytes).map(|()| BridgeResult::Sent)
            }
            BridgeCommand::StartMidiClockSend { bpm } => {
                self.stop_clock();
                return match ClockSender::start(Arc::clone(&self.device), bpm) {
                    Ok(clock) => {
                        self.clock = Some(clock);
                        BridgeResult::Sent
                    }
                    Err(e) => BridgeResult::Error {
                        message: e.to_string(),
                    },
                };
            }
            BridgeCommand::StopMidiClockSend => {
                self.stop_clock();
                Ok(BridgeResult::Sent)
            }
            BridgeCommand::EnableMidiClockFollow { index } => {
                self.stop_follow();
                match ClockFollowInput::start(&self.client_name, index) {
                    Ok(follow) => {
                        self.follow = Some(follow);
                        Ok(self.clock_status())
                    }
                    Err(e) => Err(e),
                }
            }
            BridgeCommand::DisableMidiClockFollow => {
                self.stop_follow();
                Ok(self.clock_status())
            }
            BridgeCommand::MidiClockStatus => Ok(self.clock_status()),
        };
        outcome.unwrap_or_else(|e| BridgeResult::Error {
            message: e.to_string(),
        })
    }

    /// Stops the clock and closes the followed input.
    pub fn shutdown(&mut self) {
        self.stop_clock();
        self.stop_follow();
    }

    fn clock_status(&self) -> BridgeResult {
        let (running, bpm) = self
            .follow
            .as_ref()
            .map_or((false, None), ClockFollowInput::status);
        BridgeResult::ClockStatus { running, bpm }
    }

    fn stop_clock(&mut self) {
        if let Some(clock) = self.clock.take() {
            clock.stop();
        }
    }

    fn stop_follow(&mut self) {
        if let Some(follow) = self.follow.take() {
            follow.stop();
        }
    }
}

/// Runs a [`BridgeHost`] over `reader`/`writer` and shuts it down once the
/// input ends.  Device lifetime stays with the caller.
pub async fn serve_bridge<R, W>(
    reader: R,
    writer: W,
    device: Arc<dyn OutputDevice>,
    client_name: &str,
) -> Result<usize, BridgeError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut host = BridgeHost::new(device, client_name);
    let served = host.serve(reader, writer).await;
    host.shutdown();
    served
}

// ── Client side ───────────────────────────────────────────────────────────────

type LinkReader = Box<dyn AsyncBufRead + Send + Unpin>;
type LinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open request/response channel to a bridge host.
pub struct BridgeLink {
    lines: Lines<LinkReader>,
    writer: LinkWriter,
    // Held so the host is killed when the link is dropped.
    _child: Option<Child>,
}

impl BridgeLink {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: LinkReader = Box::new(reader);
        Self {
            lines: reader.lines(),
            writer: Box::new(writer),
            _child: None,
        }
    }

    /// Ties the host process to this link.
    pub fn with_child(mut self, child: Child) -> Self {
        self._child = Some(child);
        self
    }

    /// Sends `command` and waits for the response with the same id.
    ///
    /// Responses carrying another id are leftovers of an abandoned call and
    /// are skipped.
    pub async fn call(&mut self, command: BridgeCommand) -> Result<BridgeResult, BridgeError> {
        let id = Uuid::new_v4();
        let mut json = serde_json::to_string(&BridgeRequest { id, command })?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Err(BridgeError::Closed);
            };
            let response: BridgeResponse = serde_json::from_str(&line)?;
            if response.id == id {
                return Ok(response.result);
            }
            debug!(stale = %response.id, "discarding response to an earlier call");
        }
    }
}

/// Opens links to a bridge host.
#[async_trait]
pub trait BridgeConnector: Send + Sync {
    async fn open(&self) -> Result<BridgeLink, BridgeError>;
}

/// Spawns the bridge host as a child process and talks over its stdio.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessConnector {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl BridgeConnector for ProcessConnector {
    async fn open(&self) -> Result<BridgeLink, BridgeError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(BridgeError::Closed)?;
        let stdout = child.stdout.take().ok_or(BridgeError::Closed)?;
        info!(program = %self.program.display(), pid = ?child.id(), "bridge host started");
        Ok(BridgeLink::new(BufReader::new(stdout), stdin).with_child(child))
    }
}

/// Runs [`serve_bridge`] on a task in this process, connected through an
/// in-memory pipe.
#[derive(Clone)]
pub struct InProcessConnector {
    device: Arc<dyn OutputDevice>,
}

impl InProcessConnector {
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl BridgeConnector for InProcessConnector {
    async fn open(&self) -> Result<BridgeLink, BridgeError> {
        let (client, host) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let device = Arc::clone(&self.device);
        tokio::spawn(async move {
            if let Err(e) =
                serve_bridge(BufReader::new(host_read), host_write, device, "pedal-link-bridge").await
            {
                warn!("in-process bridge host stopped: {e}");
            }
        });
        let (client_read, client_write) = tokio::io::split(client);
        Ok(BridgeLink::new(BufReader::new(client_read), client_write))
    }
}

/// Transport that reaches the pedal through a bridge host.
pub struct BridgeTransport {
    connector: Box<dyn BridgeConnector>,
    link: Option<BridgeLink>,
    output: OutputSelector,
    call_timeout: Duration,
    clock: Option<f64>,
}

impl BridgeTransport {
    pub fn new(
        connector: Box<dyn BridgeConnector>,
        output: OutputSelector,
        call_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            link: None,
            output,
            call_timeout,
            clock: None,
        }
    }

    /// Tempo of the clock the host was last told to send, if any.
    pub fn clock_bpm(&self) -> Option<f64> {
        self.clock
    }

    /// Starts following clock on host input `index`; answers the
    /// follower's `(running, bpm)`.
    pub async fn enable_clock_follow(
        &mut self,
        index: usize,
    ) -> Result<(bool, Option<f64>), TransportError> {
        self.expect_clock_status(BridgeCommand::EnableMidiClockFollow { index })
            .await
    }

    pub async fn disable_clock_follow(&mut self) -> Result<(), TransportError> {
        self.expect_clock_status(BridgeCommand::DisableMidiClockFollow)
            .await
            .map(|_| ())
    }

    /// `(running, bpm)` of the clock followed on the host.
    pub async fn clock_status(&mut self) -> Result<(bool, Option<f64>), TransportError> {
        self.expect_clock_status(BridgeCommand::MidiClockStatus).await
    }

    async fn expect_clock_status(
        &mut self,
        command: BridgeCommand,
    ) -> Result<(bool, Option<f64>), TransportError> {
        match self.call(command).await? {
            BridgeResult::ClockStatus { running, bpm } => Ok((running, bpm)),
            other => Err(TransportError::SendFailed(format!("unexpected reply {other:?}"))),
        }
    }

    /// Issues one call on the open link.  Any link-level failure drops the
    /// link; a host-reported error leaves it open.
    async fn call(&mut self, command: BridgeCommand) -> Result<BridgeResult, TransportError> {
        let operation = command.name();
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;

        let outcome = tokio::time::timeout(self.call_timeout, link.call(command)).await;
        match outcome {
            Ok(Ok(BridgeResult::Error { message })) => Err(TransportError::SendFailed(message)),
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                warn!(operation, "bridge link failed: {e}");
                self.link = None;
                Err(TransportError::SendFailed(e.to_string()))
            }
            Err(_) => {
                warn!(operation, "bridge call timed out");
                self.link = None;
                Err(TransportError::Timeout {
                    operation,
                    after: self.call_timeout,
                })
            }
        }
    }

    async fn expect_sent(&mut self, command: BridgeCommand) -> Result<(), TransportError> {
        match self.call(command).await? {
            BridgeResult::Sent => Ok(()),
            other => Err(TransportError::SendFailed(format!("unexpected reply {other:?}"))),
        }
    }

    async fn open_and_select(&mut self) -> Result<(), TransportError> {
        let link = self
            .connector
            .open()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        self.link = Some(link);

        // Smoke test: the host answers and reports its outputs.
        let names = match self.call(BridgeCommand::ListMidiOutputs).await {
            Ok(BridgeResult::Outputs { names }) => names,
            Ok(other) => {
                return Err(TransportError::Unavailable(format!(
                    "unexpected reply {other:?}"
                )))
            }
            Err(TransportError::SendFailed(reason)) => {
                return Err(TransportError::Unavailable(reason))
            }
            Err(e) => return Err(e),
        };
        if names.is_empty() {
            return Err(TransportError::NoDeviceFound);
        }

        let index = self.output.pick(&names);
        match self.call(BridgeCommand::SelectMidiOutput { index }).await? {
            BridgeResult::Selected { index: Some(selected) } => {
                info!(index = selected, output = %names[index], "bridge transport connected");
                Ok(())
            }
            _ => Err(TransportError::NoDeviceFound),
        }
    }
}

#[async_trait]
impl MidiTransport for BridgeTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.link = None;
        self.clock = None;
        let result = self.open_and_select().await;
        if result.is_err() {
            self.link = None;
        }
        result
    }

    async fn disconnect(&mut self) {
        self.stop_clock().await;
        if self.link.take().is_some() {
            debug!("bridge transport disconnected");
        }
    }

    async fn send_test(&mut self) -> Result<Duration, TransportError> {
        let start = Instant::now();
        self.expect_sent(BridgeCommand::for_message(&MidiMessage::probe()))
            .await?;
        Ok(start.elapsed())
    }

    async fn send(&mut self, message: &MidiMessage) -> Result<(), TransportError> {
        self.expect_sent(BridgeCommand::for_message(message)).await
    }

    async fn start_clock(&mut self, bpm: f64) -> Result<(), TransportError> {
        match self.expect_sent(BridgeCommand::StartMidiClockSend { bpm }).await {
            Ok(()) => {
                self.clock = Some(bpm);
                Ok(())
            }
            // Host-reported failures leave the link up.
            Err(TransportError::SendFailed(reason)) if self.link.is_some() => {
                self.clock = None;
                Err(TransportError::Clock(reason))
            }
            Err(e) => {
                self.clock = None;
                Err(e)
            }
        }
    }

    async fn stop_clock(&mut self) {
        if self.clock.take().is_some() && self.link.is_some() {
            if let Err(e) = self.expect_sent(BridgeCommand::StopMidiClockSend).await {
                debug!("bridge clock stop failed: {e}");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::device::LoopbackDevice;

    fn in_process(device: &LoopbackDevice) -> BridgeTransport {
        BridgeTransport::new(
            Box::new(InProcessConnector::new(Arc::new(device.clone()))),
            OutputSelector::default(),
            DEFAULT_CALL_TIMEOUT,
        )
    }

    #[test]
    fn test_request_wire_format_is_flat_snake_case() {
        // Arrange
        let request = BridgeRequest {
            id: Uuid::nil(),
            command: BridgeCommand::SendMidiCc {
                channel: 1,
                control: 0,
                value: 0,
            },
        };

        // Act
        let json = serde_json::to_value(&request).unwrap();

        // Assert
        assert_eq!(
            json,
            serde_json::json!({
                "id": "00000000-0000-0000-0000-000000000000",
                "command": "send_midi_cc",
                "channel": 1,
                "control": 0,
                "value": 0
            })
        );
    }

    #[test]
    fn test_response_with_outputs_parses() {
        let line = r#"{"id":"00000000-0000-0000-0000-000000000000","status":"outputs","names":["A","B"]}"#;
        let response: BridgeResponse = serde_json::from_str(line).unwrap();
        assert_eq!(
            response.result,
            BridgeResult::Outputs {
                names: vec!["A".to_string(), "B".to_string()]
            }
        );
    }

    fn host(device: &LoopbackDevice) -> BridgeHost {
        BridgeHost::new(Arc::new(device.clone()), "pedal-link-test")
    }

    #[test]
    fn test_handle_command_rejects_invalid_raw_bytes() {
        let device = LoopbackDevice::single();
        device.select_output(0).unwrap();

        let result = host(&device).handle(BridgeCommand::SendMidiRaw { bytes: vec![0xB0, 0x01] });

        assert!(matches!(result, BridgeResult::Error { .. }));
        assert!(device.sent().is_empty());
    }

    #[tokio::test]
    async fn test_serve_bridge_answers_each_request_with_its_id() {
        // Arrange
        let device = LoopbackDevice::new(["Pedal"]);
        let id = Uuid::new_v4();
        let input = format!(
            "{}\n\nnot json\n",
            serde_json::to_string(&BridgeRequest {
                id,
                command: BridgeCommand::ListMidiOutputs
            })
            .unwrap()
        );
        let mut output = Vec::new();

        // Act
        let served = serve_bridge(
            input.as_bytes(),
            &mut output,
            Arc::new(device.clone()),
            "pedal-link-test",
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(served, 1);
        let response: BridgeResponse =
            serde_json::from_str(String::from_utf8(output).unwrap().trim()).unwrap();
        assert_eq!(response.id, id);
        assert_eq!(
            response.result,
            BridgeResult::Outputs {
                names: vec!["Pedal".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_connect_selects_output_and_sends_through_host() {
        // Arrange
        let device = LoopbackDevice::new(["IAC", "Pedal"]);
        let mut transport = in_process(&device);

        // Act
        transport.connect().await.unwrap();
        transport
            .send(&MidiMessage::program_change(1, 9))
            .await
            .unwrap();
        let latency = transport.send_test().await.unwrap();

        // Assert
        assert!(transport.is_connected());
        assert_eq!(device.selected(), Some(0));
        assert_eq!(device.sent(), vec![vec![0xC0, 0x09], vec![0xB0, 0x00, 0x00]]);
        assert!(latency < DEFAULT_CALL_TIMEOUT);
    }

    #[tokio::test]
    async fn test_connect_without_outputs_is_no_device_found() {
        let device = LoopbackDevice::new(Vec::<String>::new());
        let mut transport = in_process(&device);

        assert_eq!(transport.connect().await, Err(TransportError::NoDeviceFound));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_host_reported_send_error_keeps_link_open() {
        // Arrange
        let device = LoopbackDevice::single();
        let mut transport = in_process(&device);
        transport.connect().await.unwrap();
        device.unplug();

        // Act
        let result = transport.send(&MidiMessage::control_change(1, 1, 1)).await;

        // Assert
        assert!(matches!(result, Err(TransportError::SendFailed(_))));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_missing_host_program_is_unavailable() {
        let mut transport = BridgeTransport::new(
            Box::new(ProcessConnector::new(
                "/nonexistent/pedal-link-bridge-host",
                Vec::new(),
            )),
            OutputSelector::default(),
            DEFAULT_CALL_TIMEOUT,
        );

        let result = transport.connect().await;

        assert!(matches!(result, Err(TransportError::Unavailable(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_host_times_out_and_drops_link() {
        // Arrange: a host that accepts requests and never answers.
        struct SilentConnector;

        #[async_trait]
        impl BridgeConnector for SilentConnector {
            async fn open(&self) -> Result<BridgeLink, BridgeError> {
                let (client, host) = tokio::io::duplex(1024);
                tokio::spawn(async move {
                    let _host = host;
                    std::future::pending::<()>().await;
                });
                let (r, w) = tokio::io::split(client);
                Ok(BridgeLink::new(BufReader::new(r), w))
            }
        }
        let mut transport = BridgeTransport::new(
            Box::new(SilentConnector),
            OutputSelector::default(),
            Duration::from_millis(300),
        );

        // Act
        let result = transport.connect().await;

        // Assert
        assert_eq!(
            result,
            Err(TransportError::Timeout {
                operation: "list_midi_outputs",
                after: Duration::from_millis(300)
            })
        );
        assert!(!transport.is_connected());
    }

    // ── Clock ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_clock_status_wire_format() {
        let line = r#"{"id":"00000000-0000-0000-0000-000000000000","status":"clock_status","running":true,"bpm":120.0}"#;
        let response: BridgeResponse = serde_json::from_str(line).unwrap();
        assert_eq!(
            response.result,
            BridgeResult::ClockStatus {
                running: true,
                bpm: Some(120.0)
            }
        );

        let request = serde_json::to_value(BridgeRequest {
            id: Uuid::nil(),
            command: BridgeCommand::StartMidiClockSend { bpm: 98.5 },
        })
        .unwrap();
        assert_eq!(request["command"], "start_midi_clock_send");
        assert_eq!(request["bpm"], 98.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_clock_stops_when_output_is_reselected() {
        // Arrange
        let device = LoopbackDevice::single();
        let mut host = host(&device);
        host.handle(BridgeCommand::SelectMidiOutput { index: 0 });
        assert_eq!(
            host.handle(BridgeCommand::StartMidiClockSend { bpm: 125.0 }),
            BridgeResult::Sent
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Act
        host.handle(BridgeCommand::SelectMidiOutput { index: 0 });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Assert
        assert_eq!(
            device.sent(),
            vec![vec![0xFA], vec![0xF8], vec![0xF8], vec![0xFC]]
        );
    }

    #[tokio::test]
    async fn test_host_rejects_clock_without_output_or_tempo() {
        let device = LoopbackDevice::single();
        let mut host = host(&device);

        let unselected = host.handle(BridgeCommand::StartMidiClockSend { bpm: 120.0 });
        host.handle(BridgeCommand::SelectMidiOutput { index: 0 });
        let zero = host.handle(BridgeCommand::StartMidiClockSend { bpm: 0.0 });

        assert_eq!(
            unselected,
            BridgeResult::Error {
                message: "no MIDI output selected".to_string()
            }
        );
        assert!(matches!(zero, BridgeResult::Error { .. }));
        assert!(device.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_clock_runs_on_host_and_stops_on_disconnect() {
        // Arrange
        let device = LoopbackDevice::single();
        let mut transport = in_process(&device);
        transport.connect().await.unwrap();

        // Act
        tokio_test::assert_ok!(transport.start_clock(125.0).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.disconnect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Assert
        assert_eq!(transport.clock_bpm(), None);
        let sent = device.sent();
        assert_eq!(sent.first(), Some(&vec![0xFA]));
        assert_eq!(sent.last(), Some(&vec![0xFC]));
        assert_eq!(sent.iter().filter(|m| m.as_slice() == [0xF8]).count(), 3);
    }

    #[tokio::test]
    async fn test_transport_clock_rejection_is_a_clock_error() {
        let device = LoopbackDevice::single();
        let mut transport = in_process(&device);
        transport.connect().await.unwrap();

        let result = transport.start_clock(-5.0).await;

        assert!(matches!(result, Err(TransportError::Clock(_))));
        assert!(transport.is_connected());
        assert_eq!(transport.clock_bpm(), None);
    }

    #[tokio::test]
    async fn test_follow_on_missing_input_reports_error_and_idle_status() {
        // Arrange
        let device = LoopbackDevice::single();
        let mut transport = in_process(&device);
        transport.connect().await.unwrap();

        // Act
        let enabled = transport.enable_clock_follow(999).await;
        let status = transport.clock_status().await;

        // Assert
        assert!(matches!(enabled, Err(TransportError::SendFailed(_))));
        assert_eq!(status, Ok((false, None)));
        tokio_test::assert_ok!(transport.disable_clock_follow().await);
        assert!(transport.is_connected());
    }
}
