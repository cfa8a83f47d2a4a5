//! Inbound MIDI: messages from the pedal into the message log.
//!
//! `midir` delivers input on its own backend thread.  The callback does
//! nothing but copy the bytes onto a Tokio channel; an [`InboundPump`] task
//! on the runtime decodes each message into the log and feeds the clock
//! follower.
//!
//! [`ClockFollowInput`] is the log-free variant the bridge host uses: it
//! only tracks the tempo of incoming clock.

use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

use midir::{Ignore, MidiInput, MidiInputConnection};
use pedal_link_core::midi::{decode_inbound, ClockFollower};
use pedal_link_core::MessageLog;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::device::DeviceError;

/// One raw message and the moment it arrived.
pub type RawInbound = (Vec<u8>, Instant);

/// Names of the available MIDI inputs.
pub fn list_inputs(client_name: &str) -> Result<Vec<String>, DeviceError> {
    let midi_in = MidiInput::new(client_name).map_err(|e| DeviceError::Unavailable(e.to_string()))?;
    midi_in
        .ports()
        .iter()
        .map(|port| {
            midi_in
                .port_name(port)
                .map_err(|e| DeviceError::Unavailable(e.to_string()))
        })
        .collect()
}

/// Task that moves raw inbound messages into the log.
pub struct InboundPump {
    clock: Arc<Mutex<ClockFollower>>,
    task: JoinHandle<usize>,
}

impl InboundPump {
    /// Spawns the pump.  It ends when every sender of `rx` is gone and
    /// resolves to the number of messages processed.
    pub fn spawn(mut rx: mpsc::UnboundedReceiver<RawInbound>, log: Arc<MessageLog>) -> Self {
        let clock = Arc::new(Mutex::new(ClockFollower::new()));
        let follower = Arc::clone(&clock);
        let task = tokio::spawn(async move {
            let mut processed = 0usize;
            while let Some((bytes, at)) = rx.recv().await {
                follower
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .observe(&bytes, at);
                if let Some(entry) = decode_inbound(&bytes) {
                    log.log(entry);
                }
                processed += 1;
            }
            debug!(processed, "inbound pump finished");
            processed
        });
        Self { clock, task }
    }

    /// `(running, bpm)` of the followed clock.
    pub fn clock_status(&self) -> (bool, Option<f64>) {
        self.clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .status()
    }

    /// Waits for the pump to drain.
    pub async fn finish(self) -> usize {
        self.task.await.unwrap_or(0)
    }
}

/// An open MIDI input feeding an [`InboundPump`].
pub struct InboundListener {
    // Dropping the connection stops the callback and closes the channel.
    connection: MidiInputConnection<()>,
    pump: InboundPump,
}

impl InboundListener {
    /// Opens input `index` and starts pumping into `log`.
    pub fn start(client_name: &str, index: usize, log: Arc<MessageLog>) -> Result<Self, DeviceError> {
        let (tx, rx) = mpsc::unbounded_channel::<RawInbound>();
        let connection = open_input(client_name, index, move |message| {
            let _ = tx.send((message.to_vec(), Instant::now()));
        })?;
        Ok(Self {
            connection,
            pump: InboundPump::spawn(rx, log),
        })
    }

    pub fn clock_status(&self) -> (bool, Option<f64>) {
        self.pump.clock_status()
    }

    /// Closes the input and waits for queued messages to reach the log.
    pub async fn stop(self) -> usize {
        self.connection.close();
        self.pump.finish().await
    }
}

/// Opens input `index` with `on_message` as the callback.
fn open_input<F>(client_name: &str, index: usize, mut on_message: F) -> Result<MidiInputConnection<()>, DeviceError>
where
    F: FnMut(&[u8]) + Send + 'static,
{
    let mut midi_in =
        MidiInput::new(client_name).map_err(|e| DeviceError::Unavailable(e.to_string()))?;
    midi_in.ignore(Ignore::None);

    let ports = midi_in.ports();
    let port = ports.get(index).ok_or_else(|| DeviceError::Open {
        index,
        reason: format!("only {} inputs available", ports.len()),
    })?;
    let port_name = midi_in.port_name(port).unwrap_or_default();

    let connection = midi_in
        .connect(
            port,
            &format!("{client_name} in"),
            move |_stamp, message, _| on_message(message),
            (),
        )
        .map_err(|e| DeviceError::Open {
            index,
            reason: e.to_string(),
        })?;

    info!(index, port = %port_name, "MIDI input opened");
    Ok(connection)
}

/// Tempo tracking on a MIDI input, without logging.
///
/// The input connection lives on its own thread, so the handle can be held
/// across awaits on any backend.  Dropping the handle closes the input.
pub struct ClockFollowInput {
    clock: Arc<Mutex<ClockFollower>>,
    stop: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl ClockFollowInput {
    /// Opens input `index` and starts following its clock.
    pub fn start(client_name: &str, index: usize) -> Result<Self, DeviceError> {
        let clock = Arc::new(Mutex::new(ClockFollower::new()));
        let follower = Arc::clone(&clock);
        let client_name = client_name.to_string();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), DeviceError>>();
        let (stop, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("midi-clock-follow".to_string())
            .spawn(move || {
                let opened = open_input(&client_name, index, move |message| {
                    follower
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .observe(message, Instant::now());
                });
                let connection = match opened {
                    Ok(connection) => {
                        let _ = ready_tx.send(Ok(()));
                        connection
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Returns on an explicit stop or when the handle is dropped.
                let _ = stop_rx.recv();
                connection.close();
                debug!(index, "clock follow input closed");
            })
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                clock,
                stop,
                thread,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::Unavailable(
                "clock follow thread exited".to_string(),
            )),
        }
    }

    /// `(running, bpm)` of the followed clock.
    pub fn status(&self) -> (bool, Option<f64>) {
        self.clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .status()
    }

    /// Closes the input and waits for its thread.
    pub fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.thread.join();
    }
}

impl std::fmt::Debug for ClockFollowInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockFollowInput")
            .field("status", &self.status())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
