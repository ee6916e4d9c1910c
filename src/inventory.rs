//! Background inventory engine.
//!
//! Starting an inventory spawns two threads. The worker owns the receive
//! side of the serial line (locking the transport per read so commands can
//! interleave), decodes tag notifications and feeds them into a bounded
//! queue. The dispatcher drains that queue and runs the user callbacks, so
//! a slow callback can never stall frame extraction.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::frame::{build_frame, extract_valid_frames, Frame, Mid};
use crate::reader::{build_antenna_mask, NationReader, READ_CHUNK};
use crate::transport::RfidTransport;
use crate::types::{EndReason, ReaderError, TagRecord};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;

/// Window spent listening for a confirmation after each stop attempt
const STOP_CONFIRM_WINDOW: Duration = Duration::from_millis(300);

/// Lifecycle of the inventory engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryState {
    Idle,
    Running,
    Stopping,
}

impl InventoryState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_RUNNING => InventoryState::Running,
            STATE_STOPPING => InventoryState::Stopping,
            _ => InventoryState::Idle,
        }
    }
}

enum InventoryEvent {
    Tag(TagRecord),
    End(EndReason),
}

/// Shared state between the reader, its worker and its dispatcher
pub(crate) struct InventoryHandle {
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl InventoryHandle {
    pub(crate) fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            worker: Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    fn store_threads(&self, worker: JoinHandle<()>, dispatcher: JoinHandle<()>) {
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(worker);
        }
        if let Ok(mut slot) = self.dispatcher.lock() {
            *slot = Some(dispatcher);
        }
    }

    /// True while a worker thread exists and has not run to completion
    fn worker_alive(&self) -> bool {
        self.worker
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Join the worker within `timeout`. A worker that refuses to exit is
    /// kept in the slot so the next start can refuse to race it.
    fn join_worker(&self, timeout: Duration) {
        let handle = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let deadline = Instant::now() + timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if !handle.is_finished() {
                warn!("inventory worker did not exit within {:?}", timeout);
                if let Ok(mut slot) = self.worker.lock() {
                    *slot = Some(handle);
                }
                return;
            }
            let _ = handle.join();
        }
        // The worker dropped its sender, so the dispatcher drains and exits.
        let dispatcher = match self.dispatcher.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.join();
        }
    }
}

impl<T: RfidTransport + Send + 'static> NationReader<T> {
    /// Start a continuous inventory on the given antennas, invoking `on_tag`
    /// for every detection. Any previous session is stopped first.
    pub fn start_inventory<F>(&self, antenna_ids: &[u8], on_tag: F) -> Result<(), ReaderError>
    where
        F: FnMut(TagRecord) + Send + 'static,
    {
        self.start_inventory_inner(antenna_ids, Box::new(on_tag), None)
    }

    /// Like [`start_inventory`](Self::start_inventory), with an additional
    /// callback fired once when the reader reports the end of the round.
    pub fn start_inventory_with_end<F, G>(
        &self,
        antenna_ids: &[u8],
        on_tag: F,
        on_end: G,
    ) -> Result<(), ReaderError>
    where
        F: FnMut(TagRecord) + Send + 'static,
        G: FnOnce(EndReason) + Send + 'static,
    {
        self.start_inventory_inner(antenna_ids, Box::new(on_tag), Some(Box::new(on_end)))
    }

    fn start_inventory_inner(
        &self,
        antenna_ids: &[u8],
        mut on_tag: Box<dyn FnMut(TagRecord) + Send>,
        mut on_end: Option<Box<dyn FnOnce(EndReason) + Send>>,
    ) -> Result<(), ReaderError> {
        if antenna_ids.is_empty() {
            return Err(ReaderError::InvalidParameter("no antennas selected".into()));
        }
        let mask = build_antenna_mask(antenna_ids)?;

        // Starting on top of an unconfirmed stop would interleave the new
        // read command with leftover notifications.
        if !self.stop_inventory()? {
            return Err(ReaderError::Protocol(
                "reader did not confirm stop before starting inventory".into(),
            ));
        }
        if self.inventory.worker_alive() {
            return Err(ReaderError::WorkerBusy);
        }

        let mut payload = Vec::with_capacity(5);
        payload.extend_from_slice(&mask.to_be_bytes());
        payload.push(0x01); // continuous read
        let request = build_frame(Mid::ReadEpcTag, &payload, self.rs485_address(), false);
        {
            let mut port = self.lock_transport()?;
            port.flush_input().map_err(Self::transport_err)?;
            port.write(&request).map_err(Self::transport_err)?;
        }
        debug!("inventory started on antennas {:?} (mask 0x{mask:08X})", antenna_ids);

        let (events, queue) = mpsc::sync_channel(self.config().event_queue_depth);
        let dispatcher = thread::spawn(move || {
            while let Ok(event) = queue.recv() {
                match event {
                    InventoryEvent::Tag(tag) => on_tag(tag),
                    InventoryEvent::End(reason) => {
                        if let Some(callback) = on_end.take() {
                            callback(reason);
                        }
                    }
                }
            }
        });

        let running = Arc::clone(&self.inventory.running);
        let state = Arc::clone(&self.inventory.state);
        running.store(true, Ordering::SeqCst);
        state.store(STATE_RUNNING, Ordering::SeqCst);
        let transport = self.transport();
        let worker = thread::spawn(move || worker_loop(transport, running, state, events));
        self.inventory.store_threads(worker, dispatcher);
        Ok(())
    }

    /// Stop the running inventory and confirm the reader is no longer
    /// transmitting. Safe to call when nothing is running.
    ///
    /// Returns `Ok(true)` once the reader confirms the stop, `Ok(false)` if
    /// no confirmation arrived across all attempts. The first attempt is
    /// often lost while the reader is mid-notification, hence the retries.
    pub fn stop_inventory(&self) -> Result<bool, ReaderError> {
        let was_running = self.inventory.running.swap(false, Ordering::SeqCst);
        if was_running {
            self.inventory.state.store(STATE_STOPPING, Ordering::SeqCst);
        }
        self.inventory.join_worker(self.config().join_timeout);

        let request = build_frame(Mid::StopInventory, &[], self.rs485_address(), false);
        let mut port = self.lock_transport()?;
        port.flush_input().map_err(Self::transport_err)?;

        let attempts = self.config().stop_attempts.max(1);
        let mut chunk = [0u8; READ_CHUNK];
        for attempt in 1..=attempts {
            port.write(&request).map_err(Self::transport_err)?;

            let deadline = Instant::now() + STOP_CONFIRM_WINDOW;
            let mut buffer: Vec<u8> = Vec::new();
            while Instant::now() < deadline {
                let n = port.read(&mut chunk, 50).map_err(Self::transport_err)?;
                if n == 0 {
                    continue;
                }
                buffer.extend_from_slice(&chunk[..n]);
                let (frames, consumed) = extract_valid_frames(&buffer);
                buffer.drain(..consumed);
                if frames.iter().any(stop_confirmed) {
                    self.inventory.state.store(STATE_IDLE, Ordering::SeqCst);
                    debug!("stop confirmed on attempt {attempt}");
                    return Ok(true);
                }
            }
            debug!("stop attempt {attempt} of {attempts} unconfirmed");
            thread::sleep(self.config().stop_retry_delay);
        }

        warn!("reader never confirmed the stop command");
        Ok(false)
    }

    /// Confirm the reader is idle by probing with the stop command, then
    /// give the hardware a moment to settle. Used before configuration
    /// changes that the reader rejects while inventorying. Attempt count
    /// and delays come from [`ReaderConfig`](crate::ReaderConfig).
    pub fn is_idle(&self) -> bool {
        let attempts = self.config().idle_check_attempts.max(1);
        for attempt in 1..=attempts {
            match self.execute(Mid::StopInventory, &[]) {
                Ok(frame) if frame.payload.first() == Some(&0x00) => {
                    thread::sleep(self.config().idle_settle_delay);
                    return true;
                }
                Ok(frame) => debug!(
                    "idle check {attempt}/{attempts}: unexpected payload {:02X?}",
                    frame.payload
                ),
                Err(e) => debug!("idle check {attempt}/{attempts} failed: {e}"),
            }
            thread::sleep(self.config().idle_check_delay);
        }
        false
    }

    pub fn inventory_state(&self) -> InventoryState {
        InventoryState::from_u8(self.inventory.state.load(Ordering::SeqCst))
    }

    pub fn is_inventory_running(&self) -> bool {
        self.inventory.running.load(Ordering::SeqCst)
    }
}

fn stop_confirmed(frame: &Frame) -> bool {
    if frame.answers(Mid::StopInventory) {
        return frame.payload.first() == Some(&0x00);
    }
    frame.is_read_end()
        && frame.payload.first().map(|&c| EndReason::from_code(c))
            == Some(EndReason::StoppedByCommand)
}

fn worker_loop<T: RfidTransport>(
    transport: Arc<Mutex<T>>,
    running: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    events: SyncSender<InventoryEvent>,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    while running.load(Ordering::SeqCst) {
        // Lock per read so stop and configuration commands can interleave.
        let n = {
            let mut port = match transport.lock() {
                Ok(port) => port,
                Err(_) => {
                    error!("inventory worker: transport mutex poisoned");
                    break;
                }
            };
            match port.read(&mut chunk, 100) {
                Ok(n) => n,
                Err(e) => {
                    error!("inventory worker: transport read failed: {:?}", e);
                    state.store(STATE_IDLE, Ordering::SeqCst);
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        };
        if n == 0 {
            continue;
        }

        buffer.extend_from_slice(&chunk[..n]);
        let (frames, consumed) = extract_valid_frames(&buffer);
        buffer.drain(..consumed);

        for frame in frames {
            if frame.is_tag_notification() {
                match TagRecord::parse(&frame.payload) {
                    Ok(tag) => match events.try_send(InventoryEvent::Tag(tag)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("tag event queue full, dropping a detection")
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            error!("inventory worker: event consumer gone");
                            state.store(STATE_IDLE, Ordering::SeqCst);
                            running.store(false, Ordering::SeqCst);
                            return;
                        }
                    },
                    Err(e) => warn!("skipping malformed tag frame: {e}"),
                }
            } else if frame.is_read_end() {
                let reason = EndReason::from_code(frame.payload.first().copied().unwrap_or(0));
                debug!("inventory ended: {:?}", reason);
                state.store(STATE_IDLE, Ordering::SeqCst);
                running.store(false, Ordering::SeqCst);
                let _ = events.send(InventoryEvent::End(reason));
                return;
            }
        }
    }

    state.store(STATE_IDLE, Ordering::SeqCst);
}
