// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Dedicated thread that repeatedly runs the aggregation cycle.
//!
//! Non-live aggregators cycle whenever every active pad has data or is EOS.
//! Live aggregators additionally cycle when the current block's deadline
//! (measured from the moment the driver started) expires, emitting whatever
//! data arrived in time. Stream format errors park the driver in the
//! `Failed` state until a renegotiation wakes it up.

use crate::aggregator::{Aggregator, CycleOutcome};
use mixkit_core::{
    state_helpers, AggregatorStateUpdate, AggregatorStatsTracker, AggregatorStatsUpdate, FlowError,
    MixKitError, StopReason,
};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on how long the driver sleeps without re-checking cancellation.
const IDLE_POLL: Duration = Duration::from_millis(50);

const COMMAND_CAPACITY: usize = 64;

/// Wake-ups sent to the driver thread by pads and the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCommand {
    /// Pad data, EOS or topology changed.
    Wake,
    /// A format changed. The driver reads the sticky flag on the pad link, this only wakes it.
    Renegotiated,
    Shutdown,
}

#[derive(Debug, Default)]
pub struct DriverOptions {
    /// Used for the thread name and in state and stats updates.
    pub name: String,
    pub state_tx: Option<mpsc::Sender<AggregatorStateUpdate>>,
    pub stats_tx: Option<mpsc::Sender<AggregatorStatsUpdate>>,
    /// Cancelling this token stops the driver with `StopReason::Shutdown`.
    pub cancellation_token: Option<CancellationToken>,
}

/// Handle to a running driver thread. Dropping it stops the thread.
pub struct AggregatorDriver {
    aggregator: Arc<Aggregator>,
    commands: SyncSender<DriverCommand>,
    cancellation_token: CancellationToken,
    thread: Option<JoinHandle<StopReason>>,
}

impl std::fmt::Debug for AggregatorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorDriver").field("finished", &self.is_finished()).finish_non_exhaustive()
    }
}

impl AggregatorDriver {
    /// Spawns the driver thread for `aggregator`.
    ///
    /// # Errors
    ///
    /// Returns `MixKitError::Runtime` when the thread cannot be spawned.
    pub fn spawn(aggregator: Arc<Aggregator>, options: DriverOptions) -> Result<Self, MixKitError> {
        let (commands, command_rx) = std::sync::mpsc::sync_channel(COMMAND_CAPACITY);
        let cancellation_token = options.cancellation_token.clone().unwrap_or_default();
        aggregator.link().set_waker(Some(commands.clone()));

        let name = if options.name.is_empty() { "mixer".to_string() } else { options.name.clone() };
        let mut driver = DriverLoop {
            aggregator: Arc::clone(&aggregator),
            commands: command_rx,
            cancellation_token: cancellation_token.clone(),
            stats: AggregatorStatsTracker::new(name.clone(), options.stats_tx),
            state_tx: options.state_tx,
            name: name.clone(),
            failed: false,
            degraded: false,
        };

        let thread = std::thread::Builder::new()
            .name(format!("mixkit-aggregator-{name}"))
            .spawn(move || driver.run())
            .map_err(|e| {
                aggregator.link().set_waker(None);
                MixKitError::Runtime(format!("Failed to spawn aggregator thread: {e}"))
            })?;

        Ok(Self { aggregator, commands, cancellation_token, thread: Some(thread) })
    }

    pub const fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the driver and waits for the thread to exit.
    pub fn shutdown(mut self) -> StopReason {
        self.request_stop();
        self.wait()
    }

    /// Waits for the driver to stop on its own (EOS, downstream error or cancellation).
    pub fn join(mut self) -> StopReason {
        self.wait()
    }

    fn request_stop(&self) {
        self.cancellation_token.cancel();
        // A full channel already guarantees a wake-up.
        let _ = self.commands.try_send(DriverCommand::Shutdown);
    }

    fn wait(&mut self) -> StopReason {
        let Some(thread) = self.thread.take() else {
            return StopReason::Shutdown;
        };
        thread.join().unwrap_or_else(|_| {
            error!("Aggregator thread panicked");
            StopReason::Unknown
        })
    }
}

impl Drop for AggregatorDriver {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.request_stop();
            self.wait();
        }
    }
}

struct DriverLoop {
    aggregator: Arc<Aggregator>,
    commands: Receiver<DriverCommand>,
    cancellation_token: CancellationToken,
    stats: AggregatorStatsTracker,
    state_tx: Option<mpsc::Sender<AggregatorStateUpdate>>,
    name: String,
    failed: bool,
    degraded: bool,
}

impl DriverLoop {
    fn run(&mut self) -> StopReason {
        self.emit(state_helpers::emit_initializing);
        info!(name = %self.name, "Aggregator driver started");
        self.emit(state_helpers::emit_running);

        let reason = self.drive();

        self.aggregator.link().set_waker(None);
        self.stats.set_dropped(self.aggregator.dropped_frames());
        self.stats.force_send();
        self.emit(|tx, name| state_helpers::emit_stopped(tx, name, reason));
        info!(name = %self.name, ?reason, "Aggregator driver stopped");
        reason
    }

    fn drive(&mut self) -> StopReason {
        let start = Instant::now();

        loop {
            if self.cancellation_token.is_cancelled() {
                return StopReason::Shutdown;
            }
            if self.aggregator.link().take_renegotiated() {
                self.renegotiated();
            }

            let deadline = if self.failed || !self.aggregator.is_live() {
                None
            } else {
                self.aggregator.next_deadline().map(|rt| start + Duration::from(rt))
            };
            let ready = !self.failed && self.aggregator.pads_ready();

            if ready {
                if let Some(reason) = self.drain_commands() {
                    return reason;
                }
            } else {
                let wait = deadline
                    .map_or(IDLE_POLL, |d| d.saturating_duration_since(Instant::now()).min(IDLE_POLL));
                match self.commands.recv_timeout(wait) {
                    Ok(DriverCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        return StopReason::Shutdown;
                    },
                    Ok(DriverCommand::Renegotiated | DriverCommand::Wake) => continue,
                    Err(RecvTimeoutError::Timeout) => {},
                }
            }

            if self.failed {
                continue;
            }
            let timeout = !ready && deadline.is_some_and(|d| Instant::now() >= d);
            if !timeout && !self.aggregator.pads_ready() {
                continue;
            }

            if let Some(reason) = self.cycle(timeout) {
                return reason;
            }
        }
    }

    fn drain_commands(&mut self) -> Option<StopReason> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                DriverCommand::Shutdown => return Some(StopReason::Shutdown),
                DriverCommand::Renegotiated | DriverCommand::Wake => {},
            }
        }
        None
    }

    fn renegotiated(&mut self) {
        if self.failed {
            info!(name = %self.name, "Format renegotiated, resuming");
            self.failed = false;
            self.emit(state_helpers::emit_running);
        }
    }

    fn cycle(&mut self, timeout: bool) -> Option<StopReason> {
        self.stats.cycle(timeout);
        let result = self.aggregator.aggregate(timeout);
        self.stats.set_dropped(self.aggregator.dropped_frames());

        let stop = match result {
            Ok(CycleOutcome::Pushed { frames }) => {
                self.stats.pushed(frames);
                if timeout {
                    if !self.degraded {
                        warn!(name = %self.name, "Inputs missed the output deadline, filling with silence");
                        self.degraded = true;
                        let reason = "inputs missed the output deadline";
                        self.emit(|tx, name| state_helpers::emit_degraded(tx, name, reason));
                    }
                } else if self.degraded {
                    self.degraded = false;
                    self.emit(state_helpers::emit_running);
                }
                None
            },
            Ok(CycleOutcome::NeedData) => {
                self.stats.need_data();
                None
            },
            Ok(CycleOutcome::Eos) => {
                info!(name = %self.name, "All inputs reached end of stream");
                self.aggregator.signal_end_of_stream();
                Some(StopReason::Completed)
            },
            Err(MixKitError::Flow(FlowError::Flushing)) => {
                debug!(name = %self.name, "Downstream is flushing");
                None
            },
            Err(MixKitError::Flow(e)) => {
                warn!(name = %self.name, error = %e, "Downstream refused output, stopping");
                Some(StopReason::OutputClosed)
            },
            Err(e) => {
                if e.is_not_negotiated() {
                    self.stats.not_negotiated();
                }
                error!(name = %self.name, error = %e, "Aggregation failed, waiting for renegotiation");
                self.failed = true;
                self.emit(|tx, name| state_helpers::emit_failed(tx, name, e.to_string()));
                None
            },
        };

        self.stats.maybe_send();
        stop
    }

    fn emit(&self, emit: impl FnOnce(&mpsc::Sender<AggregatorStateUpdate>, &str)) {
        if let Some(state_tx) = &self.state_tx {
            emit(state_tx, &self.name);
        }
    }
}
