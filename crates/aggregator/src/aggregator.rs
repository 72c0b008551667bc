// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The aggregation cycle.
//!
//! Every cycle produces (at most) one output block covering
//! `[offset, offset + blocksize)` in output frames:
//!
//! 1. Resolve the block size, carrying the fractional remainder of the
//!    configured duration from block to block so the long-run average is exact.
//! 2. For every pad, make sure the queue head has been converted and
//!    classified (discontinuity detection and resync), and drop whatever lags
//!    behind the current offset.
//! 3. Mix every pad whose data starts inside the window into the block.
//! 4. Push the block once every active pad has covered the window (or on a
//!    live timeout) and advance the offset.
//!
//! Any drop during step 2 aborts the cycle with [`CycleOutcome::NeedData`] so
//! that no pad's stale state ends up in an emitted block.
//!
//! Locking: the stream lock serializes whole cycles against renegotiation and
//! flushes; the object lock guards the timeline (offset, segment, block-size
//! accounting) against concurrent queries. Pad state locks nest inside both.

use crate::config::{AggregatorConfig, DurationFraction, PadConfig};
use crate::downstream::Downstream;
use crate::driver::DriverCommand;
use crate::mixer::SampleMixer;
use crate::pad::{lock, InputPad, NextSample, OutputTimeline, PadLink, PadState, QosBatch};
use crate::producer::Producer;
use crate::registry::AggregatorRegistry;
use mixkit_core::{
    AudioBuffer, AudioFormat, BufferFlags, ClockTime, MixKitError, PooledBytes, QosObserver, Segment,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error, info, trace, warn};

/// Result of one [`Aggregator::aggregate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A block of `frames` frames was pushed downstream.
    Pushed { frames: u64 },
    /// Not enough input to complete the block; call again once more data arrived.
    NeedData,
    /// Every active pad is EOS and nothing is left to output.
    Eos,
}

/// Unit for [`Aggregator::position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionFormat {
    /// Stream time in nanoseconds.
    Time,
    /// Output bytes.
    Bytes,
    /// Output frames.
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    pub live: bool,
    pub min: ClockTime,
    pub max: ClockTime,
}

struct OutputBlock {
    data: PooledBytes,
    blocksize: u64,
    gap: bool,
}

#[derive(Default)]
struct StreamState {
    current: Option<OutputBlock>,
}

struct ObjectState {
    format: Option<AudioFormat>,
    mixer: Option<SampleMixer>,
    segment: Segment,
    /// Output frames since segment start; `None` until resolved.
    offset: Option<u64>,
    samples_per_buffer: u64,
    error_per_buffer: u64,
    accumulated_error: u64,
    duration: DurationFraction,
    alignment_threshold: ClockTime,
    discont_wait: ClockTime,
    latency: ClockTime,
    /// Bumped whenever the timeline is reset under a cycle's feet.
    epoch: u64,
}

impl ObjectState {
    fn update_samples_per_buffer(&mut self, format: &AudioFormat) -> Result<(), MixKitError> {
        let total = u128::from(format.sample_rate) * u128::from(self.duration.numerator);
        let denom = u128::from(self.duration.denominator.max(1));

        let samples_per_buffer = u64::try_from(total / denom).map_err(|_| {
            MixKitError::Configuration("output buffer duration is too long".to_string())
        })?;
        if samples_per_buffer == 0 {
            return Err(MixKitError::NotNegotiated(format!(
                "output buffer duration {}/{} is shorter than one sample at {} Hz",
                self.duration.numerator, self.duration.denominator, format.sample_rate
            )));
        }

        self.samples_per_buffer = samples_per_buffer;
        self.error_per_buffer = u64::try_from(total % denom).unwrap_or(0);
        self.accumulated_error = 0;
        debug!(
            samples_per_buffer,
            error = self.error_per_buffer,
            denominator = self.duration.denominator,
            "Samples per buffer updated"
        );
        Ok(())
    }

    /// Size of the next block, including the extra frame once the remainder adds up to one.
    fn upcoming_blocksize(&self) -> u64 {
        let denom = u128::from(self.duration.denominator.max(1));
        let error = u128::from(self.error_per_buffer) + u128::from(self.accumulated_error);
        self.samples_per_buffer + u64::from(error >= denom)
    }

    fn next_blocksize(&mut self) -> u64 {
        let blocksize = self.upcoming_blocksize();
        let denom = u128::from(self.duration.denominator.max(1));
        let error = u128::from(self.error_per_buffer) + u128::from(self.accumulated_error);
        // The remainder is below the u64 denominator.
        self.accumulated_error = u64::try_from(error % denom).unwrap_or(0);
        blocksize
    }

    fn reset_timeline(&mut self) {
        self.segment.position = None;
        self.offset = None;
        self.accumulated_error = 0;
        self.epoch += 1;
    }
}

enum PadPass {
    /// No queued data.
    Empty,
    /// The head was rejected and dropped.
    Dropped,
    /// A classified working buffer is available.
    Ready,
}

/// Mixes any number of input pads into one sample-accurate output stream.
pub struct Aggregator {
    config: AggregatorConfig,
    registry: AggregatorRegistry,
    downstream: Arc<dyn Downstream>,
    stream: Mutex<StreamState>,
    object: Mutex<ObjectState>,
    pads: RwLock<Vec<Arc<InputPad>>>,
    link: Arc<PadLink>,
    next_pad_index: AtomicUsize,
    qos_observer: RwLock<Option<Arc<dyn QosObserver>>>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("pads", &self.pads().len())
            .field("output_format", &self.output_format())
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// # Errors
    ///
    /// Returns `MixKitError::Configuration` when the config does not validate.
    pub fn new(
        config: AggregatorConfig,
        registry: AggregatorRegistry,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self, MixKitError> {
        config.validate()?;
        let object = ObjectState {
            format: None,
            mixer: None,
            segment: Segment::default(),
            offset: None,
            samples_per_buffer: 0,
            error_per_buffer: 0,
            accumulated_error: 0,
            duration: config.output_buffer_duration.reduced(),
            alignment_threshold: config.alignment_threshold(),
            discont_wait: config.discont_wait(),
            latency: ClockTime(config.latency_ns),
            epoch: 0,
        };
        Ok(Self {
            link: Arc::new(PadLink::new(config.ignore_inactive_pads)),
            config,
            registry,
            downstream,
            stream: Mutex::new(StreamState::default()),
            object: Mutex::new(object),
            pads: RwLock::new(Vec::new()),
            next_pad_index: AtomicUsize::new(0),
            qos_observer: RwLock::new(None),
        })
    }

    pub const fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub(crate) const fn link(&self) -> &Arc<PadLink> {
        &self.link
    }

    pub(crate) fn signal_end_of_stream(&self) {
        self.downstream.end_of_stream();
    }

    // --- pads -------------------------------------------------------------

    /// Attaches a new input pad. Without a name, `sink_N` is used.
    ///
    /// # Errors
    ///
    /// Returns `MixKitError::Configuration` for an invalid pad config or a duplicate name.
    pub fn request_pad(
        &self,
        name: Option<&str>,
        config: PadConfig,
    ) -> Result<Arc<InputPad>, MixKitError> {
        config.validate()?;
        let mut pads = self.pads.write().unwrap_or_else(PoisonError::into_inner);

        let name = match name {
            Some(name) => name.to_string(),
            None => loop {
                let candidate = format!("sink_{}", self.next_pad_index.fetch_add(1, Ordering::Relaxed));
                if !pads.iter().any(|p| p.name() == candidate) {
                    break candidate;
                }
            },
        };
        if pads.iter().any(|p| p.name() == name) {
            return Err(MixKitError::Configuration(format!("pad '{name}' already exists")));
        }

        let pad = Arc::new(InputPad::new(
            &name,
            config,
            self.config.pad_queue_capacity,
            Arc::clone(&self.link),
        ));
        pads.push(Arc::clone(&pad));
        drop(pads);

        info!(pad = %name, "Pad added");
        self.link.notify(DriverCommand::Wake);
        Ok(pad)
    }

    /// Detaches a pad. Producers blocked on it are released with `FlowError::Flushing`.
    pub fn remove_pad(&self, name: &str) -> Option<Arc<InputPad>> {
        let mut pads = self.pads.write().unwrap_or_else(PoisonError::into_inner);
        let index = pads.iter().position(|p| p.name() == name)?;
        let pad = pads.remove(index);
        drop(pads);

        pad.flush_start();
        info!(pad = %name, "Pad removed");
        self.link.notify(DriverCommand::Wake);
        Some(pad)
    }

    pub fn pads(&self) -> Vec<Arc<InputPad>> {
        self.pads.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn pad(&self, name: &str) -> Option<Arc<InputPad>> {
        self.pads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    // --- configuration ----------------------------------------------------

    /// # Errors
    ///
    /// Returns `MixKitError::Configuration` for a zero numerator or denominator.
    pub fn set_output_buffer_duration(&self, duration: DurationFraction) -> Result<(), MixKitError> {
        duration.validate()?;
        let mut obj = lock(&self.object);
        obj.duration = duration.reduced();
        obj.samples_per_buffer = 0;
        debug!(numerator = obj.duration.numerator, denominator = obj.duration.denominator, "Output buffer duration changed");
        Ok(())
    }

    pub fn output_buffer_duration(&self) -> DurationFraction {
        lock(&self.object).duration
    }

    pub fn set_alignment_threshold(&self, threshold: ClockTime) {
        lock(&self.object).alignment_threshold = threshold;
    }

    pub fn set_discont_wait(&self, wait: ClockTime) {
        lock(&self.object).discont_wait = wait;
    }

    pub fn set_ignore_inactive_pads(&self, ignore: bool) {
        self.link.set_ignore_inactive(ignore);
        self.link.notify(DriverCommand::Wake);
    }

    pub fn set_qos_observer(&self, observer: Option<Arc<dyn QosObserver>>) {
        *self.qos_observer.write().unwrap_or_else(PoisonError::into_inner) = observer;
    }

    // --- negotiation and lifecycle ------------------------------------------

    /// Installs a new output format between cycles.
    ///
    /// A rate change invalidates the output offset and discards the block in
    /// flight; otherwise the block in flight and every pad's pending buffer are
    /// converted to the new layout. Pad converters are rebuilt on next use.
    ///
    /// # Errors
    ///
    /// Returns `MixKitError::NotNegotiated` for an invalid format.
    pub fn set_output_format(&self, format: AudioFormat) -> Result<(), MixKitError> {
        if !format.is_valid() {
            return Err(MixKitError::NotNegotiated(format!("invalid output format {format}")));
        }

        let mut stream = lock(&self.stream);
        let mut obj = lock(&self.object);
        let old = obj.format;
        if old == Some(format) {
            return Ok(());
        }
        info!(%format, "Output format negotiated");

        let rate_changed = old.is_some_and(|old| old.sample_rate != format.sample_rate);
        if let Some(old) = old {
            if rate_changed {
                obj.offset = None;
                obj.epoch += 1;
                stream.current = None;
            } else {
                stream.current =
                    stream.current.take().and_then(|block| self.convert_block(block, &old, &format));
            }
        }

        obj.format = Some(format);
        obj.mixer = Some(SampleMixer::for_format(format.sample_format));
        obj.samples_per_buffer = 0;

        for pad in self.pads() {
            let mut state = lock(&pad.state);
            state.invalidate_converter();
            if rate_changed {
                // Offsets counted in the old rate are meaningless now.
                state.output_offset = None;
                state.next_offset = None;
            }
            let Some(old) = old else {
                continue;
            };
            let Some(pending) = state.buffer.take() else {
                continue;
            };
            let converted = self
                .registry
                .create_converter(&old, &format, None)
                .and_then(|mut converter| converter.convert(&pending));
            match converted {
                Ok(converted) => state.buffer = Some(converted),
                Err(e) => {
                    warn!(
                        pad = %pad.name(),
                        error = %e,
                        "Could not convert pending buffer to the new output format, dropping it"
                    );
                    state.position = 0;
                    state.size = 0;
                    pad.drop_head();
                },
            }
        }
        drop(obj);
        drop(stream);

        self.link.notify(DriverCommand::Renegotiated);
        Ok(())
    }

    fn convert_block(&self, block: OutputBlock, old: &AudioFormat, new: &AudioFormat) -> Option<OutputBlock> {
        let OutputBlock { data, blocksize, gap } = block;
        let input = AudioBuffer::new(data.freeze());
        match self.registry.create_converter(old, new, None).and_then(|mut c| c.convert(&input)) {
            Ok(converted) => Some(OutputBlock {
                data: PooledBytes::detached(converted.data.to_vec()),
                blocksize,
                gap,
            }),
            Err(e) => {
                warn!(error = %e, "Could not convert the block in flight, discarding it");
                None
            },
        }
    }

    pub fn output_format(&self) -> Option<AudioFormat> {
        lock(&self.object).format
    }

    /// Resets the timeline and applies the configured output format, if any.
    ///
    /// # Errors
    ///
    /// Returns `MixKitError::NotNegotiated` when the configured output format is invalid.
    pub fn start(&self) -> Result<(), MixKitError> {
        self.reset();
        if let Some(format) = self.config.output_format {
            self.set_output_format(format)?;
        }
        info!("Aggregator started");
        Ok(())
    }

    /// Drops all queued data and forgets the output format.
    pub fn stop(&self) {
        let pads = self.pads();
        for pad in &pads {
            pad.flush_start();
        }
        self.reset();
        for pad in &pads {
            lock(&pad.state).reset();
            pad.flush_stop();
        }
        info!("Aggregator stopped");
    }

    fn reset(&self) {
        let mut stream = lock(&self.stream);
        let mut obj = lock(&self.object);
        obj.reset_timeline();
        obj.format = None;
        obj.mixer = None;
        obj.samples_per_buffer = 0;
        stream.current = None;
    }

    /// Discards queued and in-flight data, keeping the output format.
    ///
    /// Producers blocked on a full pad are released with `FlowError::Flushing`.
    pub fn flush(&self) {
        self.flush_with_segment(None);
    }

    fn flush_with_segment(&self, segment: Option<Segment>) {
        let pads = self.pads();
        for pad in &pads {
            pad.flush_start();
        }
        {
            let mut stream = lock(&self.stream);
            let mut obj = lock(&self.object);
            if let Some(segment) = segment {
                self.link.set_output_rate(segment.rate);
                obj.segment = segment;
            }
            obj.reset_timeline();
            stream.current = None;
            for pad in &pads {
                lock(&pad.state).reset();
            }
        }
        for pad in &pads {
            pad.flush_stop();
        }
        debug!("Flushed");
        self.link.notify(DriverCommand::Wake);
    }

    /// Flushes and installs a new output segment.
    ///
    /// # Errors
    ///
    /// - `MixKitError::Unsupported` for a negative rate
    /// - `MixKitError::Configuration` for a zero rate or inverted bounds
    pub fn set_output_segment(&self, segment: Segment) -> Result<(), MixKitError> {
        segment.validate()?;
        let segment = Segment { position: None, ..segment };
        info!(rate = segment.rate, start = %segment.start, stop = ?segment.stop, "Output segment");
        self.flush_with_segment(Some(segment));
        Ok(())
    }

    /// Flushing seek. `None` keeps the current start or stop.
    ///
    /// # Errors
    ///
    /// See [`Aggregator::set_output_segment`].
    pub fn seek(
        &self,
        rate: f64,
        start: Option<ClockTime>,
        stop: Option<ClockTime>,
    ) -> Result<(), MixKitError> {
        let current = self.segment();
        let segment = Segment::new(rate, start.unwrap_or(current.start), stop.or(current.stop))?;
        self.set_output_segment(segment)
    }

    pub fn segment(&self) -> Segment {
        lock(&self.object).segment.clone()
    }

    // --- the cycle --------------------------------------------------------

    /// Runs one aggregation cycle.
    ///
    /// `timeout` marks a cycle triggered by a live deadline rather than by
    /// data: pads without data then simply contribute nothing.
    ///
    /// # Errors
    ///
    /// - `MixKitError::NotNegotiated` when no output format is known on a
    ///   data-driven cycle, a pad carries data without a valid format, or a
    ///   converter cannot be built
    /// - `MixKitError::Flow` with the downstream error when the push fails
    pub fn aggregate(&self, timeout: bool) -> Result<CycleOutcome, MixKitError> {
        let mut stream = lock(&self.stream);
        let mut obj = lock(&self.object);

        let position = obj.segment.position.unwrap_or(obj.segment.start);
        obj.segment.position = Some(position);

        let (Some(format), Some(mixer)) = (obj.format, obj.mixer) else {
            if timeout {
                debug!("Got timeout before an output format was negotiated, not producing output");
                obj.segment.position = Some(position + obj.duration.to_clock_time());
                return Ok(CycleOutcome::NeedData);
            }
            error!("Unknown data received, not negotiated");
            return Err(MixKitError::NotNegotiated("no output format negotiated".to_string()));
        };

        if obj.samples_per_buffer == 0 {
            obj.update_samples_per_buffer(&format).inspect_err(|e| {
                error!(error = %e, "Failed to calculate the number of samples per buffer");
            })?;
        }

        let rate = format.sample_rate;
        let bpf = format.bpf();
        let segment_start = obj.segment.start;
        let offset = match obj.offset {
            Some(offset) => offset,
            None => {
                let offset = (position - segment_start).to_frames(rate);
                debug!(offset, "Starting at offset");
                obj.offset = Some(offset);
                offset
            },
        };

        let blocksize = stream
            .current
            .get_or_insert_with(|| {
                let blocksize = obj.next_blocksize();
                #[allow(clippy::cast_possible_truncation)]
                let data = self.registry.allocator().allocate(blocksize as usize, &format);
                OutputBlock { data, blocksize, gap: true }
            })
            .blocksize;

        let mut next_offset = offset + blocksize;
        let mut next_timestamp = segment_start + ClockTime::from_frames(next_offset, rate);
        trace!(blocksize, offset, timestamp = %position, "Starting to mix");

        let pads = self.pads();
        let live = self.config.force_live || pads.iter().any(|p| p.is_live());
        let epoch = obj.epoch;
        let out = OutputTimeline {
            format,
            offset,
            segment: &obj.segment,
            alignment_threshold: obj.alignment_threshold,
            discont_wait: obj.discont_wait,
            live,
        };

        let mut qos = QosBatch::new();
        let mut dropped = false;
        let mut is_eos = !self.config.force_live;
        let mut is_done = true;

        for pad in &pads {
            if pad.is_inactive() {
                continue;
            }
            let pad_eos = pad.is_eos();
            if !pad_eos {
                is_eos = false;
            }

            let mut state = lock(&pad.state);
            match self.prepare_pad(pad, &mut state, &out, &mut dropped, &mut qos)? {
                PadPass::Empty => {
                    if timeout {
                        if let Some(output_offset) = state.output_offset.filter(|&o| o < next_offset) {
                            let missing = next_offset - output_offset;
                            debug!(
                                pad = %pad.name(),
                                missing,
                                duration = %ClockTime::from_frames(missing, rate),
                                "Timeout, missing frames"
                            );
                        }
                    } else if !pad_eos {
                        is_done = false;
                    }
                },
                PadPass::Dropped => {},
                PadPass::Ready => {
                    if state.catch_up(pad.name_arc(), &out, &mut qos) {
                        dropped = true;
                        drop(state);
                        pad.drop_head();
                    }
                },
            }
        }

        if let Some(block) = stream.current.as_mut() {
            for pad in &pads {
                if pad.is_inactive() {
                    continue;
                }
                let mut state = lock(&pad.state);
                let in_window = state.buffer.is_some()
                    && state.output_offset.is_some_and(|o| o >= offset && o < offset + blocksize);
                if !in_window {
                    continue;
                }

                trace!(pad = %pad.name(), "Mixing buffer for current offset");
                let keep = state.mix_into(
                    pad.name_arc(),
                    offset,
                    blocksize,
                    &mut block.data,
                    bpf,
                    mixer,
                    &mut block.gap,
                );
                if state.output_offset.is_some_and(|o| o >= next_offset) {
                    trace!(pad = %pad.name(), "Pad is at or after current offset");
                } else {
                    is_done = false;
                }
                if !keep {
                    drop(state);
                    pad.drop_head();
                }
            }
        }
        drop(obj);

        self.deliver_qos(qos);

        if dropped {
            trace!("A pad dropped a buffer, wait for the next one");
            return Ok(CycleOutcome::NeedData);
        }
        if !is_done && !is_eos {
            trace!("Not done yet for the current offset, waiting for more data");
            return Ok(CycleOutcome::NeedData);
        }

        if is_eos {
            let max_offset = pads
                .iter()
                .filter(|p| !p.is_inactive())
                .filter_map(|p| lock(&p.state).output_offset)
                .max()
                .unwrap_or(0);

            if max_offset <= offset {
                debug!("All pads are EOS");
                stream.current = None;
                return Ok(CycleOutcome::Eos);
            }
            if max_offset <= next_offset {
                debug!(max_offset, next_offset, "Last buffer is incomplete");
                next_offset = max_offset;
                next_timestamp = segment_start + ClockTime::from_frames(next_offset, rate);
                if let Some(block) = stream.current.as_mut() {
                    #[allow(clippy::cast_possible_truncation)]
                    block.data.truncate((next_offset - offset) as usize * bpf);
                }
            }
        }

        let Some(block) = stream.current.take() else {
            return Ok(CycleOutcome::NeedData);
        };
        let frames = next_offset - offset;
        let buffer = AudioBuffer {
            data: block.data.freeze(),
            pts: Some(position),
            duration: Some(next_timestamp - position),
            offset: Some(offset),
            offset_end: Some(next_offset),
            flags: BufferFlags { gap: block.gap, ..BufferFlags::default() },
        };
        drop(stream);

        trace!(timestamp = %position, offset, frames, gap = block.gap, "Pushing output buffer");
        self.downstream.push(buffer).map_err(|e| {
            debug!(error = %e, "Downstream refused output buffer");
            MixKitError::Flow(e)
        })?;

        let _stream = lock(&self.stream);
        let mut obj = lock(&self.object);
        if obj.epoch == epoch {
            obj.offset = Some(next_offset);
            obj.segment.position = Some(next_timestamp);

            // A timeout left gaps behind: resync lagging pads on their next buffer.
            if timeout {
                for pad in &pads {
                    let mut state = lock(&pad.state);
                    if state.output_offset.is_some_and(|o| o < next_offset) {
                        state.output_offset = None;
                    }
                }
            }
        }

        Ok(CycleOutcome::Pushed { frames })
    }

    /// Makes sure the pad's queue head is converted and classified, retrying once after a reject.
    fn prepare_pad(
        &self,
        pad: &InputPad,
        state: &mut PadState,
        out: &OutputTimeline<'_>,
        dropped: &mut bool,
        qos: &mut QosBatch,
    ) -> Result<PadPass, MixKitError> {
        let mut rejected = false;
        for _ in 0..2 {
            let Some(input) = pad.peek_with(state) else {
                return Ok(if rejected { PadPass::Dropped } else { PadPass::Empty });
            };
            if state.format.is_none() {
                error!(pad = %pad.name(), "Unknown data received, not negotiated");
                return Err(MixKitError::NotNegotiated(format!(
                    "pad '{}' has no valid format",
                    pad.name()
                )));
            }
            if state.buffer.is_some() {
                return Ok(PadPass::Ready);
            }

            let converted = state.convert(input, &out.format, &self.registry).map_err(|e| {
                error!(pad = %pad.name(), error = %e, "Failed to convert buffer");
                if e.is_not_negotiated() {
                    e
                } else {
                    MixKitError::NotNegotiated(e.to_string())
                }
            })?;
            state.buffer = Some(converted);

            if state.fill(pad.name_arc(), out, qos) {
                return Ok(PadPass::Ready);
            }
            state.buffer = None;
            pad.drop_head();
            *dropped = true;
            rejected = true;
        }
        Ok(PadPass::Dropped)
    }

    fn deliver_qos(&self, reports: QosBatch) {
        if reports.is_empty() {
            return;
        }
        let observer = self.qos_observer.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(observer) = observer {
            for report in reports {
                observer.on_qos(report);
            }
        }
    }

    // --- queries ----------------------------------------------------------

    /// Current output position; `None` when not known in the requested unit.
    pub fn position(&self, format: PositionFormat) -> Option<u64> {
        let obj = lock(&self.object);
        match format {
            PositionFormat::Time => obj
                .segment
                .position
                .and_then(|p| obj.segment.to_stream_time(p))
                .map(ClockTime::nseconds),
            PositionFormat::Bytes => {
                let bpf = obj.format?.bpf() as u64;
                obj.offset.map(|offset| offset * bpf)
            },
            PositionFormat::Default => obj.offset,
        }
    }

    /// Longest duration declared by any pad; unknown as soon as one pad's duration is unknown.
    pub fn duration(&self) -> Option<ClockTime> {
        let pads = self.pads();
        if pads.is_empty() {
            return None;
        }
        let mut max = ClockTime::ZERO;
        for pad in &pads {
            max = max.max(pad.duration()?);
        }
        Some(max)
    }

    pub fn latency(&self) -> Latency {
        let (duration, extra) = {
            let obj = lock(&self.object);
            (obj.duration.to_clock_time(), obj.latency)
        };
        let latency = duration + extra;
        Latency { live: self.is_live(), min: latency, max: latency }
    }

    /// Force-live, or any pad fed by a live producer.
    pub fn is_live(&self) -> bool {
        self.config.force_live || self.pads().iter().any(|p| p.is_live())
    }

    /// Output frames since segment start; `None` until the first cycle resolved it.
    pub fn offset(&self) -> Option<u64> {
        lock(&self.object).offset
    }

    /// Frame count of a regular block, once computed for the current format.
    pub fn samples_per_buffer(&self) -> Option<u64> {
        let spb = lock(&self.object).samples_per_buffer;
        (spb > 0).then_some(spb)
    }

    /// The pad's working buffer, if it starts inside the current output window.
    ///
    /// The window is the in-flight block, or the block the next cycle will produce.
    pub fn peek_next_sample(&self, pad: &InputPad) -> Option<NextSample> {
        let stream = lock(&self.stream);
        let obj = lock(&self.object);
        let offset = obj.offset?;
        let blocksize =
            stream.current.as_ref().map_or_else(|| obj.upcoming_blocksize(), |b| b.blocksize);
        let window_end = offset + blocksize;
        let state = lock(&pad.state);
        let buffer = state.buffer.as_ref()?;
        let output_offset = state.output_offset?;
        if output_offset < offset || output_offset >= window_end {
            return None;
        }
        Some(NextSample {
            buffer: buffer.clone(),
            format: state.format,
            segment: state.segment.clone(),
            output_offset,
            position: state.position,
            size: state.size,
        })
    }

    /// True when a data-driven cycle can make progress: every active pad is
    /// EOS or has queued data.
    pub fn pads_ready(&self) -> bool {
        let mut any = false;
        for pad in self.pads() {
            if pad.is_inactive() {
                continue;
            }
            any = true;
            if !pad.is_eos() && !pad.has_buffer() {
                return false;
            }
        }
        any
    }

    /// Running time by which the current block is due in live operation.
    pub fn next_deadline(&self) -> Option<ClockTime> {
        let obj = lock(&self.object);
        let position = obj.segment.position.unwrap_or(obj.segment.start);
        let block_end = position + obj.duration.to_clock_time();
        let running_time = obj
            .segment
            .to_running_time(block_end)
            .or_else(|| obj.segment.to_running_time(position))?;
        Some(running_time + obj.latency)
    }

    /// Samples dropped across all pads since their last segment or flush.
    pub fn dropped_frames(&self) -> u64 {
        self.pads().iter().map(|p| p.qos_counters().1).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_utils::{read_s16, s16_buffer, CollectingDownstream};
    use mixkit_core::{FlowError, QosCollector, SampleFormat};

    const FORMAT: AudioFormat = AudioFormat::new(48_000, 2, SampleFormat::S16Le);

    fn ms(v: u64) -> ClockTime {
        ClockTime::from_mseconds(v)
    }

    fn setup(config: AggregatorConfig) -> (Aggregator, Arc<CollectingDownstream>) {
        let downstream = Arc::new(CollectingDownstream::default());
        let agg = Aggregator::new(
            config,
            AggregatorRegistry::new(),
            Arc::clone(&downstream) as Arc<dyn Downstream>,
        )
        .unwrap();
        agg.start().unwrap();
        agg.set_output_format(FORMAT).unwrap();
        (agg, downstream)
    }

    fn stereo_pad(agg: &Aggregator) -> Arc<InputPad> {
        let pad = agg.request_pad(None, PadConfig::default()).unwrap();
        pad.set_format(FORMAT);
        pad
    }

    /// A 10 ms stereo buffer holding `value` in every sample.
    fn block(value: i16, pts_ms: u64) -> AudioBuffer {
        s16_buffer(&[value; 960]).with_pts(ms(pts_ms))
    }

    #[test]
    fn data_cycle_without_format_is_not_negotiated() {
        let downstream = Arc::new(CollectingDownstream::default());
        let agg =
            Aggregator::new(AggregatorConfig::default(), AggregatorRegistry::new(), downstream).unwrap();
        agg.start().unwrap();

        assert!(agg.aggregate(false).unwrap_err().is_not_negotiated());

        // A timeout only advances the position.
        assert_eq!(agg.aggregate(true).unwrap(), CycleOutcome::NeedData);
        assert_eq!(agg.position(PositionFormat::Time), Some(ms(10).nseconds()));
    }

    #[test]
    fn ten_millisecond_blocks_are_480_frames() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        let pad = stereo_pad(&agg);

        for i in 0..3 {
            pad.push(block(100, i * 10)).unwrap();
            assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
        }

        let pushed = downstream.take();
        assert_eq!(pushed.len(), 3);
        for (i, buffer) in pushed.iter().enumerate() {
            assert_eq!(buffer.len(), 480 * 4);
            assert_eq!(buffer.pts, Some(ms(i as u64 * 10)));
            assert_eq!(buffer.duration, Some(ms(10)));
            assert_eq!(buffer.offset, Some(i as u64 * 480));
            assert_eq!(buffer.offset_end, Some((i as u64 + 1) * 480));
            assert!(!buffer.flags.gap);
        }
        assert_eq!(agg.offset(), Some(1440));
        assert_eq!(agg.position(PositionFormat::Bytes), Some(1440 * 4));
    }

    #[test]
    fn waits_for_every_pad_before_pushing() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        let a = stereo_pad(&agg);
        let b = stereo_pad(&agg);

        a.push(block(100, 0)).unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::NeedData);
        assert!(!agg.pads_ready());

        // `a` was fully mixed into the pending block and needs its next buffer too.
        b.push(block(23, 0)).unwrap();
        assert!(!agg.pads_ready());
        a.push(block(100, 10)).unwrap();
        assert!(agg.pads_ready());
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

        let out = downstream.take();
        assert_eq!(out.len(), 1);
        assert!(read_s16(&out[0]).iter().all(|&s| s == 123));
    }

    #[test]
    fn timeout_emits_gap_block_without_data() {
        let (agg, downstream) =
            setup(AggregatorConfig { force_live: true, ..AggregatorConfig::default() });
        let _pad = stereo_pad(&agg);

        assert_eq!(agg.aggregate(true).unwrap(), CycleOutcome::Pushed { frames: 480 });
        let out = downstream.take();
        assert!(out[0].flags.gap);
        assert!(out[0].data.iter().all(|&b| b == 0));
    }

    #[test]
    fn muted_pad_keeps_gap_flag() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        let pad = stereo_pad(&agg);
        pad.set_mute(true);

        pad.push(block(100, 0)).unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
        assert!(downstream.take()[0].flags.gap);
    }

    #[test]
    fn eos_truncates_final_block() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        let pad = stereo_pad(&agg);

        pad.push(block(1, 0)).unwrap();
        // 100 frames only.
        pad.push(s16_buffer(&[2; 200]).with_pts(ms(10))).unwrap();
        pad.end_of_stream();

        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
        // The short buffer is mixed before the pad turns EOS.
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::NeedData);
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 100 });
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Eos);

        let out = downstream.take();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].len(), 100 * 4);
        assert_eq!(out[1].offset_end, Some(580));
        assert_eq!(out[1].duration, Some(ClockTime::from_frames(580, 48_000) - ms(10)));
    }

    #[test]
    fn eos_without_data_emits_nothing() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        let pad = stereo_pad(&agg);
        pad.end_of_stream();

        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Eos);
        assert!(downstream.take().is_empty());
        assert!(!downstream.saw_eos());

        agg.signal_end_of_stream();
        assert!(downstream.saw_eos());
    }

    #[test]
    fn pad_without_format_fails_the_cycle() {
        let (agg, _downstream) = setup(AggregatorConfig::default());
        let pad = agg.request_pad(None, PadConfig::default()).unwrap();
        pad.push(block(1, 0)).unwrap();
        assert!(agg.aggregate(false).unwrap_err().is_not_negotiated());
    }

    #[test]
    fn downstream_errors_propagate_without_advancing() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        let pad = stereo_pad(&agg);
        downstream.fail_with(FlowError::NotLinked);

        pad.push(block(1, 0)).unwrap();
        let err = agg.aggregate(false).unwrap_err();
        assert!(matches!(err, MixKitError::Flow(FlowError::NotLinked)));
        assert_eq!(agg.offset(), Some(0));
    }

    #[test]
    fn late_buffer_is_dropped_and_reported() {
        let (agg, _downstream) = setup(AggregatorConfig::default());
        let collector = Arc::new(QosCollector::new());
        agg.set_qos_observer(Some(Arc::clone(&collector) as Arc<dyn QosObserver>));
        let pad = agg
            .request_pad(None, PadConfig { qos_messages: true, ..PadConfig::default() })
            .unwrap();
        pad.set_format(FORMAT);

        pad.push(block(1, 0)).unwrap();
        pad.push(block(1, 10)).unwrap();
        agg.aggregate(false).unwrap();
        agg.aggregate(false).unwrap();

        // Jumps back to a region that was already output.
        pad.push(block(1, 5).with_flags(BufferFlags { discont: true, ..BufferFlags::default() }))
            .unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::NeedData);

        let reports = collector.take();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].dropped, 480);
        assert_eq!(reports[0].timestamp, Some(ms(5)));
        assert_eq!(agg.dropped_frames(), 480);
        assert!(!pad.has_buffer());
    }

    #[test]
    fn queries_follow_the_timeline() {
        let (agg, _downstream) = setup(AggregatorConfig::default());
        let a = stereo_pad(&agg);
        let b = stereo_pad(&agg);

        assert_eq!(agg.duration(), None);
        a.set_duration(Some(ms(500)));
        b.set_duration(Some(ms(800)));
        assert_eq!(agg.duration(), Some(ms(800)));

        let latency = agg.latency();
        assert!(!latency.live);
        assert_eq!(latency.min, ms(10));
        assert_eq!(agg.position(PositionFormat::Default), None);

        // 20 ms on `a`, two 10 ms buffers on `b`.
        a.push(s16_buffer(&[4; 1920]).with_pts(ms(0))).unwrap();
        b.push(block(0, 0)).unwrap();
        b.push(block(0, 10)).unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
        assert_eq!(agg.samples_per_buffer(), Some(480));
        assert_eq!(agg.position(PositionFormat::Default), Some(480));
        assert_eq!(agg.position(PositionFormat::Time), Some(ms(10).nseconds()));
        assert_eq!(agg.next_deadline(), Some(ms(20)));

        let next = agg.peek_next_sample(&a).expect("second half of a lands in the next window");
        assert_eq!(next.output_offset, 480);
        assert_eq!(next.position, 480);
        assert_eq!(next.size, 960);
        assert!(agg.peek_next_sample(&b).is_none());
    }

    #[test]
    fn block_sizes_carry_the_fractional_remainder() {
        let (agg, downstream) =
            setup(AggregatorConfig { force_live: true, ..AggregatorConfig::default() });
        agg.set_output_buffer_duration(DurationFraction::new(1, 7)).unwrap();

        for _ in 0..14 {
            agg.aggregate(true).unwrap();
        }
        let sizes: Vec<u64> = downstream
            .take()
            .iter()
            .map(|b| b.offset_end.unwrap() - b.offset.unwrap())
            .collect();
        let mut expected = vec![6857; 6];
        expected.push(6858);
        expected.extend(expected.clone());
        assert_eq!(sizes, expected);
        assert_eq!(agg.offset(), Some(96_000));
    }

    #[test]
    fn huge_denominator_remainder_does_not_overflow() {
        let (agg, downstream) =
            setup(AggregatorConfig { force_live: true, ..AggregatorConfig::default() });
        agg.set_output_buffer_duration(DurationFraction::new(u64::MAX - 1, u64::MAX)).unwrap();

        for _ in 0..3 {
            agg.aggregate(true).unwrap();
        }
        let sizes: Vec<u64> = downstream
            .take()
            .iter()
            .map(|b| b.offset_end.unwrap() - b.offset.unwrap())
            .collect();
        assert_eq!(sizes, vec![47_999, 48_000, 48_000]);
        assert_eq!(agg.offset(), Some(143_999));
    }

    #[test]
    fn peek_window_includes_the_extra_frame() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        // 1.5 frames per block: sizes alternate 1, 2.
        agg.set_output_buffer_duration(DurationFraction::new(1, 32_000)).unwrap();
        let pad = stereo_pad(&agg);
        pad.push(s16_buffer(&[5; 6]).with_pts(ClockTime::from_frames_ceil(2, 48_000))).unwrap();

        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 1 });
        assert!(downstream.take()[0].flags.gap);
        assert_eq!(agg.offset(), Some(1));
        assert_eq!(agg.samples_per_buffer(), Some(1));

        let next = agg.peek_next_sample(&pad).expect("buffer starts inside the two-frame block");
        assert_eq!(next.output_offset, 2);
        assert_eq!(next.size, 3);
    }

    #[test]
    fn block_shorter_than_a_sample_is_not_negotiated() {
        let (agg, _downstream) = setup(AggregatorConfig::default());
        agg.set_output_buffer_duration(DurationFraction::new(1, 96_000)).unwrap();
        assert!(agg.aggregate(true).unwrap_err().is_not_negotiated());
    }

    #[test]
    fn output_rate_change_discards_pending_block() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        let a = stereo_pad(&agg);
        let _b = stereo_pad(&agg);

        a.push(block(7, 0)).unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::NeedData);

        agg.set_output_format(AudioFormat::new(24_000, 2, SampleFormat::S16Le)).unwrap();
        assert_eq!(agg.offset(), None);
        assert_eq!(agg.samples_per_buffer(), None);
        assert!(downstream.take().is_empty());
    }

    #[test]
    fn layout_change_converts_pending_block() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        let a = stereo_pad(&agg);
        let b = stereo_pad(&agg);

        a.push(block(8_192, 0)).unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::NeedData);

        let f32_stereo = AudioFormat::new(48_000, 2, SampleFormat::F32);
        agg.set_output_format(f32_stereo).unwrap();
        a.push(block(8_192, 10)).unwrap();
        b.push(block(0, 0)).unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

        let out = downstream.take();
        assert_eq!(out[0].len(), 480 * 8);
        let first = f32::from_le_bytes([out[0].data[0], out[0].data[1], out[0].data[2], out[0].data[3]]);
        assert!((first - 0.25).abs() < 1e-6);
    }

    #[test]
    fn flush_resets_timeline_but_keeps_format() {
        let (agg, _downstream) = setup(AggregatorConfig::default());
        let pad = stereo_pad(&agg);
        pad.push(block(1, 0)).unwrap();
        agg.aggregate(false).unwrap();
        assert_eq!(agg.offset(), Some(480));

        pad.push(block(1, 10)).unwrap();
        agg.flush();
        assert_eq!(agg.offset(), None);
        assert_eq!(agg.output_format(), Some(FORMAT));
        assert!(!pad.has_buffer());
    }

    #[test]
    fn seek_installs_segment_and_rejects_reverse() {
        let (agg, _downstream) = setup(AggregatorConfig::default());
        assert!(matches!(agg.seek(-1.0, None, None), Err(MixKitError::Unsupported(_))));

        agg.seek(1.0, Some(ms(1000)), None).unwrap();
        let pad = stereo_pad(&agg);
        pad.set_segment(Segment::new(1.0, ms(1000), None).unwrap()).unwrap();
        pad.push(block(3, 1000)).unwrap();

        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
        assert_eq!(agg.position(PositionFormat::Time), Some(ms(1010).nseconds()));
        assert_eq!(agg.offset(), Some(480));
    }

    #[test]
    fn inactive_pads_are_ignored_when_configured() {
        let (agg, downstream) = setup(AggregatorConfig::default());
        let a = stereo_pad(&agg);
        let b = stereo_pad(&agg);
        b.set_active(false);

        a.push(block(5, 0)).unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::NeedData);

        a.push(block(5, 10)).unwrap();
        agg.set_ignore_inactive_pads(true);
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
        assert_eq!(downstream.take().len(), 1);
    }

    #[test]
    fn duplicate_pad_names_are_rejected() {
        let (agg, _downstream) = setup(AggregatorConfig::default());
        agg.request_pad(Some("mic"), PadConfig::default()).unwrap();
        assert!(agg.request_pad(Some("mic"), PadConfig::default()).is_err());
        assert!(agg.remove_pad("mic").is_some());
        assert!(agg.pad("mic").is_none());
    }
}
