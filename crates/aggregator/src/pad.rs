// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Input pads: producer intake and per-buffer offset bookkeeping.
//!
//! Producers push buffers, format changes and segments into a bounded FIFO.
//! Format and segment changes are serialized with the data: they take effect
//! on the aggregation side only once every buffer queued before them has been
//! consumed. The aggregation cycle works on the head of the queue through
//! [`PadState`], which tracks where the unconsumed part of the current buffer
//! lands in the output timeline.

use crate::config::PadConfig;
use crate::converter::FormatConverter;
use crate::driver::DriverCommand;
use crate::mixer::{Gain, SampleMixer};
use crate::producer::Producer;
use crate::registry::AggregatorRegistry;
use mixkit_core::{AudioBuffer, AudioFormat, ClockTime, FlowError, MixKitError, QosReport, Segment};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// QoS reports collected during one cycle; almost always empty.
pub(crate) type QosBatch = SmallVec<[QosReport; 4]>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between an aggregator and its pads.
#[derive(Debug)]
pub(crate) struct PadLink {
    waker: Mutex<Option<SyncSender<DriverCommand>>>,
    output_rate: Mutex<f64>,
    ignore_inactive: AtomicBool,
    /// Set by every format change until the driver consumes it.
    renegotiated: AtomicBool,
}

impl PadLink {
    pub(crate) fn new(ignore_inactive: bool) -> Self {
        Self {
            waker: Mutex::new(None),
            output_rate: Mutex::new(1.0),
            ignore_inactive: AtomicBool::new(ignore_inactive),
            renegotiated: AtomicBool::new(false),
        }
    }

    pub(crate) fn notify(&self, command: DriverCommand) {
        if command == DriverCommand::Renegotiated {
            self.renegotiated.store(true, Ordering::Release);
        }
        if let Some(tx) = lock(&self.waker).as_ref() {
            // A full channel already holds a pending wake-up; the renegotiation flag is sticky.
            let _ = tx.try_send(command);
        }
    }

    /// Returns whether a format changed since the last call.
    pub(crate) fn take_renegotiated(&self) -> bool {
        self.renegotiated.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_waker(&self, waker: Option<SyncSender<DriverCommand>>) {
        *lock(&self.waker) = waker;
    }

    pub(crate) fn output_rate(&self) -> f64 {
        *lock(&self.output_rate)
    }

    pub(crate) fn set_output_rate(&self, rate: f64) {
        *lock(&self.output_rate) = rate;
    }

    pub(crate) fn ignore_inactive(&self) -> bool {
        self.ignore_inactive.load(Ordering::Acquire)
    }

    pub(crate) fn set_ignore_inactive(&self, ignore: bool) {
        self.ignore_inactive.store(ignore, Ordering::Release);
    }
}

enum PadItem {
    Buffer(AudioBuffer),
    Format(Option<AudioFormat>),
    Segment(Segment),
}

struct PadQueue {
    items: VecDeque<PadItem>,
    buffers: usize,
    capacity: usize,
    eos: bool,
    flushing: bool,
    /// Bumped by every flush so producers blocked across a whole flush still notice it.
    flush_seqnum: u64,
    inactive: bool,
    /// Latest format and segment pushed, used to clip incoming buffers.
    format: Option<AudioFormat>,
    segment: Segment,
    duration: Option<ClockTime>,
}

impl PadQueue {
    fn has_buffer(&self) -> bool {
        self.buffers > 0
    }
}

/// Output-side values a pad needs to place its data.
pub(crate) struct OutputTimeline<'a> {
    pub format: AudioFormat,
    /// Current aggregator offset in output frames.
    pub offset: u64,
    pub segment: &'a Segment,
    pub alignment_threshold: ClockTime,
    pub discont_wait: ClockTime,
    pub live: bool,
}

/// Aggregation-side state of one pad. Guarded by the pad's state lock.
pub(crate) struct PadState {
    /// Declared input format; `None` when unknown or invalid.
    pub format: Option<AudioFormat>,
    pub segment: Segment,
    pub config: PadConfig,
    converter: Option<Box<dyn FormatConverter>>,
    converter_dirty: bool,
    /// Working buffer (the converted queue head).
    pub buffer: Option<AudioBuffer>,
    /// Frames already consumed from `buffer`.
    pub position: u64,
    /// Frames in `buffer`.
    pub size: u64,
    /// Output offset the unconsumed part of `buffer` lands at.
    pub output_offset: Option<u64>,
    /// Expected pad-relative offset of the next buffer.
    pub next_offset: Option<u64>,
    pub discont_time: Option<ClockTime>,
    pub new_segment: bool,
    pub processed: u64,
    pub dropped: u64,
}

impl PadState {
    fn new(config: PadConfig) -> Self {
        Self {
            format: None,
            segment: Segment::default(),
            config,
            converter: None,
            converter_dirty: true,
            buffer: None,
            position: 0,
            size: 0,
            output_offset: None,
            next_offset: None,
            discont_time: None,
            new_segment: false,
            processed: 0,
            dropped: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.position = 0;
        self.size = 0;
        self.output_offset = None;
        self.next_offset = None;
        self.discont_time = None;
        self.buffer = None;
        self.reset_qos();
    }

    const fn reset_qos(&mut self) {
        self.processed = 0;
        self.dropped = 0;
    }

    pub(crate) const fn invalidate_converter(&mut self) {
        self.converter_dirty = true;
    }

    /// Converts a freshly peeked buffer to the output format, rebuilding the converter if needed.
    pub(crate) fn convert(
        &mut self,
        input: AudioBuffer,
        out_format: &AudioFormat,
        registry: &AggregatorRegistry,
    ) -> Result<AudioBuffer, MixKitError> {
        if self.converter_dirty {
            self.converter = None;
            let Some(in_format) = self.format else {
                return Err(MixKitError::NotNegotiated("pad received data without a format".into()));
            };
            let converter =
                registry.create_converter(&in_format, out_format, self.config.converter.as_ref())?;
            self.converter_dirty = false;
            if !converter.is_passthrough() {
                self.converter = Some(converter);
            }
        }

        match self.converter.as_mut() {
            Some(converter) => converter.convert(&input),
            None => Ok(input),
        }
    }

    /// Classifies the working buffer against the output timeline.
    ///
    /// Returns `false` when the buffer must be dropped (malformed, outside the
    /// output segment, or entirely before the current output offset).
    pub(crate) fn fill(
        &mut self,
        pad: &Arc<str>,
        out: &OutputTimeline<'_>,
        qos: &mut QosBatch,
    ) -> bool {
        let Some(buffer) = self.buffer.as_ref() else {
            return false;
        };
        let rate = out.format.sample_rate;
        let frames = buffer.frames(out.format.bpf()) as u64;
        let (pts, duration, flags) = (buffer.pts, buffer.duration, buffer.flags);

        self.position = 0;
        self.size = frames;

        if self.size == 0 {
            match duration {
                Some(duration) if flags.gap => self.size = duration.to_frames(rate),
                _ => {
                    warn!(
                        pad = %pad,
                        "Dropping 0-sized buffer missing either a duration or a gap flag"
                    );
                    return false;
                },
            }
        }

        let Some(start_time) = pts else {
            if self.output_offset.is_none() {
                self.output_offset = Some(out.offset);
            }
            self.next_offset = Some(self.next_offset.map_or(self.size, |next| next + self.size));
            trace!(pad = %pad, output_offset = ?self.output_offset, "Queued timeless buffer");
            return true;
        };

        let end_time = start_time + ClockTime::from_frames_ceil(self.size, rate);
        let start_offset = (start_time - self.segment.start).to_frames(rate);
        let end_offset = start_offset + self.size;

        let mut discont = false;
        let forced = flags.discont || flags.resync || self.new_segment;
        match self.next_offset {
            Some(next) if !forced => {
                let diff = next.abs_diff(start_offset);
                let expected_time = self.segment.start + ClockTime::from_frames(next, rate);
                let max_sample_diff = out.alignment_threshold.to_frames(rate);

                if diff >= max_sample_diff {
                    if out.discont_wait > ClockTime::ZERO {
                        match self.discont_time {
                            None => {
                                if expected_time.abs_diff(start_time) >= out.discont_wait {
                                    discont = true;
                                } else {
                                    self.discont_time = Some(expected_time);
                                }
                            },
                            Some(discont_time) => {
                                if start_time.abs_diff(discont_time) >= out.discont_wait {
                                    discont = true;
                                    self.discont_time = None;
                                }
                            },
                        }
                    } else {
                        discont = true;
                    }
                } else if self.discont_time.is_some() {
                    // Back within the threshold.
                    self.discont_time = None;
                }
            },
            _ => {
                discont = true;
                self.new_segment = false;
            },
        }

        if discont {
            if let Some(next) = self.next_offset {
                debug!(pad = %pad, expected = next, got = start_offset, "Have discont");
            }
            self.next_offset = None;
        } else if let Some(next) = self.next_offset.as_mut() {
            *next += self.size;
        }

        if self.output_offset.is_none() || discont {
            let to_output = |time: ClockTime| {
                self.segment
                    .to_running_time(time)
                    .and_then(|rt| out.segment.position_from_running_time(rt))
                    .map(|position| (position - out.segment.start).to_frames(rate))
            };
            let mut start_output_offset = to_output(start_time);
            let end_output_offset = match (start_output_offset, to_output(end_time)) {
                (None, None) => {
                    self.position = 0;
                    self.size = 0;
                    debug!(pad = %pad, "Buffer outside output segment");
                    return false;
                },
                (_, Some(end)) => end,
                (Some(start), None) => start + self.size,
            };

            if end_output_offset < out.offset {
                self.dropped += self.size;
                let rt = self.enqueue_qos(pad, out, self.size, qos);
                debug!(
                    pad = %pad,
                    samples = self.size,
                    running_time = ?rt,
                    end_output_offset,
                    offset = out.offset,
                    "Dropped buffer entirely before current output offset"
                );
                self.position = 0;
                self.size = 0;
                return false;
            }

            let needs_trim = match start_output_offset {
                None => true,
                Some(start) => {
                    start < out.offset || self.output_offset.is_some_and(|current| start < current)
                },
            };
            if needs_trim {
                let diff = match start_output_offset {
                    None if end_output_offset < self.size => {
                        self.size - end_output_offset + out.offset
                    },
                    None => {
                        let start = end_output_offset - self.size;
                        start_output_offset = Some(start);
                        out.offset.saturating_sub(start)
                    },
                    Some(start) => match self.output_offset {
                        Some(current) if start < current => current - start,
                        _ => out.offset.saturating_sub(start),
                    },
                };

                self.dropped += diff.min(self.size);
                if diff != 0 {
                    let rt = self.enqueue_qos(pad, out, diff, qos);
                    debug!(
                        pad = %pad,
                        samples = diff,
                        running_time = ?rt,
                        "Dropped samples before current output offset"
                    );
                }

                self.position += diff;
                if let Some(start) = start_output_offset.as_mut() {
                    *start += diff;
                }
                if self.position >= self.size {
                    debug!(
                        pad = %pad,
                        end_output_offset,
                        offset = out.offset,
                        "Buffer before segment or current position"
                    );
                    self.position = 0;
                    self.size = 0;
                    return false;
                }
            }

            self.output_offset = Some(start_output_offset.unwrap_or(out.offset));
            if self.next_offset.is_none() {
                self.next_offset = Some(end_offset);
            }
            debug!(
                pad = %pad,
                output_offset = ?self.output_offset,
                offset = out.offset,
                "Buffer resynced"
            );
        }

        trace!(pad = %pad, output_offset = ?self.output_offset, "Queued new buffer");
        true
    }

    /// Skips frames that lie before the output offset.
    ///
    /// Returns `true` when the whole working buffer was consumed and dropped.
    pub(crate) fn catch_up(
        &mut self,
        pad: &Arc<str>,
        out: &OutputTimeline<'_>,
        qos: &mut QosBatch,
    ) -> bool {
        let Some(output_offset) = self.output_offset else {
            return false;
        };
        if self.buffer.is_none() || output_offset >= out.offset {
            return false;
        }

        let lag = out.offset - output_offset;
        let diff = lag.min(self.size - self.position);
        self.dropped += diff;
        if diff != 0 {
            let rt = self.enqueue_qos(pad, out, diff, qos);
            debug!(
                pad = %pad,
                samples = diff,
                running_time = ?rt,
                "Dropped samples because input buffer is before output offset"
            );
        }
        self.position += diff;
        self.output_offset = Some(output_offset + diff);

        if self.position == self.size {
            debug!(
                pad = %pad,
                late = %ClockTime::from_frames(lag, out.format.sample_rate),
                "Buffer was late, dropping"
            );
            self.buffer = None;
            return true;
        }
        false
    }

    /// Mixes the overlap of the working buffer with `[offset, offset + blocksize)` into `output`.
    ///
    /// Clears `*output_gap` when samples were written. Returns `false` once the
    /// working buffer is exhausted and must be dropped from the queue.
    #[allow(clippy::cast_possible_truncation, clippy::too_many_arguments)]
    pub(crate) fn mix_into(
        &mut self,
        pad: &Arc<str>,
        offset: u64,
        blocksize: u64,
        output: &mut [u8],
        bpf: usize,
        mixer: SampleMixer,
        output_gap: &mut bool,
    ) -> bool {
        let (Some(output_offset), Some(buffer)) = (self.output_offset, self.buffer.as_ref()) else {
            return false;
        };

        let out_start = output_offset.saturating_sub(offset);
        let overlap = (self.size - self.position).min(blocksize - out_start);

        if buffer.flags.gap {
            trace!(pad = %pad, "Skipping gap buffer");
            self.output_offset = Some(output_offset + (self.size - self.position));
            self.position = self.size;
            self.buffer = None;
            return false;
        }

        let gain = Gain { volume: self.config.volume, mute: self.config.mute };
        let wrote = mixer.mix(
            &buffer.data,
            self.position as usize,
            output,
            out_start as usize,
            overlap as usize,
            bpf,
            gain,
        );
        if wrote {
            *output_gap = false;
        }

        self.processed += overlap;
        self.position += overlap;
        self.output_offset = Some(output_offset + overlap);

        if self.position == self.size {
            trace!(pad = %pad, "Finished mixing buffer, waiting for next");
            self.buffer = None;
            return false;
        }
        true
    }

    /// Queues a QoS report for `samples` dropped at the current position.
    ///
    /// Returns the running time of the dropped region.
    fn enqueue_qos(
        &self,
        pad: &Arc<str>,
        out: &OutputTimeline<'_>,
        samples: u64,
        qos: &mut QosBatch,
    ) -> Option<ClockTime> {
        let rate = out.format.sample_rate;
        let timestamp = self
            .buffer
            .as_ref()
            .and_then(|b| b.pts)
            .map(|pts| pts + ClockTime::from_frames(self.position, rate));
        let running_time = timestamp.and_then(|t| self.segment.to_running_time(t));

        if !self.config.qos_messages {
            return running_time;
        }

        qos.push(QosReport {
            pad: Arc::clone(pad),
            live: out.live,
            running_time,
            stream_time: timestamp.and_then(|t| self.segment.to_stream_time(t)),
            timestamp,
            duration: ClockTime::from_frames(samples, rate),
            processed: self.processed,
            dropped: self.dropped,
        });
        running_time
    }
}

/// A snapshot of a pad's working buffer, see [`Aggregator::peek_next_sample`](crate::Aggregator::peek_next_sample).
#[derive(Debug, Clone)]
pub struct NextSample {
    pub buffer: AudioBuffer,
    pub format: Option<AudioFormat>,
    pub segment: Segment,
    pub output_offset: u64,
    pub position: u64,
    pub size: u64,
}

/// One producer's connection point into an aggregator.
pub struct InputPad {
    name: Arc<str>,
    queue: Mutex<PadQueue>,
    space: Condvar,
    pub(crate) state: Mutex<PadState>,
    link: Arc<PadLink>,
}

impl std::fmt::Debug for InputPad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPad").field("name", &self.name).finish_non_exhaustive()
    }
}

impl InputPad {
    pub(crate) fn new(name: &str, config: PadConfig, capacity: usize, link: Arc<PadLink>) -> Self {
        Self {
            name: Arc::from(name),
            queue: Mutex::new(PadQueue {
                items: VecDeque::new(),
                buffers: 0,
                capacity: capacity.max(1),
                eos: false,
                flushing: false,
                flush_seqnum: 0,
                inactive: false,
                format: None,
                segment: Segment::default(),
                duration: None,
            }),
            space: Condvar::new(),
            state: Mutex::new(PadState::new(config)),
            link,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) const fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    /// Queues a buffer, blocking while the queue is full.
    ///
    /// The buffer is clipped to the current pad segment first; a buffer
    /// entirely outside of it is silently discarded.
    ///
    /// # Errors
    ///
    /// - `FlowError::Flushing` when the pad is flushed while queueing (or already flushing)
    /// - `FlowError::Eos` after [`InputPad::end_of_stream`]
    pub fn push(&self, buffer: AudioBuffer) -> Result<(), FlowError> {
        let mut queue = lock(&self.queue);
        if queue.flushing {
            return Err(FlowError::Flushing);
        }
        if queue.eos {
            return Err(FlowError::Eos);
        }

        let Some(buffer) = clip_buffer(buffer, queue.format.as_ref(), &queue.segment) else {
            trace!(pad = %self.name, "Buffer outside pad segment, discarding");
            return Ok(());
        };

        let seqnum = queue.flush_seqnum;
        while queue.buffers >= queue.capacity && !queue.flushing && queue.flush_seqnum == seqnum {
            queue = self.space.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
        if queue.flushing || queue.flush_seqnum != seqnum {
            return Err(FlowError::Flushing);
        }

        queue.items.push_back(PadItem::Buffer(buffer));
        queue.buffers += 1;
        drop(queue);

        self.link.notify(DriverCommand::Wake);
        Ok(())
    }

    /// Declares the format of subsequently pushed buffers.
    ///
    /// An invalid format is recorded as unknown; the cycle that meets data
    /// from this pad then fails as not negotiated.
    pub fn set_format(&self, format: AudioFormat) {
        let format = if format.is_valid() {
            Some(format)
        } else {
            warn!(pad = %self.name, %format, "Invalid pad format");
            None
        };
        let mut queue = lock(&self.queue);
        queue.format = format;
        queue.items.push_back(PadItem::Format(format));
        drop(queue);
        self.link.notify(DriverCommand::Renegotiated);
    }

    /// Declares the segment of subsequently pushed buffers.
    ///
    /// # Errors
    ///
    /// - `MixKitError::Unsupported` for negative rates
    /// - `MixKitError::Configuration` when the rate differs from the output segment rate
    #[allow(clippy::float_cmp)]
    pub fn set_segment(&self, segment: Segment) -> Result<(), MixKitError> {
        segment.validate()?;
        let output_rate = self.link.output_rate();
        if segment.rate != output_rate {
            return Err(MixKitError::Configuration(format!(
                "segment rate {} does not match output rate {output_rate}",
                segment.rate
            )));
        }
        let mut queue = lock(&self.queue);
        queue.segment = segment.clone();
        queue.items.push_back(PadItem::Segment(segment));
        Ok(())
    }

    /// No more buffers will be pushed.
    pub fn end_of_stream(&self) {
        lock(&self.queue).eos = true;
        debug!(pad = %self.name, "End of stream");
        self.link.notify(DriverCommand::Wake);
    }

    pub fn set_active(&self, active: bool) {
        lock(&self.queue).inactive = !active;
        self.link.notify(DriverCommand::Wake);
    }

    pub fn is_active(&self) -> bool {
        !lock(&self.queue).inactive
    }

    /// Total duration declared by the producer; `None` when unknown.
    pub fn set_duration(&self, duration: Option<ClockTime>) {
        lock(&self.queue).duration = duration;
    }

    pub fn duration(&self) -> Option<ClockTime> {
        lock(&self.queue).duration
    }

    /// True when at least one buffer is queued.
    pub fn has_buffer(&self) -> bool {
        lock(&self.queue).has_buffer()
    }

    pub fn config(&self) -> PadConfig {
        lock(&self.state).config.clone()
    }

    /// # Errors
    ///
    /// Returns `MixKitError::Configuration` when the config does not validate.
    pub fn set_config(&self, config: PadConfig) -> Result<(), MixKitError> {
        config.validate()?;
        let mut state = lock(&self.state);
        if state.config.converter != config.converter {
            state.invalidate_converter();
        }
        let live_changed = state.config.live != config.live;
        state.config = config;
        drop(state);
        if live_changed {
            self.link.notify(DriverCommand::Wake);
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `MixKitError::Configuration` for a volume outside `0.0..=10.0`.
    pub fn set_volume(&self, volume: f64) -> Result<(), MixKitError> {
        let mut config = self.config();
        config.volume = volume;
        self.set_config(config)
    }

    pub fn set_mute(&self, mute: bool) {
        lock(&self.state).config.mute = mute;
    }

    pub fn set_qos_messages(&self, enabled: bool) {
        lock(&self.state).config.qos_messages = enabled;
    }

    /// Replaces the opaque converter configuration; the converter is rebuilt on next use.
    pub fn set_converter_config(&self, converter: Option<serde_json::Value>) {
        let mut state = lock(&self.state);
        state.config.converter = converter;
        state.invalidate_converter();
    }

    pub fn is_live(&self) -> bool {
        lock(&self.state).config.live
    }

    /// `(processed, dropped)` sample counters since the last segment or flush.
    pub fn qos_counters(&self) -> (u64, u64) {
        let state = lock(&self.state);
        (state.processed, state.dropped)
    }

    /// Discards everything queued and resets the offset bookkeeping.
    ///
    /// Producers blocked in [`InputPad::push`] return `FlowError::Flushing`.
    pub fn flush(&self) {
        self.flush_start();
        lock(&self.state).reset();
        self.flush_stop();
    }

    pub(crate) fn flush_start(&self) {
        let mut queue = lock(&self.queue);
        queue.flushing = true;
        queue.flush_seqnum += 1;
        queue.items.clear();
        queue.buffers = 0;
        drop(queue);
        self.space.notify_all();
    }

    pub(crate) fn flush_stop(&self) {
        let mut queue = lock(&self.queue);
        queue.flushing = false;
        queue.eos = false;
    }

    /// Applies serialized format/segment changes and returns the head buffer.
    pub(crate) fn peek_with(&self, state: &mut PadState) -> Option<AudioBuffer> {
        let mut queue = lock(&self.queue);
        loop {
            match queue.items.front() {
                Some(PadItem::Buffer(buffer)) => return Some(buffer.clone()),
                None => return None,
                Some(_) => {},
            }
            match queue.items.pop_front() {
                Some(PadItem::Format(format)) => {
                    if state.format != format {
                        debug!(pad = %self.name, ?format, "Pad format changed");
                        state.format = format;
                        state.invalidate_converter();
                    }
                },
                Some(PadItem::Segment(segment)) => {
                    state.segment = segment;
                    state.new_segment = true;
                    state.reset_qos();
                },
                Some(PadItem::Buffer(_)) | None => {},
            }
        }
    }

    /// Removes the head buffer and wakes a blocked producer.
    pub(crate) fn drop_head(&self) {
        let mut queue = lock(&self.queue);
        if let Some(index) = queue.items.iter().position(|item| matches!(item, PadItem::Buffer(_))) {
            queue.items.remove(index);
            queue.buffers -= 1;
        }
        drop(queue);
        self.space.notify_one();
    }

    /// The pad's declared format as seen by the aggregation side.
    pub fn format(&self) -> Option<AudioFormat> {
        lock(&self.state).format
    }
}

impl Producer for InputPad {
    fn is_eos(&self) -> bool {
        let queue = lock(&self.queue);
        queue.eos && !queue.has_buffer()
    }

    fn peek_buffer(&self) -> Option<AudioBuffer> {
        let mut state = lock(&self.state);
        self.peek_with(&mut state)
    }

    fn drop_buffer(&self) {
        self.drop_head();
    }

    fn is_inactive(&self) -> bool {
        self.link.ignore_inactive() && lock(&self.queue).inactive
    }
}

/// Trims frames outside the segment; `None` when nothing remains.
fn clip_buffer(
    mut buffer: AudioBuffer,
    format: Option<&AudioFormat>,
    segment: &Segment,
) -> Option<AudioBuffer> {
    let Some(format) = format.filter(|f| f.is_valid()) else {
        return Some(buffer);
    };
    let Some(pts) = buffer.pts else {
        return Some(buffer);
    };

    let rate = format.sample_rate;
    let bpf = format.bpf();
    let frames = buffer.frames(bpf) as u64;
    let duration = buffer.duration.unwrap_or_else(|| ClockTime::from_frames(frames, rate));
    let stop = pts + duration;

    let (clip_start, clip_stop) = segment.clip(pts, Some(stop))?;
    let clip_stop = clip_stop.unwrap_or(stop);
    if clip_start == pts && clip_stop == stop {
        return Some(buffer);
    }

    let head = (clip_start - pts).to_frames(rate);
    let tail = (stop - clip_stop).to_frames(rate);
    if frames > 0 {
        if head + tail >= frames {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let (start_byte, end_byte) = ((head as usize) * bpf, ((frames - tail) as usize) * bpf);
        buffer.data = buffer.data.slice(start_byte..end_byte);
    }

    buffer.pts = Some(clip_start);
    buffer.duration = Some(clip_stop - clip_start);
    if let Some(offset) = buffer.offset.as_mut() {
        *offset += head;
    }
    if let Some(offset_end) = buffer.offset_end.as_mut() {
        *offset_end = offset_end.saturating_sub(tail);
    }
    Some(buffer)
}
