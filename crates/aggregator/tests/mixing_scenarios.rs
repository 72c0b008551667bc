// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end aggregation scenarios driven through the public API.
//!
//! Cycles are invoked by hand so every test controls exactly which cycles are
//! data-driven and which ones are live timeouts.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use mixkit_aggregator::{
    Aggregator, AggregatorConfig, AggregatorRegistry, CycleOutcome, Downstream, DurationFraction,
    InputPad, PadConfig,
};
use mixkit_core::{
    AudioBuffer, AudioFormat, BufferFlags, ClockTime, FlowError, QosCollector, QosObserver,
    SampleFormat,
};
use std::sync::{Arc, Mutex};

const STEREO_48K: AudioFormat = AudioFormat::new(48_000, 2, SampleFormat::S16Le);

#[derive(Default)]
struct Collector {
    buffers: Mutex<Vec<AudioBuffer>>,
}

impl Collector {
    fn take(&self) -> Vec<AudioBuffer> {
        std::mem::take(&mut *self.buffers.lock().unwrap())
    }
}

impl Downstream for Collector {
    fn push(&self, buffer: AudioBuffer) -> Result<(), FlowError> {
        self.buffers.lock().unwrap().push(buffer);
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn ms(v: u64) -> ClockTime {
    ClockTime::from_mseconds(v)
}

fn aggregator(config: AggregatorConfig, format: AudioFormat) -> (Aggregator, Arc<Collector>) {
    init_tracing();
    let collector = Arc::new(Collector::default());
    let downstream: Arc<dyn Downstream> = collector.clone();
    let agg = Aggregator::new(config, AggregatorRegistry::new(), downstream).unwrap();
    agg.start().unwrap();
    agg.set_output_format(format).unwrap();
    (agg, collector)
}

fn pad(agg: &Aggregator, name: &str, format: AudioFormat) -> Arc<InputPad> {
    let pad = agg.request_pad(Some(name), PadConfig::default()).unwrap();
    pad.set_format(format);
    pad
}

fn s16(samples: &[i16]) -> AudioBuffer {
    AudioBuffer::new(samples.iter().flat_map(|s| s.to_le_bytes()).collect::<Vec<u8>>())
}

fn samples(buffer: &AudioBuffer) -> Vec<i16> {
    buffer.data.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect()
}

/// 10 ms of 48 kHz stereo holding `value` everywhere.
fn block_10ms(value: i16, pts_ms: u64) -> AudioBuffer {
    s16(&[value; 960]).with_pts(ms(pts_ms))
}

fn live() -> AggregatorConfig {
    AggregatorConfig { force_live: true, ..AggregatorConfig::default() }
}

#[test]
fn late_joining_pad_resyncs_cleanly() {
    let (agg, out) = aggregator(live(), STEREO_48K);
    let a = pad(&agg, "a", STEREO_48K);
    let b = pad(&agg, "b", STEREO_48K);

    // B stays silent for three deadlines.
    for i in 0..3 {
        a.push(block_10ms(1_000, i * 10)).unwrap();
        assert_eq!(agg.aggregate(true).unwrap(), CycleOutcome::Pushed { frames: 480 });
    }

    for i in 3..6 {
        a.push(block_10ms(1_000, i * 10)).unwrap();
        b.push(block_10ms(234, i * 10)).unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
    }

    let buffers = out.take();
    assert_eq!(buffers.len(), 6);
    for buffer in &buffers[..3] {
        assert!(samples(buffer).iter().all(|&s| s == 1_000));
    }
    for buffer in &buffers[3..] {
        assert!(samples(buffer).iter().all(|&s| s == 1_234));
        assert!(!buffer.flags.gap);
    }
    assert_eq!(b.qos_counters(), (1_440, 0));
    assert_eq!(agg.offset(), Some(2_880));
}

#[test]
fn timestamp_jumps_resync_or_drop() {
    let config = AggregatorConfig { discont_wait_ns: 0, ..AggregatorConfig::default() };
    let (agg, out) = aggregator(config, STEREO_48K);
    let collector = Arc::new(QosCollector::new());
    agg.set_qos_observer(Some(collector.clone() as Arc<dyn QosObserver>));
    let a = agg
        .request_pad(Some("a"), PadConfig { qos_messages: true, ..PadConfig::default() })
        .unwrap();
    a.set_format(STEREO_48K);

    for i in 0..3 {
        a.push(block_10ms(5, i * 10)).unwrap();
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
    }

    // 200 ms ahead of the expected 30 ms: resynced, nothing dropped.
    a.push(block_10ms(5, 230)).unwrap();
    for _ in 0..20 {
        assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
    }
    let next = agg.peek_next_sample(&a).expect("buffer waits at its resynced offset");
    assert_eq!(next.output_offset, 11_040);
    assert_eq!(a.qos_counters().1, 0);
    assert!(collector.take().is_empty());

    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });
    let buffers = out.take();
    assert_eq!(buffers.len(), 24);
    assert!(buffers[3..23].iter().all(|b| b.flags.gap));
    assert!(samples(&buffers[23]).iter().all(|&s| s == 5));

    // 200 ms behind the expected 240 ms: entirely before the output offset.
    a.push(block_10ms(5, 40)).unwrap();
    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::NeedData);
    assert_eq!(a.qos_counters().1, 480);
    let reports = collector.take();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].dropped, 480);
    assert_eq!(reports[0].duration, ms(10));
    assert!(out.take().is_empty());
}

#[test]
fn even_block_duration_never_adjusts() {
    let (agg, out) = aggregator(live(), STEREO_48K);
    for _ in 0..50 {
        agg.aggregate(true).unwrap();
    }
    let buffers = out.take();
    assert!(buffers.iter().all(|b| b.len() == 480 * 4));
    assert_eq!(agg.offset(), Some(50 * 480));
    assert_eq!(agg.samples_per_buffer(), Some(480));
}

#[test]
fn uneven_block_duration_has_no_cumulative_error() {
    let config = AggregatorConfig {
        output_buffer_duration: DurationFraction::new(3, 1_000 * 7),
        ..live()
    };
    let (agg, out) = aggregator(config, STEREO_48K);

    // 48000 * 3 / 7000 = 20 + 4/7 frames.
    for _ in 0..7 {
        agg.aggregate(true).unwrap();
    }
    let sizes: Vec<u64> = out
        .take()
        .iter()
        .map(|b| b.offset_end.unwrap() - b.offset.unwrap())
        .collect();
    assert_eq!(sizes, vec![20, 21, 20, 21, 20, 21, 21]);
    assert_eq!(sizes.iter().sum::<u64>(), 144);
    assert_eq!(agg.position(mixkit_aggregator::PositionFormat::Time), Some(ms(3).nseconds()));
}

#[test]
fn final_block_truncates_to_furthest_pad() {
    let mono_1k = AudioFormat::new(1_000, 1, SampleFormat::S16Le);
    let config = AggregatorConfig {
        output_buffer_duration: DurationFraction::new(1, 10),
        ..AggregatorConfig::default()
    };
    let (agg, out) = aggregator(config, mono_1k);
    let a = pad(&agg, "a", mono_1k);
    let b = pad(&agg, "b", mono_1k);

    a.push(s16(&[1; 1_000]).with_pts(ClockTime::ZERO)).unwrap();
    b.push(s16(&[2; 950]).with_pts(ClockTime::ZERO)).unwrap();
    a.end_of_stream();
    b.end_of_stream();

    let mut outcomes = Vec::new();
    loop {
        let outcome = agg.aggregate(false).unwrap();
        outcomes.push(outcome);
        if outcome == CycleOutcome::Eos {
            break;
        }
        assert!(outcomes.len() < 20, "aggregation did not terminate");
    }

    let buffers = out.take();
    assert_eq!(buffers.len(), 10);
    let last = buffers.last().unwrap();
    assert_eq!(last.offset, Some(900));
    assert_eq!(last.offset_end, Some(1_000));
    assert_eq!(last.len(), 100 * 2);
    assert_eq!(last.duration, Some(ms(100)));
    let tail = samples(last);
    assert!(tail[..50].iter().all(|&s| s == 3));
    assert!(tail[50..].iter().all(|&s| s == 1));
}

#[test]
fn pad_order_does_not_change_the_mix() {
    let run = |names: [&str; 2]| {
        let (agg, out) = aggregator(AggregatorConfig::default(), STEREO_48K);
        let first = pad(&agg, names[0], STEREO_48K);
        let second = pad(&agg, names[1], STEREO_48K);
        let (loud, quiet) = if names[0] == "loud" { (first, second) } else { (second, first) };

        for i in 0..4u64 {
            let ramp: Vec<i16> = (0..960).map(|s| i16::try_from(s).unwrap() * 10).collect();
            loud.push(s16(&ramp).with_pts(ms(i * 10))).unwrap();
            // Offset by half a block.
            quiet.push(block_10ms(-7, 5 + i * 10)).unwrap();
        }
        loud.end_of_stream();
        quiet.end_of_stream();
        while agg.aggregate(false).unwrap() != CycleOutcome::Eos {}
        (out.take().iter().flat_map(samples).collect::<Vec<i16>>(), agg.offset())
    };

    let forward = run(["loud", "quiet"]);
    let reverse = run(["quiet", "loud"]);
    assert_eq!(forward, reverse);
    assert_eq!(forward.1, Some(4 * 480 + 240));
}

#[test]
fn silence_stays_gap_until_a_single_sample_overlaps() {
    let (agg, out) = aggregator(live(), STEREO_48K);
    let a = pad(&agg, "a", STEREO_48K);

    for _ in 0..3 {
        assert_eq!(agg.aggregate(true).unwrap(), CycleOutcome::Pushed { frames: 480 });
    }

    // One frame at the start of the fourth block.
    a.push(s16(&[9, 9]).with_pts(ms(30))).unwrap();
    assert_eq!(agg.aggregate(true).unwrap(), CycleOutcome::NeedData);
    assert_eq!(agg.aggregate(true).unwrap(), CycleOutcome::Pushed { frames: 480 });
    assert_eq!(agg.aggregate(true).unwrap(), CycleOutcome::Pushed { frames: 480 });

    let buffers = out.take();
    let gaps: Vec<bool> = buffers.iter().map(|b| b.flags.gap).collect();
    assert_eq!(gaps, vec![true, true, true, false, true]);
    assert!(buffers[..3].iter().all(|b| b.data.iter().all(|&byte| byte == 0)));
    assert_eq!(&samples(&buffers[3])[..4], &[9, 9, 0, 0]);
}

#[test]
fn wrong_timestamp_is_never_mixed_at_stale_offset() {
    let (agg, out) = aggregator(AggregatorConfig::default(), STEREO_48K);
    let a = pad(&agg, "a", STEREO_48K);

    a.push(block_10ms(10, 0)).unwrap();
    agg.aggregate(false).unwrap();

    // Flagged discontinuity with a timestamp 2.5 ms later than expected.
    let resync = BufferFlags { discont: true, ..BufferFlags::default() };
    a.push(s16(&[20; 960]).with_pts(ClockTime::from_nseconds(12_500_000)).with_flags(resync))
        .unwrap();
    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

    let buffers = out.take();
    assert_eq!(buffers.len(), 2);
    let second = samples(&buffers[1]);
    // 120 silent frames before the resynced data.
    assert!(second[..240].iter().all(|&s| s == 0));
    assert!(second[240..].iter().all(|&s| s == 20));
}

#[test]
fn gap_input_buffers_keep_output_silent() {
    let (agg, out) = aggregator(AggregatorConfig::default(), STEREO_48K);
    let a = pad(&agg, "a", STEREO_48K);

    a.push(AudioBuffer::gap(Some(ClockTime::ZERO), ms(10))).unwrap();
    a.push(block_10ms(3, 10)).unwrap();
    a.end_of_stream();
    while agg.aggregate(false).unwrap() != CycleOutcome::Eos {}

    let buffers = out.take();
    assert_eq!(buffers.len(), 2);
    assert!(buffers[0].flags.gap);
    assert!(!buffers[1].flags.gap);
}

/// 10 ms of 48 kHz stereo with constant left and right values.
fn stereo_10ms(left: i16, right: i16, pts_ms: u64) -> AudioBuffer {
    let frames: Vec<i16> = std::iter::repeat([left, right]).take(480).flatten().collect();
    s16(&frames).with_pts(ms(pts_ms))
}

fn assert_channels(buffer: &AudioBuffer, left: i16, right: i16) {
    for frame in samples(buffer).chunks_exact(2) {
        assert_eq!(frame, [left, right]);
    }
}

#[test]
fn pad_settings_apply_from_the_next_buffer() {
    let (agg, out) = aggregator(AggregatorConfig::default(), STEREO_48K);
    let a = pad(&agg, "a", STEREO_48K);

    a.push(stereo_10ms(1, 2, 0)).unwrap();
    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

    a.set_converter_config(Some(serde_json::json!({ "mix_matrix": [[0.0, 1.0], [1.0, 0.0]] })));
    a.push(stereo_10ms(1, 2, 10)).unwrap();
    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

    // Dropping the matrix through the full config goes back to passthrough.
    a.set_config(PadConfig { converter: None, ..a.config() }).unwrap();
    a.push(stereo_10ms(1, 2, 20)).unwrap();
    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

    a.set_volume(2.0).unwrap();
    assert!(a.set_volume(11.0).is_err());
    a.push(stereo_10ms(1, 2, 30)).unwrap();
    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

    let buffers = out.take();
    assert_eq!(buffers.len(), 4);
    assert_channels(&buffers[0], 1, 2);
    assert_channels(&buffers[1], 2, 1);
    assert_channels(&buffers[2], 1, 2);
    assert_channels(&buffers[3], 2, 4);
}

#[test]
fn tightened_alignment_threshold_resyncs_drifting_pad() {
    let (agg, out) = aggregator(AggregatorConfig::default(), STEREO_48K);
    agg.set_discont_wait(ClockTime::ZERO);
    let a = pad(&agg, "a", STEREO_48K);

    a.push(block_10ms(5, 0)).unwrap();
    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

    // 2 ms late, well inside the default threshold: mixed back to back.
    a.push(block_10ms(5, 12)).unwrap();
    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

    // Another 2 ms of drift is now beyond the threshold.
    agg.set_alignment_threshold(ms(1));
    a.push(block_10ms(5, 24)).unwrap();
    assert_eq!(agg.aggregate(false).unwrap(), CycleOutcome::Pushed { frames: 480 });

    let buffers = out.take();
    assert_eq!(buffers.len(), 3);
    assert!(samples(&buffers[1]).iter().all(|&s| s == 5));
    let third = samples(&buffers[2]);
    // Resynced to 24 ms: 192 silent frames first.
    assert!(third[..384].iter().all(|&s| s == 0));
    assert!(third[384..].iter().all(|&s| s == 5));
}
