// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Wires configured sources, an aggregator, its driver thread and the file writer together.

use std::path::PathBuf;
use std::sync::Arc;

use mixkit_aggregator::{
    Aggregator, AggregatorDriver, AggregatorRegistry, ChannelDownstream, Downstream, DriverOptions,
    Latency, PooledAllocator,
};
use mixkit_core::{
    AggregatorState, AggregatorStateUpdate, AggregatorStats, AggregatorStatsUpdate, QosObserver,
    QosReport, StopReason,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::output::{self, OutputSummary};
use crate::sources::{self, SourceHandle};

const STATUS_CHANNEL_CAPACITY: usize = 32;
const QOS_CHANNEL_CAPACITY: usize = 64;

/// Outcome of one mix run.
#[derive(Debug, Clone)]
pub struct MixSummary {
    pub stop_reason: StopReason,
    pub output: OutputSummary,
    /// Last statistics snapshot reported by the driver.
    pub stats: Option<AggregatorStats>,
    pub dropped_frames: u64,
    /// Frames pushed by each source, in configuration order.
    pub source_frames: Vec<(String, u64)>,
}

/// Runs the configured mix until every source finished or `cancellation_token` fires.
///
/// # Errors
///
/// Returns an error when the configuration is invalid, the aggregator cannot be
/// built, a thread cannot be spawned, or the output file cannot be written.
pub async fn run(config: &Config, cancellation_token: CancellationToken) -> anyhow::Result<MixSummary> {
    config.validate()?;

    let (downstream, output_rx) = ChannelDownstream::channel(config.output.channel_capacity);
    let output_path = PathBuf::from(&config.output.path);
    let writer = tokio::spawn(async move { output::write_raw(output_rx, &output_path).await });

    let registry = AggregatorRegistry::new().with_allocator(Arc::new(PooledAllocator::default()));
    let downstream: Arc<dyn Downstream> = Arc::new(downstream);
    let aggregator = Arc::new(Aggregator::new(config.aggregator_config(), registry, downstream)?);
    aggregator.start()?;

    let (qos_tx, qos_rx) = mpsc::channel::<QosReport>(QOS_CHANNEL_CAPACITY);
    aggregator.set_qos_observer(Some(Arc::new(qos_tx) as Arc<dyn QosObserver>));
    let qos_task = tokio::spawn(log_qos(qos_rx));

    let mut pads = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let pad = aggregator.request_pad(Some(&source.name), source.pad_config())?;
        pad.set_format(config.source_format(source));
        pads.push(pad);
    }

    let Latency { live, min, .. } = aggregator.latency();
    info!(
        output = %config.output.format,
        sources = config.sources.len(),
        live,
        latency = %min,
        block = ?aggregator.output_buffer_duration(),
        "Starting mix"
    );

    let (state_tx, state_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
    let (stats_tx, stats_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
    let state_task = tokio::spawn(log_states(state_rx));
    let stats_task = tokio::spawn(track_stats(stats_rx));

    let driver = AggregatorDriver::spawn(
        Arc::clone(&aggregator),
        DriverOptions {
            name: "mix".to_string(),
            state_tx: Some(state_tx),
            stats_tx: Some(stats_tx),
            cancellation_token: Some(cancellation_token.child_token()),
        },
    )?;

    let sources_token = cancellation_token.child_token();
    let mut handles: Vec<SourceHandle> = Vec::with_capacity(config.sources.len());
    for (source, pad) in config.sources.iter().zip(&pads) {
        match sources::spawn_source(
            source,
            config.source_format(source),
            Arc::clone(pad),
            sources_token.clone(),
        ) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                sources_token.cancel();
                let _ = driver.shutdown();
                release_pads(&aggregator, &pads);
                join_sources(handles).await;
                return Err(e);
            },
        }
    }

    let stop_reason = tokio::task::spawn_blocking(move || driver.join()).await?;
    match stop_reason {
        StopReason::Completed => info!("Mix completed"),
        StopReason::Shutdown => info!("Mix cancelled"),
        reason => warn!(?reason, "Mix stopped early"),
    }

    // Release sources still blocked on full pads.
    sources_token.cancel();
    release_pads(&aggregator, &pads);
    let source_frames = join_sources(handles).await;

    let dropped_frames = aggregator.dropped_frames();
    aggregator.set_qos_observer(None);
    drop(pads);
    // Last handle to the downstream channel; the writer drains and returns.
    drop(aggregator);

    let output = writer.await??;
    let stats = stats_task.await.unwrap_or_default();
    let _ = state_task.await;
    let _ = qos_task.await;

    Ok(MixSummary { stop_reason, output, stats, dropped_frames, source_frames })
}

fn release_pads(aggregator: &Aggregator, pads: &[Arc<mixkit_aggregator::InputPad>]) {
    for pad in pads {
        aggregator.remove_pad(pad.name());
    }
}

async fn join_sources(handles: Vec<SourceHandle>) -> Vec<(String, u64)> {
    let mut frames = Vec::with_capacity(handles.len());
    for handle in handles {
        let name = handle.name().to_string();
        let produced = tokio::task::spawn_blocking(move || handle.join()).await.unwrap_or(0);
        frames.push((name, produced));
    }
    frames
}

async fn log_states(mut rx: mpsc::Receiver<AggregatorStateUpdate>) {
    while let Some(update) = rx.recv().await {
        match &update.state {
            AggregatorState::Failed { reason } => {
                error!(aggregator = %update.name, %reason, "Aggregator failed");
            },
            AggregatorState::Degraded { reason } => {
                warn!(aggregator = %update.name, %reason, "Aggregator degraded");
            },
            state => info!(aggregator = %update.name, ?state, "Aggregator state changed"),
        }
    }
}

async fn track_stats(mut rx: mpsc::Receiver<AggregatorStatsUpdate>) -> Option<AggregatorStats> {
    let mut last = None;
    while let Some(update) = rx.recv().await {
        debug!(
            aggregator = %update.name,
            cycles = update.stats.cycles,
            pushed = update.stats.pushed,
            dropped = update.stats.dropped_frames,
            "Aggregator stats"
        );
        last = Some(update.stats);
    }
    last
}

async fn log_qos(mut rx: mpsc::Receiver<QosReport>) {
    while let Some(report) = rx.recv().await {
        warn!(
            pad = %report.pad,
            duration = %report.duration,
            running_time = ?report.running_time,
            processed = report.processed,
            dropped = report.dropped,
            "Pad dropped samples"
        );
    }
}
