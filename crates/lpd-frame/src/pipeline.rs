//! Two-stage receive pipeline.
//!
//! ```text
//! receivers ─RawPacket─► lpd-assemble ─FrameBuffer─► lpd-reorder ─ReorderedImage─► sink
//!                              ▲                          │
//!                              └──────── pool ◄───────────┘
//! ```
//!
//! The assemble thread owns the [`FrameAssembler`] and checks frame timeouts on
//! every loop turn, at least once per tick. The reorder thread owns the
//! [`PixelReorderer`] and returns buffers to the pool once a frame is done.
//! Configuration changes travel through the assemble thread so that frames
//! flushed by a change are reordered with the layout they were received under.

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde_json::{Map, Value};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::assembler::{FrameAssembler, PacketOutcome};
use crate::definitions::FrameLayout;
use crate::error::ConfigError;
use crate::frame::{FrameBuffer, FramePool, PoolHandle};
use crate::loss::LossAccumulator;
use crate::metrics::{self, StageMetrics};
use crate::receiver::RawPacket;
use crate::reorder::{ImageGeometry, ImageSink, PixelReorderer};
use crate::settings::{ResolvedSettings, Settings};

pub const DEFAULT_FRAME_BUFFERS: usize = 8;
pub const DEFAULT_PACKET_QUEUE: usize = 65_536;
const TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Frame buffers in the pool; bounds frames in flight plus frames queued
    /// for reordering.
    pub frame_buffers: usize,
    /// Raw packets queued between the receivers and the assembler.
    pub packet_queue: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self { frame_buffers: DEFAULT_FRAME_BUFFERS, packet_queue: DEFAULT_PACKET_QUEUE }
    }
}

enum Control {
    Configure(ResolvedSettings, Sender<Result<(), ConfigError>>),
    Stop,
}

enum ReorderWork {
    Frame(FrameBuffer),
    Reconfigure(FrameLayout, ImageGeometry),
}

pub struct Pipeline {
    settings: Settings,
    packet_tx: Sender<RawPacket>,
    control_tx: Sender<Control>,
    loss: Arc<LossAccumulator>,
    stages: Arc<StageMetrics>,
    pool_free: Receiver<FrameBuffer>,
    frame_buffers: usize,
    assemble: Option<JoinHandle<()>>,
    reorder: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start<S>(settings: Settings, options: PipelineOptions, sink: S) -> Result<Self>
    where
        S: ImageSink + Send + 'static,
    {
        let resolved = settings.resolve()?;
        let loss = LossAccumulator::new();
        let stages = Arc::new(StageMetrics::new());

        let pool = FramePool::new(&resolved.layout, options.frame_buffers);
        let frame_buffers = pool.capacity();
        let pool_handle = pool.handle();
        let pool_free = pool.free_receiver();

        let (packet_tx, packet_rx) = crossbeam_channel::bounded(options.packet_queue.max(1));
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        // Unbounded, but never holds more frames than the pool has buffers.
        let (work_tx, work_rx) = crossbeam_channel::unbounded();

        let reorderer = PixelReorderer::new(resolved.layout, resolved.geometry, loss.clone());
        let reorder_stages = stages.clone();
        let reorder = std::thread::Builder::new()
            .name("lpd-reorder".into())
            .spawn(move || run_reorder(reorderer, work_rx, pool_handle, sink, reorder_stages))?;

        let assembler = FrameAssembler::new(
            resolved.layout,
            resolved.port_map,
            pool,
            resolved.frame_timeout,
            loss.clone(),
        );
        let assemble_stages = stages.clone();
        let assemble = std::thread::Builder::new()
            .name("lpd-assemble".into())
            .spawn(move || run_assemble(assembler, packet_rx, control_rx, work_tx, assemble_stages))?;

        tracing::info!(
            fem_port_map = %settings.fem_port_map,
            bit_depth = %settings.bit_depth,
            frame_buffers,
            "pipeline started"
        );

        Ok(Self {
            settings,
            packet_tx,
            control_tx,
            loss,
            stages,
            pool_free,
            frame_buffers,
            assemble: Some(assemble),
            reorder: Some(reorder),
        })
    }

    /// Sender for receivers to feed packets into.
    pub fn packet_sender(&self) -> Sender<RawPacket> {
        self.packet_tx.clone()
    }

    /// Queue one packet without blocking. Returns false if it was dropped.
    pub fn submit(&self, packet: RawPacket) -> bool {
        match self.packet_tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.loss.packets_overflowed.fetch_add(1, Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Queue one packet, waiting for room. For offline sources such as
    /// capture replay, where dropping would misreport loss.
    pub fn submit_blocking(&self, packet: RawPacket) -> bool {
        self.packet_tx.send(packet).is_ok()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn loss(&self) -> &Arc<LossAccumulator> {
        &self.loss
    }

    /// Apply a configure request. On error nothing changes.
    pub fn configure(&mut self, params: &Map<String, Value>) -> Result<(), ConfigError> {
        let update = self.settings.with_params(params)?;
        if update.settings != self.settings {
            let resolved = update.settings.resolve()?;
            let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
            self.control_tx
                .send(Control::Configure(resolved, reply_tx))
                .map_err(|_| ConfigError::PipelineStopped)?;
            reply_rx.recv().map_err(|_| ConfigError::PipelineStopped)??;
            tracing::info!(settings = ?update.settings, "configuration applied");
            self.settings = update.settings;
        }
        if let Some(value) = update.packets_lost {
            self.loss.set_packets_lost(value);
        }
        Ok(())
    }

    /// Flat status map: current settings, loss counters and stage timings.
    pub fn status(&self) -> Map<String, Value> {
        let mut status = self.settings.to_params();
        status.extend(self.loss.snapshot().to_status());
        let stages = self.stages.snapshot();
        status.insert("queue_avg_ns".into(), Value::from(stages.queue_avg_ns));
        status.insert("queue_count".into(), Value::from(stages.queue_count));
        status.insert("assemble_avg_ns".into(), Value::from(stages.assemble_avg_ns));
        status.insert("reorder_avg_ns".into(), Value::from(stages.reorder_avg_ns));
        status.insert("frame_buffers".into(), Value::from(self.frame_buffers));
        status.insert("frame_buffers_free".into(), Value::from(self.pool_free.len()));
        status
    }

    /// Flush in-flight frames as dropped, drain the reorder stage and join
    /// both threads. Idempotent.
    pub fn stop(&mut self) {
        let _ = self.control_tx.send(Control::Stop);
        for handle in [self.assemble.take(), self.reorder.take()].into_iter().flatten() {
            let name = handle.thread().name().unwrap_or("lpd-stage").to_string();
            if handle.join().is_err() {
                tracing::error!(thread = %name, "pipeline thread panicked");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_assemble(
    mut assembler: FrameAssembler,
    packet_rx: Receiver<RawPacket>,
    control_rx: Receiver<Control>,
    work_tx: Sender<ReorderWork>,
    stages: Arc<StageMetrics>,
) {
    let forward = |assembler: &FrameAssembler, buffer: FrameBuffer| {
        if let Err(e) = work_tx.send(ReorderWork::Frame(buffer)) {
            if let ReorderWork::Frame(buffer) = e.into_inner() {
                assembler.release(buffer);
            }
        }
    };

    let mut last_check = Instant::now();
    loop {
        crossbeam_channel::select! {
            recv(control_rx) -> msg => match msg {
                Ok(Control::Configure(resolved, reply)) => {
                    let result = assembler.reconfigure(
                        resolved.layout,
                        resolved.port_map,
                        resolved.frame_timeout,
                    );
                    let reply_result = match result {
                        Ok(flushed) => {
                            for buffer in flushed {
                                forward(&assembler, buffer);
                            }
                            let _ = work_tx.send(ReorderWork::Reconfigure(resolved.layout, resolved.geometry));
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(reply_result);
                }
                Ok(Control::Stop) | Err(_) => break,
            },
            recv(packet_rx) -> msg => match msg {
                Ok(packet) => {
                    if let Some(buffer) = assemble_one(&mut assembler, &packet, &stages) {
                        forward(&assembler, buffer);
                    }
                }
                Err(_) => break,
            },
            default(TICK) => {}
        }

        let now = Instant::now();
        if now.duration_since(last_check) >= TICK {
            last_check = now;
            for buffer in assembler.monitor_buffers(now) {
                forward(&assembler, buffer);
            }
        }
    }

    // Packets already queued at stop still belong to their frames.
    for _ in 0..packet_rx.len() {
        let Ok(packet) = packet_rx.try_recv() else { break };
        if let Some(buffer) = assemble_one(&mut assembler, &packet, &stages) {
            forward(&assembler, buffer);
        }
    }
    for buffer in assembler.flush() {
        forward(&assembler, buffer);
    }
    tracing::info!("assemble stage stopped");
}

fn assemble_one(assembler: &mut FrameAssembler, packet: &RawPacket, stages: &StageMetrics) -> Option<FrameBuffer> {
    let t0 = metrics::now_ns();
    if packet.recv_timestamp_ns != 0 {
        stages.queue.record(t0.saturating_sub(packet.recv_timestamp_ns));
    }
    let outcome = assembler.process_packet(&packet.data, packet.port, Instant::now());
    stages.assemble.record(metrics::now_ns().saturating_sub(t0));
    match outcome {
        PacketOutcome::Complete(buffer) => Some(buffer),
        _ => None,
    }
}

fn run_reorder<S: ImageSink>(
    mut reorderer: PixelReorderer,
    work_rx: Receiver<ReorderWork>,
    pool: PoolHandle,
    mut sink: S,
    stages: Arc<StageMetrics>,
) {
    for work in work_rx.iter() {
        match work {
            ReorderWork::Frame(buffer) => {
                let t0 = metrics::now_ns();
                // Failures are counted and logged by the reorderer.
                let _ = reorderer.process_frame(&buffer, &mut sink);
                stages.reorder.record(metrics::now_ns().saturating_sub(t0));
                pool.release(buffer);
            }
            ReorderWork::Reconfigure(layout, geometry) => {
                reorderer.set_layout(layout);
                if let Err(e) = reorderer.set_geometry(geometry) {
                    tracing::warn!(err = %e, "keeping previous image geometry");
                }
            }
        }
    }
    tracing::info!(images = reorderer.image_counter(), "reorder stage stopped");
}
