//! Frame reassembly.
//!
//! Consumes raw FEM datagrams, routes them by port to a FEM, and writes each
//! payload into the slot addressed by its packet number inside the buffer of
//! its frame. Arrival order does not matter: placement is direct-indexed.
//!
//! ## Buffer lifecycle
//! * first packet of an untracked frame number claims a pool buffer;
//! * with the pool empty, the oldest in-flight frame is evicted (FIFO), its
//!   partial loss recorded, and its buffer reused;
//! * a complete frame is moved out of [`FrameAssembler::process_packet`];
//! * frames older than the timeout are moved out of
//!   [`FrameAssembler::monitor_buffers`] as `Dropped`, and every remaining
//!   frame is moved out of [`FrameAssembler::flush`] on stop.
//!
//! Frames that leave the assembler carry their own loss accounting downstream;
//! only evicted frames are accounted here, since they never leave.

use std::collections::VecDeque;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::definitions::FrameLayout;
use crate::error::{ConfigError, PacketError};
use crate::fem_map::FemPortMap;
use crate::frame::{FrameBuffer, FramePool, FrameState};
use crate::loss::LossAccumulator;
use crate::trailer::PacketTrailer;

pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(1000);

/// What happened to one datagram.
#[derive(Debug)]
pub enum PacketOutcome {
    /// Payload stored; the frame is still receiving.
    Stored { frame_number: u32 },
    /// Payload stored and the frame completed. Ownership passes to the caller.
    Complete(FrameBuffer),
    /// Port not in the FEM map.
    Ignored(PacketError),
    /// Malformed, duplicate, or no buffer to put it in.
    Discarded(PacketError),
}

struct InFlight {
    frame_number: u32,
    started: Instant,
    buffer: FrameBuffer,
}

pub struct FrameAssembler {
    layout: FrameLayout,
    port_map: FemPortMap,
    pool: FramePool,
    /// Claim order, oldest first.
    in_flight: VecDeque<InFlight>,
    frame_timeout: Duration,
    loss: Arc<LossAccumulator>,
}

impl FrameAssembler {
    pub fn new(
        layout: FrameLayout,
        port_map: FemPortMap,
        pool: FramePool,
        frame_timeout: Duration,
        loss: Arc<LossAccumulator>,
    ) -> Self {
        Self {
            in_flight: VecDeque::with_capacity(pool.capacity()),
            layout,
            port_map,
            pool,
            frame_timeout,
            loss,
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn port_map(&self) -> &FemPortMap {
        &self.port_map
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Frame numbers currently receiving, oldest first.
    pub fn in_flight_frames(&self) -> Vec<u32> {
        self.in_flight.iter().map(|f| f.frame_number).collect()
    }

    /// Read-only view of an in-flight frame.
    pub fn frame(&self, frame_number: u32) -> Option<&FrameBuffer> {
        self.in_flight.iter().find(|f| f.frame_number == frame_number).map(|f| &f.buffer)
    }

    /// Swap routing, layout and timeout. In-flight frames are flushed as
    /// dropped when routing or layout change; they are returned for hand-off.
    pub fn reconfigure(
        &mut self,
        layout: FrameLayout,
        port_map: FemPortMap,
        frame_timeout: Duration,
    ) -> Result<Vec<FrameBuffer>, ConfigError> {
        if layout.region_size > self.pool.region_size() {
            return Err(ConfigError::InvalidValue {
                key: "bit_depth",
                reason: format!(
                    "needs {} byte FEM regions, pool buffers hold {}",
                    layout.region_size,
                    self.pool.region_size()
                ),
            });
        }
        let flushed = if layout != self.layout || port_map != self.port_map {
            self.flush()
        } else {
            Vec::new()
        };
        self.layout = layout;
        self.port_map = port_map;
        self.frame_timeout = frame_timeout;
        Ok(flushed)
    }

    pub fn process_packet(&mut self, datagram: &[u8], port: u16, now: Instant) -> PacketOutcome {
        self.loss.packets_received.fetch_add(1, Relaxed);

        let (payload, trailer) = match PacketTrailer::split(datagram) {
            Ok(split) => split,
            Err(e) => return self.malformed(e),
        };

        let entry = match self.port_map.lookup(port) {
            Some(entry) => entry,
            None => {
                self.loss.packets_ignored.fetch_add(1, Relaxed);
                tracing::trace!(port, frame = trailer.frame_number, "ignoring packet from unmapped port");
                return PacketOutcome::Ignored(PacketError::UnroutablePacket(port));
            }
        };

        let packet_number = trailer.packet_number as usize;
        let capacity = match self.layout.payload_capacity(packet_number) {
            Some(capacity) => capacity,
            None => {
                return self.malformed(PacketError::PacketOutOfRange {
                    packet_number: trailer.packet_number,
                    packets_per_fem: self.layout.packets_per_fem(),
                })
            }
        };
        if payload.len() > capacity {
            return self.malformed(PacketError::OversizedPayload {
                packet_number: trailer.packet_number,
                len: payload.len(),
                capacity,
            });
        }

        let frame_number = trailer.frame_number;
        let idx = match self.find_or_claim(frame_number, now) {
            Some(idx) => idx,
            None => {
                self.loss.packets_unbuffered.fetch_add(1, Relaxed);
                self.loss.packets_lost.fetch_add(1, Relaxed);
                tracing::warn!(frame = frame_number, "no frame buffer available; packet lost");
                return PacketOutcome::Discarded(PacketError::BufferPoolExhausted(frame_number));
            }
        };

        let layout = self.layout;
        let expected_fems = self.port_map.num_fems();
        let frame = &mut self.in_flight[idx];

        let position = match frame.buffer.header_mut().activate_fem(entry.fem_idx) {
            Some(position) => position,
            None => {
                self.loss.packets_ignored.fetch_add(1, Relaxed);
                return PacketOutcome::Ignored(PacketError::UnroutablePacket(port));
            }
        };

        if frame.buffer.header_mut().fem_rx_state_mut(position).has_packet(packet_number) {
            self.loss.packets_duplicate.fetch_add(1, Relaxed);
            tracing::debug!(frame = frame_number, fem = entry.fem_idx, packet = packet_number, "duplicate packet");
            return PacketOutcome::Discarded(PacketError::DuplicatePacket {
                frame_number,
                fem_idx: entry.fem_idx,
                packet_number: trailer.packet_number,
            });
        }

        // Slot is the packet number itself: unique per FEM per frame.
        let slot = packet_number;
        if !frame.buffer.write_slot(position, layout.slot_offset(slot), capacity, payload) {
            return self.malformed(PacketError::OversizedPayload {
                packet_number: trailer.packet_number,
                len: payload.len(),
                capacity,
            });
        }

        let header = frame.buffer.header_mut();
        let rx = header.fem_rx_state_mut(position);
        rx.record(packet_number, slot as u16);
        if trailer.start_of_frame {
            rx.sof_marker_count = rx.sof_marker_count.saturating_add(1);
            header.total_sof_marker_count += 1;
        }
        let rx = header.fem_rx_state_mut(position);
        if trailer.end_of_frame {
            rx.eof_marker_count = rx.eof_marker_count.saturating_add(1);
            header.total_eof_marker_count += 1;
        }
        header.total_packets_received += 1;

        tracing::trace!(
            frame = frame_number,
            fem = entry.fem_idx,
            packet = packet_number,
            sof = trailer.start_of_frame,
            eof = trailer.end_of_frame,
            "packet stored"
        );

        if !header.is_complete(layout.packets_per_fem(), expected_fems) {
            return PacketOutcome::Stored { frame_number };
        }

        let Some(mut done) = self.in_flight.remove(idx) else {
            return PacketOutcome::Stored { frame_number };
        };
        done.buffer.header_mut().frame_state = FrameState::Complete;
        self.loss.frames_complete.fetch_add(1, Relaxed);
        tracing::debug!(
            frame = frame_number,
            packets = done.buffer.header().total_packets_received,
            fems = done.buffer.header().num_active_fems(),
            "frame complete"
        );
        PacketOutcome::Complete(done.buffer)
    }

    /// Hand out every frame that has been receiving for longer than the
    /// timeout, marked `Dropped`.
    pub fn monitor_buffers(&mut self, now: Instant) -> Vec<FrameBuffer> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.in_flight.len() {
            if now.saturating_duration_since(self.in_flight[i].started) < self.frame_timeout {
                i += 1;
                continue;
            }
            if let Some(mut frame) = self.in_flight.remove(i) {
                frame.buffer.header_mut().frame_state = FrameState::Dropped;
                self.loss.frames_timed_out.fetch_add(1, Relaxed);
                tracing::warn!(
                    frame = frame.frame_number,
                    received = frame.buffer.header().total_packets_received,
                    timeout_ms = self.frame_timeout.as_millis() as u64,
                    "frame timed out incomplete"
                );
                expired.push(frame.buffer);
            }
        }
        expired
    }

    /// Hand out every in-flight frame as `Dropped`.
    pub fn flush(&mut self) -> Vec<FrameBuffer> {
        let flushed: Vec<FrameBuffer> = self
            .in_flight
            .drain(..)
            .map(|mut frame| {
                frame.buffer.header_mut().frame_state = FrameState::Dropped;
                frame.buffer
            })
            .collect();
        if !flushed.is_empty() {
            self.loss.frames_flushed.fetch_add(flushed.len() as u64, Relaxed);
            tracing::info!(frames = flushed.len(), "flushed in-flight frames");
        }
        flushed
    }

    /// Return a buffer handed out earlier.
    pub fn release(&self, buffer: FrameBuffer) {
        self.pool.release(buffer);
    }

    fn find_or_claim(&mut self, frame_number: u32, now: Instant) -> Option<usize> {
        if let Some(idx) = self.in_flight.iter().position(|f| f.frame_number == frame_number) {
            return Some(idx);
        }
        let mut buffer = match self.pool.checkout() {
            Some(buffer) => buffer,
            None => self.evict_oldest()?,
        };
        buffer.header_mut().claim(frame_number, SystemTime::now());
        tracing::debug!(frame = frame_number, "new frame");
        self.in_flight.push_back(InFlight { frame_number, started: now, buffer });
        Some(self.in_flight.len() - 1)
    }

    fn evict_oldest(&mut self) -> Option<FrameBuffer> {
        let mut oldest = self.in_flight.pop_front()?;
        oldest.buffer.header_mut().frame_state = FrameState::Dropped;
        let loss = self.loss.record_frame(oldest.buffer.header(), self.layout.packets_per_fem());
        self.loss.frames_evicted.fetch_add(1, Relaxed);
        tracing::warn!(
            frame = oldest.frame_number,
            lost = loss.lost,
            "frame buffers exhausted; evicted oldest incomplete frame"
        );
        oldest.buffer.reset();
        Some(oldest.buffer)
    }

    fn malformed(&self, err: PacketError) -> PacketOutcome {
        self.loss.packets_malformed.fetch_add(1, Relaxed);
        tracing::debug!(err = %err, "discarding malformed packet");
        PacketOutcome::Discarded(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FrameLayout {
        FrameLayout::custom(8, 3, 8).unwrap()
    }

    fn assembler(map: &str, pool_size: usize) -> (FrameAssembler, Arc<LossAccumulator>) {
        let loss = LossAccumulator::new();
        let layout = layout();
        let asm = FrameAssembler::new(
            layout,
            FemPortMap::parse(map).unwrap(),
            FramePool::new(&layout, pool_size),
            Duration::from_millis(100),
            loss.clone(),
        );
        (asm, loss)
    }

    fn packet(frame_number: u32, packet_number: u32) -> Vec<u8> {
        let layout = layout();
        let len = layout.payload_capacity(packet_number as usize).unwrap();
        let mut datagram: Vec<u8> = (0..len).map(|i| (packet_number as u8) * 16 + i as u8).collect();
        PacketTrailer {
            frame_number,
            packet_number,
            start_of_frame: packet_number == 0,
            end_of_frame: packet_number as usize == layout.packets_per_fem() - 1,
        }
        .append_to(&mut datagram);
        datagram
    }

    fn deliver(asm: &mut FrameAssembler, frame_number: u32, order: &[u32], port: u16) -> Option<FrameBuffer> {
        let now = Instant::now();
        let mut done = None;
        for &p in order {
            if let PacketOutcome::Complete(buffer) = asm.process_packet(&packet(frame_number, p), port, now) {
                done = Some(buffer);
            }
        }
        done
    }

    #[test]
    fn test_in_order_frame_completes() {
        let (mut asm, loss) = assembler("61649:0", 2);
        let buffer = deliver(&mut asm, 3, &[0, 1, 2, 3], 61649).expect("complete");
        let header = buffer.header();
        assert_eq!(header.frame_number, Some(3));
        assert_eq!(header.frame_state, FrameState::Complete);
        assert_eq!(header.total_packets_received, 4);
        assert_eq!(header.total_sof_marker_count, 1);
        assert_eq!(header.total_eof_marker_count, 1);
        assert_eq!(header.active_fems(), &[0]);
        assert!(asm.in_flight_frames().is_empty());
        assert_eq!(loss.snapshot().frames_complete, 1);

        assert_eq!(asm.pool().available(), 1);
        asm.release(buffer);
        assert_eq!(asm.pool().available(), 2);
    }

    #[test]
    fn test_reassembly_is_order_independent() {
        let (mut asm, _) = assembler("61649:0", 1);
        let reference = deliver(&mut asm, 1, &[0, 1, 2, 3], 61649).unwrap();
        let ref_state = reference.header().fem_rx_state(0).unwrap().packet_state().to_vec();
        let ref_region = reference.fem_region(0).unwrap().to_vec();
        asm.release(reference);

        for order in [[3, 1, 0, 2], [2, 3, 0, 1], [1, 0, 3, 2], [3, 2, 1, 0]] {
            let buffer = deliver(&mut asm, 2, &order, 61649).expect("complete");
            assert_eq!(buffer.header().fem_rx_state(0).unwrap().packet_state(), &ref_state[..]);
            assert_eq!(buffer.fem_region(0).unwrap(), &ref_region[..]);
            asm.release(buffer);
        }
    }

    #[test]
    fn test_unmapped_port_is_ignored() {
        let (mut asm, loss) = assembler("61649:0,61650:1", 2);
        let now = Instant::now();
        assert!(matches!(asm.process_packet(&packet(5, 0), 61649, now), PacketOutcome::Stored { .. }));
        assert!(matches!(
            asm.process_packet(&packet(5, 1), 61651, now),
            PacketOutcome::Ignored(PacketError::UnroutablePacket(61651))
        ));
        assert_eq!(loss.snapshot().packets_ignored, 1);
        assert_eq!(asm.frame(5).unwrap().header().total_packets_received, 1);

        assert!(matches!(
            asm.process_packet(&packet(6, 0), 61651, now),
            PacketOutcome::Ignored(_)
        ));
        assert_eq!(asm.in_flight_frames(), vec![5]);
    }

    #[test]
    fn test_two_fem_frame_waits_for_both() {
        let (mut asm, _) = assembler("61649:0,61650:1", 2);
        assert!(deliver(&mut asm, 8, &[0, 1, 2, 3], 61650).is_none());
        assert_eq!(asm.frame(8).unwrap().header().active_fems(), &[1]);
        let buffer = deliver(&mut asm, 8, &[2, 0, 3, 1], 61649).expect("complete");
        assert_eq!(buffer.header().active_fems(), &[1, 0]);
        assert_eq!(buffer.header().total_packets_received, 8);
    }

    #[test]
    fn test_pool_exhaustion_evicts_oldest() {
        let (mut asm, loss) = assembler("61649:0", 1);
        let now = Instant::now();
        asm.process_packet(&packet(1, 0), 61649, now);
        asm.process_packet(&packet(1, 2), 61649, now);
        assert!(matches!(asm.process_packet(&packet(2, 0), 61649, now), PacketOutcome::Stored { frame_number: 2 }));

        let snap = loss.snapshot();
        assert_eq!(snap.frames_evicted, 1);
        assert_eq!(snap.packets_lost, 2);
        assert_eq!(snap.fem_packets_lost[0], 2);
        assert_eq!(asm.in_flight_frames(), vec![2]);
        assert_eq!(asm.frame(2).unwrap().header().total_packets_received, 1);
    }

    #[test]
    fn test_no_buffer_to_evict_loses_packet() {
        let (mut asm, loss) = assembler("61649:0", 1);
        let held = deliver(&mut asm, 1, &[0, 1, 2, 3], 61649).unwrap();
        assert!(matches!(
            asm.process_packet(&packet(2, 0), 61649, Instant::now()),
            PacketOutcome::Discarded(PacketError::BufferPoolExhausted(2))
        ));
        let snap = loss.snapshot();
        assert_eq!(snap.packets_unbuffered, 1);
        assert_eq!(snap.packets_lost, 1);
        asm.release(held);
    }

    #[test]
    fn test_timeout_hands_out_dropped_frame() {
        let (mut asm, loss) = assembler("61649:0", 2);
        let start = Instant::now();
        for p in [0, 1, 2] {
            asm.process_packet(&packet(7, p), 61649, start);
        }
        assert!(asm.monitor_buffers(start + Duration::from_millis(99)).is_empty());
        let expired = asm.monitor_buffers(start + Duration::from_millis(100));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].header().frame_state, FrameState::Dropped);
        assert_eq!(expired[0].header().total_packets_received, 3);
        assert_eq!(loss.snapshot().frames_timed_out, 1);
        assert!(asm.in_flight_frames().is_empty());
    }

    #[test]
    fn test_flush_drops_everything() {
        let (mut asm, loss) = assembler("61649:0", 3);
        let now = Instant::now();
        asm.process_packet(&packet(1, 0), 61649, now);
        asm.process_packet(&packet(2, 3), 61649, now);
        let flushed = asm.flush();
        assert_eq!(flushed.len(), 2);
        assert!(flushed.iter().all(|b| b.header().frame_state == FrameState::Dropped));
        assert_eq!(loss.snapshot().frames_flushed, 2);
        assert!(asm.flush().is_empty());
    }

    #[test]
    fn test_duplicate_packet_discarded() {
        let (mut asm, loss) = assembler("61649:0", 1);
        let now = Instant::now();
        asm.process_packet(&packet(4, 1), 61649, now);
        assert!(matches!(
            asm.process_packet(&packet(4, 1), 61649, now),
            PacketOutcome::Discarded(PacketError::DuplicatePacket { packet_number: 1, .. })
        ));
        assert_eq!(loss.snapshot().packets_duplicate, 1);
        assert_eq!(asm.frame(4).unwrap().header().total_packets_received, 1);
    }

    #[test]
    fn test_malformed_packets_counted() {
        let (mut asm, loss) = assembler("61649:0", 1);
        let now = Instant::now();
        assert!(matches!(
            asm.process_packet(&[1, 2, 3], 61649, now),
            PacketOutcome::Discarded(PacketError::MalformedTrailer(_))
        ));

        let mut out_of_range = vec![0u8; 8];
        PacketTrailer { frame_number: 1, packet_number: 4, start_of_frame: false, end_of_frame: false }
            .append_to(&mut out_of_range);
        assert!(matches!(
            asm.process_packet(&out_of_range, 61649, now),
            PacketOutcome::Discarded(PacketError::PacketOutOfRange { packet_number: 4, .. })
        ));

        let mut oversized = vec![0u8; 9];
        PacketTrailer { frame_number: 1, packet_number: 0, start_of_frame: true, end_of_frame: false }
            .append_to(&mut oversized);
        assert!(matches!(
            asm.process_packet(&oversized, 61649, now),
            PacketOutcome::Discarded(PacketError::OversizedPayload { len: 9, .. })
        ));

        assert_eq!(loss.snapshot().packets_malformed, 3);
        assert!(asm.in_flight_frames().is_empty());
    }

    #[test]
    fn test_extra_markers_prevent_completion() {
        let (mut asm, _) = assembler("61649:0", 1);
        let now = Instant::now();
        let mut datagram = packet(9, 1);
        let len = datagram.len();
        datagram.truncate(len - crate::trailer::TRAILER_SIZE);
        PacketTrailer { frame_number: 9, packet_number: 1, start_of_frame: true, end_of_frame: false }
            .append_to(&mut datagram);
        asm.process_packet(&datagram, 61649, now);
        assert!(deliver(&mut asm, 9, &[0, 2, 3], 61649).is_none());
        let header = asm.frame(9).unwrap().header();
        assert_eq!(header.total_packets_received, 4);
        assert_eq!(header.total_sof_marker_count, 2);
    }

    #[test]
    fn test_reconfigure_flushes_on_routing_change() {
        let (mut asm, _) = assembler("61649:0", 2);
        asm.process_packet(&packet(1, 0), 61649, Instant::now());
        let flushed = asm
            .reconfigure(layout(), FemPortMap::parse("61650:0").unwrap(), Duration::from_millis(50))
            .unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(asm.port_map().ports(), vec![61650]);

        let bigger = FrameLayout::custom(16, 3, 8).unwrap();
        assert!(asm.reconfigure(bigger, FemPortMap::default(), Duration::from_millis(50)).is_err());
        assert_eq!(asm.port_map().ports(), vec![61650]);
    }
}
