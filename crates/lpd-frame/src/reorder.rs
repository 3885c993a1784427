//! Pixel reordering.
//!
//! A FEM streams its 16-bit samples in ASIC scan order: for each image,
//! pixel rows bottom-up, pixel columns left to right, then ASIC rows
//! bottom-up and ASIC columns left to right. Sample `s` of the stream sits at
//! offset `s % samples_per_packet` of packet `s / samples_per_packet`, and the
//! packet's storage slot comes from that FEM's receive state. Missing packets
//! read as zero.
//!
//! FEM `k` owns rows `k * height .. (k + 1) * height` of the composite image.
//! Odd FEMs are mounted upside down and are rotated 180 degrees within their
//! stripe.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use crate::definitions::{FrameLayout, MAX_NUM_FEMS};
use crate::error::{ConfigError, ReorderError};
use crate::frame::{FemReceiveState, FrameBuffer};
use crate::loss::{FrameLoss, LossAccumulator};

pub const DEFAULT_IMAGE_WIDTH: usize = 256;
pub const DEFAULT_IMAGE_HEIGHT: usize = 256;
pub const DEFAULT_NUM_IMAGES: usize = 20;
pub const DEFAULT_ASIC_ROWS: usize = 8;
pub const DEFAULT_ASIC_COLS: usize = 16;

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Per-FEM image geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub width: usize,
    pub height: usize,
    /// Images carried by one frame.
    pub num_images: usize,
    pub asic_rows: usize,
    pub asic_cols: usize,
}

impl ImageGeometry {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("image_width", self.width),
            ("image_height", self.height),
            ("num_images", self.num_images),
            ("asic_rows", self.asic_rows),
            ("asic_cols", self.asic_cols),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue { key, reason: "must be positive".into() });
            }
        }
        if self.width % self.asic_cols != 0 {
            return Err(ConfigError::InvalidValue {
                key: "image_width",
                reason: format!("{} not divisible by {} ASIC columns", self.width, self.asic_cols),
            });
        }
        if self.height % self.asic_rows != 0 {
            return Err(ConfigError::InvalidValue {
                key: "image_height",
                reason: format!("{} not divisible by {} ASIC rows", self.height, self.asic_rows),
            });
        }
        if self.frame_pixels(MAX_NUM_FEMS).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "image_width",
                reason: format!(
                    "{}x{} pixels, {} images per frame, {} FEMs overflows the image size",
                    self.width, self.height, self.num_images, MAX_NUM_FEMS
                ),
            });
        }
        Ok(())
    }

    pub fn pixels_per_image(&self) -> usize {
        self.width * self.height
    }

    /// Pixels across every composite image of a frame with `stripes` FEM
    /// stripes, or `None` if the count does not fit in `usize`.
    pub fn frame_pixels(&self, stripes: usize) -> Option<usize> {
        self.width
            .checked_mul(self.height)?
            .checked_mul(stripes)?
            .checked_mul(self.num_images)
    }

    fn asic_pixel_rows(&self) -> usize {
        self.height / self.asic_rows
    }

    fn asic_pixel_cols(&self) -> usize {
        self.width / self.asic_cols
    }
}

impl Default for ImageGeometry {
    fn default() -> Self {
        Self {
            width: DEFAULT_IMAGE_WIDTH,
            height: DEFAULT_IMAGE_HEIGHT,
            num_images: DEFAULT_NUM_IMAGES,
            asic_rows: DEFAULT_ASIC_ROWS,
            asic_cols: DEFAULT_ASIC_COLS,
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorderedImage {
    pub frame_number: u32,
    /// Index of the image within its frame.
    pub image_number: u32,
    /// Sequence number across every image emitted by this reorderer.
    pub image_counter: u64,
    pub width: usize,
    pub height: usize,
    /// Row-major pixel plane.
    pub pixels: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetValues {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

/// Named, shaped array as handed to a downstream writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: &'static str,
    pub dims: Vec<usize>,
    pub values: DatasetValues,
}

impl ReorderedImage {
    pub fn pixel(&self, row: usize, col: usize) -> Option<u16> {
        if col >= self.width {
            return None;
        }
        self.pixels.get(row * self.width + col).copied()
    }

    /// The `data`, `img_num` and `frame_num` datasets of this image.
    pub fn into_datasets(self) -> [Dataset; 3] {
        [
            Dataset {
                name: "data",
                dims: vec![self.height, self.width],
                values: DatasetValues::U16(self.pixels),
            },
            Dataset { name: "img_num", dims: vec![1], values: DatasetValues::U32(vec![self.image_number]) },
            Dataset { name: "frame_num", dims: vec![1], values: DatasetValues::U32(vec![self.frame_number]) },
        ]
    }
}

/// Downstream consumer of reordered images.
pub trait ImageSink {
    fn push(&mut self, image: ReorderedImage) -> Result<(), ReorderError>;
}

impl ImageSink for Vec<ReorderedImage> {
    fn push(&mut self, image: ReorderedImage) -> Result<(), ReorderError> {
        Vec::push(self, image);
        Ok(())
    }
}

impl ImageSink for Sender<ReorderedImage> {
    fn push(&mut self, image: ReorderedImage) -> Result<(), ReorderError> {
        self.send(image).map_err(|_| ReorderError::SinkClosed)
    }
}

// ---------------------------------------------------------------------------
// Reorderer
// ---------------------------------------------------------------------------

pub struct PixelReorderer {
    layout: FrameLayout,
    geometry: ImageGeometry,
    image_counter: u64,
    loss: Arc<LossAccumulator>,
}

impl PixelReorderer {
    pub fn new(layout: FrameLayout, geometry: ImageGeometry, loss: Arc<LossAccumulator>) -> Self {
        Self { layout, geometry, image_counter: 0, loss }
    }

    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Images emitted so far.
    pub fn image_counter(&self) -> u64 {
        self.image_counter
    }

    pub fn set_geometry(&mut self, geometry: ImageGeometry) -> Result<(), ConfigError> {
        geometry.validate()?;
        self.geometry = geometry;
        Ok(())
    }

    pub fn set_layout(&mut self, layout: FrameLayout) {
        self.layout = layout;
    }

    /// Account the frame's loss, then emit `num_images` composite images.
    ///
    /// Works for complete and dropped frames alike. On error the images
    /// already pushed stay pushed.
    pub fn process_frame(
        &mut self,
        buffer: &FrameBuffer,
        sink: &mut dyn ImageSink,
    ) -> Result<FrameLoss, ReorderError> {
        let header = buffer.header();
        let loss = self.loss.record_frame(header, self.layout.packets_per_fem());
        self.loss.frames_processed.fetch_add(1, Relaxed);
        if loss.lost > 0 {
            tracing::debug!(
                frame = ?header.frame_number,
                lost = loss.lost,
                state = ?header.frame_state,
                "frame packet loss"
            );
        }

        let Some(max_fem) = header.max_active_fem_idx() else {
            tracing::debug!(frame = ?header.frame_number, "frame has no active FEMs; no images");
            return Ok(loss);
        };

        if let Err(e) = self.emit_images(buffer, max_fem as usize + 1, sink) {
            self.loss.frames_failed.fetch_add(1, Relaxed);
            tracing::error!(frame = ?header.frame_number, err = %e, "reorder aborted");
            return Err(e);
        }
        Ok(loss)
    }

    fn emit_images(
        &mut self,
        buffer: &FrameBuffer,
        stripes: usize,
        sink: &mut dyn ImageSink,
    ) -> Result<(), ReorderError> {
        let header = buffer.header();
        let frame_number = header.frame_number.unwrap_or_default();
        // Bounds every index computed below, including for unvalidated geometry.
        if self.geometry.frame_pixels(stripes).is_none() {
            return Err(ReorderError::ImageTooLarge {
                width: self.geometry.width,
                height: self.geometry.height,
                stripes,
                num_images: self.geometry.num_images,
            });
        }
        let width = self.geometry.width;
        let height = self.geometry.height * stripes;
        let pixels = width * height;

        for image in 0..self.geometry.num_images {
            let mut plane = Vec::new();
            plane
                .try_reserve_exact(pixels)
                .map_err(|source| ReorderError::AllocationFailure { pixels, source })?;
            plane.resize(pixels, 0u16);

            for (position, &fem_idx) in header.active_fems().iter().enumerate() {
                let (Some(rx), Some(region)) = (header.fem_rx_state(position), buffer.fem_region(position))
                else {
                    continue;
                };
                self.reorder_fem(rx, region, fem_idx as usize, image, &mut plane, frame_number);
            }

            sink.push(ReorderedImage {
                frame_number,
                image_number: image as u32,
                image_counter: self.image_counter,
                width,
                height,
                pixels: plane,
            })?;
            self.image_counter += 1;
            self.loss.images_emitted.fetch_add(1, Relaxed);
        }
        Ok(())
    }

    /// Scatter one image of one FEM's stream into its stripe of `plane`.
    fn reorder_fem(
        &self,
        rx: &FemReceiveState,
        region: &[u8],
        fem_idx: usize,
        image: usize,
        plane: &mut [u16],
        frame_number: u32,
    ) {
        let g = &self.geometry;
        let prows = g.asic_pixel_rows();
        let pcols = g.asic_pixel_cols();
        let spp = self.layout.samples_per_packet();
        let stripe_base = fem_idx * g.height;
        let rotated = fem_idx % 2 == 1;

        let mut sample = image * g.pixels_per_image();
        for pixel_row in (0..prows).rev() {
            for pixel_col in 0..pcols {
                for asic_row in (0..g.asic_rows).rev() {
                    for asic_col in 0..g.asic_cols {
                        let packet = sample / spp;
                        let offset = sample % spp;
                        sample += 1;

                        let value = match rx.slot(packet) {
                            Some(slot) => {
                                let at = self.layout.slot_offset(slot as usize) + offset * 2;
                                region.get(at..at + 2).map_or(0, |b| u16::from_le_bytes([b[0], b[1]]))
                            }
                            None => {
                                if offset == 0 {
                                    tracing::trace!(frame = frame_number, fem = fem_idx, packet, "missing packet");
                                }
                                0
                            }
                        };

                        let mut row = asic_row * prows + pixel_row;
                        let mut col = asic_col * pcols + pixel_col;
                        if rotated {
                            row = g.height - 1 - row;
                            col = g.width - 1 - col;
                        }
                        plane[(stripe_base + row) * g.width + col] = value;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameState;
    use std::time::SystemTime;

    // 4 samples per primary packet, 3 primaries + 1 tail: 16 samples per FEM.
    fn layout() -> FrameLayout {
        FrameLayout::custom(8, 3, 8).unwrap()
    }

    fn geometry() -> ImageGeometry {
        ImageGeometry { width: 4, height: 4, num_images: 1, asic_rows: 2, asic_cols: 2 }
    }

    /// Frame whose FEMs carry samples `base + s + 1`, skipping listed packets.
    fn frame(fems: &[(u8, u16)], skip: &[(u8, usize)]) -> FrameBuffer {
        let layout = layout();
        let mut buffer = FrameBuffer::new(layout.region_size);
        buffer.header_mut().claim(42, SystemTime::now());
        let spp = layout.samples_per_packet();
        for &(fem_idx, base) in fems {
            let pos = buffer.header_mut().activate_fem(fem_idx).unwrap();
            for p in 0..layout.packets_per_fem() {
                if skip.contains(&(fem_idx, p)) {
                    continue;
                }
                let payload: Vec<u8> = (0..spp)
                    .flat_map(|o| (base + (p * spp + o) as u16 + 1).to_le_bytes())
                    .collect();
                assert!(buffer.write_slot(pos, layout.slot_offset(p), 8, &payload));
                let header = buffer.header_mut();
                header.fem_rx_state_mut(pos).record(p, p as u16);
                header.total_packets_received += 1;
            }
        }
        buffer
    }

    fn reorderer() -> (PixelReorderer, Arc<LossAccumulator>) {
        let loss = LossAccumulator::new();
        (PixelReorderer::new(layout(), geometry(), loss.clone()), loss)
    }

    #[test]
    fn test_single_fem_reference_image() {
        let (mut r, loss) = reorderer();
        let mut out: Vec<ReorderedImage> = Vec::new();
        let frame_loss = r.process_frame(&frame(&[(0, 0)], &[]), &mut out).unwrap();
        assert_eq!(frame_loss.lost, 0);
        assert_eq!(out.len(), 1);
        let image = &out[0];
        assert_eq!((image.width, image.height), (4, 4));
        assert_eq!(image.frame_number, 42);
        assert_eq!(image.pixels, vec![11, 15, 12, 16, 3, 7, 4, 8, 9, 13, 10, 14, 1, 5, 2, 6]);
        assert_eq!(loss.snapshot().images_emitted, 1);
    }

    #[test]
    fn test_missing_packet_reads_zero() {
        let (mut r, loss) = reorderer();
        let mut out: Vec<ReorderedImage> = Vec::new();
        let mut buffer = frame(&[(0, 0)], &[(0, 1)]);
        buffer.header_mut().frame_state = FrameState::Dropped;
        let frame_loss = r.process_frame(&buffer, &mut out).unwrap();
        assert_eq!(frame_loss.lost, 1);
        assert_eq!(loss.snapshot().packets_lost, 1);

        let image = &out[0];
        for (row, col) in [(3, 1), (3, 3), (1, 1), (1, 3)] {
            assert_eq!(image.pixel(row, col), Some(0));
        }
        assert_eq!(image.pixel(0, 0), Some(11));
        assert_eq!(image.pixels.iter().filter(|&&p| p == 0).count(), 4);
    }

    #[test]
    fn test_odd_fem_rotated_in_its_stripe() {
        let (mut r, _) = reorderer();
        let mut out: Vec<ReorderedImage> = Vec::new();
        r.process_frame(&frame(&[(1, 100), (0, 0)], &[]), &mut out).unwrap();
        let image = &out[0];
        assert_eq!((image.width, image.height), (4, 8));

        let stripe0 = &image.pixels[..16];
        assert_eq!(stripe0, &[11, 15, 12, 16, 3, 7, 4, 8, 9, 13, 10, 14, 1, 5, 2, 6]);

        let upright: Vec<u16> =
            [11, 15, 12, 16, 3, 7, 4, 8, 9, 13, 10, 14, 1, 5, 2, 6].iter().map(|v| v + 100).collect();
        let stripe1: Vec<u16> = image.pixels[16..].iter().rev().copied().collect();
        assert_eq!(stripe1, upright);
    }

    #[test]
    fn test_stripe_follows_fem_index_not_arrival() {
        let (mut r, _) = reorderer();
        let mut out: Vec<ReorderedImage> = Vec::new();
        r.process_frame(&frame(&[(2, 0)], &[]), &mut out).unwrap();
        let image = &out[0];
        assert_eq!(image.height, 12);
        assert!(image.pixels[..32].iter().all(|&p| p == 0));
        assert_eq!(image.pixel(8, 0), Some(11));
    }

    #[test]
    fn test_no_active_fems_emits_nothing() {
        let (mut r, loss) = reorderer();
        let mut buffer = FrameBuffer::new(layout().region_size);
        buffer.header_mut().claim(5, SystemTime::now());
        let mut out: Vec<ReorderedImage> = Vec::new();
        let frame_loss = r.process_frame(&buffer, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(frame_loss.lost, 0);
        assert_eq!(loss.snapshot().frames_processed, 1);
    }

    #[test]
    fn test_multiple_images_and_counter() {
        let loss = LossAccumulator::new();
        let geometry = ImageGeometry { width: 2, height: 2, num_images: 4, asic_rows: 1, asic_cols: 1 };
        let mut r = PixelReorderer::new(layout(), geometry, loss);
        let mut out: Vec<ReorderedImage> = Vec::new();
        r.process_frame(&frame(&[(0, 0)], &[]), &mut out).unwrap();
        r.process_frame(&frame(&[(0, 0)], &[]), &mut out).unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(out.iter().map(|i| i.image_counter).collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
        assert_eq!(out[3].image_number, 3);
        // 1x1 ASIC grid: image i is samples 4i..4i+4, bottom row first.
        assert_eq!(out[1].pixels, vec![7, 8, 5, 6]);
        assert_eq!(r.image_counter(), 8);
    }

    #[test]
    fn test_closed_sink_fails_frame() {
        let (mut r, loss) = reorderer();
        let (mut tx, rx) = crossbeam_channel::unbounded::<ReorderedImage>();
        drop(rx);
        assert!(matches!(
            r.process_frame(&frame(&[(0, 0)], &[]), &mut tx),
            Err(ReorderError::SinkClosed)
        ));
        let snap = loss.snapshot();
        assert_eq!(snap.frames_failed, 1);
        assert_eq!(snap.images_emitted, 0);
    }

    #[test]
    fn test_set_geometry_validates() {
        let (mut r, _) = reorderer();
        let bad = ImageGeometry { width: 5, ..geometry() };
        assert!(r.set_geometry(bad).is_err());
        assert_eq!(r.geometry(), &geometry());
        assert!(r.set_geometry(ImageGeometry::default()).is_ok());
    }

    #[test]
    fn test_oversized_geometry_rejected() {
        let huge = ImageGeometry { width: 1 << 33, height: 1 << 33, num_images: 1, asic_rows: 1, asic_cols: 1 };
        assert!(matches!(huge.validate(), Err(ConfigError::InvalidValue { key: "image_width", .. })));
        assert_eq!(huge.frame_pixels(1), None);

        let (mut r, _) = reorderer();
        assert!(r.set_geometry(huge).is_err());
        assert_eq!(r.geometry(), &geometry());

        let many = ImageGeometry { num_images: usize::MAX / 16 + 1, ..geometry() };
        assert!(many.validate().is_err());
    }

    #[test]
    fn test_oversized_geometry_fails_frame_without_panic() {
        let loss = LossAccumulator::new();
        let huge = ImageGeometry { width: 1 << 33, height: 1 << 33, num_images: 1, asic_rows: 1, asic_cols: 1 };
        let mut r = PixelReorderer::new(layout(), huge, loss.clone());
        let mut out: Vec<ReorderedImage> = Vec::new();
        let mut buffer = frame(&[(0, 0)], &[(0, 1), (0, 2), (0, 3)]);
        buffer.header_mut().frame_state = FrameState::Dropped;
        assert!(matches!(
            r.process_frame(&buffer, &mut out),
            Err(ReorderError::ImageTooLarge { stripes: 1, .. })
        ));
        assert!(out.is_empty());
        let snap = loss.snapshot();
        assert_eq!(snap.frames_failed, 1);
        assert_eq!(snap.packets_lost, 3);

        // The reorderer keeps working once the geometry is fixed.
        r.set_geometry(geometry()).unwrap();
        r.process_frame(&frame(&[(0, 0)], &[]), &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_datasets() {
        let image = ReorderedImage {
            frame_number: 9,
            image_number: 2,
            image_counter: 0,
            width: 2,
            height: 1,
            pixels: vec![1, 2],
        };
        let [data, img_num, frame_num] = image.into_datasets();
        assert_eq!(data.name, "data");
        assert_eq!(data.dims, vec![1, 2]);
        assert_eq!(img_num.values, DatasetValues::U32(vec![2]));
        assert_eq!(frame_num.name, "frame_num");
        assert_eq!(frame_num.values, DatasetValues::U32(vec![9]));
    }
}
