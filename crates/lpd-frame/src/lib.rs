pub mod assembler;
pub mod definitions;
pub mod error;
pub mod fem_map;
pub mod frame;
pub mod loss;
pub mod metrics;
pub mod pipeline;
pub mod receiver;
pub mod reorder;
pub mod settings;
pub mod trailer;

pub use assembler::{FrameAssembler, PacketOutcome};
pub use definitions::{BitDepth, FrameLayout};
pub use error::{ConfigError, PacketError, ReorderError};
pub use fem_map::{FemPortMap, FemPortMapEntry};
pub use frame::{FrameBuffer, FrameHeader, FramePool, FrameState};
pub use loss::{FrameLoss, LossAccumulator, LossSnapshot};
pub use pipeline::{Pipeline, PipelineOptions};
pub use receiver::{spawn_receivers, RawPacket};
pub use reorder::{ImageGeometry, ImageSink, PixelReorderer, ReorderedImage};
pub use settings::Settings;
pub use trailer::PacketTrailer;
