//! Key/value configuration surface of the decoder.
//!
//! The same keys appear in the `[pipeline]` table of the config file and in
//! runtime configure requests. A request is validated as a whole before any of
//! it takes effect.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::assembler::DEFAULT_FRAME_TIMEOUT;
use crate::definitions::{BitDepth, FrameLayout};
use crate::error::ConfigError;
use crate::fem_map::{FemPortMap, DEFAULT_FEM_PORT_MAP};
use crate::reorder::ImageGeometry;

pub const FEM_PORT_MAP: &str = "fem_port_map";
pub const BIT_DEPTH: &str = "bit_depth";
pub const IMAGE_WIDTH: &str = "image_width";
pub const IMAGE_HEIGHT: &str = "image_height";
pub const NUM_IMAGES: &str = "num_images";
pub const ASIC_ROWS: &str = "asic_rows";
pub const ASIC_COLS: &str = "asic_cols";
pub const FRAME_TIMEOUT_MS: &str = "frame_timeout_ms";
pub const PACKETS_LOST: &str = "packets_lost";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub fem_port_map: String,
    pub bit_depth: BitDepth,
    pub image_width: usize,
    pub image_height: usize,
    pub num_images: usize,
    pub asic_rows: usize,
    pub asic_cols: usize,
    pub frame_timeout_ms: u64,
}

/// Settings turned into the typed values the stages run on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub layout: FrameLayout,
    pub port_map: FemPortMap,
    pub geometry: ImageGeometry,
    pub frame_timeout: Duration,
}

/// Outcome of a configure request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub settings: Settings,
    /// New value for the cumulative loss counter, if the request set one.
    pub packets_lost: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        let geometry = ImageGeometry::default();
        Self {
            fem_port_map: DEFAULT_FEM_PORT_MAP.to_string(),
            bit_depth: BitDepth::default(),
            image_width: geometry.width,
            image_height: geometry.height,
            num_images: geometry.num_images,
            asic_rows: geometry.asic_rows,
            asic_cols: geometry.asic_cols,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Settings {
    pub fn geometry(&self) -> ImageGeometry {
        ImageGeometry {
            width: self.image_width,
            height: self.image_height,
            num_images: self.num_images,
            asic_rows: self.asic_rows,
            asic_cols: self.asic_cols,
        }
    }

    pub fn resolve(&self) -> Result<ResolvedSettings, ConfigError> {
        let port_map = FemPortMap::parse(&self.fem_port_map)?;
        let geometry = self.geometry();
        geometry.validate()?;
        if self.frame_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: FRAME_TIMEOUT_MS,
                reason: "must be positive".into(),
            });
        }
        Ok(ResolvedSettings {
            layout: FrameLayout::for_bit_depth(self.bit_depth),
            port_map,
            geometry,
            frame_timeout: Duration::from_millis(self.frame_timeout_ms),
        })
    }

    /// Apply a configure request on top of `self`. Unknown keys are skipped.
    /// Nothing is changed unless every recognised key is valid.
    pub fn with_params(&self, params: &Map<String, Value>) -> Result<SettingsUpdate, ConfigError> {
        let mut next = self.clone();
        let mut packets_lost = None;

        for (key, value) in params {
            match key.as_str() {
                FEM_PORT_MAP => next.fem_port_map = as_string(FEM_PORT_MAP, value)?,
                BIT_DEPTH => next.bit_depth = as_string(BIT_DEPTH, value)?.parse()?,
                IMAGE_WIDTH => next.image_width = as_u64(IMAGE_WIDTH, value)? as usize,
                IMAGE_HEIGHT => next.image_height = as_u64(IMAGE_HEIGHT, value)? as usize,
                NUM_IMAGES => next.num_images = as_u64(NUM_IMAGES, value)? as usize,
                ASIC_ROWS => next.asic_rows = as_u64(ASIC_ROWS, value)? as usize,
                ASIC_COLS => next.asic_cols = as_u64(ASIC_COLS, value)? as usize,
                FRAME_TIMEOUT_MS => next.frame_timeout_ms = as_u64(FRAME_TIMEOUT_MS, value)?,
                PACKETS_LOST => packets_lost = Some(as_u64(PACKETS_LOST, value)?),
                other => tracing::debug!(key = other, "ignoring unknown configuration key"),
            }
        }

        next.resolve()?;
        Ok(SettingsUpdate { settings: next, packets_lost })
    }

    /// Current values as configure-request parameters.
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert(FEM_PORT_MAP.into(), Value::from(self.fem_port_map.clone()));
        params.insert(BIT_DEPTH.into(), Value::from(self.bit_depth.as_str()));
        params.insert(IMAGE_WIDTH.into(), Value::from(self.image_width));
        params.insert(IMAGE_HEIGHT.into(), Value::from(self.image_height));
        params.insert(NUM_IMAGES.into(), Value::from(self.num_images));
        params.insert(ASIC_ROWS.into(), Value::from(self.asic_rows));
        params.insert(ASIC_COLS.into(), Value::from(self.asic_cols));
        params.insert(FRAME_TIMEOUT_MS.into(), Value::from(self.frame_timeout_ms));
        params
    }
}

fn as_string(key: &'static str, value: &Value) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ConfigError::InvalidValue { key, reason: format!("expected a string, got {}", other) }),
    }
}

fn as_u64(key: &'static str, value: &Value) -> Result<u64, ConfigError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ConfigError::InvalidValue {
        key,
        reason: format!("expected a non-negative integer, got {}", value),
    })
}
