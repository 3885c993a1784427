//! Port → FEM routing table.
//!
//! Built once from the `fem_port_map` configuration string, a comma-separated
//! list of `port:index` pairs, e.g. `"61649:0,61650:1"`.

use std::collections::HashMap;

use crate::definitions::MAX_NUM_FEMS;
use crate::error::ConfigError;

pub const DEFAULT_FEM_PORT_MAP: &str = "61649:0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FemPortMapEntry {
    /// Logical FEM index; selects the stripe of the composite image.
    pub fem_idx: u8,
    /// Position of the entry in the configuration string.
    pub buffer_slot: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FemPortMap {
    entries: HashMap<u16, FemPortMapEntry>,
}

impl FemPortMap {
    pub fn parse(map: &str) -> Result<Self, ConfigError> {
        let mut entries = HashMap::new();
        let mut seen_fems = [false; MAX_NUM_FEMS];

        for (buffer_slot, raw) in map.split(',').map(str::trim).filter(|s| !s.is_empty()).enumerate() {
            let (port, index) = raw
                .split_once(':')
                .ok_or_else(|| ConfigError::MalformedPortMapEntry(raw.to_string()))?;
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::MalformedPortMapEntry(raw.to_string()))?;
            let index: u32 = index
                .trim()
                .parse()
                .map_err(|_| ConfigError::MalformedPortMapEntry(raw.to_string()))?;

            if index as usize >= MAX_NUM_FEMS {
                return Err(ConfigError::FemIndexOutOfRange { index, max: MAX_NUM_FEMS - 1 });
            }
            let fem_idx = index as u8;
            if seen_fems[fem_idx as usize] {
                return Err(ConfigError::DuplicateFem(fem_idx));
            }
            seen_fems[fem_idx as usize] = true;

            if entries.insert(port, FemPortMapEntry { fem_idx, buffer_slot }).is_some() {
                return Err(ConfigError::DuplicatePort(port));
            }
        }

        if entries.is_empty() {
            return Err(ConfigError::EmptyPortMap);
        }
        Ok(Self { entries })
    }

    /// Route a packet by the port it arrived on. `None` is the illegal-FEM case.
    #[inline]
    pub fn lookup(&self, port: u16) -> Option<FemPortMapEntry> {
        self.entries.get(&port).copied()
    }

    /// Number of FEMs expected to contribute to every frame.
    pub fn num_fems(&self) -> usize {
        self.entries.len()
    }

    /// Configured ports in configuration order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<(usize, u16)> =
            self.entries.iter().map(|(port, e)| (e.buffer_slot, *port)).collect();
        ports.sort_unstable();
        ports.into_iter().map(|(_, port)| port).collect()
    }
}

impl Default for FemPortMap {
    fn default() -> Self {
        let mut entries = HashMap::new();
        entries.insert(61649, FemPortMapEntry { fem_idx: 0, buffer_slot: 0 });
        Self { entries }
    }
}
