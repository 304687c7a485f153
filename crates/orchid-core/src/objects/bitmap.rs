// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-width port bitmap, one per cluster.
//!
//! Tracks VNC port occupancy as a bit per port offset. The bitmap persists
//! with its cluster as a base64 blob and mirrors the GRAPHICS/PORT
//! attribute of every live VM placed in that cluster.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a port could not be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// The port falls outside the bitmap's range.
    OutOfRange,
    /// The port is already reserved.
    InUse,
    /// No free port left in the bitmap.
    Exhausted,
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => f.write_str("port out of range"),
            Self::InUse => f.write_str("port already in use"),
            Self::Exhausted => f.write_str("no free port available"),
        }
    }
}

impl std::error::Error for PortError {}

/// A fixed-width bitmap of port offsets above a base port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBitmap {
    base: u16,
    ports: u32,
    #[serde(with = "blob")]
    bits: Vec<u8>,
}

impl PortBitmap {
    /// An empty bitmap of `ports` offsets starting at `base`.
    ///
    /// The width is clamped so `base + offset` always fits a port number.
    pub fn new(base: u16, ports: u32) -> Self {
        let ports = ports.min(65536 - base as u32);
        let bytes = ports.div_ceil(8) as usize;
        Self {
            base,
            ports,
            bits: vec![0u8; bytes],
        }
    }

    /// The first port this bitmap manages.
    pub fn base(&self) -> u16 {
        self.base
    }

    fn test(&self, offset: u32) -> bool {
        self.bits[(offset / 8) as usize] & (1 << (offset % 8)) != 0
    }

    fn mark(&mut self, offset: u32) {
        self.bits[(offset / 8) as usize] |= 1 << (offset % 8);
    }

    fn clear(&mut self, offset: u32) {
        self.bits[(offset / 8) as usize] &= !(1 << (offset % 8));
    }

    fn offset_of(&self, port: u16) -> Option<u32> {
        let p = port as u32;
        let b = self.base as u32;
        if p < b || p - b >= self.ports {
            None
        } else {
            Some(p - b)
        }
    }

    /// Reserve a port, preferring `base + vm_id` when that offset is free,
    /// probing for the lowest free offset otherwise.
    pub fn acquire(&mut self, vm_id: i64) -> Result<u16, PortError> {
        if vm_id >= 0 && (vm_id as u64) < self.ports as u64 {
            let preferred = vm_id as u32;
            if !self.test(preferred) {
                self.mark(preferred);
                return Ok(self.base + preferred as u16);
            }
        }
        for offset in 0..self.ports {
            if !self.test(offset) {
                self.mark(offset);
                return Ok(self.base + offset as u16);
            }
        }
        Err(PortError::Exhausted)
    }

    /// Reserve an explicitly requested port. Fails if it is already taken.
    pub fn set(&mut self, port: u16) -> Result<(), PortError> {
        let offset = self.offset_of(port).ok_or(PortError::OutOfRange)?;
        if self.test(offset) {
            return Err(PortError::InUse);
        }
        self.mark(offset);
        Ok(())
    }

    /// Release a reserved port. Returns whether the bit was set.
    pub fn release(&mut self, port: u16) -> bool {
        match self.offset_of(port) {
            Some(offset) if self.test(offset) => {
                self.clear(offset);
                true
            }
            _ => false,
        }
    }

    /// Whether a port is currently reserved.
    pub fn in_use(&self, port: u16) -> bool {
        self.offset_of(port).map(|o| self.test(o)).unwrap_or(false)
    }

    /// Number of reserved ports.
    pub fn reserved(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }
}

/// base64 codec for the persisted bitmap blob.
mod blob {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
