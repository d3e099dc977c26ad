/*
Copyright 2025 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
 */

//! Ring Position Arithmetic
//!
//! A hardware command queue is a circular array of `depth` descriptor cells.
//! Both sides address it with positions in `0..depth`; the host producer
//! writes at `tail`, the device consumer retires from `head`:
//!
//! ```text
//!          head (consumer)             tail (producer)
//!            v                           v
//!   ┌────┬────┬────┬────┬────┬────┬────┬────┐
//!   │free│ in │ in │ in │ in │ in │ in │free│
//!   └────┴────┴────┴────┴────┴────┴────┴────┘
//!            └──────── in flight ───────┘
//! ```
//!
//! Positions are `u16` so a depth of 65536 is the largest ring that can be
//! addressed. All arithmetic is done in `u32` and reduced modulo depth.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("Ring depth {0} is outside 1..=65536")]
    InvalidDepth(u32),
    #[error("Position {0} is outside a ring of depth {1}")]
    PositionOutOfRange(u16, u32),
}

/// Geometry of a single ring: its depth and the modular operations over
/// positions in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    depth: u32,
}

impl RingGeometry {
    /// The largest depth a `u16` position can address.
    pub const MAX_DEPTH: u32 = 1 << 16;

    /// Create the geometry for a ring of `depth` cells.
    pub const fn new(depth: u32) -> Result<Self, RingError> {
        if depth == 0 || depth > Self::MAX_DEPTH {
            return Err(RingError::InvalidDepth(depth));
        }
        Ok(Self { depth })
    }

    /// Number of cells in the ring.
    #[inline]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Check that `pos` addresses a cell of this ring.
    #[inline]
    pub const fn check(&self, pos: u16) -> Result<u16, RingError> {
        if (pos as u32) < self.depth {
            Ok(pos)
        } else {
            Err(RingError::PositionOutOfRange(pos, self.depth))
        }
    }

    /// `pos + n`, wrapping at depth.
    #[inline]
    pub const fn add(&self, pos: u16, n: u32) -> u16 {
        ((pos as u32 + n % self.depth) % self.depth) as u16
    }

    /// Number of cells walked going forward from `from` to `to`.
    ///
    /// Equal positions give 0, the caller decides whether that means an
    /// empty or a full window.
    #[inline]
    pub const fn distance(&self, from: u16, to: u16) -> u32 {
        (to as u32 + self.depth - from as u32) % self.depth
    }

    /// Whether `pos` lies in the half-open window `[start, end)`.
    ///
    /// `start == end` is treated as an empty window.
    #[inline]
    pub const fn in_window(&self, pos: u16, start: u16, end: u16) -> bool {
        self.distance(start, pos) < self.distance(start, end)
    }

    /// Clamp a reclaim target so that at most `max` cells are walked past
    /// `head` in one call.
    ///
    /// Returns `target` unchanged when it is already within reach.
    #[inline]
    pub const fn limit(&self, head: u16, target: u16, max: u32) -> u16 {
        if self.distance(head, target) > max {
            self.add(head, max)
        } else {
            target
        }
    }
}
