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

/// Backing memory of a ring: `depth` cells of `cell_size` bytes each,
/// addressed by ring position.
#[derive(Debug)]
pub(crate) struct CellArena {
    cell_size: usize,
    bytes: Vec<u8>,
}

impl CellArena {
    pub(crate) fn new(depth: u32, cell_size: u32) -> Self {
        let cell_size = cell_size as usize;
        Self {
            cell_size,
            bytes: vec![0; depth as usize * cell_size],
        }
    }

    /// Copy encoded cells into the ring starting at `pos`, wrapping at the
    /// end of the arena.
    pub(crate) fn write(&mut self, pos: u16, cells: &[u8]) {
        let start = pos as usize * self.cell_size;
        let first = cells.len().min(self.bytes.len() - start);
        self.bytes[start..start + first].copy_from_slice(&cells[..first]);
        let rest = cells.len() - first;
        self.bytes[..rest].copy_from_slice(&cells[first..]);
    }

    /// Contiguous copy of `count` cells starting at `pos`.
    pub(crate) fn read(&self, pos: u16, count: u16) -> Vec<u8> {
        let len = count as usize * self.cell_size;
        let start = pos as usize * self.cell_size;
        let first = len.min(self.bytes.len() - start);
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&self.bytes[start..start + first]);
        out.extend_from_slice(&self.bytes[..len - first]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_wraps_around() {
        let mut arena = CellArena::new(4, 32);
        let cells: Vec<u8> = (0..96).map(|i| i as u8).collect();
        arena.write(3, &cells);
        let back = arena.read(3, 3);
        assert_eq!(back, cells);
        // the second cell landed at position 0
        assert_eq!(arena.read(0, 1), cells[32..64].to_vec());
    }
}
