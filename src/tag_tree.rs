//! Tag trees (ISO/IEC 15444-1 B.10.2): quad-tree coding of a 2-D grid
//! of non-negative integer thresholds with minimal redundant signaling.
//!
//! Packet headers use one independent instance per coded quantity per
//! precinct (inclusion layers, zero bit-planes). Node state only ever
//! grows: repeated queries with non-decreasing thresholds refine the
//! stored floors monotonically. Querying a leaf with a lower threshold
//! than previously requested, before its value is determined, is out of
//! contract for the caller and only tolerated once the value is known.

use crate::bit_io::{PacketBitReader, PacketBitWriter};
use crate::error::J2kError;

#[derive(Clone, Default, Debug)]
struct TagNode {
    value: u32,
    /// Lowest threshold proven so far; monotonically non-decreasing.
    low: u32,
    known: bool,
    parent: Option<u32>,
}

/// Flat quad-tree over a `w` x `h` leaf grid, leaves first, root last.
#[derive(Debug, Clone)]
pub struct TagTree {
    nodes: Vec<TagNode>,
    leaf_width: usize,
    leaf_height: usize,
    levels: u32,
    /// Min-propagation into interior nodes is redone lazily after leaf
    /// values change (encoder side only).
    dirty: bool,
    /// Per-level (start, width, height), leaves first.
    level_dims: Vec<(usize, usize, usize)>,
}

impl TagTree {
    /// `levels = ceil(log2(max(w, h))) + 1`, zero when either dimension
    /// is zero.
    pub fn new(w: usize, h: usize) -> Self {
        let mut nodes = Vec::new();
        let mut level_dims = Vec::new();
        let mut levels = 0u32;

        if w > 0 && h > 0 {
            let mut cur_start = 0usize;
            let mut cur_w = w;
            let mut cur_h = h;
            nodes.resize(w * h, TagNode::default());
            level_dims.push((cur_start, cur_w, cur_h));
            levels = 1;

            while cur_w > 1 || cur_h > 1 {
                let next_w = cur_w.div_ceil(2);
                let next_h = cur_h.div_ceil(2);
                let next_start = nodes.len();
                nodes.resize(next_start + next_w * next_h, TagNode::default());

                for y in 0..cur_h {
                    for x in 0..cur_w {
                        let child = cur_start + y * cur_w + x;
                        let parent = next_start + (y / 2) * next_w + (x / 2);
                        nodes[child].parent = Some(parent as u32);
                    }
                }

                cur_start = next_start;
                cur_w = next_w;
                cur_h = next_h;
                level_dims.push((cur_start, cur_w, cur_h));
                levels += 1;
            }
        }

        Self { nodes, leaf_width: w, leaf_height: h, levels, dirty: true, level_dims }
    }

    pub fn levels(&self) -> u32 {
        self.levels
    }

    /// Clear all coding state and leaf values.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            node.value = 0;
            node.low = 0;
            node.known = false;
        }
        self.dirty = true;
    }

    /// Set the value a leaf will encode. All leaves must be set before
    /// the first `encode` call.
    pub fn set_value(&mut self, x: usize, y: usize, value: u32) {
        assert!(x < self.leaf_width && y < self.leaf_height, "tag-tree leaf out of range");
        self.nodes[y * self.leaf_width + x].value = value;
        self.dirty = true;
    }

    /// Propagate subtree minima into the interior nodes.
    fn finalize(&mut self) {
        for &(start, w, h) in self.level_dims.iter().skip(1) {
            for i in start..start + w * h {
                self.nodes[i].value = u32::MAX;
            }
        }
        for &(start, w, h) in &self.level_dims[..self.level_dims.len().saturating_sub(1)] {
            for i in start..start + w * h {
                if let Some(p) = self.nodes[i].parent {
                    let v = self.nodes[i].value;
                    let p = p as usize;
                    if v < self.nodes[p].value {
                        self.nodes[p].value = v;
                    }
                }
            }
        }
        self.dirty = false;
    }

    fn path_to(&self, x: usize, y: usize) -> Vec<usize> {
        let mut path = Vec::with_capacity(self.levels as usize);
        let mut idx = y * self.leaf_width + x;
        loop {
            path.push(idx);
            match self.nodes[idx].parent {
                Some(p) => idx = p as usize,
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// Emit the bits proving, for the leaf at (x, y), whether its value
    /// is below `threshold`, resuming from whatever earlier calls
    /// already communicated.
    pub fn encode(&mut self, writer: &mut PacketBitWriter, x: usize, y: usize, threshold: u32) {
        assert!(x < self.leaf_width && y < self.leaf_height, "tag-tree leaf out of range");
        if self.dirty {
            self.finalize();
        }
        let mut floor = 0u32;
        for idx in self.path_to(x, y) {
            let node = &mut self.nodes[idx];
            if node.low < floor {
                node.low = floor;
            }
            while node.low < threshold && !node.known {
                if node.low < node.value {
                    writer.write_bit(1);
                    node.low += 1;
                } else {
                    writer.write_bit(0);
                    node.known = true;
                }
            }
            floor = node.low;
        }
    }

    /// Decoder-side walk: read decisions while the running floor is
    /// below `threshold`, converging toward the stored value. Returns
    /// `(low, known)` for the leaf; `known && low < threshold` means the
    /// value is proven below the threshold.
    pub fn update(
        &mut self,
        reader: &mut PacketBitReader<'_>,
        x: usize,
        y: usize,
        threshold: u32,
    ) -> Result<(u32, bool), J2kError> {
        assert!(x < self.leaf_width && y < self.leaf_height, "tag-tree leaf out of range");
        let mut floor = 0u32;
        for idx in self.path_to(x, y) {
            let node = &mut self.nodes[idx];
            if node.low < floor {
                node.low = floor;
            }
            while node.low < threshold && !node.known {
                if reader.read_bit()? == 1 {
                    node.low += 1;
                } else {
                    node.known = true;
                    node.value = node.low;
                }
            }
            floor = node.low;
        }
        let leaf = &self.nodes[y * self.leaf_width + x];
        Ok((leaf.low, leaf.known))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_count_matches_formula() {
        for (w, h, expect) in
            [(1, 1, 1), (2, 2, 2), (3, 3, 3), (4, 4, 3), (5, 1, 4), (1, 16, 5), (0, 4, 0)]
        {
            let tt = TagTree::new(w, h);
            assert_eq!(tt.levels(), expect, "{w}x{h}");
        }
    }

    #[test]
    fn parent_links_form_a_quad_tree() {
        let tt = TagTree::new(3, 3);
        assert_eq!(tt.nodes.len(), 9 + 4 + 1);
        assert_eq!(tt.nodes[0].parent, Some(9));
        assert_eq!(tt.nodes[8].parent, Some(12));
        assert_eq!(tt.nodes[13].parent, None);
    }

    fn roundtrip_grid(values: &[u32], w: usize, h: usize, thresholds: &[u32]) {
        let mut enc = TagTree::new(w, h);
        for y in 0..h {
            for x in 0..w {
                enc.set_value(x, y, values[y * w + x]);
            }
        }
        let mut writer = PacketBitWriter::new();
        for &t in thresholds {
            for y in 0..h {
                for x in 0..w {
                    enc.encode(&mut writer, x, y, t);
                }
            }
        }
        let bytes = writer.finish();

        let mut dec = TagTree::new(w, h);
        let mut reader = PacketBitReader::new(&bytes);
        for &t in thresholds {
            for y in 0..h {
                for x in 0..w {
                    let (low, known) = dec.update(&mut reader, x, y, t).unwrap();
                    let v = values[y * w + x];
                    if v < t {
                        assert!(known && low == v, "({x},{y}) t={t}: low={low} known={known}");
                    } else {
                        assert!(low >= t.min(v), "({x},{y}) t={t}: low={low}");
                    }
                }
            }
        }
    }

    #[test]
    fn roundtrip_small_grid() {
        roundtrip_grid(&[5, 2, 10, 0], 2, 2, &[1, 3, 6, 11]);
    }

    #[test]
    fn roundtrip_non_square() {
        let values = [3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8];
        roundtrip_grid(&values, 4, 3, &[2, 4, 10]);
    }

    #[test]
    fn roundtrip_single_leaf() {
        roundtrip_grid(&[5], 1, 1, &[5, 6]);
    }

    #[test]
    fn update_is_idempotent_once_known() {
        let mut enc = TagTree::new(2, 2);
        enc.set_value(0, 0, 1);
        enc.set_value(1, 0, 4);
        enc.set_value(0, 1, 2);
        enc.set_value(1, 1, 3);
        let mut writer = PacketBitWriter::new();
        enc.encode(&mut writer, 0, 0, 5);
        let bytes = writer.finish();

        let mut dec = TagTree::new(2, 2);
        let mut reader = PacketBitReader::new(&bytes);
        let (low, known) = dec.update(&mut reader, 0, 0, 5).unwrap();
        assert!(known);
        assert_eq!(low, 1);

        // Re-querying with the same or a lower threshold consumes no
        // bits and returns the determined value unchanged.
        let consumed = reader.position();
        for t in [5, 3, 1] {
            let (low2, known2) = dec.update(&mut reader, 0, 0, t).unwrap();
            assert_eq!((low2, known2), (1, true));
            assert_eq!(reader.position(), consumed);
        }
    }

    #[test]
    fn state_is_monotone_across_growing_thresholds() {
        let mut enc = TagTree::new(2, 1);
        enc.set_value(0, 0, 7);
        enc.set_value(1, 0, 2);
        let mut writer = PacketBitWriter::new();
        for t in 1..=8 {
            enc.encode(&mut writer, 0, 0, t);
            enc.encode(&mut writer, 1, 0, t);
        }
        let bytes = writer.finish();

        let mut dec = TagTree::new(2, 1);
        let mut reader = PacketBitReader::new(&bytes);
        let mut prev_low = 0;
        for t in 1..=8 {
            let (low, _) = dec.update(&mut reader, 0, 0, t).unwrap();
            assert!(low >= prev_low, "t={t}");
            prev_low = low;
            dec.update(&mut reader, 1, 0, t).unwrap();
        }
        assert_eq!(prev_low, 7);
    }
}
