//! Post-compression rate-distortion allocation.
//!
//! Collects every coded code-block, computes per-block truncation
//! hulls, and solves per-layer rate-distortion slope thresholds so the
//! cumulative packet stream meets the layer byte budgets: exactly (by
//! bisection over simulated packet emission) for the layers marked for
//! optimization, analytically (log-log interpolation over a 64-bucket
//! slope summary, corrected by the previous layer's prediction error)
//! for the rest. Strictly single-threaded: it must have observed every
//! code-block before the first threshold is computed.

use crate::code_block::{BlockId, CodedBlock, TruncationPoint};
use crate::codestream::ProgressionOrder;
use crate::error::J2kError;
use crate::progression::{PacketSlot, TileProgressionInput, build_sequence};
use std::collections::{BTreeMap, HashMap};

/// Slopes below this floor cannot be distinguished from lossless by the
/// model; they snap to zero and everything is included.
const SLOPE_FLOOR: f64 = 1e-8;

/// Buckets in the log2-spaced slope summary.
const SUMMARY_BUCKETS: usize = 64;

/// Relative tolerance ending the bisection.
const BISECT_REL_TOL: f64 = 1e-3;
const BISECT_MAX_ITERS: usize = 32;

/// One quality layer target. `target_bytes` is cumulative over all
/// preceding layers; `None` means "take whatever is left" (only legal
/// for the last layer).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerSpec {
    pub target_bytes: Option<usize>,
    /// Solve exactly by bisection instead of estimating.
    pub optimize: bool,
}

/// A code-block's contribution to one packet.
#[derive(Debug, Clone, Copy)]
pub struct BlockContribution {
    pub id: BlockId,
    /// Byte range of the block's buffer newly included in this layer.
    pub rate_start: usize,
    pub rate_end: usize,
    /// Coding passes newly included.
    pub passes_added: usize,
}

/// One packet handed to the sink: everything a precinct contributes to
/// one layer.
#[derive(Debug)]
pub struct PacketRef<'a> {
    pub tile: u16,
    pub slot: PacketSlot,
    pub blocks: &'a [BlockContribution],
}

/// Byte cost reported by the sink for one packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketBody {
    pub header_len: usize,
    pub body_len: usize,
}

impl PacketBody {
    pub fn total(&self) -> usize {
        self.header_len + self.body_len
    }
}

/// The packet serializer, an opaque collaborator. `simulate` asks for
/// the byte cost without emitting anything.
pub trait PacketSink {
    fn encode_packet(&mut self, packet: &PacketRef<'_>, simulate: bool)
    -> Result<PacketBody, J2kError>;

    /// Whether real (non-simulated) packets can currently be written.
    fn is_packet_writable(&self) -> bool;
}

struct BlockEntry {
    coded: CodedBlock,
    hull: Vec<TruncationPoint>,
    precinct: u32,
}

/// 64-bucket log2-spaced summary of bytes per slope decade.
struct SlopeSummary {
    bytes: [u64; SUMMARY_BUCKETS],
}

impl SlopeSummary {
    fn new() -> Self {
        Self { bytes: [0; SUMMARY_BUCKETS] }
    }

    fn bucket_of(slope: f64) -> usize {
        // Bucket 0 holds the floor; each bucket spans one octave.
        let l = (slope.max(SLOPE_FLOOR) / SLOPE_FLOOR).log2();
        (l as usize).min(SUMMARY_BUCKETS - 1)
    }

    fn bucket_slope(i: usize) -> f64 {
        SLOPE_FLOOR * (i as f64).exp2()
    }

    fn record(&mut self, hull: &[TruncationPoint]) {
        let mut prev_rate = 0usize;
        for p in hull {
            self.bytes[Self::bucket_of(p.slope)] += (p.rate - prev_rate) as u64;
            prev_rate = p.rate;
        }
    }

    /// Estimate the slope threshold that keeps roughly `budget` bytes,
    /// interpolating log-log between the two nearest buckets.
    fn estimate_threshold(&self, budget: usize) -> f64 {
        let mut acc = 0u64;
        for i in (0..SUMMARY_BUCKETS).rev() {
            let next = acc + self.bytes[i];
            if next as usize >= budget {
                let hi = Self::bucket_slope(i + 1);
                let lo = Self::bucket_slope(i);
                if self.bytes[i] == 0 {
                    return lo;
                }
                // Fraction of this bucket we can afford.
                let f = (budget as f64 - acc as f64) / self.bytes[i] as f64;
                return (hi.ln() + f * (lo.ln() - hi.ln())).exp();
            }
            acc = next;
        }
        0.0
    }
}

/// The post-compression rate allocator.
pub struct RateAllocator {
    layers: Vec<LayerSpec>,
    /// Keyed by identity, never by arrival order: parallel coding may
    /// deliver blocks in any order within a component.
    blocks: BTreeMap<BlockId, BlockEntry>,
    summary: SlopeSummary,
}

impl RateAllocator {
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        assert!(!layers.is_empty(), "at least one layer is required");
        Self { layers, blocks: BTreeMap::new(), summary: SlopeSummary::new() }
    }

    /// Register one coded block and the precinct it belongs to.
    /// Completion order is irrelevant; identity comes from the id.
    pub fn add_block(&mut self, coded: CodedBlock, precinct: u32) {
        let hull = coded.truncation_points();
        self.summary.record(&hull);
        self.blocks.insert(coded.id, BlockEntry { coded, hull, precinct });
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Truncation index for a threshold: the last hull point, walking
    /// from the coarse end, whose slope stays at or above it.
    fn trunc_index(hull: &[TruncationPoint], threshold: f64) -> Option<usize> {
        let mut chosen = None;
        for (i, p) in hull.iter().enumerate() {
            if p.slope >= threshold {
                chosen = Some(i);
            } else {
                break;
            }
        }
        chosen
    }

    /// Contributions of one precinct's blocks for a candidate
    /// threshold, given what earlier layers already took.
    fn collect_contributions(
        &self,
        tile: u16,
        slot: PacketSlot,
        threshold: f64,
        included: &HashMap<BlockId, (usize, usize)>,
        out: &mut Vec<BlockContribution>,
    ) {
        out.clear();
        for (id, entry) in self.blocks.range(range_for(tile, slot)) {
            if entry.precinct != slot.precinct
                || id.resolution != slot.resolution
                || id.component != slot.component
            {
                continue;
            }
            let (prev_rate, prev_passes) = included.get(id).copied().unwrap_or((0, 0));
            let target = if threshold <= SLOPE_FLOOR {
                entry.hull.len().checked_sub(1)
            } else {
                Self::trunc_index(&entry.hull, threshold)
            };
            let (rate_end, passes) = match target {
                Some(i) => (entry.hull[i].rate, entry.hull[i].pass + 1),
                None => (prev_rate, prev_passes),
            };
            if rate_end < prev_rate {
                // Thresholds are non-increasing, so a later layer can
                // only extend earlier inclusions.
                continue;
            }
            out.push(BlockContribution {
                id: *id,
                rate_start: prev_rate,
                rate_end,
                passes_added: passes.saturating_sub(prev_passes),
            });
        }
    }

    /// Bytes the whole image costs for one layer at a candidate
    /// threshold, by simulated packet emission.
    fn simulate_layer(
        &self,
        sequences: &[Vec<PacketSlot>],
        layer: u16,
        threshold: f64,
        included: &HashMap<BlockId, (usize, usize)>,
        sink: &mut dyn PacketSink,
    ) -> Result<usize, J2kError> {
        let mut total = 0usize;
        let mut contributions = Vec::new();
        for (tile_idx, seq) in sequences.iter().enumerate() {
            for slot in seq.iter().filter(|s| s.layer == layer) {
                self.collect_contributions(
                    tile_idx as u16,
                    *slot,
                    threshold,
                    included,
                    &mut contributions,
                );
                let body = sink.encode_packet(
                    &PacketRef { tile: tile_idx as u16, slot: *slot, blocks: &contributions },
                    true,
                )?;
                total += body.total();
            }
        }
        Ok(total)
    }

    fn max_slope(&self) -> f64 {
        self.blocks
            .values()
            .filter_map(|e| e.hull.first())
            .map(|p| p.slope)
            .fold(SLOPE_FLOOR, f64::max)
    }

    /// Commit a layer at a fixed threshold: record inclusions and
    /// return the bytes it added.
    fn commit_layer(
        &self,
        sequences: &[Vec<PacketSlot>],
        layer: u16,
        threshold: f64,
        included: &mut HashMap<BlockId, (usize, usize)>,
        sink: &mut dyn PacketSink,
        simulate: bool,
    ) -> Result<usize, J2kError> {
        let mut total = 0usize;
        let mut contributions = Vec::new();
        for (tile_idx, seq) in sequences.iter().enumerate() {
            for slot in seq.iter().filter(|s| s.layer == layer) {
                self.collect_contributions(
                    tile_idx as u16,
                    *slot,
                    threshold,
                    included,
                    &mut contributions,
                );
                let body = sink.encode_packet(
                    &PacketRef { tile: tile_idx as u16, slot: *slot, blocks: &contributions },
                    simulate,
                )?;
                total += body.total();
                for c in &contributions {
                    let entry = included.entry(c.id).or_insert((0, 0));
                    entry.0 = entry.0.max(c.rate_end);
                    entry.1 += c.passes_added;
                }
            }
        }
        Ok(total)
    }

    /// Solve all layer thresholds and emit every packet through the
    /// sink in the given progression order. Returns the slope threshold
    /// chosen per layer (non-increasing).
    pub fn allocate(
        &mut self,
        tiles: &[TileProgressionInput],
        order: ProgressionOrder,
        sink: &mut dyn PacketSink,
    ) -> Result<Vec<f64>, J2kError> {
        let sequences: Vec<Vec<PacketSlot>> =
            tiles.iter().map(|t| build_sequence(t, order)).collect();

        let mut thresholds = Vec::with_capacity(self.layers.len());
        let mut included: HashMap<BlockId, (usize, usize)> = HashMap::new();
        let mut cumulative = 0usize;
        // Actual-vs-predicted byte ratio observed in the previous
        // estimated layer.
        let mut correction = 1.0f64;
        let mut prev_threshold = f64::INFINITY;

        for layer_idx in 0..self.layers.len() {
            let layer = layer_idx as u16;
            let spec = self.layers[layer_idx];
            let budget = match spec.target_bytes {
                Some(t) => {
                    let layer_budget = t.saturating_sub(cumulative);
                    // The mandatory per-packet overhead cannot be
                    // truncated away; an empty layer still costs it.
                    let floor_bytes = self.simulate_layer(
                        &sequences,
                        layer,
                        f64::INFINITY,
                        &included,
                        sink,
                    )?;
                    if floor_bytes > layer_budget {
                        return Err(J2kError::RateInfeasible(format!(
                            "layer {layer} needs {floor_bytes} header bytes but only {layer_budget} remain"
                        )));
                    }
                    Some(layer_budget)
                }
                None => None,
            };

            let threshold = match budget {
                None => 0.0,
                Some(budget) if spec.optimize => {
                    // Bisect the slope until the simulated bytes meet
                    // the budget within tolerance.
                    let mut lo = SLOPE_FLOOR;
                    let mut hi = self.max_slope() * 2.0;
                    let mut best = hi;
                    for _ in 0..BISECT_MAX_ITERS {
                        let mid = ((lo.ln() + hi.ln()) * 0.5).exp();
                        let bytes = self.simulate_layer(
                            &sequences,
                            layer,
                            mid,
                            &included,
                            sink,
                        )?;
                        if bytes <= budget {
                            best = mid;
                            hi = mid;
                            if (budget - bytes) as f64 <= budget as f64 * BISECT_REL_TOL {
                                break;
                            }
                        } else {
                            lo = mid;
                        }
                        if hi / lo < 1.0 + BISECT_REL_TOL {
                            break;
                        }
                    }
                    if best <= SLOPE_FLOOR * 2.0 { 0.0 } else { best }
                }
                Some(budget) => {
                    // Analytic estimation from the slope summary,
                    // corrected by the previous layer's outcome.
                    let estimate = self.summary.estimate_threshold(
                        ((cumulative + budget) as f64 * correction) as usize,
                    );
                    if estimate <= SLOPE_FLOOR * 2.0 { 0.0 } else { estimate }
                }
            };

            // Layer thresholds never increase.
            let threshold = threshold.min(prev_threshold);
            prev_threshold = threshold;
            thresholds.push(threshold);

            let actual = self.commit_layer(&sequences, layer, threshold, &mut included, sink, true)?;
            if let Some(budget) = budget {
                if actual > 0 && budget > 0 {
                    correction = budget as f64 / actual as f64;
                }
            }
            cumulative += actual;
        }

        // Thresholds fixed; emit everything for real, in order.
        if !sink.is_packet_writable() {
            return Err(J2kError::RateInfeasible("packet sink refuses output".into()));
        }
        let mut final_included: HashMap<BlockId, (usize, usize)> = HashMap::new();
        for layer_idx in 0..self.layers.len() {
            self.commit_layer(
                &sequences,
                layer_idx as u16,
                thresholds[layer_idx],
                &mut final_included,
                sink,
                false,
            )?;
        }
        Ok(thresholds)
    }
}

fn range_for(
    tile: u16,
    slot: PacketSlot,
) -> std::ops::RangeInclusive<BlockId> {
    let lo = BlockId {
        tile,
        component: slot.component,
        resolution: slot.resolution,
        orientation_rank: 0,
        index: 0,
    };
    let hi = BlockId {
        tile,
        component: slot.component,
        resolution: slot.resolution,
        orientation_rank: u8::MAX,
        index: u32::MAX,
    };
    lo..=hi
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit_io::ByteBuffer;
    use crate::code_block::SubbandOrientation;
    use crate::geometry::Rect;
    use crate::progression::{CompProgInfo, ResProgInfo};

    /// Sink that charges one header byte plus the body bytes.
    struct CountingSink {
        emitted: Vec<(PacketSlot, usize)>,
    }

    impl CountingSink {
        fn new() -> Self {
            Self { emitted: Vec::new() }
        }
    }

    impl PacketSink for CountingSink {
        fn encode_packet(
            &mut self,
            packet: &PacketRef<'_>,
            simulate: bool,
        ) -> Result<PacketBody, J2kError> {
            let body_len: usize =
                packet.blocks.iter().map(|b| b.rate_end - b.rate_start).sum();
            if !simulate {
                self.emitted.push((packet.slot, body_len));
            }
            Ok(PacketBody { header_len: 1, body_len })
        }

        fn is_packet_writable(&self) -> bool {
            true
        }
    }

    fn coded_block(id: BlockId, rates: &[usize], dists: &[f64]) -> CodedBlock {
        CodedBlock {
            id,
            data: ByteBuffer::new(),
            rates: rates.to_vec(),
            distortions: dists.to_vec(),
            terminated: vec![false; rates.len()],
            skipped_planes: 0,
            magbits: 8,
        }
    }

    fn one_precinct_tile(layers: u16) -> TileProgressionInput {
        TileProgressionInput {
            tile_rect: Rect { x0: 0, y0: 0, x1: 64, y1: 64 },
            num_layers: layers,
            components: vec![CompProgInfo {
                dx: 1,
                dy: 1,
                resolutions: vec![ResProgInfo {
                    npx: 1,
                    npy: 1,
                    rect: Rect { x0: 0, y0: 0, x1: 64, y1: 64 },
                    ppx: 15,
                    ppy: 15,
                    span_x: 1 << 15,
                    span_y: 1 << 15,
                }],
            }],
        }
    }

    fn populated_allocator(layers: Vec<LayerSpec>) -> RateAllocator {
        let mut alloc = RateAllocator::new(layers);
        for i in 0..4u32 {
            let id = BlockId::new(0, 0, 0, SubbandOrientation::LL, i);
            let base = 10 + i as usize;
            alloc.add_block(
                coded_block(
                    id,
                    &[base, base * 3, base * 6],
                    &[1000.0, 1400.0, 1500.0],
                ),
                0,
            );
        }
        alloc
    }

    #[test]
    fn thresholds_never_increase() {
        let layers = vec![
            LayerSpec { target_bytes: Some(60), optimize: true },
            LayerSpec { target_bytes: Some(150), optimize: true },
            LayerSpec { target_bytes: None, optimize: false },
        ];
        let mut alloc = populated_allocator(layers);
        let tiles = [one_precinct_tile(3)];
        let mut sink = CountingSink::new();
        let thresholds = alloc.allocate(&tiles, ProgressionOrder::Lrcp, &mut sink).unwrap();
        assert_eq!(thresholds.len(), 3);
        for w in thresholds.windows(2) {
            assert!(w[0] >= w[1], "{thresholds:?}");
        }
        // The final layer includes everything.
        assert_eq!(thresholds[2], 0.0);
    }

    #[test]
    fn optimized_layer_respects_budget() {
        let layers = vec![LayerSpec { target_bytes: Some(80), optimize: true }];
        let mut alloc = populated_allocator(layers);
        let tiles = [one_precinct_tile(1)];
        let mut sink = CountingSink::new();
        alloc.allocate(&tiles, ProgressionOrder::Lrcp, &mut sink).unwrap();
        let total: usize = sink.emitted.iter().map(|&(_, body)| body + 1).sum();
        assert!(total <= 80, "emitted {total} bytes for an 80-byte budget");
    }

    #[test]
    fn infeasible_budget_is_rejected() {
        // Four packets of mandatory header overhead cannot fit in 2
        // bytes, no matter the truncation.
        let layers = vec![LayerSpec { target_bytes: Some(0), optimize: true }];
        let mut alloc = populated_allocator(layers);
        let tiles = [one_precinct_tile(1)];
        let mut sink = CountingSink::new();
        let err = alloc.allocate(&tiles, ProgressionOrder::Lrcp, &mut sink).unwrap_err();
        assert!(matches!(err, J2kError::RateInfeasible(_)), "{err:?}");
    }

    #[test]
    fn final_emission_covers_every_slot_once() {
        let layers = vec![
            LayerSpec { target_bytes: Some(100), optimize: true },
            LayerSpec { target_bytes: None, optimize: false },
        ];
        let mut alloc = populated_allocator(layers);
        let tiles = [one_precinct_tile(2)];
        let mut sink = CountingSink::new();
        alloc.allocate(&tiles, ProgressionOrder::Lrcp, &mut sink).unwrap();
        assert_eq!(sink.emitted.len(), 2);
        assert_eq!(sink.emitted[0].0.layer, 0);
        assert_eq!(sink.emitted[1].0.layer, 1);
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let layers = vec![LayerSpec { target_bytes: None, optimize: false }];
        let mk = |i: u32| {
            coded_block(
                BlockId::new(0, 0, 0, SubbandOrientation::LL, i),
                &[8, 20],
                &[100.0, 150.0],
            )
        };
        let mut forward = RateAllocator::new(layers.clone());
        forward.add_block(mk(0), 0);
        forward.add_block(mk(1), 0);
        let mut backward = RateAllocator::new(layers);
        backward.add_block(mk(1), 0);
        backward.add_block(mk(0), 0);

        let tiles = [one_precinct_tile(1)];
        let mut s1 = CountingSink::new();
        let mut s2 = CountingSink::new();
        forward.allocate(&tiles, ProgressionOrder::Lrcp, &mut s1).unwrap();
        backward.allocate(&tiles, ProgressionOrder::Lrcp, &mut s2).unwrap();
        assert_eq!(s1.emitted, s2.emitted);
    }

    #[test]
    fn estimated_layer_between_optimized_ones() {
        let layers = vec![
            LayerSpec { target_bytes: Some(50), optimize: true },
            LayerSpec { target_bytes: Some(120), optimize: false },
            LayerSpec { target_bytes: None, optimize: false },
        ];
        let mut alloc = populated_allocator(layers);
        let tiles = [one_precinct_tile(3)];
        let mut sink = CountingSink::new();
        let thresholds = alloc.allocate(&tiles, ProgressionOrder::Lrcp, &mut sink).unwrap();
        for w in thresholds.windows(2) {
            assert!(w[0] >= w[1]);
        }
    }
}
