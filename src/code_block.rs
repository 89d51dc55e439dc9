//! Code-block data model: the quantized-coefficient rectangle handed in
//! by the wavelet/quantization stage, and the coded result handed on to
//! the rate allocator and packetizer.

use crate::bit_io::ByteBuffer;

/// Orientation of a wavelet subband.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubbandOrientation {
    /// Low-Low (base image)
    #[default]
    LL,
    /// High-Low (horizontal details)
    HL,
    /// Low-High (vertical details)
    LH,
    /// High-High (diagonal details)
    HH,
}

/// Identity of a code-block inside the image decomposition. The rate
/// allocator keys on this, never on arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub tile: u16,
    pub component: u16,
    pub resolution: u8,
    pub orientation_rank: u8,
    pub index: u32,
}

impl BlockId {
    pub fn new(
        tile: u16,
        component: u16,
        resolution: u8,
        orientation: SubbandOrientation,
        index: u32,
    ) -> Self {
        let orientation_rank = match orientation {
            SubbandOrientation::LL => 0,
            SubbandOrientation::HL => 1,
            SubbandOrientation::LH => 2,
            SubbandOrientation::HH => 3,
        };
        Self { tile, component, resolution, orientation_rank, index }
    }
}

/// Sign bit position in the sign-magnitude sample representation.
pub const SIGN_BIT: u32 = 0x8000_0000;

/// A rectangle of quantized wavelet coefficients to be entropy coded.
///
/// Samples are in sign-magnitude form, sign in bit 31. The coder never
/// mutates `width`/`height`/`offset`; it only reads the data array.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub id: BlockId,
    pub data: Vec<i32>,
    pub width: usize,
    pub height: usize,
    /// Index of the first sample inside `data`.
    pub offset: usize,
    /// Row stride inside `data`.
    pub scan_width: usize,
    pub orientation: SubbandOrientation,
    /// Number of magnitude bit-planes, including any ROI up-shift.
    pub magbits: u8,
    /// Samples boosted by the max-shift region of interest.
    pub roi_coeff_count: usize,
    /// Squared wavelet-basis norm for MSE weighting.
    pub mse_weight: f64,
}

impl CodeBlock {
    pub fn new(
        id: BlockId,
        data: Vec<i32>,
        width: usize,
        height: usize,
        orientation: SubbandOrientation,
        magbits: u8,
    ) -> Self {
        debug_assert!(width.is_power_of_two() && height.is_power_of_two());
        debug_assert!((4..=1024).contains(&width) && (4..=1024).contains(&height));
        debug_assert!(width * height <= 4096);
        debug_assert!(data.len() >= width * height);
        Self {
            id,
            data,
            width,
            height,
            offset: 0,
            scan_width: width,
            orientation,
            magbits,
            roi_coeff_count: 0,
            mse_weight: 1.0,
        }
    }

    pub fn sample(&self, x: usize, y: usize) -> i32 {
        self.data[self.offset + y * self.scan_width + x]
    }

    /// Magnitude of the sample at (x, y), sign bit stripped.
    pub fn magnitude(&self, x: usize, y: usize) -> u32 {
        self.sample(x, y) as u32 & !SIGN_BIT
    }
}

/// One valid truncation point on a code-block's convex hull.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncationPoint {
    /// Coding pass index (0-based, cumulative).
    pub pass: usize,
    /// Total bytes needed to decode through this pass.
    pub rate: usize,
    /// Distortion decrease per byte relative to the previous hull point.
    pub slope: f64,
}

/// The outcome of coding one code-block: coded bytes plus the per-pass
/// rate/distortion/termination record the allocator truncates on.
#[derive(Debug, Clone)]
pub struct CodedBlock {
    pub id: BlockId,
    pub data: ByteBuffer,
    /// Cumulative byte count after each coding pass.
    pub rates: Vec<usize>,
    /// Cumulative distortion reduction after each coding pass.
    pub distortions: Vec<f64>,
    /// Whether the coder terminated the stream after each pass.
    pub terminated: Vec<bool>,
    /// All-zero most-significant planes skipped before the first pass.
    pub skipped_planes: u8,
    /// Magnitude bit-planes the block declared (for packet headers).
    pub magbits: u8,
}

impl CodedBlock {
    pub fn num_passes(&self) -> usize {
        self.rates.len()
    }

    /// Select the truncation points forming the convex hull of the
    /// (rate, distortion) curve. Slopes come out strictly decreasing;
    /// passes inside the hull are not valid truncation targets.
    pub fn truncation_points(&self) -> Vec<TruncationPoint> {
        #[derive(Clone, Copy)]
        struct Point {
            pass: usize,
            rate: usize,
            dist: f64,
            slope: f64,
        }
        let mut hull: Vec<Point> = Vec::new();
        let below = |hull: &[Point]| -> (usize, f64) {
            if hull.len() >= 2 {
                let p = hull[hull.len() - 2];
                (p.rate, p.dist)
            } else {
                (0, 0.0)
            }
        };
        for pass in 0..self.num_passes() {
            let rate = self.rates[pass];
            let dist = self.distortions[pass];
            // Peel off hull points the new candidate renders concave.
            while let Some(top) = hull.last().copied() {
                if rate <= top.rate {
                    break;
                }
                let s_new = (dist - top.dist) / (rate - top.rate) as f64;
                if s_new >= top.slope {
                    hull.pop();
                } else {
                    break;
                }
            }
            match hull.last().copied() {
                Some(top) if rate == top.rate => {
                    // Same byte count, more distortion gain: the later
                    // pass strictly dominates the earlier one.
                    if dist > top.dist {
                        let (br, bd) = below(&hull);
                        let top = hull.last_mut().expect("non-empty hull");
                        top.pass = pass;
                        top.dist = dist;
                        top.slope = (dist - bd) / (top.rate - br) as f64;
                    }
                }
                other => {
                    let (br, bd) = other.map_or((0, 0.0), |t| (t.rate, t.dist));
                    if rate > br && dist > bd {
                        let slope = (dist - bd) / (rate - br) as f64;
                        hull.push(Point { pass, rate, dist, slope });
                    }
                }
            }
        }
        hull.into_iter()
            .map(|p| TruncationPoint { pass: p.pass, rate: p.rate, slope: p.slope })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coded(rates: &[usize], dists: &[f64]) -> CodedBlock {
        CodedBlock {
            id: BlockId::new(0, 0, 0, SubbandOrientation::LL, 0),
            data: ByteBuffer::new(),
            rates: rates.to_vec(),
            distortions: dists.to_vec(),
            terminated: vec![false; rates.len()],
            skipped_planes: 0,
            magbits: 8,
        }
    }

    #[test]
    fn hull_slopes_strictly_decrease() {
        let cb = coded(&[10, 25, 30, 60, 80], &[100.0, 180.0, 190.0, 240.0, 250.0]);
        let hull = cb.truncation_points();
        assert!(!hull.is_empty());
        for w in hull.windows(2) {
            assert!(w[0].slope > w[1].slope, "{hull:?}");
        }
    }

    #[test]
    fn non_convex_pass_is_dropped() {
        // Pass 1 is a poor deal sandwiched between two better ones; the
        // hull must skip it.
        let cb = coded(&[10, 40, 50], &[100.0, 110.0, 200.0]);
        let hull = cb.truncation_points();
        assert!(hull.iter().all(|p| p.pass != 1), "{hull:?}");
    }

    #[test]
    fn zero_rate_pass_folds_into_previous() {
        let cb = coded(&[10, 10, 20], &[50.0, 60.0, 90.0]);
        let hull = cb.truncation_points();
        // The second pass costs nothing; truncating after pass 0 alone
        // is not on the hull.
        assert!(hull.iter().any(|p| p.pass == 1));
        assert!(hull.iter().all(|p| p.pass != 0));
    }
}
