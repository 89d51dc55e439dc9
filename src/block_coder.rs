//! Bit-plane code-block coder (Tier-1 coding, ISO/IEC 15444-1 Annex D).
//!
//! Drives the MQ coder (or the raw bit output when bypass is active)
//! through the three pass types per bit-plane and produces the coded
//! bytes together with the per-pass rate/distortion curve the allocator
//! truncates on. The per-sample state machinery lives in [`CoderState`]
//! and is shared with the paired decoder.

use crate::bit_io::BitStuffWriter;
use crate::code_block::{CodeBlock, CodedBlock, SubbandOrientation};
use crate::coder_options::{CoderFlags, CoderOptions, TerminationPolicy};
use crate::mq_coder::{CTX_MR_BASE, CTX_RUN, CTX_SC_BASE, CTX_UNIFORM, CTX_ZC_BASE, MqEncoder};

// Per-sample coding state flags. One entry per coefficient in a
// border-padded array, so neighbor reads never bounds-check.
pub(crate) const SIG: u16 = 1 << 0;
pub(crate) const VISITED: u16 = 1 << 1;
/// Some 8-neighbor is significant. Must stay the OR of the neighbors'
/// SIG bits at all times; `set_significant` maintains it symmetrically.
pub(crate) const NZ_CTX: u16 = 1 << 2;
pub(crate) const REFINED: u16 = 1 << 3;
pub(crate) const NEG: u16 = 1 << 4;

/// Rows per coding stripe.
pub(crate) const STRIPE: usize = 4;

// Neighbor-significance bit positions used to key the zero-coding
// tables.
const NB_L: u32 = 0;
const NB_R: u32 = 1;
const NB_U: u32 = 2;
const NB_D: u32 = 3;
const NB_UL: u32 = 4;
const NB_UR: u32 = 5;
const NB_DL: u32 = 6;
const NB_DR: u32 = 7;

const fn zc_label_lh(h: u32, v: u32, d: u32) -> u8 {
    match (h, v, d) {
        (2, _, _) => 8,
        (1, v, _) if v >= 1 => 7,
        (1, 0, d) if d >= 1 => 6,
        (1, 0, 0) => 5,
        (0, 2, _) => 4,
        (0, 1, _) => 3,
        (0, 0, d) if d >= 2 => 2,
        (0, 0, 1) => 1,
        _ => 0,
    }
}

const fn zc_label_hh(h: u32, v: u32, d: u32) -> u8 {
    let hv = h + v;
    match (d, hv) {
        (d, _) if d >= 3 => 8,
        (2, hv) if hv >= 1 => 7,
        (2, 0) => 6,
        (1, hv) if hv >= 2 => 5,
        (1, 1) => 4,
        (1, 0) => 3,
        (0, hv) if hv >= 2 => 2,
        (0, 1) => 1,
        _ => 0,
    }
}

const fn build_zc_lut(kind: u8) -> [u8; 256] {
    let mut lut = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        let p = i as u32;
        let h = ((p >> NB_L) & 1) + ((p >> NB_R) & 1);
        let v = ((p >> NB_U) & 1) + ((p >> NB_D) & 1);
        let d = ((p >> NB_UL) & 1) + ((p >> NB_UR) & 1) + ((p >> NB_DL) & 1) + ((p >> NB_DR) & 1);
        lut[i] = match kind {
            0 => zc_label_lh(h, v, d),
            // HL transposes the roles of the horizontal and vertical
            // neighbors.
            1 => zc_label_lh(v, h, d),
            _ => zc_label_hh(h, v, d),
        };
        i += 1;
    }
    lut
}

static ZC_LUT_LH: [u8; 256] = build_zc_lut(0);
static ZC_LUT_HL: [u8; 256] = build_zc_lut(1);
static ZC_LUT_HH: [u8; 256] = build_zc_lut(2);

/// Sign-coding contexts and flip bits per (H+1)*3 + (V+1), Table D.3.
static SC_LUT: [(u8, u8); 9] =
    [(4, 1), (3, 1), (2, 1), (1, 1), (0, 0), (1, 0), (2, 0), (3, 0), (4, 0)];

// Fixed-point distortion-decrease tables, 7-bit index with the current
// plane's bit at position 6, 13 fractional bits. The lossless variants
// assume zero residual after the final plane. All values are exact in
// integer arithmetic: with x = i/64, x^2 * 8192 = 2*i^2.
const MSE_LKP_BITS: u32 = 7;
const MSE_LKP_MASK: u32 = (1 << MSE_LKP_BITS) - 1;
const MSE_FRAC: f64 = 8192.0;

const fn sq(v: i64) -> i64 {
    v * v
}

const fn build_mse_lut(kind: u8) -> [i64; 128] {
    let mut lut = [0i64; 128];
    let mut i = 0i64;
    while i < 128 {
        lut[i as usize] = match kind {
            // Significance, lossy: error drops from x^2 (reconstructed
            // at zero) to (x - 1.5)^2 (reconstructed mid-interval).
            0 => 2 * sq(i) - 2 * sq(i - 96),
            // Significance, final lossless plane: residual is zero.
            1 => 2 * sq(i),
            // Refinement, lossy: recentering from 1.0 to 0.5 or 1.5.
            2 => 2 * sq(i - 64) - 2 * sq(i - 32 - 64 * (i >> 6)),
            // Refinement, final lossless plane.
            _ => 2 * sq(i - 64),
        };
        i += 1;
    }
    lut
}

static FS_SIG_LOSSY: [i64; 128] = build_mse_lut(0);
static FS_SIG_LOSSLESS: [i64; 128] = build_mse_lut(1);
static FS_MR_LOSSY: [i64; 128] = build_mse_lut(2);
static FS_MR_LOSSLESS: [i64; 128] = build_mse_lut(3);

fn mse_index(mag: u32, plane: u32) -> usize {
    let windowed = if plane >= MSE_LKP_BITS - 1 {
        u64::from(mag) >> (plane - (MSE_LKP_BITS - 1))
    } else {
        u64::from(mag) << ((MSE_LKP_BITS - 1) - plane)
    };
    (windowed & u64::from(MSE_LKP_MASK)) as usize
}

/// Per-sample significance/visited/sign state for one code-block, with
/// a one-sample border so neighbor reads never branch on edges.
pub(crate) struct CoderState {
    state: Vec<u16>,
    padded_width: usize,
}

impl CoderState {
    pub(crate) fn new() -> Self {
        Self { state: Vec::new(), padded_width: 0 }
    }

    pub(crate) fn reset(&mut self, width: usize, height: usize) {
        self.padded_width = width + 2;
        let len = (width + 2) * (height + 2);
        self.state.clear();
        self.state.resize(len, 0);
    }

    #[inline]
    pub(crate) fn idx(&self, x: usize, y: usize) -> usize {
        (y + 1) * self.padded_width + (x + 1)
    }

    #[inline]
    pub(crate) fn get(&self, x: usize, y: usize) -> u16 {
        self.state[self.idx(x, y)]
    }

    #[inline]
    pub(crate) fn or_into(&mut self, x: usize, y: usize, flags: u16) {
        let i = self.idx(x, y);
        self.state[i] |= flags;
    }

    /// Neighbor-significance byte keying the zero-coding tables. In
    /// stripe-causal mode samples of the next stripe read as
    /// insignificant.
    pub(crate) fn neighbor_pattern(&self, x: usize, y: usize, causal: bool) -> u32 {
        let i = self.idx(x, y);
        let w = self.padded_width;
        let s = &self.state;
        let mask_down = causal && (y % STRIPE) == STRIPE - 1;
        let mut p = 0u32;
        p |= u32::from(s[i - 1] & SIG) << NB_L;
        p |= u32::from(s[i + 1] & SIG) << NB_R;
        p |= u32::from(s[i - w] & SIG) << NB_U;
        p |= u32::from(s[i - w - 1] & SIG) << NB_UL;
        p |= u32::from(s[i - w + 1] & SIG) << NB_UR;
        if !mask_down {
            p |= u32::from(s[i + w] & SIG) << NB_D;
            p |= u32::from(s[i + w - 1] & SIG) << NB_DL;
            p |= u32::from(s[i + w + 1] & SIG) << NB_DR;
        }
        p
    }

    pub(crate) fn zc_context(&self, orientation: SubbandOrientation, pattern: u32) -> usize {
        let label = match orientation {
            SubbandOrientation::LL | SubbandOrientation::LH => ZC_LUT_LH[pattern as usize],
            SubbandOrientation::HL => ZC_LUT_HL[pattern as usize],
            SubbandOrientation::HH => ZC_LUT_HH[pattern as usize],
        };
        CTX_ZC_BASE + label as usize
    }

    /// Sign-coding context and flip bit from the four primary
    /// neighbors' significance and sign.
    pub(crate) fn sign_context(&self, x: usize, y: usize, causal: bool) -> (usize, u8) {
        let i = self.idx(x, y);
        let w = self.padded_width;
        let contrib = |st: u16| -> i32 {
            if st & SIG == 0 {
                0
            } else if st & NEG != 0 {
                -1
            } else {
                1
            }
        };
        let h = (contrib(self.state[i - 1]) + contrib(self.state[i + 1])).clamp(-1, 1);
        let down = if causal && (y % STRIPE) == STRIPE - 1 {
            0
        } else {
            contrib(self.state[i + w])
        };
        let v = (contrib(self.state[i - w]) + down).clamp(-1, 1);
        let (label, flip) = SC_LUT[((h + 1) * 3 + (v + 1)) as usize];
        (CTX_SC_BASE + label as usize, flip)
    }

    /// Mark (x, y) significant and propagate the non-zero-context bit
    /// to all eight neighbors, suppressing updates into the previous
    /// stripe in causal mode.
    pub(crate) fn set_significant(&mut self, x: usize, y: usize, negative: bool, causal: bool) {
        let i = self.idx(x, y);
        let w = self.padded_width;
        self.state[i] |= SIG;
        if negative {
            self.state[i] |= NEG;
        }
        let skip_up = causal && (y % STRIPE) == 0;
        if !skip_up {
            self.state[i - w - 1] |= NZ_CTX;
            self.state[i - w] |= NZ_CTX;
            self.state[i - w + 1] |= NZ_CTX;
        }
        self.state[i - 1] |= NZ_CTX;
        self.state[i + 1] |= NZ_CTX;
        self.state[i + w - 1] |= NZ_CTX;
        self.state[i + w] |= NZ_CTX;
        self.state[i + w + 1] |= NZ_CTX;
    }

    pub(crate) fn mr_context(&self, x: usize, y: usize) -> usize {
        let st = self.get(x, y);
        if st & REFINED != 0 {
            CTX_MR_BASE + 2
        } else if st & NZ_CTX != 0 {
            CTX_MR_BASE + 1
        } else {
            CTX_MR_BASE
        }
    }

    pub(crate) fn clear_visited(&mut self) {
        for st in &mut self.state {
            *st &= !VISITED;
        }
    }

    /// A full stripe column with no significance, visit or neighbor
    /// context qualifies for the run-length shortcut.
    pub(crate) fn column_all_clear(&self, x: usize, y0: usize) -> bool {
        (y0..y0 + STRIPE).all(|y| self.get(x, y) & (SIG | VISITED | NZ_CTX) == 0)
    }
}

struct RawPassResult {
    sp_dist: f64,
    sp_rate: usize,
    sp_terminated: bool,
    mr_dist: f64,
    mr_rate: usize,
}

/// Reusable bit-plane coder. One instance per worker; the state array
/// is scratch reused across blocks.
pub struct BlockCoder {
    opts: CoderOptions,
    cs: CoderState,
}

impl BlockCoder {
    pub fn new(opts: CoderOptions) -> Self {
        Self { opts, cs: CoderState::new() }
    }

    pub fn options(&self) -> &CoderOptions {
        &self.opts
    }

    /// Encode one code-block, producing its coded bytes and the
    /// per-pass rate/distortion record.
    pub fn encode(&mut self, block: &CodeBlock) -> CodedBlock {
        self.cs.reset(block.width, block.height);

        let mut max_mag = 0u32;
        for y in 0..block.height {
            for x in 0..block.width {
                max_mag |= block.magnitude(x, y);
            }
        }

        let magbits = u32::from(block.magbits);
        if max_mag == 0 {
            return CodedBlock {
                id: block.id,
                data: MqEncoder::new().into_buffer(),
                rates: Vec::new(),
                distortions: Vec::new(),
                terminated: Vec::new(),
                skipped_planes: block.magbits,
                magbits: block.magbits,
            };
        }

        let top_plane = 31 - max_mag.leading_zeros();
        let skipped_planes = magbits.saturating_sub(top_plane + 1) as u8;

        let mut mq = MqEncoder::new();
        let mut rates: Vec<usize> = Vec::new();
        let mut dists: Vec<f64> = Vec::new();
        let mut terminated: Vec<bool> = Vec::new();
        // Indices of unterminated MQ passes whose rate estimates need a
        // final fixup once the stream is terminated.
        let mut estimated: Vec<usize> = Vec::new();
        let mut cumulative_dist = 0.0f64;

        let causal = self.opts.flags.contains(CoderFlags::CAUSAL);
        let term_all = self.opts.flags.contains(CoderFlags::TERM_ALL);
        let bypass = self.opts.flags.contains(CoderFlags::BYPASS);
        let reset_ctx = self.opts.flags.contains(CoderFlags::RESET_CTX);
        let pred = self.opts.termination == TerminationPolicy::Predictable;

        let mut planes_coded = 0u8;
        for plane in (0..=top_plane).rev() {
            let first_plane = plane == top_plane;
            let final_plane = plane == 0;
            let raw_plane = bypass && planes_coded >= self.opts.bypass_threshold;
            planes_coded = planes_coded.saturating_add(1);

            if !first_plane {
                if raw_plane {
                    // Significance propagation and refinement share one
                    // raw segment unless every pass terminates; the MQ
                    // cleanup that follows ends it either way.
                    let raw =
                        self.raw_passes(block, plane, &mut mq, causal, final_plane, pred, term_all);
                    cumulative_dist += raw.sp_dist;
                    rates.push(raw.sp_rate);
                    dists.push(cumulative_dist);
                    terminated.push(raw.sp_terminated);

                    cumulative_dist += raw.mr_dist;
                    rates.push(raw.mr_rate);
                    dists.push(cumulative_dist);
                    terminated.push(true);
                } else {
                    cumulative_dist +=
                        self.significance_pass(block, plane, &mut mq, causal, final_plane);
                    self.end_mq_pass(&mut mq, term_all, false, &mut rates, &mut terminated, &mut estimated);
                    dists.push(cumulative_dist);
                    if reset_ctx {
                        mq.reset_contexts();
                    }

                    cumulative_dist +=
                        self.refinement_pass(block, plane, &mut mq, final_plane);
                    self.end_mq_pass(&mut mq, term_all, false, &mut rates, &mut terminated, &mut estimated);
                    dists.push(cumulative_dist);
                    if reset_ctx {
                        mq.reset_contexts();
                    }
                }
            }

            cumulative_dist += self.cleanup_pass(block, plane, &mut mq, causal, final_plane);
            // The cleanup before a raw plane must terminate so the raw
            // segment starts byte-aligned.
            let next_raw = bypass && !final_plane && planes_coded >= self.opts.bypass_threshold;
            self.end_mq_pass(
                &mut mq,
                term_all || next_raw,
                final_plane,
                &mut rates,
                &mut terminated,
                &mut estimated,
            );
            dists.push(cumulative_dist);
            if reset_ctx {
                mq.reset_contexts();
            }
        }

        // Resolve the deferred length estimates now that the stream is
        // fully terminated.
        if !estimated.is_empty() {
            let mut pending: Vec<usize> = estimated.iter().map(|&i| rates[i]).collect();
            mq.finish_length_calculation(&mut pending, self.opts.length_calc);
            for (&i, &r) in estimated.iter().zip(&pending) {
                rates[i] = r;
            }
        }

        let data = mq.into_buffer();

        // A non-terminated pass whose last byte is an 0xFF sheds it; the
        // decoder synthesizes the omitted byte. Two passes in a row can
        // never both need this, since the byte after an 0xFF is stuffed.
        for i in 0..rates.len() {
            if !terminated[i] && rates[i] > 0 && data.byte_at(rates[i] - 1) == 0xFF {
                rates[i] -= 1;
            }
        }

        CodedBlock {
            id: block.id,
            data,
            rates,
            distortions: dists,
            terminated,
            skipped_planes,
            magbits: block.magbits,
        }
    }

    fn end_mq_pass(
        &self,
        mq: &mut MqEncoder,
        terminate: bool,
        last: bool,
        rates: &mut Vec<usize>,
        terminated: &mut Vec<bool>,
        estimated: &mut Vec<usize>,
    ) {
        if terminate || last {
            rates.push(mq.terminate(self.opts.termination));
            terminated.push(true);
        } else {
            estimated.push(rates.len());
            rates.push(mq.num_coded_bytes(self.opts.length_calc));
            terminated.push(false);
        }
    }

    fn code_sign_mq(&mut self, block: &CodeBlock, x: usize, y: usize, mq: &mut MqEncoder, causal: bool) {
        let negative = block.sample(x, y) < 0;
        let (ctx, flip) = self.cs.sign_context(x, y, causal);
        mq.code_symbol(u8::from(negative) ^ flip, ctx);
        self.cs.set_significant(x, y, negative, causal);
    }

    fn code_sign_raw(&mut self, block: &CodeBlock, x: usize, y: usize, raw: &mut BitStuffWriter<'_>, causal: bool) {
        let negative = block.sample(x, y) < 0;
        raw.write_bit(u8::from(negative));
        self.cs.set_significant(x, y, negative, causal);
    }

    /// Significance propagation: samples not yet significant with a
    /// significant neighbor.
    fn significance_pass(
        &mut self,
        block: &CodeBlock,
        plane: u32,
        mq: &mut MqEncoder,
        causal: bool,
        final_plane: bool,
    ) -> f64 {
        let mut dist_fixed = 0i64;
        let table: &[i64; 128] = if final_plane { &FS_SIG_LOSSLESS } else { &FS_SIG_LOSSY };
        for y0 in (0..block.height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(block.height);
            for x in 0..block.width {
                for y in y0..y1 {
                    let st = self.cs.get(x, y);
                    if st & (SIG | VISITED) != 0 || st & NZ_CTX == 0 {
                        continue;
                    }
                    let mag = block.magnitude(x, y);
                    let bit = ((mag >> plane) & 1) as u8;
                    let pattern = self.cs.neighbor_pattern(x, y, causal);
                    mq.code_symbol(bit, self.cs.zc_context(block.orientation, pattern));
                    if bit == 1 {
                        self.code_sign_mq(block, x, y, mq, causal);
                        dist_fixed += table[mse_index(mag, plane)];
                    }
                    self.cs.or_into(x, y, VISITED);
                }
            }
        }
        self.scale_dist(dist_fixed, plane, block.mse_weight)
    }

    /// Magnitude refinement: significant samples not touched by the
    /// significance pass of this plane.
    fn refinement_pass(
        &mut self,
        block: &CodeBlock,
        plane: u32,
        mq: &mut MqEncoder,
        final_plane: bool,
    ) -> f64 {
        let mut dist_fixed = 0i64;
        let table: &[i64; 128] = if final_plane { &FS_MR_LOSSLESS } else { &FS_MR_LOSSY };
        for y0 in (0..block.height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(block.height);
            for x in 0..block.width {
                for y in y0..y1 {
                    let st = self.cs.get(x, y);
                    if st & SIG == 0 || st & VISITED != 0 {
                        continue;
                    }
                    let mag = block.magnitude(x, y);
                    let bit = ((mag >> plane) & 1) as u8;
                    mq.code_symbol(bit, self.cs.mr_context(x, y));
                    self.cs.or_into(x, y, VISITED | REFINED);
                    dist_fixed += table[mse_index(mag, plane)];
                }
            }
        }
        self.scale_dist(dist_fixed, plane, block.mse_weight)
    }

    /// Both bypass passes of one plane: raw significance propagation and
    /// raw refinement, sharing one stuffed segment unless every pass
    /// terminates.
    fn raw_passes(
        &mut self,
        block: &CodeBlock,
        plane: u32,
        mq: &mut MqEncoder,
        causal: bool,
        final_plane: bool,
        pred: bool,
        term_all: bool,
    ) -> RawPassResult {
        let sig_table: &[i64; 128] = if final_plane { &FS_SIG_LOSSLESS } else { &FS_SIG_LOSSY };
        let mr_table: &[i64; 128] = if final_plane { &FS_MR_LOSSLESS } else { &FS_MR_LOSSY };
        let mse_weight = block.mse_weight;

        let mut sp_dist_fixed = 0i64;
        let mut raw = BitStuffWriter::new_continuing(mq.buffer_mut());
        for y0 in (0..block.height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(block.height);
            for x in 0..block.width {
                for y in y0..y1 {
                    let st = self.cs.get(x, y);
                    if st & (SIG | VISITED) != 0 || st & NZ_CTX == 0 {
                        continue;
                    }
                    let mag = block.magnitude(x, y);
                    let bit = ((mag >> plane) & 1) as u8;
                    raw.write_bit(bit);
                    if bit == 1 {
                        self.code_sign_raw(block, x, y, &mut raw, causal);
                        sp_dist_fixed += sig_table[mse_index(mag, plane)];
                    }
                    self.cs.or_into(x, y, VISITED);
                }
            }
        }
        let (sp_rate, sp_terminated) = if term_all {
            raw.terminate(pred);
            (raw.bytes_written(), true)
        } else {
            (raw.unterminated_len(), false)
        };

        let mut mr_dist_fixed = 0i64;
        for y0 in (0..block.height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(block.height);
            for x in 0..block.width {
                for y in y0..y1 {
                    let st = self.cs.get(x, y);
                    if st & SIG == 0 || st & VISITED != 0 {
                        continue;
                    }
                    let mag = block.magnitude(x, y);
                    raw.write_bit(((mag >> plane) & 1) as u8);
                    self.cs.or_into(x, y, VISITED | REFINED);
                    mr_dist_fixed += mr_table[mse_index(mag, plane)];
                }
            }
        }
        // The cleanup pass that follows is MQ coded, so the raw segment
        // always ends here.
        raw.terminate(pred);
        let mr_rate = raw.bytes_written();
        drop(raw);
        mq.resync_segment();

        RawPassResult {
            sp_dist: self.scale_dist(sp_dist_fixed, plane, mse_weight),
            sp_rate,
            sp_terminated,
            mr_dist: self.scale_dist(mr_dist_fixed, plane, mse_weight),
            mr_rate,
        }
    }

    /// Cleanup: everything still unvisited, with the four-sample
    /// run-length shortcut on all-clear columns. Clears the visited
    /// flags at the end.
    fn cleanup_pass(
        &mut self,
        block: &CodeBlock,
        plane: u32,
        mq: &mut MqEncoder,
        causal: bool,
        final_plane: bool,
    ) -> f64 {
        let mut dist_fixed = 0i64;
        let table: &[i64; 128] = if final_plane { &FS_SIG_LOSSLESS } else { &FS_SIG_LOSSY };
        for y0 in (0..block.height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(block.height);
            for x in 0..block.width {
                let mut y = y0;
                if y1 - y0 == STRIPE && self.cs.column_all_clear(x, y0) {
                    let run_break =
                        (y0..y1).find(|&yy| (block.magnitude(x, yy) >> plane) & 1 == 1);
                    match run_break {
                        None => {
                            mq.code_symbol(0, CTX_RUN);
                            continue;
                        }
                        Some(yb) => {
                            mq.code_symbol(1, CTX_RUN);
                            let r = (yb - y0) as u32;
                            mq.code_symbol(((r >> 1) & 1) as u8, CTX_UNIFORM);
                            mq.code_symbol((r & 1) as u8, CTX_UNIFORM);
                            let mag = block.magnitude(x, yb);
                            self.code_sign_mq(block, x, yb, mq, causal);
                            dist_fixed += table[mse_index(mag, plane)];
                            y = yb + 1;
                        }
                    }
                }
                for yy in y..y1 {
                    let st = self.cs.get(x, yy);
                    if st & (SIG | VISITED) != 0 {
                        continue;
                    }
                    let mag = block.magnitude(x, yy);
                    let bit = ((mag >> plane) & 1) as u8;
                    let pattern = self.cs.neighbor_pattern(x, yy, causal);
                    mq.code_symbol(bit, self.cs.zc_context(block.orientation, pattern));
                    if bit == 1 {
                        self.code_sign_mq(block, x, yy, mq, causal);
                        dist_fixed += table[mse_index(mag, plane)];
                    }
                }
            }
        }
        if self.opts.flags.contains(CoderFlags::SEG_SYMBOLS) {
            mq.code_symbol(1, CTX_UNIFORM);
            mq.code_symbol(0, CTX_UNIFORM);
            mq.code_symbol(1, CTX_UNIFORM);
            mq.code_symbol(0, CTX_UNIFORM);
        }
        self.cs.clear_visited();
        self.scale_dist(dist_fixed, plane, block.mse_weight)
    }

    fn scale_dist(&self, fixed: i64, plane: u32, weight: f64) -> f64 {
        (fixed as f64 / MSE_FRAC) * (1u64 << (2 * plane.min(30))) as f64 * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_block::{BlockId, SIGN_BIT};

    fn block_from(data: Vec<i32>, w: usize, h: usize) -> CodeBlock {
        CodeBlock::new(
            BlockId::new(0, 0, 0, SubbandOrientation::LL, 0),
            data,
            w,
            h,
            SubbandOrientation::LL,
            8,
        )
    }

    #[test]
    fn zc_tables_match_neighbor_counts() {
        // Two horizontal neighbors always give the strongest context.
        let both_h = (1 << NB_L) | (1 << NB_R);
        assert_eq!(ZC_LUT_LH[both_h as usize], 8);
        assert_eq!(ZC_LUT_HL[((1 << NB_U) | (1 << NB_D)) as usize], 8);
        // All-clear neighborhood is the weakest.
        assert_eq!(ZC_LUT_LH[0], 0);
        assert_eq!(ZC_LUT_HH[0], 0);
        // One diagonal in HH.
        assert_eq!(ZC_LUT_HH[1 << NB_UL], 3);
    }

    #[test]
    fn distortion_tables_match_the_reconstruction_model() {
        // A sample becoming significant always reduces error.
        for i in 64..128 {
            assert!(FS_SIG_LOSSY[i] > 0, "i={i}");
            assert!(FS_SIG_LOSSLESS[i] > 0, "i={i}");
        }
        // Refinement gains average out positive even though individual
        // samples near the old reconstruction point lose.
        let avg: i64 = FS_MR_LOSSY.iter().sum::<i64>() / 128;
        assert!(avg > 0, "average refinement gain {avg}");
        assert!(FS_MR_LOSSY[0] > 0);
        assert!(FS_MR_LOSSY[63] < 0);
        // The final lossless plane zeroes the residual, so its gain is
        // never negative.
        for i in 0..128 {
            assert!(FS_MR_LOSSLESS[i] >= 0, "i={i}");
        }
    }

    #[test]
    fn nz_context_invariant_holds_after_updates() {
        let mut cs = CoderState::new();
        cs.reset(8, 8);
        cs.set_significant(3, 3, false, false);
        // All eight neighbors see the significance.
        for (nx, ny) in
            [(2, 2), (3, 2), (4, 2), (2, 3), (4, 3), (2, 4), (3, 4), (4, 4)]
        {
            assert!(cs.get(nx, ny) & NZ_CTX != 0, "({nx},{ny})");
        }
        // A non-neighbor does not.
        assert_eq!(cs.get(5, 5) & NZ_CTX, 0);
    }

    #[test]
    fn causal_mode_suppresses_previous_stripe_updates() {
        let mut cs = CoderState::new();
        cs.reset(8, 8);
        // y = 4 is the first row of the second stripe.
        cs.set_significant(3, 4, false, true);
        assert_eq!(cs.get(3, 3) & NZ_CTX, 0);
        assert_eq!(cs.get(2, 3) & NZ_CTX, 0);
        assert!(cs.get(2, 4) & NZ_CTX != 0);
        assert!(cs.get(3, 5) & NZ_CTX != 0);
    }

    #[test]
    fn all_zero_block_codes_nothing() {
        let blk = block_from(vec![0; 16], 4, 4);
        let mut coder = BlockCoder::new(CoderOptions::default());
        let coded = coder.encode(&blk);
        assert_eq!(coded.num_passes(), 0);
        assert_eq!(coded.skipped_planes, 8);
        assert!(coded.data.is_empty());
    }

    #[test]
    fn pass_count_matches_planes() {
        // Max magnitude 10 -> top plane 3 -> cleanup + 3 * 3 passes.
        let mut data = vec![0i32; 16];
        data[0] = 10;
        data[5] = 5;
        data[10] = (3u32 | SIGN_BIT) as i32;
        let blk = block_from(data, 4, 4);
        let mut coder = BlockCoder::new(CoderOptions::default());
        let coded = coder.encode(&blk);
        assert_eq!(coded.num_passes(), 1 + 3 * 3);
        assert_eq!(coded.skipped_planes, 8 - 4);
        for w in coded.rates.windows(2) {
            assert!(w[0] <= w[1], "{:?}", coded.rates);
        }
        // The full decode recovers everything: net distortion reduction
        // is positive and dominated by the early planes.
        let dists = &coded.distortions;
        assert!(*dists.last().unwrap() > 0.0);
        assert!(dists[0] <= *dists.last().unwrap());
        assert_eq!(coded.terminated.last(), Some(&true));
    }

    #[test]
    fn term_all_terminates_every_pass() {
        let mut data = vec![0i32; 16];
        data[3] = 7;
        data[12] = 2;
        let blk = block_from(data, 4, 4);
        let opts = CoderOptions { flags: CoderFlags::TERM_ALL, ..CoderOptions::default() };
        let mut coder = BlockCoder::new(opts);
        let coded = coder.encode(&blk);
        assert!(coded.terminated.iter().all(|&t| t));
        assert_eq!(*coded.rates.last().unwrap(), coded.data.len());
    }

    #[test]
    fn ff_shortening_leaves_no_rate_behind_an_ff() {
        let mut data = vec![0i32; 64];
        for (i, v) in data.iter_mut().enumerate() {
            *v = ((i * 37 + 11) % 97) as i32;
        }
        let blk = block_from(data, 8, 8);
        let mut coder = BlockCoder::new(CoderOptions::default());
        let coded = coder.encode(&blk);
        for (i, &rate) in coded.rates.iter().enumerate() {
            // Post-fixup, an unterminated rate never sits right after an
            // 0xFF; the stream's stuffing rule means a single step back
            // always suffices.
            if !coded.terminated[i] && rate > 0 {
                assert_ne!(
                    coded.data.byte_at(rate - 1),
                    0xFF,
                    "pass {i} rate {rate} still ends on an 0xFF"
                );
            }
            assert!(rate <= coded.data.len());
        }
    }
}
