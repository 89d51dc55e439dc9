//! Bit-plane code-block decoder, the exact inverse of
//! [`crate::block_coder::BlockCoder`].
//!
//! Reproduces, per bit-plane, the significance/sign/refinement decision
//! sequence the encoder made, for any bypass/termination configuration.
//! Backs the encode-decode round-trip guarantees.

use crate::bit_io::BitStuffReader;
use crate::block_coder::{CoderState, NZ_CTX, REFINED, SIG, STRIPE, VISITED};
use crate::code_block::{CodedBlock, SIGN_BIT, SubbandOrientation};
use crate::coder_options::{CoderFlags, CoderOptions};
use crate::mq_coder::{CTX_RUN, CTX_UNIFORM, MqDecoder};
use log::warn;

/// Reusable bit-plane decoder; scratch state shared across blocks.
pub struct BlockDecoder {
    opts: CoderOptions,
    cs: CoderState,
}

impl BlockDecoder {
    pub fn new(opts: CoderOptions) -> Self {
        Self { opts, cs: CoderState::new() }
    }

    /// Decode up to `max_passes` coding passes of `coded`, returning the
    /// reconstructed samples in sign-magnitude form.
    pub fn decode(
        &mut self,
        coded: &CodedBlock,
        width: usize,
        height: usize,
        orientation: SubbandOrientation,
        max_passes: usize,
    ) -> Vec<i32> {
        self.cs.reset(width, height);
        let mut mags = vec![0u32; width * height];

        let n_passes = coded.num_passes().min(max_passes);
        if n_passes == 0 {
            return vec![0; width * height];
        }
        let top_plane = u32::from(coded.magbits)
            .saturating_sub(u32::from(coded.skipped_planes))
            .saturating_sub(1);

        let data = coded.data.as_slice();
        let seg_end = |from_pass: usize| -> usize {
            for j in from_pass..coded.num_passes() {
                if coded.terminated[j] {
                    return coded.rates[j].min(data.len());
                }
            }
            data.len()
        };

        let causal = self.opts.flags.contains(CoderFlags::CAUSAL);
        let term_all = self.opts.flags.contains(CoderFlags::TERM_ALL);
        let bypass = self.opts.flags.contains(CoderFlags::BYPASS);
        let reset_ctx = self.opts.flags.contains(CoderFlags::RESET_CTX);

        let mut mq = MqDecoder::new(data);
        let mut needs_restart = true;
        let mut seg_start = 0usize;
        let mut pass = 0usize;

        let mut planes_coded = 0u8;
        for plane in (0..=top_plane).rev() {
            if pass >= n_passes {
                break;
            }
            let first_plane = plane == top_plane;
            let raw_plane = bypass && planes_coded >= self.opts.bypass_threshold;
            planes_coded = planes_coded.saturating_add(1);

            if !first_plane {
                if raw_plane {
                    let end = seg_end(pass);
                    let mut raw = BitStuffReader::new(&data[seg_start.min(end)..end]);
                    self.significance_pass_raw(&mut raw, &mut mags, width, height, plane, causal);
                    if self.finish_pass(coded, &mut pass, &mut seg_start, n_passes) {
                        break;
                    }
                    if term_all {
                        // Refinement got its own terminated segment.
                        let end = seg_end(pass);
                        raw = BitStuffReader::new(&data[seg_start.min(end)..end]);
                    }
                    self.refinement_pass_raw(&mut raw, &mut mags, width, height, plane);
                    if self.finish_pass(coded, &mut pass, &mut seg_start, n_passes) {
                        break;
                    }
                    needs_restart = true;
                } else {
                    if needs_restart {
                        mq.restart_segment(seg_start, seg_end(pass));
                        needs_restart = false;
                    }
                    self.significance_pass(&mut mq, &mut mags, width, height, plane, orientation, causal);
                    needs_restart = coded.terminated[pass];
                    if self.finish_pass(coded, &mut pass, &mut seg_start, n_passes) {
                        break;
                    }
                    if reset_ctx {
                        mq.reset_contexts();
                    }
                    if needs_restart {
                        mq.restart_segment(seg_start, seg_end(pass));
                        needs_restart = false;
                    }
                    self.refinement_pass(&mut mq, &mut mags, width, height, plane);
                    needs_restart = coded.terminated[pass];
                    if self.finish_pass(coded, &mut pass, &mut seg_start, n_passes) {
                        break;
                    }
                    if reset_ctx {
                        mq.reset_contexts();
                    }
                }
            }

            if needs_restart {
                mq.restart_segment(seg_start, seg_end(pass));
                needs_restart = false;
            }
            self.cleanup_pass(&mut mq, &mut mags, width, height, plane, orientation, causal);
            needs_restart = coded.terminated[pass];
            if self.finish_pass(coded, &mut pass, &mut seg_start, n_passes) {
                break;
            }
            if reset_ctx {
                mq.reset_contexts();
            }
        }

        let mut out = vec![0i32; width * height];
        for y in 0..height {
            for x in 0..width {
                let mag = mags[y * width + x];
                let neg = self.cs.get(x, y) & crate::block_coder::NEG != 0;
                out[y * width + x] = (mag | if neg { SIGN_BIT } else { 0 }) as i32;
            }
        }
        out
    }

    /// Advance the pass cursor; returns true when decoding must stop.
    fn finish_pass(
        &mut self,
        coded: &CodedBlock,
        pass: &mut usize,
        seg_start: &mut usize,
        n_passes: usize,
    ) -> bool {
        if coded.terminated[*pass] {
            *seg_start = coded.rates[*pass].min(coded.data.len());
        }
        *pass += 1;
        *pass >= n_passes
    }

    fn decode_sign_mq(&mut self, mq: &mut MqDecoder<'_>, x: usize, y: usize, causal: bool) {
        let (ctx, flip) = self.cs.sign_context(x, y, causal);
        let neg = (mq.decode_symbol(ctx) ^ flip) == 1;
        self.cs.set_significant(x, y, neg, causal);
    }

    fn significance_pass(
        &mut self,
        mq: &mut MqDecoder<'_>,
        mags: &mut [u32],
        width: usize,
        height: usize,
        plane: u32,
        orientation: SubbandOrientation,
        causal: bool,
    ) {
        for y0 in (0..height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(height);
            for x in 0..width {
                for y in y0..y1 {
                    let st = self.cs.get(x, y);
                    if st & (SIG | VISITED) != 0 || st & NZ_CTX == 0 {
                        continue;
                    }
                    let pattern = self.cs.neighbor_pattern(x, y, causal);
                    let bit = mq.decode_symbol(self.cs.zc_context(orientation, pattern));
                    if bit == 1 {
                        self.decode_sign_mq(mq, x, y, causal);
                        mags[y * width + x] |= 1 << plane;
                    }
                    self.cs.or_into(x, y, VISITED);
                }
            }
        }
    }

    fn significance_pass_raw(
        &mut self,
        raw: &mut BitStuffReader<'_>,
        mags: &mut [u32],
        width: usize,
        height: usize,
        plane: u32,
        causal: bool,
    ) {
        for y0 in (0..height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(height);
            for x in 0..width {
                for y in y0..y1 {
                    let st = self.cs.get(x, y);
                    if st & (SIG | VISITED) != 0 || st & NZ_CTX == 0 {
                        continue;
                    }
                    if raw.read_bit() == 1 {
                        let neg = raw.read_bit() == 1;
                        self.cs.set_significant(x, y, neg, causal);
                        mags[y * width + x] |= 1 << plane;
                    }
                    self.cs.or_into(x, y, VISITED);
                }
            }
        }
    }

    fn refinement_pass(
        &mut self,
        mq: &mut MqDecoder<'_>,
        mags: &mut [u32],
        width: usize,
        height: usize,
        plane: u32,
    ) {
        for y0 in (0..height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(height);
            for x in 0..width {
                for y in y0..y1 {
                    let st = self.cs.get(x, y);
                    if st & SIG == 0 || st & VISITED != 0 {
                        continue;
                    }
                    let bit = mq.decode_symbol(self.cs.mr_context(x, y));
                    mags[y * width + x] |= u32::from(bit) << plane;
                    self.cs.or_into(x, y, VISITED | REFINED);
                }
            }
        }
    }

    fn refinement_pass_raw(
        &mut self,
        raw: &mut BitStuffReader<'_>,
        mags: &mut [u32],
        width: usize,
        height: usize,
        plane: u32,
    ) {
        for y0 in (0..height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(height);
            for x in 0..width {
                for y in y0..y1 {
                    let st = self.cs.get(x, y);
                    if st & SIG == 0 || st & VISITED != 0 {
                        continue;
                    }
                    let bit = raw.read_bit();
                    mags[y * width + x] |= u32::from(bit) << plane;
                    self.cs.or_into(x, y, VISITED | REFINED);
                }
            }
        }
    }

    fn cleanup_pass(
        &mut self,
        mq: &mut MqDecoder<'_>,
        mags: &mut [u32],
        width: usize,
        height: usize,
        plane: u32,
        orientation: SubbandOrientation,
        causal: bool,
    ) {
        for y0 in (0..height).step_by(STRIPE) {
            let y1 = (y0 + STRIPE).min(height);
            for x in 0..width {
                let mut y = y0;
                if y1 - y0 == STRIPE && self.cs.column_all_clear(x, y0) {
                    if mq.decode_symbol(CTX_RUN) == 0 {
                        continue;
                    }
                    let r = (u32::from(mq.decode_symbol(CTX_UNIFORM)) << 1)
                        | u32::from(mq.decode_symbol(CTX_UNIFORM));
                    let yb = y0 + r as usize;
                    self.decode_sign_mq(mq, x, yb, causal);
                    mags[yb * width + x] |= 1 << plane;
                    y = yb + 1;
                }
                for yy in y..y1 {
                    let st = self.cs.get(x, yy);
                    if st & (SIG | VISITED) != 0 {
                        continue;
                    }
                    let pattern = self.cs.neighbor_pattern(x, yy, causal);
                    let bit = mq.decode_symbol(self.cs.zc_context(orientation, pattern));
                    if bit == 1 {
                        self.decode_sign_mq(mq, x, yy, causal);
                        mags[yy * width + x] |= 1 << plane;
                    }
                }
            }
        }
        if self.opts.flags.contains(CoderFlags::SEG_SYMBOLS) {
            let s = (mq.decode_symbol(CTX_UNIFORM),
                mq.decode_symbol(CTX_UNIFORM),
                mq.decode_symbol(CTX_UNIFORM),
                mq.decode_symbol(CTX_UNIFORM));
            if s != (1, 0, 1, 0) {
                warn!("invalid segmentation symbol; code-block data is likely corrupt");
            }
        }
        self.cs.clear_visited();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_coder::BlockCoder;
    use crate::code_block::{BlockId, CodeBlock, SIGN_BIT};
    use crate::coder_options::TerminationPolicy;

    fn sample_block(w: usize, h: usize, magbits: u8, orientation: SubbandOrientation) -> CodeBlock {
        let max = (1u32 << magbits) - 1;
        let mut data = vec![0i32; w * h];
        for (i, v) in data.iter_mut().enumerate() {
            // Deterministic mixed content: zeros, small and large values,
            // both signs.
            let r = (i * 2654435761) >> 9;
            let mag = (r as u32) % (max + 1);
            let mag = if i % 3 == 0 { 0 } else { mag };
            let neg = (r >> 13) & 1 == 1;
            *v = (mag | if neg && mag != 0 { SIGN_BIT } else { 0 }) as i32;
        }
        CodeBlock::new(
            BlockId::new(0, 0, 0, orientation, 0),
            data,
            w,
            h,
            orientation,
            magbits,
        )
    }

    fn assert_roundtrip(block: &CodeBlock, opts: CoderOptions) {
        let mut coder = BlockCoder::new(opts);
        let coded = coder.encode(block);
        let mut decoder = BlockDecoder::new(opts);
        let decoded =
            decoder.decode(&coded, block.width, block.height, block.orientation, usize::MAX);
        for y in 0..block.height {
            for x in 0..block.width {
                let expect = block.sample(x, y);
                let got = decoded[y * block.width + x];
                // A sample that never became significant carries no sign.
                let expect_cmp = if expect as u32 & !SIGN_BIT == 0 { 0 } else { expect };
                assert_eq!(
                    got, expect_cmp,
                    "({x},{y}) under {:?}: got {got:#x}, want {expect_cmp:#x}",
                    opts.flags
                );
            }
        }
    }

    #[test]
    fn roundtrip_default() {
        let block = sample_block(16, 16, 8, SubbandOrientation::LL);
        assert_roundtrip(&block, CoderOptions::default());
    }

    #[test]
    fn roundtrip_all_subbands() {
        for orientation in [
            SubbandOrientation::LL,
            SubbandOrientation::HL,
            SubbandOrientation::LH,
            SubbandOrientation::HH,
        ] {
            let block = sample_block(8, 8, 7, orientation);
            assert_roundtrip(&block, CoderOptions::default());
        }
    }

    #[test]
    fn roundtrip_term_all() {
        let block = sample_block(16, 8, 8, SubbandOrientation::HL);
        let opts = CoderOptions { flags: CoderFlags::TERM_ALL, ..CoderOptions::default() };
        assert_roundtrip(&block, opts);
    }

    #[test]
    fn roundtrip_reset_contexts() {
        let block = sample_block(8, 16, 8, SubbandOrientation::LH);
        let opts = CoderOptions {
            flags: CoderFlags::RESET_CTX | CoderFlags::TERM_ALL,
            ..CoderOptions::default()
        };
        assert_roundtrip(&block, opts);
    }

    #[test]
    fn roundtrip_causal() {
        let block = sample_block(16, 16, 8, SubbandOrientation::HH);
        let opts = CoderOptions { flags: CoderFlags::CAUSAL, ..CoderOptions::default() };
        assert_roundtrip(&block, opts);
    }

    #[test]
    fn roundtrip_segmentation_symbols() {
        let block = sample_block(8, 8, 8, SubbandOrientation::LL);
        let opts = CoderOptions { flags: CoderFlags::SEG_SYMBOLS, ..CoderOptions::default() };
        assert_roundtrip(&block, opts);
    }

    #[test]
    fn roundtrip_bypass() {
        // Enough planes that the trailing ones are raw coded.
        let block = sample_block(16, 16, 10, SubbandOrientation::LL);
        let opts = CoderOptions { flags: CoderFlags::BYPASS, ..CoderOptions::default() };
        assert_roundtrip(&block, opts);
    }

    #[test]
    fn roundtrip_bypass_term_all() {
        let block = sample_block(16, 16, 10, SubbandOrientation::HL);
        let opts = CoderOptions {
            flags: CoderFlags::BYPASS | CoderFlags::TERM_ALL,
            ..CoderOptions::default()
        };
        assert_roundtrip(&block, opts);
    }

    #[test]
    fn roundtrip_bypass_predictable_termination() {
        let block = sample_block(16, 16, 9, SubbandOrientation::LH);
        let opts = CoderOptions {
            flags: CoderFlags::BYPASS | CoderFlags::TERM_ALL | CoderFlags::PRED_TERM,
            termination: TerminationPolicy::Predictable,
            ..CoderOptions::default()
        };
        assert_roundtrip(&block, opts);
    }

    #[test]
    fn roundtrip_near_optimal_termination() {
        let block = sample_block(16, 16, 8, SubbandOrientation::LL);
        let opts = CoderOptions {
            flags: CoderFlags::TERM_ALL,
            termination: TerminationPolicy::NearOptimal,
            ..CoderOptions::default()
        };
        assert_roundtrip(&block, opts);
    }

    #[test]
    fn roundtrip_easy_termination() {
        let block = sample_block(8, 8, 8, SubbandOrientation::HH);
        let opts = CoderOptions {
            flags: CoderFlags::TERM_ALL,
            termination: TerminationPolicy::Easy,
            ..CoderOptions::default()
        };
        assert_roundtrip(&block, opts);
    }

    #[test]
    fn truncated_decode_is_a_prefix() {
        // Decoding fewer passes must agree with the full decode on every
        // bit-plane it covers.
        let block = sample_block(16, 16, 8, SubbandOrientation::LL);
        let opts = CoderOptions { flags: CoderFlags::TERM_ALL, ..CoderOptions::default() };
        let mut coder = BlockCoder::new(opts);
        let coded = coder.encode(&block);

        let mut decoder = BlockDecoder::new(opts);
        let full = decoder.decode(&coded, 16, 16, SubbandOrientation::LL, usize::MAX);
        let partial_passes = coded.num_passes() / 2;
        let partial = decoder.decode(&coded, 16, 16, SubbandOrientation::LL, partial_passes);

        // Planes fully covered by the partial decode: every pass of a
        // plane adds only bits of that plane.
        let planes_done = (partial_passes.saturating_sub(1) / 3) as u32;
        let top = 7 - coded.skipped_planes as u32;
        if planes_done > 0 {
            let mask_shift = top + 1 - planes_done;
            for (i, (&f, &p)) in full.iter().zip(&partial).enumerate() {
                let fm = (f as u32 & !SIGN_BIT) >> mask_shift;
                let pm = (p as u32 & !SIGN_BIT) >> mask_shift;
                assert_eq!(fm, pm, "sample {i}");
            }
        }
    }
}
