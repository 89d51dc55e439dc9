//! Per-tile-component entropy coding options.
//!
//! The hosting application hands these in as string/boolean toggles; they
//! are resolved once into a fixed flag word plus two policy enums before
//! any code-block is coded. The same flag bits are what the COD/COC
//! code-block style byte carries on the wire.

use crate::error::J2kError;
use bitflags::bitflags;

bitflags! {
    /// Code-block style flags (COD/COC SPcod "code-block style" byte).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CoderFlags: u8 {
        /// Selective arithmetic coding bypass of trailing bit-planes.
        const BYPASS = 0x01;
        /// Reset context probabilities after each coding pass.
        const RESET_CTX = 0x02;
        /// Terminate after each coding pass.
        const TERM_ALL = 0x04;
        /// Vertically stripe-causal context formation.
        const CAUSAL = 0x08;
        /// Predictable termination (error resilience).
        const PRED_TERM = 0x10;
        /// Segmentation symbol at the end of each cleanup pass.
        const SEG_SYMBOLS = 0x20;
    }
}

/// MQ termination strategies, in increasing coding efficiency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationPolicy {
    /// Annex C flush; maximum certainty, least efficient.
    #[default]
    Full,
    /// Shortest byte sequence whose all-ones continuation stays inside
    /// the final coding interval.
    NearOptimal,
    /// Byte-aligned, spare bits filled with ones.
    Easy,
    /// Byte-aligned, spare bits untouched for decoder-side error
    /// detection.
    Predictable,
}

impl TryFrom<&str> for TerminationPolicy {
    type Error = J2kError;

    fn try_from(v: &str) -> Result<Self, J2kError> {
        match v {
            "full" => Ok(Self::Full),
            "near_opt" => Ok(Self::NearOptimal),
            "easy" => Ok(Self::Easy),
            "predict" => Ok(Self::Predictable),
            _ => Err(J2kError::InvalidOption(format!("unknown termination type '{v}'"))),
        }
    }
}

/// Rate estimation policies for untermininated passes, in increasing
/// cost and accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthCalculation {
    /// Written bytes plus a constant safety margin.
    Lazy,
    /// Lazy, sharpened by one byte when the pending bits fit.
    #[default]
    LazyGood,
    /// Deferred exact computation from register snapshots.
    NearOptimal,
}

impl TryFrom<&str> for LengthCalculation {
    type Error = J2kError;

    fn try_from(v: &str) -> Result<Self, J2kError> {
        match v {
            "lazy" => Ok(Self::Lazy),
            "lazy_good" => Ok(Self::LazyGood),
            "near_opt" => Ok(Self::NearOptimal),
            _ => Err(J2kError::InvalidOption(format!("unknown length calculation '{v}'"))),
        }
    }
}

/// Resolved per-tile-component coding options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoderOptions {
    pub flags: CoderFlags,
    pub termination: TerminationPolicy,
    pub length_calc: LengthCalculation,
    /// Number of most-significant bit-planes coded with the MQ coder
    /// before the bypass (if enabled) takes over.
    pub bypass_threshold: u8,
}

impl CoderOptions {
    pub const DEFAULT_BYPASS_THRESHOLD: u8 = 4;

    /// Resolve the application-facing toggles into a fixed option word.
    pub fn from_toggles(
        bypass: bool,
        reset_ctx: bool,
        term_all: bool,
        causal: bool,
        seg_symbols: bool,
        termination: &str,
        length_calc: &str,
    ) -> Result<Self, J2kError> {
        let mut flags = CoderFlags::empty();
        flags.set(CoderFlags::BYPASS, bypass);
        flags.set(CoderFlags::RESET_CTX, reset_ctx);
        flags.set(CoderFlags::TERM_ALL, term_all);
        flags.set(CoderFlags::CAUSAL, causal);
        flags.set(CoderFlags::SEG_SYMBOLS, seg_symbols);
        let termination = TerminationPolicy::try_from(termination)?;
        if termination == TerminationPolicy::Predictable {
            flags.insert(CoderFlags::PRED_TERM);
        }
        Ok(Self {
            flags,
            termination,
            length_calc: LengthCalculation::try_from(length_calc)?,
            bypass_threshold: Self::DEFAULT_BYPASS_THRESHOLD,
        })
    }

    /// The style byte written into COD/COC for these options.
    pub fn style_byte(&self) -> u8 {
        self.flags.bits()
    }

    /// Rebuild options from a COD/COC style byte.
    pub fn from_style_byte(style: u8) -> Result<Self, J2kError> {
        let flags = CoderFlags::from_bits(style).ok_or_else(|| {
            J2kError::corrupt(format!("unknown code-block style bits {style:#04x}"))
        })?;
        let termination = if flags.contains(CoderFlags::PRED_TERM) {
            TerminationPolicy::Predictable
        } else {
            TerminationPolicy::default()
        };
        Ok(Self {
            flags,
            termination,
            length_calc: LengthCalculation::default(),
            bypass_threshold: Self::DEFAULT_BYPASS_THRESHOLD,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_resolve_to_flags() {
        let opts =
            CoderOptions::from_toggles(true, false, true, false, true, "near_opt", "lazy_good")
                .unwrap();
        assert!(opts.flags.contains(CoderFlags::BYPASS));
        assert!(opts.flags.contains(CoderFlags::TERM_ALL));
        assert!(opts.flags.contains(CoderFlags::SEG_SYMBOLS));
        assert!(!opts.flags.contains(CoderFlags::CAUSAL));
        assert_eq!(opts.termination, TerminationPolicy::NearOptimal);
        assert_eq!(opts.length_calc, LengthCalculation::LazyGood);
    }

    #[test]
    fn unknown_toggle_is_rejected() {
        let err = CoderOptions::from_toggles(false, false, false, false, false, "bogus", "lazy")
            .unwrap_err();
        assert!(matches!(err, J2kError::InvalidOption(_)));
    }

    #[test]
    fn style_byte_roundtrip() {
        let opts =
            CoderOptions::from_toggles(true, true, false, true, false, "predict", "lazy").unwrap();
        let rebuilt = CoderOptions::from_style_byte(opts.style_byte()).unwrap();
        assert_eq!(rebuilt.flags, opts.flags);
        assert_eq!(rebuilt.termination, TerminationPolicy::Predictable);
    }
}
