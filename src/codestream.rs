//! The decoded-header state: every coding parameter the marker segments
//! carry, resolved through the default/override ladder the standard
//! defines (main default, then per-component, per-tile and
//! per-tile-component overrides).
//!
//! Built incrementally by the header parser; read-only to every coding
//! component once a tile-part's markers are fully applied.

use crate::coder_options::CoderFlags;
use crate::error::J2kError;
use num_enum::TryFromPrimitive;
use std::collections::HashMap;

/// Packet progression orders (SGcod/POC wire values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ProgressionOrder {
    /// Layer-resolution-component-position.
    Lrcp = 0,
    /// Resolution-layer-component-position.
    Rlcp = 1,
    /// Resolution-position-component-layer.
    Rpcl = 2,
    /// Position-component-resolution-layer.
    Pcrl = 3,
    /// Component-position-resolution-layer.
    Cprl = 4,
}

impl Default for ProgressionOrder {
    fn default() -> Self {
        Self::Lrcp
    }
}

/// Quantization styles (Sqcd/Sqcc low five bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantizationStyle {
    /// Reversible, no quantization; one exponent per subband.
    #[default]
    None,
    /// Scalar derived: one step size, others derived per level.
    Derived,
    /// Scalar expounded: one step size per subband.
    Expounded,
}

impl QuantizationStyle {
    pub fn from_wire(v: u8) -> Result<Self, J2kError> {
        match v & 0x1F {
            0 => Ok(Self::None),
            1 => Ok(Self::Derived),
            2 => Ok(Self::Expounded),
            other => Err(J2kError::corrupt(format!("unsupported quantization style {other}"))),
        }
    }
}

/// The two standard wavelet kernels (SPcod transformation byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaveletFilter {
    /// 9-7 irreversible.
    #[default]
    Irreversible97,
    /// 5-3 reversible.
    Reversible53,
}

impl WaveletFilter {
    pub fn from_wire(v: u8) -> Result<Self, J2kError> {
        match v {
            0 => Ok(Self::Irreversible97),
            1 => Ok(Self::Reversible53),
            other => Err(J2kError::corrupt(format!("unknown wavelet filter id {other}"))),
        }
    }
}

/// One quantization step size: 5-bit exponent, 11-bit mantissa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuantStep {
    pub exponent: u8,
    pub mantissa: u16,
}

/// Quantization parameters from QCD/QCC.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Quantization {
    pub style: QuantizationStyle,
    pub guard_bits: u8,
    pub steps: Vec<QuantStep>,
}

/// Coding-style parameters from COD/COC. The progression/layer/MCT
/// fields only carry meaning at the tile-default level (COC cannot
/// override them).
#[derive(Debug, Clone, PartialEq)]
pub struct CodingStyle {
    pub progression: ProgressionOrder,
    pub num_layers: u16,
    pub mct: u8,
    pub decomposition_levels: u8,
    /// Actual log2 of the code-block width (wire value + 2).
    pub code_block_width_exp: u8,
    pub code_block_height_exp: u8,
    pub block_style: CoderFlags,
    pub filter: WaveletFilter,
    /// One byte per resolution level, PPx in the low nibble and PPy in
    /// the high nibble; empty means the 2^15 maximal precincts.
    pub precincts: Vec<u8>,
    pub use_sop: bool,
    pub use_eph: bool,
}

impl Default for CodingStyle {
    fn default() -> Self {
        Self {
            progression: ProgressionOrder::default(),
            num_layers: 1,
            mct: 0,
            decomposition_levels: 5,
            code_block_width_exp: 6,
            code_block_height_exp: 6,
            block_style: CoderFlags::empty(),
            filter: WaveletFilter::default(),
            precincts: Vec::new(),
            use_sop: false,
            use_eph: false,
        }
    }
}

impl CodingStyle {
    /// Precinct exponents (PPx, PPy) at one resolution level.
    pub fn precinct_exps(&self, resolution: u8) -> (u8, u8) {
        if self.precincts.is_empty() {
            return (15, 15);
        }
        let i = usize::from(resolution).min(self.precincts.len() - 1);
        let b = self.precincts[i];
        (b & 0x0F, b >> 4)
    }
}

/// Max-shift region of interest (RGN, implicit style only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoiShift {
    pub shift: u8,
}

/// One progression-order change from a POC segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressionChange {
    pub res_start: u8,
    pub comp_start: u16,
    pub layer_end: u16,
    pub res_end: u8,
    pub comp_end: u16,
    pub progression: ProgressionOrder,
}

/// Per-component precision and subsampling from SIZ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentInfo {
    pub depth: u8,
    pub signed: bool,
    pub dx: u8,
    pub dy: u8,
}

/// A parameter resolved through the standard override ladder:
/// tile-component beats tile beats component beats the main default.
#[derive(Debug, Clone, Default)]
pub struct ParamSpec<T> {
    default: Option<T>,
    per_comp: HashMap<u16, T>,
    per_tile: HashMap<u16, T>,
    per_tile_comp: HashMap<(u16, u16), T>,
}

impl<T> ParamSpec<T> {
    pub fn set_default(&mut self, v: T) {
        self.default = Some(v);
    }

    pub fn set_component(&mut self, comp: u16, v: T) {
        self.per_comp.insert(comp, v);
    }

    pub fn set_tile(&mut self, tile: u16, v: T) {
        self.per_tile.insert(tile, v);
    }

    pub fn set_tile_component(&mut self, tile: u16, comp: u16, v: T) {
        self.per_tile_comp.insert((tile, comp), v);
    }

    pub fn get(&self, tile: u16, comp: u16) -> Option<&T> {
        self.per_tile_comp
            .get(&(tile, comp))
            .or_else(|| self.per_tile.get(&tile))
            .or_else(|| self.per_comp.get(&comp))
            .or(self.default.as_ref())
    }

    pub fn default_value(&self) -> Option<&T> {
        self.default.as_ref()
    }
}

/// Comment segment (COM), kept as registered data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub registration: u16,
    pub data: Vec<u8>,
}

/// The full decoded-header state for one codestream.
#[derive(Debug, Clone, Default)]
pub struct CodestreamSpec {
    // SIZ geometry on the reference grid.
    pub width: u32,
    pub height: u32,
    pub x_origin: u32,
    pub y_origin: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_x_origin: u32,
    pub tile_y_origin: u32,
    pub components: Vec<ComponentInfo>,

    pub coding: ParamSpec<CodingStyle>,
    pub quant: ParamSpec<Quantization>,
    pub roi: ParamSpec<RoiShift>,
    /// Progression-order changes; a tile-level POC overrides the main
    /// one, and repeated POC segments grow the same list.
    pub poc: ParamSpec<Vec<ProgressionChange>>,

    pub comments: Vec<Comment>,
    /// Component registration offsets (CRG), passed through.
    pub registration: Vec<(u16, u16)>,
    /// Packed packet headers from PPM (main) / PPT (per tile).
    pub packed_headers_main: Vec<Vec<u8>>,
    pub packed_headers_tile: HashMap<u16, Vec<Vec<u8>>>,
}

impl CodestreamSpec {
    pub fn num_components(&self) -> u16 {
        self.components.len() as u16
    }

    /// Resolved coding style for a tile-component; SIZ/COD make the
    /// default mandatory, so resolution cannot fail on a conforming
    /// stream.
    pub fn coding_for(&self, tile: u16, comp: u16) -> Result<&CodingStyle, J2kError> {
        self.coding
            .get(tile, comp)
            .ok_or_else(|| J2kError::corrupt("missing COD marker"))
    }

    pub fn quant_for(&self, tile: u16, comp: u16) -> Result<&Quantization, J2kError> {
        self.quant
            .get(tile, comp)
            .ok_or_else(|| J2kError::corrupt("missing QCD marker"))
    }

    pub fn uses_packed_headers(&self) -> bool {
        !self.packed_headers_main.is_empty() || !self.packed_headers_tile.is_empty()
    }
}
