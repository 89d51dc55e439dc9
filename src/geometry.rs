//! Tile/resolution/component geometry derived from the decoded header
//! state ("where is everything" for the coding components).
//!
//! Every extent here comes from the canonical ceiling-division tiling
//! formulas; an off-by-one in any of them silently corrupts every
//! downstream computation, so the tests pin the edge cases.

use crate::code_block::SubbandOrientation;
use crate::codestream::CodestreamSpec;
use crate::error::J2kError;

/// A half-open rectangle on a coordinate grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }
}

fn ceil_div(a: u32, b: u32) -> u32 {
    debug_assert!(b > 0);
    a.div_ceil(b)
}

fn ceil_div_i64(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    if a >= 0 { (a + b - 1) / b } else { a / b }
}

/// Geometry oracle over a finished [`CodestreamSpec`].
///
/// Tile-local queries require [`Self::set_tile`] first; asking about a
/// tile that is not current is a caller bug and panics.
pub struct Geometry<'a> {
    spec: &'a CodestreamSpec,
    num_tiles_x: u32,
    num_tiles_y: u32,
    current_tile: Option<u16>,
}

impl<'a> Geometry<'a> {
    pub fn new(spec: &'a CodestreamSpec) -> Result<Self, J2kError> {
        if spec.tile_width == 0 || spec.tile_height == 0 {
            return Err(J2kError::corrupt("zero tile dimensions"));
        }
        if spec.width <= spec.x_origin || spec.height <= spec.y_origin {
            return Err(J2kError::corrupt("empty image area"));
        }
        if spec.tile_x_origin > spec.x_origin || spec.tile_y_origin > spec.y_origin {
            return Err(J2kError::corrupt("tile origin beyond image origin"));
        }
        let num_tiles_x = ceil_div(spec.width - spec.tile_x_origin, spec.tile_width);
        let num_tiles_y = ceil_div(spec.height - spec.tile_y_origin, spec.tile_height);
        Ok(Self { spec, num_tiles_x, num_tiles_y, current_tile: None })
    }

    pub fn num_tiles_x(&self) -> u32 {
        self.num_tiles_x
    }

    pub fn num_tiles_y(&self) -> u32 {
        self.num_tiles_y
    }

    pub fn num_tiles(&self) -> u32 {
        self.num_tiles_x * self.num_tiles_y
    }

    /// Make `tile` the current tile for the tile-local queries below.
    pub fn set_tile(&mut self, tile: u16) {
        assert!(u32::from(tile) < self.num_tiles(), "tile {tile} out of range");
        self.current_tile = Some(tile);
    }

    fn tile(&self) -> u16 {
        self.current_tile.expect("no current tile; call set_tile first")
    }

    /// Tile area on the reference grid, clamped to the image area.
    pub fn tile_rect(&self) -> Rect {
        let t = u32::from(self.tile());
        let s = self.spec;
        let p = t % self.num_tiles_x;
        let q = t / self.num_tiles_x;
        Rect {
            x0: (s.tile_x_origin + p * s.tile_width).max(s.x_origin),
            y0: (s.tile_y_origin + q * s.tile_height).max(s.y_origin),
            x1: (s.tile_x_origin + (p + 1) * s.tile_width).min(s.width),
            y1: (s.tile_y_origin + (q + 1) * s.tile_height).min(s.height),
        }
    }

    /// Tile-component area under component subsampling.
    pub fn tile_comp_rect(&self, comp: u16) -> Rect {
        let info = self.spec.components[usize::from(comp)];
        let r = self.tile_rect();
        Rect {
            x0: ceil_div(r.x0, u32::from(info.dx)),
            y0: ceil_div(r.y0, u32::from(info.dy)),
            x1: ceil_div(r.x1, u32::from(info.dx)),
            y1: ceil_div(r.y1, u32::from(info.dy)),
        }
    }

    fn decomposition_levels(&self, comp: u16) -> u8 {
        self.spec
            .coding_for(self.tile(), comp)
            .map(|c| c.decomposition_levels)
            .unwrap_or_default()
    }

    /// Tile-component extent at resolution level `r` (0 = lowest).
    pub fn resolution_rect(&self, comp: u16, r: u8) -> Rect {
        let nd = self.decomposition_levels(comp);
        assert!(r <= nd, "resolution {r} beyond {nd} decomposition levels");
        let shift = u32::from(nd - r);
        let tc = self.tile_comp_rect(comp);
        let d = 1u32 << shift;
        Rect {
            x0: ceil_div(tc.x0, d),
            y0: ceil_div(tc.y0, d),
            x1: ceil_div(tc.x1, d),
            y1: ceil_div(tc.y1, d),
        }
    }

    /// Subband extent feeding resolution level `r`. LL exists only at
    /// r = 0; the three detail bands only at r >= 1.
    pub fn subband_rect(&self, comp: u16, r: u8, orientation: SubbandOrientation) -> Rect {
        let nd = self.decomposition_levels(comp);
        assert!(r <= nd, "resolution {r} beyond {nd} decomposition levels");
        let (xob, yob, lev) = match (orientation, r) {
            (SubbandOrientation::LL, 0) => (0i64, 0i64, u32::from(nd)),
            (SubbandOrientation::HL, r) if r > 0 => (1, 0, u32::from(nd - r) + 1),
            (SubbandOrientation::LH, r) if r > 0 => (0, 1, u32::from(nd - r) + 1),
            (SubbandOrientation::HH, r) if r > 0 => (1, 1, u32::from(nd - r) + 1),
            _ => panic!("subband {orientation:?} does not exist at resolution {r}"),
        };
        let tc = self.tile_comp_rect(comp);
        let d = 1i64 << lev;
        let off_x = (1i64 << (lev - 1)) * xob;
        let off_y = (1i64 << (lev - 1)) * yob;
        let map = |v: u32, off: i64| ceil_div_i64(i64::from(v) - off, d).max(0) as u32;
        Rect {
            x0: map(tc.x0, off_x),
            y0: map(tc.y0, off_y),
            x1: map(tc.x1, off_x),
            y1: map(tc.y1, off_y),
        }
    }

    /// Precinct grid dimensions at resolution `r`.
    pub fn num_precincts(&self, comp: u16, r: u8) -> (u32, u32) {
        let style = match self.spec.coding_for(self.tile(), comp) {
            Ok(s) => s,
            Err(_) => return (0, 0),
        };
        let (ppx, ppy) = style.precinct_exps(r);
        let rr = self.resolution_rect(comp, r);
        if rr.is_empty() {
            return (0, 0);
        }
        let px = 1u32 << ppx.min(31);
        let py = 1u32 << ppy.min(31);
        let npx = ceil_div(rr.x1, px) - rr.x0 / px;
        let npy = ceil_div(rr.y1, py) - rr.y0 / py;
        (npx, npy)
    }

    /// Precinct dimensions on the reference grid of resolution `r`, in
    /// samples of that resolution.
    pub fn precinct_size(&self, comp: u16, r: u8) -> (u32, u32) {
        let style = match self.spec.coding_for(self.tile(), comp) {
            Ok(s) => s,
            Err(_) => return (0, 0),
        };
        let (ppx, ppy) = style.precinct_exps(r);
        (1u32 << ppx.min(31), 1u32 << ppy.min(31))
    }

    /// Effective code-block exponents at resolution `r`: the nominal
    /// size clamped by the precinct (halved at r > 0 for the band
    /// split).
    pub fn code_block_exps(&self, comp: u16, r: u8) -> (u8, u8) {
        let style = match self.spec.coding_for(self.tile(), comp) {
            Ok(s) => s,
            Err(_) => return (6, 6),
        };
        let (ppx, ppy) = style.precinct_exps(r);
        let sub = u8::from(r > 0);
        (
            style.code_block_width_exp.min(ppx.saturating_sub(sub)),
            style.code_block_height_exp.min(ppy.saturating_sub(sub)),
        )
    }
}
