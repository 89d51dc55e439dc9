//! Packet emission sequencing for the five progression orders
//! (ISO/IEC 15444-1 B.12).
//!
//! Each builder produces the full packet slot sequence for one tile.
//! The position-driven orders scan precinct-origin coordinates on a
//! reference-grid lattice stepped by the GCD of all precinct spans, so
//! every precinct is visited exactly once per applicable layer.

use crate::codestream::ProgressionOrder;
use crate::geometry::{Geometry, Rect};

/// One packet to emit: a (layer, resolution, component, precinct)
/// coordinate within a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSlot {
    pub layer: u16,
    pub resolution: u8,
    pub component: u16,
    pub precinct: u32,
}

/// Precinct layout of one resolution level, precomputed on the
/// reference grid so positional scans stay in integer arithmetic.
#[derive(Debug, Clone)]
pub struct ResProgInfo {
    /// Precinct grid dimensions.
    pub npx: u32,
    pub npy: u32,
    /// Resolution-level extent.
    pub rect: Rect,
    /// log2 precinct size in resolution samples.
    pub ppx: u8,
    pub ppy: u8,
    /// Precinct span on the reference grid.
    pub span_x: u64,
    pub span_y: u64,
}

impl ResProgInfo {
    pub fn num_precincts(&self) -> u32 {
        self.npx * self.npy
    }
}

/// Per-component progression inputs.
#[derive(Debug, Clone)]
pub struct CompProgInfo {
    pub dx: u32,
    pub dy: u32,
    /// Index is the resolution level.
    pub resolutions: Vec<ResProgInfo>,
}

/// Everything the sequencers need to know about one tile.
#[derive(Debug, Clone)]
pub struct TileProgressionInput {
    pub tile_rect: Rect,
    pub num_layers: u16,
    pub components: Vec<CompProgInfo>,
}

impl TileProgressionInput {
    /// Collect the layout of the geometry's current tile.
    pub fn from_geometry(geom: &Geometry<'_>, spec: &crate::codestream::CodestreamSpec, tile: u16, num_layers: u16) -> Self {
        let tile_rect = geom.tile_rect();
        let mut components = Vec::with_capacity(spec.components.len());
        for comp in 0..spec.num_components() {
            let info = spec.components[usize::from(comp)];
            let nd = spec
                .coding_for(tile, comp)
                .map(|c| c.decomposition_levels)
                .unwrap_or_default();
            let mut resolutions = Vec::with_capacity(usize::from(nd) + 1);
            for r in 0..=nd {
                let (npx, npy) = geom.num_precincts(comp, r);
                let rect = geom.resolution_rect(comp, r);
                let (ppx, ppy) = spec
                    .coding_for(tile, comp)
                    .map(|c| c.precinct_exps(r))
                    .unwrap_or((15, 15));
                let shift = u64::from(nd - r);
                resolutions.push(ResProgInfo {
                    npx,
                    npy,
                    rect,
                    ppx,
                    ppy,
                    span_x: u64::from(info.dx) << (shift + u64::from(ppx)).min(62),
                    span_y: u64::from(info.dy) << (shift + u64::from(ppy)).min(62),
                });
            }
            components.push(CompProgInfo {
                dx: u32::from(info.dx),
                dy: u32::from(info.dy),
                resolutions,
            });
        }
        Self { tile_rect, num_layers, components }
    }

    fn max_resolutions(&self) -> u8 {
        self.components.iter().map(|c| c.resolutions.len()).max().unwrap_or(0) as u8
    }

    fn res(&self, comp: usize, r: u8) -> Option<&ResProgInfo> {
        let info = self.components[comp].resolutions.get(usize::from(r))?;
        assert!(
            info.num_precincts() > 0,
            "component {comp} resolution {r} contributes no precincts"
        );
        Some(info)
    }

    /// GCD of all precinct spans over components and resolutions, the
    /// positional scan step.
    fn position_steps(&self) -> (u64, u64) {
        let mut gx = 0u64;
        let mut gy = 0u64;
        for c in &self.components {
            for r in &c.resolutions {
                gx = gcd(gx, r.span_x);
                gy = gcd(gy, r.span_y);
            }
        }
        (gx.max(1), gy.max(1))
    }

    /// The precinct whose origin falls on reference-grid position
    /// (x, y) for (comp, r), if any.
    fn precinct_at_origin(&self, comp: usize, r: u8, x: u64, y: u64) -> Option<u32> {
        let info = self.res(comp, r)?;
        let t = self.tile_rect;
        let on_x = x == u64::from(t.x0) || x % info.span_x == 0;
        let on_y = y == u64::from(t.y0) || y % info.span_y == 0;
        if !(on_x && on_y) || x < u64::from(t.x0) || y < u64::from(t.y0) {
            return None;
        }
        // Map the reference-grid point into resolution samples, then
        // into the precinct grid.
        let c = &self.components[comp];
        let shift = (c.resolutions.len() - 1) as u32 - u32::from(r);
        let rx = div_ceil_u64(x, u64::from(c.dx) << shift) as u32;
        let ry = div_ceil_u64(y, u64::from(c.dy) << shift) as u32;
        if rx >= info.rect.x1 || ry >= info.rect.y1 {
            return None;
        }
        let px = (rx >> info.ppx).saturating_sub(info.rect.x0 >> info.ppx);
        let py = (ry >> info.ppy).saturating_sub(info.rect.y0 >> info.ppy);
        if px >= info.npx || py >= info.npy {
            return None;
        }
        Some(py * info.npx + px)
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if a == 0 { b } else { gcd(b % a, a) }
}

fn div_ceil_u64(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

/// Build the full packet slot sequence for one tile in the given
/// progression order.
pub fn build_sequence(input: &TileProgressionInput, order: ProgressionOrder) -> Vec<PacketSlot> {
    match order {
        ProgressionOrder::Lrcp => layer_res_comp_pos(input),
        ProgressionOrder::Rlcp => res_layer_comp_pos(input),
        ProgressionOrder::Rpcl => res_pos_comp_layer(input),
        ProgressionOrder::Pcrl => pos_comp_res_layer(input),
        ProgressionOrder::Cprl => comp_pos_res_layer(input),
    }
}

fn layer_res_comp_pos(input: &TileProgressionInput) -> Vec<PacketSlot> {
    let mut seq = Vec::new();
    for layer in 0..input.num_layers {
        for r in 0..input.max_resolutions() {
            for comp in 0..input.components.len() {
                let Some(info) = input.res(comp, r) else { continue };
                for precinct in 0..info.num_precincts() {
                    seq.push(PacketSlot { layer, resolution: r, component: comp as u16, precinct });
                }
            }
        }
    }
    seq
}

fn res_layer_comp_pos(input: &TileProgressionInput) -> Vec<PacketSlot> {
    let mut seq = Vec::new();
    for r in 0..input.max_resolutions() {
        for layer in 0..input.num_layers {
            for comp in 0..input.components.len() {
                let Some(info) = input.res(comp, r) else { continue };
                for precinct in 0..info.num_precincts() {
                    seq.push(PacketSlot { layer, resolution: r, component: comp as u16, precinct });
                }
            }
        }
    }
    seq
}

/// Iterate the positional lattice, invoking `emit` for every precinct
/// origin hit at (comp, r).
fn scan_positions(
    input: &TileProgressionInput,
    mut visit: impl FnMut(u64, u64, &mut dyn FnMut(usize, u8, u32)),
) -> Vec<PacketSlot> {
    let mut seq = Vec::new();
    let (step_x, step_y) = input.position_steps();
    let t = input.tile_rect;
    let mut y = u64::from(t.y0);
    while y < u64::from(t.y1) {
        let mut x = u64::from(t.x0);
        while x < u64::from(t.x1) {
            visit(x, y, &mut |comp, r, precinct| {
                for layer in 0..input.num_layers {
                    seq.push(PacketSlot { layer, resolution: r, component: comp as u16, precinct });
                }
            });
            x = next_step(x, step_x);
        }
        y = next_step(y, step_y);
    }
    seq
}

/// Next lattice point: the following multiple of the step, which also
/// moves an unaligned tile origin onto the lattice.
fn next_step(v: u64, step: u64) -> u64 {
    (v / step + 1) * step
}

fn res_pos_comp_layer(input: &TileProgressionInput) -> Vec<PacketSlot> {
    let mut seq = Vec::new();
    for r in 0..input.max_resolutions() {
        let inner = scan_positions(input, |x, y, emit| {
            for comp in 0..input.components.len() {
                if usize::from(r) >= input.components[comp].resolutions.len() {
                    continue;
                }
                if let Some(p) = input.precinct_at_origin(comp, r, x, y) {
                    emit(comp, r, p);
                }
            }
        });
        seq.extend(inner);
    }
    seq
}

fn pos_comp_res_layer(input: &TileProgressionInput) -> Vec<PacketSlot> {
    scan_positions(input, |x, y, emit| {
        for comp in 0..input.components.len() {
            for r in 0..input.components[comp].resolutions.len() as u8 {
                if let Some(p) = input.precinct_at_origin(comp, r, x, y) {
                    emit(comp, r, p);
                }
            }
        }
    })
}

fn comp_pos_res_layer(input: &TileProgressionInput) -> Vec<PacketSlot> {
    let mut seq = Vec::new();
    for comp in 0..input.components.len() {
        let inner = scan_positions(input, |x, y, emit| {
            for r in 0..input.components[comp].resolutions.len() as u8 {
                if let Some(p) = input.precinct_at_origin(comp, r, x, y) {
                    emit(comp, r, p);
                }
            }
        });
        seq.extend(inner);
    }
    seq
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn simple_input(layers: u16, resolutions: u8, np: (u32, u32)) -> TileProgressionInput {
        let rect = Rect { x0: 0, y0: 0, x1: 256, y1: 256 };
        let mut res = Vec::new();
        for r in 0..resolutions {
            let shift = u64::from(resolutions - 1 - r);
            // Precincts splitting the resolution extent evenly.
            let width = 256u32 >> (resolutions - 1 - r);
            let ppx = (width / np.0).trailing_zeros() as u8;
            let ppy = (width / np.1).trailing_zeros() as u8;
            res.push(ResProgInfo {
                npx: np.0,
                npy: np.1,
                rect: Rect { x0: 0, y0: 0, x1: width, y1: width },
                ppx,
                ppy,
                span_x: 1u64 << (shift + u64::from(ppx)),
                span_y: 1u64 << (shift + u64::from(ppy)),
            });
        }
        TileProgressionInput {
            tile_rect: rect,
            num_layers: layers,
            components: vec![CompProgInfo { dx: 1, dy: 1, resolutions: res }],
        }
    }

    fn slot_set(seq: &[PacketSlot]) -> HashSet<(u16, u8, u16, u32)> {
        seq.iter().map(|s| (s.layer, s.resolution, s.component, s.precinct)).collect()
    }

    #[test]
    fn lrcp_emits_layers_outermost() {
        let input = simple_input(2, 2, (1, 1));
        let seq = layer_res_comp_pos(&input);
        assert_eq!(seq.len(), 4);
        assert_eq!(seq[0].layer, 0);
        assert_eq!(seq[1].layer, 0);
        assert_eq!(seq[2].layer, 1);
    }

    #[test]
    fn rlcp_emits_resolutions_outermost() {
        let input = simple_input(2, 2, (1, 1));
        let seq = res_layer_comp_pos(&input);
        assert_eq!(seq[0].resolution, 0);
        assert_eq!(seq[1].resolution, 0);
        assert_eq!(seq[2].resolution, 1);
    }

    #[test]
    fn every_order_covers_the_same_slots_exactly_once() {
        let input = simple_input(3, 3, (2, 2));
        let reference = layer_res_comp_pos(&input);
        let expect = slot_set(&reference);
        assert_eq!(reference.len(), expect.len(), "LRCP emitted duplicates");
        for order in [
            ProgressionOrder::Rlcp,
            ProgressionOrder::Rpcl,
            ProgressionOrder::Pcrl,
            ProgressionOrder::Cprl,
        ] {
            let seq = build_sequence(&input, order);
            assert_eq!(seq.len(), reference.len(), "{order:?} emitted a different count");
            assert_eq!(slot_set(&seq), expect, "{order:?} covered different slots");
        }
    }

    #[test]
    fn positional_orders_scan_spatially() {
        let input = simple_input(1, 1, (4, 4));
        let seq = res_pos_comp_layer(&input);
        assert_eq!(seq.len(), 16);
        // Raster order over the 4x4 precinct grid.
        let precincts: Vec<u32> = seq.iter().map(|s| s.precinct).collect();
        assert_eq!(precincts, (0..16).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "contributes no precincts")]
    fn zero_precinct_resolution_is_an_internal_error() {
        let mut input = simple_input(1, 1, (1, 1));
        input.components[0].resolutions[0].npx = 0;
        let _ = layer_res_comp_pos(&input);
    }
}
