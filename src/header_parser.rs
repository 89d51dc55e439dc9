//! Two-pass codestream header parser.
//!
//! Pass 1 scans marker segments sequentially, validates placement and
//! ordering, and buffers each segment's raw bytes keyed by marker kind
//! and occurrence. Pass 2 replays the buffered segments in a fixed
//! canonical order and mutates the shared [`CodestreamSpec`], tile
//! defaults before component and tile-component overrides. The
//! two-phase split matters because the interpretation of later markers
//! (POC component field widths, QCC step counts) depends on values only
//! known once SIZ/COD have been applied.

use crate::coder_options::CoderFlags;
use crate::codestream::{
    CodestreamSpec, CodingStyle, Comment, ComponentInfo, ProgressionChange, ProgressionOrder,
    QuantStep, Quantization, QuantizationStyle, RoiShift, WaveletFilter,
};
use crate::error::J2kError;
use crate::markers::{MARKER_PREFIX, Marker, marker_from_byte};
use bitflags::bitflags;
use log::warn;
use std::collections::HashMap;

bitflags! {
    /// One bit per marker kind found in the header being parsed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MarkerFlags: u32 {
        const SIZ = 1 << 0;
        const COD = 1 << 1;
        const COC = 1 << 2;
        const QCD = 1 << 3;
        const QCC = 1 << 4;
        const RGN = 1 << 5;
        const POC = 1 << 6;
        const COM = 1 << 7;
        const CRG = 1 << 8;
        const PPM = 1 << 9;
        const PPT = 1 << 10;
        const TLM = 1 << 11;
        const PLM = 1 << 12;
        const PLT = 1 << 13;
        const SOT = 1 << 14;
    }
}

fn flag_for(marker: Marker) -> MarkerFlags {
    match marker {
        Marker::ImageAndTileSize => MarkerFlags::SIZ,
        Marker::CodingStyleDefault => MarkerFlags::COD,
        Marker::CodingStyleComponent => MarkerFlags::COC,
        Marker::QuantizationDefault => MarkerFlags::QCD,
        Marker::QuantizationComponent => MarkerFlags::QCC,
        Marker::RegionOfInterest => MarkerFlags::RGN,
        Marker::ProgressionOrderChange => MarkerFlags::POC,
        Marker::Comment => MarkerFlags::COM,
        Marker::ComponentRegistration => MarkerFlags::CRG,
        Marker::PackedHeadersMain => MarkerFlags::PPM,
        Marker::PackedHeadersTile => MarkerFlags::PPT,
        Marker::TilePartLengths => MarkerFlags::TLM,
        Marker::PacketLengthMain => MarkerFlags::PLM,
        Marker::PacketLengthTile => MarkerFlags::PLT,
        Marker::StartOfTile => MarkerFlags::SOT,
        _ => MarkerFlags::empty(),
    }
}

/// Big-endian byte reader over one segment or header span.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8, J2kError> {
        let b = *self.data.get(self.pos).ok_or(J2kError::NeedMoreData)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, J2kError> {
        Ok(u16::from(self.read_u8()?) << 8 | u16::from(self.read_u8()?))
    }

    fn read_u32(&mut self) -> Result<u32, J2kError> {
        Ok(u32::from(self.read_u16()?) << 16 | u32::from(self.read_u16()?))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], J2kError> {
        if self.remaining() < n {
            return Err(J2kError::NeedMoreData);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> Result<(), J2kError> {
        if self.remaining() < n {
            return Err(J2kError::NeedMoreData);
        }
        self.pos += n;
        Ok(())
    }
}

/// Start-of-tile-part parameters, plus where its entropy data begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePartInfo {
    pub tile: u16,
    /// Psot: total tile-part length from the SOT marker, 0 = to EOC.
    pub length: u32,
    pub part_index: u8,
    pub num_parts: u8,
    /// Offset of the first byte after SOD, relative to the parsed span.
    pub data_start: usize,
}

/// Buffered raw segments from pass 1, keyed by kind; the position in
/// the inner vector is the occurrence index.
type SegmentMap = HashMap<Marker, Vec<Vec<u8>>>;

/// The codestream header parser.
#[derive(Debug, Default)]
pub struct HeaderParser {
    spec: CodestreamSpec,
    pub main_markers: MarkerFlags,
}

/// Replay order for buffered main-header segments.
const MAIN_ORDER: [Marker; 10] = [
    Marker::ImageAndTileSize,
    Marker::Comment,
    Marker::ComponentRegistration,
    Marker::CodingStyleDefault,
    Marker::CodingStyleComponent,
    Marker::RegionOfInterest,
    Marker::QuantizationDefault,
    Marker::QuantizationComponent,
    Marker::ProgressionOrderChange,
    Marker::PackedHeadersMain,
];

/// Replay order for buffered tile-part segments.
const TILE_ORDER: [Marker; 7] = [
    Marker::Comment,
    Marker::CodingStyleDefault,
    Marker::CodingStyleComponent,
    Marker::RegionOfInterest,
    Marker::QuantizationDefault,
    Marker::QuantizationComponent,
    Marker::ProgressionOrderChange,
];

impl HeaderParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spec(&self) -> &CodestreamSpec {
        &self.spec
    }

    pub fn into_spec(self) -> CodestreamSpec {
        self.spec
    }

    /// Parse the main header, `data` starting at SOC. Returns the
    /// offset of the SOT marker ending the main header.
    pub fn parse_main_header(&mut self, data: &[u8]) -> Result<usize, J2kError> {
        let mut r = ByteReader::new(data);
        if r.read_u16()? != 0xFF4F {
            return Err(J2kError::corrupt("expected SOC"));
        }

        let mut segments: SegmentMap = HashMap::new();
        let mut first_segment = true;
        let sot_pos;
        loop {
            let pos = r.pos;
            if r.read_u8()? != MARKER_PREFIX {
                return Err(J2kError::corrupt("expected marker"));
            }
            let code = r.read_u8()?;
            let marker = match marker_from_byte(code) {
                Ok(m) => m,
                Err(_) => {
                    if first_segment {
                        return Err(J2kError::corrupt("SIZ must be the first segment after SOC"));
                    }
                    // Forward progress over strictness: skip by length.
                    let len = r.read_u16()?;
                    if len < 2 {
                        return Err(J2kError::corrupt("marker segment length below 2"));
                    }
                    warn!("skipping unknown marker 0xFF{code:02X} ({len} bytes)");
                    r.skip(usize::from(len) - 2)?;
                    continue;
                }
            };

            if marker == Marker::StartOfTile {
                sot_pos = pos;
                break;
            }
            if marker.is_delimiter() {
                return Err(J2kError::corrupt(format!("misplaced {marker:?} in main header")));
            }
            if marker.tile_header_only() {
                return Err(J2kError::corrupt(format!("{marker:?} is not legal in the main header")));
            }
            if first_segment && marker != Marker::ImageAndTileSize {
                return Err(J2kError::corrupt("SIZ must be the first segment after SOC"));
            }
            first_segment = false;

            let len = r.read_u16()?;
            if len < 2 {
                return Err(J2kError::corrupt("marker segment length below 2"));
            }
            let payload = r.read_bytes(usize::from(len) - 2)?;

            match marker {
                Marker::PacketLengthMain | Marker::TilePartLengths => {
                    warn!("ignoring {marker:?} segment");
                    self.main_markers |= flag_for(marker);
                    continue;
                }
                _ => {}
            }

            let flag = flag_for(marker);
            if self.main_markers.contains(flag) && !marker.repeatable() {
                return Err(J2kError::corrupt(format!("duplicate {marker:?} in main header")));
            }
            self.main_markers |= flag;
            segments.entry(marker).or_default().push(payload.to_vec());
        }

        if !self.main_markers.contains(MarkerFlags::SIZ) {
            return Err(J2kError::corrupt("main header without SIZ"));
        }
        if !self.main_markers.contains(MarkerFlags::COD) {
            return Err(J2kError::corrupt("main header without COD"));
        }
        if !self.main_markers.contains(MarkerFlags::QCD) {
            return Err(J2kError::corrupt("main header without QCD"));
        }
        if self.main_markers.contains(MarkerFlags::PPM)
            && self.main_markers.intersects(MarkerFlags::PLM | MarkerFlags::PLT)
        {
            return Err(J2kError::corrupt("PPM and PLM/PLT are mutually exclusive"));
        }

        self.interpret(&segments, &MAIN_ORDER, None)?;
        Ok(sot_pos)
    }

    /// Parse one tile-part header, `data` starting at the SOT marker.
    pub fn parse_tile_part_header(&mut self, data: &[u8]) -> Result<TilePartInfo, J2kError> {
        let mut r = ByteReader::new(data);
        if r.read_u16()? != 0xFF90 {
            return Err(J2kError::corrupt("expected SOT"));
        }
        let lsot = r.read_u16()?;
        if lsot != 10 {
            return Err(J2kError::corrupt(format!("bad Lsot {lsot}")));
        }
        let tile = r.read_u16()?;
        let length = r.read_u32()?;
        let part_index = r.read_u8()?;
        let num_parts = r.read_u8()?;

        let mut segments: SegmentMap = HashMap::new();
        let mut found = MarkerFlags::SOT;
        let data_start;
        loop {
            if r.read_u8()? != MARKER_PREFIX {
                return Err(J2kError::corrupt("expected marker in tile-part header"));
            }
            let code = r.read_u8()?;
            let marker = match marker_from_byte(code) {
                Ok(m) => m,
                Err(_) => {
                    let len = r.read_u16()?;
                    if len < 2 {
                        return Err(J2kError::corrupt("marker segment length below 2"));
                    }
                    warn!("skipping unknown marker 0xFF{code:02X} in tile-part header");
                    r.skip(usize::from(len) - 2)?;
                    continue;
                }
            };

            if marker == Marker::StartOfData {
                data_start = r.pos;
                break;
            }
            if marker.is_delimiter() || marker == Marker::StartOfTile {
                return Err(J2kError::corrupt(format!("misplaced {marker:?} in tile-part header")));
            }
            if marker.main_header_only() {
                return Err(J2kError::corrupt(format!("{marker:?} is not legal in a tile-part header")));
            }

            let len = r.read_u16()?;
            if len < 2 {
                return Err(J2kError::corrupt("marker segment length below 2"));
            }
            let payload = r.read_bytes(usize::from(len) - 2)?;

            if marker == Marker::PacketLengthTile {
                warn!("ignoring PLT segment");
                found |= MarkerFlags::PLT;
                continue;
            }

            let flag = flag_for(marker);
            if found.contains(flag) && !marker.repeatable() {
                return Err(J2kError::corrupt(format!("duplicate {marker:?} in tile-part header")));
            }
            found |= flag;
            segments.entry(marker).or_default().push(payload.to_vec());
        }

        if found.contains(MarkerFlags::PPT)
            && (found.contains(MarkerFlags::PLT) || self.main_markers.contains(MarkerFlags::PPM))
        {
            return Err(J2kError::corrupt("PPT conflicts with PLT/PPM"));
        }

        // PPT belongs to the tile, outside the canonical override order.
        if let Some(ppts) = segments.remove(&Marker::PackedHeadersTile) {
            let entry = self.spec.packed_headers_tile.entry(tile).or_default();
            for ppt in ppts {
                if ppt.is_empty() {
                    return Err(J2kError::corrupt("empty PPT segment"));
                }
                // Leading Zppt index byte, then packed header bytes.
                entry.push(ppt[1..].to_vec());
            }
        }

        self.interpret(&segments, &TILE_ORDER, Some(tile))?;
        Ok(TilePartInfo { tile, length, part_index, num_parts, data_start })
    }

    /// Pass 2: replay buffered segments in canonical order.
    fn interpret(
        &mut self,
        segments: &SegmentMap,
        order: &[Marker],
        tile: Option<u16>,
    ) -> Result<(), J2kError> {
        for &marker in order {
            let Some(list) = segments.get(&marker) else { continue };
            for payload in list {
                let mut r = ByteReader::new(payload);
                match marker {
                    Marker::ImageAndTileSize => self.apply_siz(&mut r)?,
                    Marker::Comment => self.apply_com(&mut r)?,
                    Marker::ComponentRegistration => self.apply_crg(&mut r)?,
                    Marker::CodingStyleDefault => self.apply_cod(&mut r, tile)?,
                    Marker::CodingStyleComponent => self.apply_coc(&mut r, tile)?,
                    Marker::RegionOfInterest => self.apply_rgn(&mut r, tile)?,
                    Marker::QuantizationDefault => self.apply_qcd(&mut r, tile)?,
                    Marker::QuantizationComponent => self.apply_qcc(&mut r, tile)?,
                    Marker::ProgressionOrderChange => self.apply_poc(&mut r, tile)?,
                    Marker::PackedHeadersMain => self.apply_ppm(&mut r)?,
                    _ => unreachable!("{marker:?} has no interpreter"),
                }
            }
        }
        Ok(())
    }

    fn apply_siz(&mut self, r: &mut ByteReader<'_>) -> Result<(), J2kError> {
        let _rsiz = r.read_u16()?;
        self.spec.width = r.read_u32()?;
        self.spec.height = r.read_u32()?;
        self.spec.x_origin = r.read_u32()?;
        self.spec.y_origin = r.read_u32()?;
        self.spec.tile_width = r.read_u32()?;
        self.spec.tile_height = r.read_u32()?;
        self.spec.tile_x_origin = r.read_u32()?;
        self.spec.tile_y_origin = r.read_u32()?;
        let comps = r.read_u16()?;
        if comps == 0 {
            return Err(J2kError::corrupt("SIZ with zero components"));
        }
        if self.spec.tile_width == 0 || self.spec.tile_height == 0 {
            return Err(J2kError::corrupt("SIZ with zero tile size"));
        }
        for _ in 0..comps {
            let ssiz = r.read_u8()?;
            let dx = r.read_u8()?;
            let dy = r.read_u8()?;
            if dx == 0 || dy == 0 {
                return Err(J2kError::corrupt("SIZ with zero subsampling factor"));
            }
            self.spec.components.push(ComponentInfo {
                depth: (ssiz & 0x7F) + 1,
                signed: ssiz & 0x80 != 0,
                dx,
                dy,
            });
        }
        Ok(())
    }

    /// Component index field: one byte below 257 components, two from
    /// there on. The SIZ component count decides, never the segment
    /// being replayed.
    fn read_comp_index(&self, r: &mut ByteReader<'_>) -> Result<u16, J2kError> {
        let idx = if self.spec.num_components() < 257 {
            u16::from(r.read_u8()?)
        } else {
            r.read_u16()?
        };
        if idx >= self.spec.num_components() {
            return Err(J2kError::corrupt(format!("component index {idx} out of range")));
        }
        Ok(idx)
    }

    fn read_code_block_exps(&self, r: &mut ByteReader<'_>) -> Result<(u8, u8), J2kError> {
        let w = r.read_u8()?;
        let h = r.read_u8()?;
        if w > 8 || h > 8 {
            return Err(J2kError::corrupt("code-block exponent above 2^10"));
        }
        let (we, he) = (w + 2, h + 2);
        if we + he > 12 {
            return Err(J2kError::corrupt("code-block area above 4096"));
        }
        Ok((we, he))
    }

    fn read_block_style(&self, r: &mut ByteReader<'_>) -> Result<CoderFlags, J2kError> {
        let style = r.read_u8()?;
        CoderFlags::from_bits(style)
            .ok_or_else(|| J2kError::corrupt(format!("unknown code-block style {style:#04x}")))
    }

    fn apply_cod(&mut self, r: &mut ByteReader<'_>, tile: Option<u16>) -> Result<(), J2kError> {
        let scod = r.read_u8()?;
        let progression = ProgressionOrder::try_from(r.read_u8()?)
            .map_err(|e| J2kError::corrupt(format!("bad progression order {}", e.number)))?;
        let num_layers = r.read_u16()?;
        if num_layers == 0 {
            return Err(J2kError::corrupt("COD with zero layers"));
        }
        let mct = r.read_u8()?;
        let decomposition_levels = r.read_u8()?;
        if decomposition_levels > 32 {
            return Err(J2kError::corrupt("more than 32 decomposition levels"));
        }
        let (code_block_width_exp, code_block_height_exp) = self.read_code_block_exps(r)?;
        let block_style = self.read_block_style(r)?;
        let filter = WaveletFilter::from_wire(r.read_u8()?)?;
        let mut precincts = Vec::new();
        if scod & 0x01 != 0 {
            for _ in 0..=decomposition_levels {
                precincts.push(r.read_u8()?);
            }
        }
        let style = CodingStyle {
            progression,
            num_layers,
            mct,
            decomposition_levels,
            code_block_width_exp,
            code_block_height_exp,
            block_style,
            filter,
            precincts,
            use_sop: scod & 0x02 != 0,
            use_eph: scod & 0x04 != 0,
        };
        match tile {
            None => self.spec.coding.set_default(style),
            Some(t) => self.spec.coding.set_tile(t, style),
        }
        Ok(())
    }

    fn apply_coc(&mut self, r: &mut ByteReader<'_>, tile: Option<u16>) -> Result<(), J2kError> {
        let comp = self.read_comp_index(r)?;
        let scoc = r.read_u8()?;
        let decomposition_levels = r.read_u8()?;
        if decomposition_levels > 32 {
            return Err(J2kError::corrupt("more than 32 decomposition levels"));
        }
        let (code_block_width_exp, code_block_height_exp) = self.read_code_block_exps(r)?;
        let block_style = self.read_block_style(r)?;
        let filter = WaveletFilter::from_wire(r.read_u8()?)?;
        let mut precincts = Vec::new();
        if scoc & 0x01 != 0 {
            for _ in 0..=decomposition_levels {
                precincts.push(r.read_u8()?);
            }
        }
        // COC overrides the component-level pieces; progression, layer
        // count and MCT stay whatever the governing COD established.
        let base = match tile {
            None => self.spec.coding.default_value(),
            Some(t) => self.spec.coding.get(t, comp),
        }
        .cloned()
        .ok_or_else(|| J2kError::corrupt("COC before any COD"))?;
        let style = CodingStyle {
            decomposition_levels,
            code_block_width_exp,
            code_block_height_exp,
            block_style,
            filter,
            precincts,
            ..base
        };
        match tile {
            None => self.spec.coding.set_component(comp, style),
            Some(t) => self.spec.coding.set_tile_component(t, comp, style),
        }
        Ok(())
    }

    fn read_quantization(&self, r: &mut ByteReader<'_>) -> Result<Quantization, J2kError> {
        let sq = r.read_u8()?;
        let style = QuantizationStyle::from_wire(sq)?;
        let guard_bits = sq >> 5;
        let mut steps = Vec::new();
        match style {
            QuantizationStyle::None => {
                while r.remaining() >= 1 {
                    let v = r.read_u8()?;
                    steps.push(QuantStep { exponent: v >> 3, mantissa: 0 });
                }
            }
            QuantizationStyle::Derived | QuantizationStyle::Expounded => {
                while r.remaining() >= 2 {
                    let v = r.read_u16()?;
                    steps.push(QuantStep { exponent: (v >> 11) as u8, mantissa: v & 0x7FF });
                }
                if r.remaining() != 0 {
                    return Err(J2kError::corrupt("odd trailing byte in quantization segment"));
                }
            }
        }
        if steps.is_empty() {
            return Err(J2kError::corrupt("quantization segment without step sizes"));
        }
        Ok(Quantization { style, guard_bits, steps })
    }

    fn apply_qcd(&mut self, r: &mut ByteReader<'_>, tile: Option<u16>) -> Result<(), J2kError> {
        let q = self.read_quantization(r)?;
        match tile {
            None => self.spec.quant.set_default(q),
            Some(t) => self.spec.quant.set_tile(t, q),
        }
        Ok(())
    }

    fn apply_qcc(&mut self, r: &mut ByteReader<'_>, tile: Option<u16>) -> Result<(), J2kError> {
        let comp = self.read_comp_index(r)?;
        let q = self.read_quantization(r)?;
        match tile {
            None => self.spec.quant.set_component(comp, q),
            Some(t) => self.spec.quant.set_tile_component(t, comp, q),
        }
        Ok(())
    }

    fn apply_rgn(&mut self, r: &mut ByteReader<'_>, tile: Option<u16>) -> Result<(), J2kError> {
        let comp = self.read_comp_index(r)?;
        let srgn = r.read_u8()?;
        if srgn != 0 {
            return Err(J2kError::corrupt(format!("unsupported ROI style {srgn}")));
        }
        let shift = r.read_u8()?;
        let roi = RoiShift { shift };
        match tile {
            None => self.spec.roi.set_component(comp, roi),
            Some(t) => self.spec.roi.set_tile_component(t, comp, roi),
        }
        Ok(())
    }

    fn apply_poc(&mut self, r: &mut ByteReader<'_>, tile: Option<u16>) -> Result<(), J2kError> {
        let wide = self.spec.num_components() >= 257;
        let entry_size = if wide { 9 } else { 7 };
        if r.remaining() % entry_size != 0 {
            return Err(J2kError::corrupt("POC length not a whole number of entries"));
        }
        let n_new = r.remaining() / entry_size;
        if n_new == 0 {
            return Err(J2kError::corrupt("empty POC segment"));
        }

        // A repeated POC grows the already-collected change list; the
        // old entries are preserved in order.
        let mut changes = match tile {
            None => self.spec.poc.default_value().cloned().unwrap_or_default(),
            Some(t) => self.spec.poc.get(t, 0).cloned().unwrap_or_default(),
        };
        let n_old = changes.len();
        changes.reserve(n_new);
        for _ in 0..n_new {
            let res_start = r.read_u8()?;
            let comp_start = if wide { r.read_u16()? } else { u16::from(r.read_u8()?) };
            let layer_end = r.read_u16()?;
            let res_end = r.read_u8()?;
            let comp_end_raw = if wide { r.read_u16()? } else { u16::from(r.read_u8()?) };
            // A zero end means "all components".
            let comp_end = if comp_end_raw == 0 { self.spec.num_components() } else { comp_end_raw };
            let progression = ProgressionOrder::try_from(r.read_u8()?)
                .map_err(|e| J2kError::corrupt(format!("bad POC progression {}", e.number)))?;
            if layer_end == 0 {
                return Err(J2kError::corrupt("POC with zero layer bound"));
            }
            if res_end <= res_start {
                return Err(J2kError::corrupt("POC with empty resolution range"));
            }
            if comp_end <= comp_start {
                return Err(J2kError::corrupt("POC with empty component range"));
            }
            changes.push(ProgressionChange {
                res_start,
                comp_start,
                layer_end,
                res_end,
                comp_end,
                progression,
            });
        }
        debug_assert_eq!(changes.len(), n_old + n_new);
        match tile {
            None => self.spec.poc.set_default(changes),
            Some(t) => self.spec.poc.set_tile(t, changes),
        }
        Ok(())
    }

    fn apply_com(&mut self, r: &mut ByteReader<'_>) -> Result<(), J2kError> {
        let registration = r.read_u16()?;
        if registration > 1 {
            warn!("COM with unknown registration {registration}; keeping raw bytes");
        }
        let data = r.read_bytes(r.remaining())?.to_vec();
        self.spec.comments.push(Comment { registration, data });
        Ok(())
    }

    fn apply_crg(&mut self, r: &mut ByteReader<'_>) -> Result<(), J2kError> {
        while r.remaining() >= 4 {
            let x = r.read_u16()?;
            let y = r.read_u16()?;
            self.spec.registration.push((x, y));
        }
        Ok(())
    }

    fn apply_ppm(&mut self, r: &mut ByteReader<'_>) -> Result<(), J2kError> {
        let _zppm = r.read_u8()?;
        let data = r.read_bytes(r.remaining())?.to_vec();
        self.spec.packed_headers_main.push(data);
        Ok(())
    }
}
