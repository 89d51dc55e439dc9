//! JPEG 2000 codestream marker codes (ISO/IEC 15444-1 Annex A).

use crate::error::J2kError;
use num_enum::TryFromPrimitive;

/// Marker codes, the low byte of the 0xFFxx marker word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum Marker {
    /// SOC: Start of codestream.
    StartOfCodestream = 0x4F,
    /// SIZ: Image and tile size.
    ImageAndTileSize = 0x51,
    /// COD: Coding style default.
    CodingStyleDefault = 0x52,
    /// COC: Coding style component.
    CodingStyleComponent = 0x53,
    /// TLM: Tile-part lengths.
    TilePartLengths = 0x55,
    /// PLM: Packet lengths, main header.
    PacketLengthMain = 0x57,
    /// PLT: Packet lengths, tile-part header.
    PacketLengthTile = 0x58,
    /// QCD: Quantization default.
    QuantizationDefault = 0x5C,
    /// QCC: Quantization component.
    QuantizationComponent = 0x5D,
    /// RGN: Region of interest.
    RegionOfInterest = 0x5E,
    /// POC: Progression order change.
    ProgressionOrderChange = 0x5F,
    /// PPM: Packed packet headers, main header.
    PackedHeadersMain = 0x60,
    /// PPT: Packed packet headers, tile-part header.
    PackedHeadersTile = 0x61,
    /// CRG: Component registration.
    ComponentRegistration = 0x63,
    /// COM: Comment.
    Comment = 0x64,
    /// SOT: Start of tile-part.
    StartOfTile = 0x90,
    /// SOP: Start of packet.
    StartOfPacket = 0x91,
    /// EPH: End of packet header.
    EndOfPacketHeader = 0x92,
    /// SOD: Start of data.
    StartOfData = 0x93,
    /// EOC: End of codestream.
    EndOfCodestream = 0xD9,
}

pub const MARKER_PREFIX: u8 = 0xFF;

impl Marker {
    /// Delimiting markers carry no length field.
    pub fn is_delimiter(self) -> bool {
        matches!(
            self,
            Self::StartOfCodestream
                | Self::StartOfData
                | Self::EndOfCodestream
                | Self::StartOfPacket
                | Self::EndOfPacketHeader
        )
    }

    /// Markers legal only in the main header.
    pub fn main_header_only(self) -> bool {
        matches!(
            self,
            Self::ImageAndTileSize
                | Self::TilePartLengths
                | Self::PacketLengthMain
                | Self::PackedHeadersMain
                | Self::ComponentRegistration
        )
    }

    /// Markers legal only in a tile-part header.
    pub fn tile_header_only(self) -> bool {
        matches!(self, Self::StartOfTile | Self::PacketLengthTile | Self::PackedHeadersTile)
    }

    /// Markers that may legally occur more than once per header.
    pub fn repeatable(self) -> bool {
        matches!(
            self,
            Self::CodingStyleComponent
                | Self::QuantizationComponent
                | Self::RegionOfInterest
                | Self::Comment
                | Self::PackedHeadersMain
                | Self::PackedHeadersTile
                | Self::PacketLengthMain
                | Self::PacketLengthTile
                | Self::ProgressionOrderChange
        )
    }
}

/// Parse the second byte of a marker word, surfacing unknown codes so
/// the caller can decide whether to skip them.
pub fn marker_from_byte(b: u8) -> Result<Marker, J2kError> {
    Marker::try_from(b)
        .map_err(|_| J2kError::corrupt(format!("unknown marker 0xFF{b:02X}")))
}
