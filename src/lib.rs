//! JPEG 2000 embedded block coding core (ISO/IEC 15444-1).
//!
//! The compression engine below the wavelet transform: everything from
//! quantized code-block samples to a rate-allocated packet stream, plus
//! the codestream header machinery needed to drive decoding.
//!
//! - `bit_io`: byte buffering, bit-stuffed raw segments, packet-header
//!   bit I/O.
//! - `mq_coder`: the MQ arithmetic coder (Tier-1), encoder and decoder,
//!   with the four termination and three length-estimation policies.
//! - `block_coder` / `block_decoder`: three-pass bit-plane coding of
//!   code-blocks, with selective bypass, per-pass termination and the
//!   per-pass rate/distortion record.
//! - `tag_tree`: hierarchical threshold coding for packet headers.
//! - `rate_allocator` / `progression`: post-compression rate-distortion
//!   optimization and packet sequencing across the five progression
//!   orders.
//! - `markers` / `header_parser` / `codestream` / `geometry`: the
//!   two-pass marker-segment reader, the decoded parameter state and
//!   the tiling arithmetic derived from it.
//! - `parallel`: optional worker-pool coding, one code-block per task.
//!
//! The wavelet transform, quantization, color handling and container
//! parsing live upstream and downstream of this crate and are only
//! touched at their interfaces ([`code_block::CodeBlock`] coming in,
//! [`rate_allocator::PacketSink`] going out).

pub mod bit_io;
pub mod block_coder;
pub mod block_decoder;
pub mod code_block;
pub mod coder_options;
pub mod codestream;
pub mod error;
pub mod geometry;
pub mod header_parser;
pub mod markers;
pub mod mq_coder;
pub mod parallel;
pub mod progression;
pub mod rate_allocator;
pub mod tag_tree;

pub use block_coder::BlockCoder;
pub use block_decoder::BlockDecoder;
pub use code_block::{BlockId, CodeBlock, CodedBlock, SubbandOrientation};
pub use coder_options::{CoderFlags, CoderOptions, LengthCalculation, TerminationPolicy};
pub use codestream::{CodestreamSpec, ProgressionOrder};
pub use error::J2kError;
pub use geometry::Geometry;
pub use header_parser::HeaderParser;
pub use mq_coder::{MqDecoder, MqEncoder};
pub use rate_allocator::{LayerSpec, PacketSink, RateAllocator};
pub use tag_tree::TagTree;
