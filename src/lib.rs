// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side control of the i.MX "Malone" VPU decoder.
//!
//! The VPU runs its own decoder firmware and is driven through a hardware message unit (MU) plus
//! a shared-memory RPC ring. This crate implements the session and frame-buffer lifecycle that sits
//! on top of that channel:
//!
//! * [`fbl`] manages the two frame buffer pools (tiled decode targets and linear output frames),
//! * [`mu`] and [`rpc`] move commands and events between the host and the firmware,
//! * [`decoder`] holds the per-stream state machine and the firmware event handler,
//! * [`t2l`] hands decoded frames to the external tile-to-linear blitter.
//!
//! Memory mapping, the blitter and the mailbox hardware are external collaborators expressed as
//! traits so that the host environment can provide them.

pub mod backend;
pub mod config;
pub mod decoder;
pub mod fbl;
pub mod ioctl;
pub mod memory;
pub mod mu;
pub mod rpc;
pub mod t2l;
pub mod utils;

use std::fmt;
use std::str::FromStr;

use crate::utils::checked_align_up;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` is large enough to hold a frame of `other` resolution.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Layout of the frames of a sequence, both in the VPU tiled format and in the linear RGBA format
/// produced by the blitter.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Displayed resolution.
    pub resolution: Resolution,
    /// Dimensions of the tiled luma plane.
    pub tiled: Resolution,
    /// Bytes per line of the linear output.
    pub out_stride: u32,
}

impl FrameGeometry {
    pub const TILE_WIDTH_ALIGN: u32 = 256;
    pub const TILE_HEIGHT_ALIGN: u32 = 128;
    pub const OUT_STRIDE_ALIGN: u32 = 64;

    /// Returns `None` if the aligned dimensions or the output stride overflow.
    pub fn new(resolution: Resolution) -> Option<Self> {
        let out_stride = resolution
            .width
            .checked_mul(4)
            .and_then(|bytes| checked_align_up(bytes, Self::OUT_STRIDE_ALIGN))?;

        Some(Self {
            resolution,
            tiled: Resolution {
                width: checked_align_up(resolution.width, Self::TILE_WIDTH_ALIGN)?,
                height: checked_align_up(resolution.height, Self::TILE_HEIGHT_ALIGN)?,
            },
            out_stride,
        })
    }

    pub fn luma_size(&self) -> usize {
        self.tiled.width as usize * self.tiled.height as usize
    }

    /// 4:2:0 interleaved chroma.
    pub fn chroma_size(&self) -> usize {
        self.luma_size() / 2
    }

    pub fn output_size(&self) -> usize {
        self.out_stride as usize * self.resolution.height as usize
    }

    /// Size of one motion buffer info scratch buffer.
    pub fn mbi_size(&self) -> usize {
        self.luma_size() / 4
    }
}

/// A four character code, as used by clients to name the compressed format of a stream.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl From<&[u8; 4]> for Fourcc {
    fn from(value: &[u8; 4]) -> Self {
        Fourcc(u32::from_le_bytes(*value))
    }
}

impl From<u32> for Fourcc {
    fn from(value: u32) -> Self {
        Fourcc(value)
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_le_bytes();
        for b in bytes {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fourcc({self})")
    }
}

/// Compressed formats understood by the decoder firmware. The discriminants are the firmware's
/// format identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecFormat {
    Avc = 1,
    Vc1 = 2,
    Mpeg2 = 3,
    Mpeg4 = 5,
    Jpeg = 6,
    Vp8 = 10,
    Hevc = 12,
}

impl CodecFormat {
    /// Maps a client fourcc to a codec. HEVC fourccs are only accepted if `enable_hevc` is set.
    pub fn from_fourcc(fourcc: Fourcc, enable_hevc: bool) -> Option<Self> {
        let format = match &fourcc.0.to_le_bytes() {
            b"H264" | b"AVC1" => CodecFormat::Avc,
            b"HEVC" | b"H265" => CodecFormat::Hevc,
            b"MPG2" => CodecFormat::Mpeg2,
            b"MPG4" | b"XVID" | b"DIVX" => CodecFormat::Mpeg4,
            b"VC1 " | b"WVC1" => CodecFormat::Vc1,
            b"VP80" => CodecFormat::Vp8,
            b"MJPG" => CodecFormat::Jpeg,
            _ => return None,
        };

        if format == CodecFormat::Hevc && !enable_hevc {
            return None;
        }

        Some(format)
    }

    /// Whether the firmware asks for motion-buffer-info scratch memory for this format.
    pub fn needs_mbi(&self) -> bool {
        !matches!(self, CodecFormat::Jpeg)
    }

    /// Whether the firmware asks for DCP scratch memory for this format.
    pub fn needs_dcp(&self) -> bool {
        matches!(self, CodecFormat::Hevc)
    }

    /// The canonical fourcc a client uses to open a stream of this format.
    pub fn fourcc(&self) -> Fourcc {
        Fourcc::from(match self {
            CodecFormat::Avc => b"H264",
            CodecFormat::Hevc => b"HEVC",
            CodecFormat::Mpeg2 => b"MPG2",
            CodecFormat::Mpeg4 => b"MPG4",
            CodecFormat::Vc1 => b"WVC1",
            CodecFormat::Vp8 => b"VP80",
            CodecFormat::Jpeg => b"MJPG",
        })
    }
}

impl FromStr for CodecFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(CodecFormat::Avc),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(CodecFormat::Hevc),
            "mpeg2" | "MPEG2" => Ok(CodecFormat::Mpeg2),
            "mpeg4" | "MPEG4" => Ok(CodecFormat::Mpeg4),
            "vc1" | "VC1" => Ok(CodecFormat::Vc1),
            "vp8" | "VP8" => Ok(CodecFormat::Vp8),
            "mjpeg" | "MJPEG" => Ok(CodecFormat::Jpeg),
            _ => Err("unrecognized codec. Valid values: h264, h265, mpeg2, mpeg4, vc1, vp8, mjpeg"),
        }
    }
}
