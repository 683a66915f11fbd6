// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture and GOP management for hardware video encoders.
//!
//! This crate decides, for every frame submitted to a hardware encoder, its frame type, its
//! position in the temporal layer hierarchy, the pictures it may reference and the long-term
//! reference slots in use. It also tracks the lifetime of the reconstructed picture buffers
//! those decisions rely on, so that a buffer is only returned to its pool once the GPU is done
//! with it.
//!
//! The main entry points are [`encoder::reftrack::Tracker`], which produces a
//! [`encoder::reftrack::FrameDescriptor`] per frame, and [`encoder::session::EncodeSession`],
//! which drives a tracker against a hardware submission backend.

pub mod backend;
pub mod codec;
pub mod encoder;

use std::fmt;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns the resolution obtained by dividing both dimensions by `2^factor`, rounding down.
    pub fn downscale_pow2(&self, factor: u32) -> Self {
        Self {
            width: self.width >> factor,
            height: self.height >> factor,
        }
    }

    /// Number of 16x16 macroblocks needed to cover this resolution.
    pub fn macroblock_count(&self) -> u32 {
        self.width.div_ceil(16) * self.height.div_ceil(16)
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

/// A FOURCC code like the ones used by V4L2 or VA-API.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fourcc(u32);

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        [
            n.0 as u8,
            (n.0 >> 8) as u8,
            (n.0 >> 16) as u8,
            (n.0 >> 24) as u8,
        ]
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c: [u8; 4] = (*self).into();

        f.write_fmt(format_args!(
            "{}{}{}{}",
            c[0] as char, c[1] as char, c[2] as char, c[3] as char
        ))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// Bit depth of the encoded stream. Decides the pixel format of the reconstructed pictures.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BitDepth {
    #[default]
    Depth8,
    Depth10,
}

impl BitDepth {
    /// Returns the pixel format the hardware writes reconstructed pictures in.
    pub fn recon_fourcc(&self) -> Fourcc {
        match self {
            BitDepth::Depth8 => Fourcc::from(b"NV12"),
            BitDepth::Depth10 => Fourcc::from(b"P010"),
        }
    }
}

/// Whether polling operations should block until their result is available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlockingMode {
    #[default]
    Blocking,
    NonBlocking,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_roundtrip_display() {
        let fourcc = Fourcc::from(b"NV12");
        assert_eq!(fourcc.to_string(), "NV12");
        assert_eq!(BitDepth::Depth10.recon_fourcc().to_string(), "P010");
    }

    #[test]
    fn downscale_rounds_down() {
        let res = Resolution::from((1921, 1081));
        assert_eq!(res.downscale_pow2(1), Resolution::from((960, 540)));
        assert_eq!(res.downscale_pow2(2), Resolution::from((480, 270)));
    }

    #[test]
    fn macroblocks() {
        assert_eq!(Resolution::from((320, 240)).macroblock_count(), 300);
        assert_eq!(Resolution::from((1920, 1080)).macroblock_count(), 120 * 68);
    }
}
