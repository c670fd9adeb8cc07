// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// FourCC type taken from https://docs.rs/crate/four-cc/latest and adapted to
// handle endianess; format tables follow the V4L2 pixel format definitions.
#![forbid(unsafe_code)]

use core::{fmt, result::Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C, packed)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    const fn to_u32(self) -> u32 {
        #[cfg(target_endian = "little")]
        {
            ((self.0[3] as u32) << 24 & 0xff000000)
                | ((self.0[2] as u32) << 16 & 0x00ff0000)
                | ((self.0[1] as u32) << 8 & 0x0000ff00)
                | ((self.0[0] as u32) & 0x000000ff)
        }
        #[cfg(target_endian = "big")]
        {
            ((self.0[0] as u32) << 24 & 0xff000000)
                | ((self.0[1] as u32) << 16 & 0x00ff0000)
                | ((self.0[2] as u32) << 8 & 0x0000ff00)
                | ((self.0[3] as u32) & 0x000000ff)
        }
    }

    /// Bytes per image row for this format at the given width, or `None`
    /// when the format is not in the fixed table and the caller must supply
    /// an explicit stride.
    ///
    /// For the planar families (NV12, I420, ...) the stride is that of the
    /// luma plane; the chroma planes share it by definition of the layouts
    /// supported here. Fully-planar formats without a single stride (e.g.
    /// I444) are intentionally absent.
    pub fn bytes_per_line(self, width: i32) -> Option<i32> {
        let per_pixel_num = match &self.0 {
            // 24-bit RGB
            b"RGB3" | b"BGR3" => 3,
            // 32-bit RGB
            b"RGBA" | b"BGRA" | b"RGBX" | b"BGRX" | b"AB24" => 4,
            // Packed 4:2:2 YUV
            b"YUYV" | b"UYVY" | b"YVYU" => 2,
            // Planar YUV, luma row
            b"NV12" | b"NV21" | b"NV16" | b"NV61" | b"I420" | b"YU12" | b"YV12" => 1,
            // 8-bit greyscale
            b"GREY" => 1,
            _ => return None,
        };
        Some(width * per_pixel_num)
    }

    /// Total backing-buffer size for this format given the luma stride and
    /// height, including any chroma planes. `None` for unknown formats.
    pub fn buffer_size(self, stride: i32, height: i32) -> Option<usize> {
        let plane = stride as usize * height as usize;
        match &self.0 {
            b"RGB3" | b"BGR3" | b"RGBA" | b"BGRA" | b"RGBX" | b"BGRX" | b"AB24" | b"YUYV"
            | b"UYVY" | b"YVYU" | b"GREY" => Some(plane),
            // 4:2:0 — half-resolution chroma
            b"NV12" | b"NV21" | b"I420" | b"YU12" | b"YV12" => Some(plane + plane / 2),
            // Planar 4:2:2 — full-height half-width chroma pair
            b"NV16" | b"NV61" => Some(plane * 2),
            _ => None,
        }
    }
}

impl From<&[u8; 4]> for FourCC {
    fn from(buf: &[u8; 4]) -> FourCC {
        FourCC([buf[0], buf[1], buf[2], buf[3]])
    }
}
impl From<&[u8]> for FourCC {
    fn from(buf: &[u8]) -> FourCC {
        FourCC([buf[0], buf[1], buf[2], buf[3]])
    }
}
impl From<u32> for FourCC {
    fn from(val: u32) -> FourCC {
        #[cfg(target_endian = "little")]
        {
            FourCC([
                (val & 0xff) as u8,
                (val >> 8 & 0xff) as u8,
                (val >> 16 & 0xff) as u8,
                (val >> 24 & 0xff) as u8,
            ])
        }
        #[cfg(target_endian = "big")]
        {
            FourCC([
                (val >> 24 & 0xff) as u8,
                (val >> 16 & 0xff) as u8,
                (val >> 8 & 0xff) as u8,
                (val & 0xff) as u8,
            ])
        }
    }
}

impl From<FourCC> for u32 {
    fn from(val: FourCC) -> Self {
        val.to_u32()
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match core::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                // If we return fmt::Error, then for example format!() will panic, so we choose
                // an alternative representation instead
                let b = &self.0;
                f.write_fmt(format_args!(
                    "{}{}{}{}",
                    core::ascii::escape_default(b[0]),
                    core::ascii::escape_default(b[1]),
                    core::ascii::escape_default(b[2]),
                    core::ascii::escape_default(b[3])
                ))
            }
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let b = self.0;
        f.debug_tuple("FourCC")
            .field(&format_args!(
                "{}{}{}{}",
                core::ascii::escape_default(b[0]),
                core::ascii::escape_default(b[1]),
                core::ascii::escape_default(b[2]),
                core::ascii::escape_default(b[3])
            ))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u32_round_trip() {
        let fourcc = FourCC(*b"RGB3");
        let val: u32 = fourcc.into();
        assert_eq!(val, 0x33424752);
        assert_eq!(FourCC::from(val), fourcc);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", FourCC(*b"YUYV")), "YUYV");
    }

    #[test]
    fn test_bytes_per_line() {
        assert_eq!(FourCC(*b"RGB3").bytes_per_line(640), Some(1920));
        assert_eq!(FourCC(*b"RGBA").bytes_per_line(640), Some(2560));
        assert_eq!(FourCC(*b"YUYV").bytes_per_line(640), Some(1280));
        assert_eq!(FourCC(*b"NV12").bytes_per_line(640), Some(640));
        assert_eq!(FourCC(*b"GREY").bytes_per_line(640), Some(640));
        // Unknown and single-stride-less formats have no tabled stride
        assert_eq!(FourCC(*b"I444").bytes_per_line(640), None);
        assert_eq!(FourCC(*b"H264").bytes_per_line(640), None);
    }

    #[test]
    fn test_buffer_size() {
        // Packed formats are exactly stride * height
        assert_eq!(FourCC(*b"RGBA").buffer_size(2560, 480), Some(1228800));
        assert_eq!(FourCC(*b"YUYV").buffer_size(1280, 480), Some(614400));
        // 4:2:0 planar carries half-size chroma
        assert_eq!(FourCC(*b"NV12").buffer_size(640, 480), Some(460800));
        assert_eq!(FourCC(*b"I420").buffer_size(640, 480), Some(460800));
        // Planar 4:2:2 doubles the luma plane
        assert_eq!(FourCC(*b"NV16").buffer_size(640, 480), Some(614400));
        assert_eq!(FourCC(*b"I444").buffer_size(640, 480), None);
    }
}
