//! Pixel formats understood by the import pipeline
//!
//! Formats arrive either as `wl_shm` format codes (software buffers) or as DRM
//! fourcc codes (hardware buffers). `wl_shm` reuses fourcc values for all but
//! the two mandatory formats, which are `0` and `1` on the wire.

use serde::{Deserialize, Serialize};
use wayland_server::protocol::wl_shm;

const DRM_FORMAT_ARGB8888: u32 = 0x3432_5241; // 'AR24'
const DRM_FORMAT_XRGB8888: u32 = 0x3432_5258; // 'XR24'
const DRM_FORMAT_ABGR8888: u32 = 0x3432_4241; // 'AB24'
const DRM_FORMAT_XBGR8888: u32 = 0x3432_4258; // 'XB24'
const DRM_FORMAT_RGB565: u32 = 0x3631_4752; // 'RG16'
const DRM_FORMAT_RGB888: u32 = 0x3432_4752; // 'RG24'
const DRM_FORMAT_BGR888: u32 = 0x3432_4742; // 'BG24'
const DRM_FORMAT_RGBA4444: u32 = 0x3231_4152; // 'RA12'
const DRM_FORMAT_RGBA5551: u32 = 0x3531_4152; // 'RA15'

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Abgr8888,
    Xbgr8888,
    Rgb565,
    Rgb888,
    Bgr888,
    Rgba4444,
    Rgba5551,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Argb8888,
        PixelFormat::Xrgb8888,
        PixelFormat::Abgr8888,
        PixelFormat::Xbgr8888,
        PixelFormat::Rgb565,
        PixelFormat::Rgb888,
        PixelFormat::Bgr888,
        PixelFormat::Rgba4444,
        PixelFormat::Rgba5551,
    ];

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Argb8888
            | PixelFormat::Xrgb8888
            | PixelFormat::Abgr8888
            | PixelFormat::Xbgr8888 => 4,
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => 3,
            PixelFormat::Rgb565 | PixelFormat::Rgba4444 | PixelFormat::Rgba5551 => 2,
        }
    }

    pub fn has_alpha(&self) -> bool {
        matches!(
            self,
            PixelFormat::Argb8888
                | PixelFormat::Abgr8888
                | PixelFormat::Rgba4444
                | PixelFormat::Rgba5551
        )
    }

    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Argb8888 => DRM_FORMAT_ARGB8888,
            PixelFormat::Xrgb8888 => DRM_FORMAT_XRGB8888,
            PixelFormat::Abgr8888 => DRM_FORMAT_ABGR8888,
            PixelFormat::Xbgr8888 => DRM_FORMAT_XBGR8888,
            PixelFormat::Rgb565 => DRM_FORMAT_RGB565,
            PixelFormat::Rgb888 => DRM_FORMAT_RGB888,
            PixelFormat::Bgr888 => DRM_FORMAT_BGR888,
            PixelFormat::Rgba4444 => DRM_FORMAT_RGBA4444,
            PixelFormat::Rgba5551 => DRM_FORMAT_RGBA5551,
        }
    }

    pub fn from_fourcc(fourcc: u32) -> Option<Self> {
        PixelFormat::ALL.into_iter().find(|f| f.fourcc() == fourcc)
    }

    pub fn from_wl_shm(format: wl_shm::Format) -> Option<Self> {
        match format {
            wl_shm::Format::Argb8888 => Some(PixelFormat::Argb8888),
            wl_shm::Format::Xrgb8888 => Some(PixelFormat::Xrgb8888),
            wl_shm::Format::Abgr8888 => Some(PixelFormat::Abgr8888),
            wl_shm::Format::Xbgr8888 => Some(PixelFormat::Xbgr8888),
            wl_shm::Format::Rgb565 => Some(PixelFormat::Rgb565),
            wl_shm::Format::Rgb888 => Some(PixelFormat::Rgb888),
            wl_shm::Format::Bgr888 => Some(PixelFormat::Bgr888),
            wl_shm::Format::Rgba4444 => Some(PixelFormat::Rgba4444),
            wl_shm::Format::Rgba5551 => Some(PixelFormat::Rgba5551),
            _ => None,
        }
    }

    /// Decodes a raw `wl_shm` format code as sent on the wire
    pub fn from_shm_code(code: u32) -> Option<Self> {
        wl_shm::Format::try_from(code)
            .ok()
            .and_then(PixelFormat::from_wl_shm)
    }

    /// Minimum stride in bytes for a row of `width` pixels
    pub fn min_stride(&self, width: u32) -> u64 {
        width as u64 * self.bytes_per_pixel() as u64
    }
}
