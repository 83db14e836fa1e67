//! Hardware acceleration type selection and the best-effort enumeration the
//! controller exposes for populating a `hwType` argument (grounded in
//! `original_source`'s `Bridge::hwTypes`).

use std::fmt;
use std::str::FromStr;

use gstreamer as gst;
use gstreamer::prelude::*;

/// A hardware accelerator family. `None` means software-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareAccel {
    None,
    Vaapi,
    Nvidia,
    D3d11,
    VideoToolbox,
}

impl HardwareAccel {
    /// Decoder element-factory name to try for this accelerator, paired
    /// with the codec it decodes (only H.264 is relevant to this pipeline).
    pub fn decoder_element(self) -> Option<&'static str> {
        match self {
            HardwareAccel::None => None,
            HardwareAccel::Vaapi => Some("vah264dec"),
            HardwareAccel::Nvidia => Some("nvh264dec"),
            HardwareAccel::D3d11 => Some("d3d11h264dec"),
            HardwareAccel::VideoToolbox => Some("vtdec"),
        }
    }

    /// Encoder element-factory name.
    pub fn encoder_element(self) -> Option<&'static str> {
        match self {
            HardwareAccel::None => None,
            HardwareAccel::Vaapi => Some("vah264enc"),
            HardwareAccel::Nvidia => Some("nvh264enc"),
            HardwareAccel::D3d11 => Some("d3d11h264enc"),
            HardwareAccel::VideoToolbox => Some("vtenc_h264"),
        }
    }

    /// True if the named factory is actually registered in this GStreamer
    /// installation. Used by decoder/encoder init to decide whether to
    /// silently fall back to software.
    pub fn is_available(self) -> bool {
        match self {
            HardwareAccel::None => true,
            _ => self
                .decoder_element()
                .map(|name| gst::ElementFactory::find(name).is_some())
                .unwrap_or(false),
        }
    }

    /// Best-effort probe of every known hardware family, for surfacing a
    /// `hwTypes()`-style list to callers. Does not require a device to
    /// actually work, only that the plugin is registered — matching the
    /// original's "enumerate configs" behavior, not an exhaustive
    /// capability query.
    pub fn available() -> Vec<HardwareAccel> {
        [
            HardwareAccel::Vaapi,
            HardwareAccel::Nvidia,
            HardwareAccel::D3d11,
            HardwareAccel::VideoToolbox,
        ]
        .into_iter()
        .filter(|hw| hw.is_available())
        .collect()
    }
}

impl fmt::Display for HardwareAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HardwareAccel::None => "none",
            HardwareAccel::Vaapi => "vaapi",
            HardwareAccel::Nvidia => "cuda",
            HardwareAccel::D3d11 => "d3d11",
            HardwareAccel::VideoToolbox => "videotoolbox",
        };
        write!(f, "{s}")
    }
}

impl FromStr for HardwareAccel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(HardwareAccel::None),
            "vaapi" => Ok(HardwareAccel::Vaapi),
            "cuda" | "nvidia" | "nvenc" | "nvdec" => Ok(HardwareAccel::Nvidia),
            "d3d11" | "dxva" => Ok(HardwareAccel::D3d11),
            "videotoolbox" | "vt" => Ok(HardwareAccel::VideoToolbox),
            other => Err(format!("unrecognized hardware type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_parses_and_is_always_available() {
        assert_eq!(HardwareAccel::from_str("None").unwrap(), HardwareAccel::None);
        assert!(HardwareAccel::None.is_available());
    }

    #[test]
    fn cuda_alias_maps_to_nvidia() {
        assert_eq!(HardwareAccel::from_str("cuda").unwrap(), HardwareAccel::Nvidia);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(HardwareAccel::from_str("quantum").is_err());
    }
}
