//! Named capture presets
//!
//! A preset fixes the viewport size and a device pixel ratio hint. Presets
//! are a closed set; unknown names fail to parse.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetCategory {
    Mobile,
    Tablet,
    Desktop,
    Social,
    Web,
    Custom,
}

impl PresetCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresetCategory::Mobile => "mobile",
            PresetCategory::Tablet => "tablet",
            PresetCategory::Desktop => "desktop",
            PresetCategory::Social => "social",
            PresetCategory::Web => "web",
            PresetCategory::Custom => "custom",
        }
    }
}

impl fmt::Display for PresetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    MobilePortrait,
    MobileLandscape,
    #[serde(rename = "iphone-14")]
    Iphone14,
    #[serde(rename = "iphone-14-pro")]
    Iphone14Pro,
    AndroidStandard,
    Ipad,
    IpadPro,
    TabletLandscape,
    DesktopHd,
    DesktopFhd,
    #[serde(rename = "desktop-2k")]
    Desktop2k,
    #[serde(rename = "desktop-4k")]
    Desktop4k,
    FacebookPost,
    TwitterHeader,
    InstagramSquare,
    InstagramStory,
    YoutubeThumbnail,
    WebBanner,
    BlogHeader,
    ThumbnailLarge,
    ThumbnailMedium,
    ThumbnailSmall,
    SquareLarge,
    SquareMedium,
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PresetSpec {
    pub name: &'static str,
    pub category: PresetCategory,
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl PresetSpec {
    /// Phone and tablet presets render with mobile and touch emulation.
    pub fn emulates_mobile(&self) -> bool {
        matches!(
            self.category,
            PresetCategory::Mobile | PresetCategory::Tablet
        )
    }
}

const fn spec(
    name: &'static str,
    category: PresetCategory,
    width: u32,
    height: u32,
    device_scale_factor: f64,
) -> PresetSpec {
    PresetSpec {
        name,
        category,
        width,
        height,
        device_scale_factor,
    }
}

impl Preset {
    pub const ALL: [Preset; 26] = [
        Preset::MobilePortrait,
        Preset::MobileLandscape,
        Preset::Iphone14,
        Preset::Iphone14Pro,
        Preset::AndroidStandard,
        Preset::Ipad,
        Preset::IpadPro,
        Preset::TabletLandscape,
        Preset::DesktopHd,
        Preset::DesktopFhd,
        Preset::Desktop2k,
        Preset::Desktop4k,
        Preset::FacebookPost,
        Preset::TwitterHeader,
        Preset::InstagramSquare,
        Preset::InstagramStory,
        Preset::YoutubeThumbnail,
        Preset::WebBanner,
        Preset::BlogHeader,
        Preset::ThumbnailLarge,
        Preset::ThumbnailMedium,
        Preset::ThumbnailSmall,
        Preset::SquareLarge,
        Preset::SquareMedium,
        Preset::Portrait,
        Preset::Landscape,
    ];

    pub fn spec(&self) -> PresetSpec {
        use PresetCategory::*;
        match self {
            Preset::MobilePortrait => spec("mobile-portrait", Mobile, 375, 667, 2.0),
            Preset::MobileLandscape => spec("mobile-landscape", Mobile, 667, 375, 2.0),
            Preset::Iphone14 => spec("iphone-14", Mobile, 390, 844, 3.0),
            Preset::Iphone14Pro => spec("iphone-14-pro", Mobile, 393, 852, 3.0),
            Preset::AndroidStandard => spec("android-standard", Mobile, 360, 800, 3.0),
            Preset::Ipad => spec("ipad", Tablet, 768, 1024, 2.0),
            Preset::IpadPro => spec("ipad-pro", Tablet, 1024, 1366, 2.0),
            Preset::TabletLandscape => spec("tablet-landscape", Tablet, 1024, 768, 2.0),
            Preset::DesktopHd => spec("desktop-hd", Desktop, 1280, 720, 1.0),
            Preset::DesktopFhd => spec("desktop-fhd", Desktop, 1920, 1080, 1.0),
            Preset::Desktop2k => spec("desktop-2k", Desktop, 2560, 1440, 1.0),
            Preset::Desktop4k => spec("desktop-4k", Desktop, 3840, 2160, 1.0),
            Preset::FacebookPost => spec("facebook-post", Social, 1200, 630, 1.0),
            Preset::TwitterHeader => spec("twitter-header", Social, 1500, 500, 1.0),
            Preset::InstagramSquare => spec("instagram-square", Social, 1080, 1080, 1.0),
            Preset::InstagramStory => spec("instagram-story", Social, 1080, 1920, 1.0),
            Preset::YoutubeThumbnail => spec("youtube-thumbnail", Social, 1280, 720, 1.0),
            Preset::WebBanner => spec("web-banner", Web, 1920, 400, 1.0),
            Preset::BlogHeader => spec("blog-header", Web, 1200, 600, 1.0),
            Preset::ThumbnailLarge => spec("thumbnail-large", Web, 800, 600, 1.0),
            Preset::ThumbnailMedium => spec("thumbnail-medium", Web, 400, 300, 1.0),
            Preset::ThumbnailSmall => spec("thumbnail-small", Web, 200, 150, 1.0),
            Preset::SquareLarge => spec("square-large", Custom, 1200, 1200, 1.0),
            Preset::SquareMedium => spec("square-medium", Custom, 800, 800, 1.0),
            Preset::Portrait => spec("portrait", Custom, 800, 1200, 1.0),
            Preset::Landscape => spec("landscape", Custom, 1200, 800, 1.0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    /// Preset catalogue grouped by category, in declaration order.
    pub fn grouped() -> BTreeMap<PresetCategory, Vec<PresetSpec>> {
        let mut groups: BTreeMap<PresetCategory, Vec<PresetSpec>> = BTreeMap::new();
        for preset in Preset::ALL {
            let spec = preset.spec();
            groups.entry(spec.category).or_default().push(spec);
        }
        groups
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Preset {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Preset::ALL
            .into_iter()
            .find(|preset| preset.name() == wanted)
            .ok_or_else(|| CaptureError::Validation(format!("unknown preset: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_HEIGHT, MAX_WIDTH, MIN_HEIGHT, MIN_WIDTH};

    #[test]
    fn test_names_parse_back() {
        for preset in Preset::ALL {
            assert_eq!(preset.name().parse::<Preset>().unwrap(), preset);
        }
        assert!("desktop-8k".parse::<Preset>().is_err());
    }

    #[test]
    fn test_serde_names_match_display_names() {
        for preset in Preset::ALL {
            let json = serde_json::to_string(&preset).unwrap();
            assert_eq!(json, format!("\"{}\"", preset.name()));
        }
    }

    #[test]
    fn test_every_preset_fits_option_ranges() {
        for preset in Preset::ALL {
            let spec = preset.spec();
            assert!((MIN_WIDTH..=MAX_WIDTH).contains(&spec.width), "{preset}");
            assert!((MIN_HEIGHT..=MAX_HEIGHT).contains(&spec.height), "{preset}");
            assert!(spec.device_scale_factor >= 1.0);
        }
    }

    #[test]
    fn test_catalogue_covers_all_categories() {
        let groups = Preset::grouped();
        assert_eq!(groups.len(), 6);
        assert_eq!(groups.values().map(Vec::len).sum::<usize>(), 26);
        assert_eq!(groups[&PresetCategory::Social].len(), 5);
        assert!(groups[&PresetCategory::Tablet]
            .iter()
            .all(PresetSpec::emulates_mobile));
    }
}
