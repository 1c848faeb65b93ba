mod font;
mod geom;
mod layout;
mod render;

pub use font::{
    FontMetrics, ResolvedCaptionFont, default_fallback_families, list_font_files,
    load_font_metrics, measure_text_height_px, measure_text_width_px, resolve_caption_font,
};
pub(crate) use font::locate_font;
pub use geom::BoxSettings;
pub use layout::{FitParams, fit, fit_scaled};
pub use render::{Compositor, encode_png};

use anyhow::{Result, anyhow};

/// Absolute pixel rectangle inside an image. The origin may be negative when
/// an offset pushes the box past the top-left edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BoxPx {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct WrappedLine {
    pub text: String,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FittedLayout {
    pub font_size: u32,
    pub lines: Vec<WrappedLine>,
    pub line_spacing: f32,
    /// False when even the smallest size overflowed the box.
    pub fits: bool,
}

impl FittedLayout {
    pub fn total_height(&self) -> f32 {
        if self.lines.is_empty() {
            return 0.0;
        }
        let heights: f32 = self.lines.iter().map(|line| line.height).sum();
        heights + self.line_spacing * (self.lines.len() - 1) as f32
    }

    pub fn max_line_width(&self) -> f32 {
        self.lines.iter().map(|line| line.width).fold(0.0, f32::max)
    }

    pub fn texts(&self) -> Vec<&str> {
        self.lines.iter().map(|line| line.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const BLACK: Rgb = Rgb(0, 0, 0);
    pub const WHITE: Rgb = Rgb(255, 255, 255);

    /// Parses `#RRGGBB`, `RRGGBB` or the short `#RGB` form.
    pub fn parse_hex(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(anyhow!("invalid color '{}': expected #RRGGBB", value));
        }
        let expanded = match hex.len() {
            3 => hex.chars().flat_map(|ch| [ch, ch]).collect::<String>(),
            6 => hex.to_string(),
            _ => return Err(anyhow!("invalid color '{}': expected #RRGGBB", value)),
        };
        let channel = |idx: usize| {
            u8::from_str_radix(&expanded[idx..idx + 2], 16)
                .map_err(|_| anyhow!("invalid color '{}': expected #RRGGBB", value))
        };
        Ok(Rgb(channel(0)?, channel(2)?, channel(4)?))
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    pub fill_color: Rgb,
    pub fill_alpha: u8,
    pub outline_color: Rgb,
    pub outline_width: u32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            fill_color: Rgb::BLACK,
            fill_alpha: 100,
            outline_color: Rgb::WHITE,
            outline_width: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionStyle {
    pub font_color: Rgb,
    pub font_scale_pct: u32,
    pub overlay: OverlayStyle,
    pub fit: FitParams,
}

impl Default for CaptionStyle {
    fn default() -> Self {
        Self {
            font_color: Rgb::WHITE,
            font_scale_pct: 100,
            overlay: OverlayStyle::default(),
            fit: FitParams::default(),
        }
    }
}
