use tracing::debug;

use super::font::{FontMetrics, measure_text_height_px, measure_text_width_px};
use super::{FittedLayout, WrappedLine};

/// Candidate sizes are tried in steps of this many units, largest first.
const FONT_SIZE_STEP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitParams {
    pub box_width: f32,
    pub box_height: f32,
    pub max_size: u32,
    pub min_size: u32,
    pub line_spacing: f32,
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            box_width: 400.0,
            box_height: 200.0,
            max_size: 120,
            min_size: 10,
            line_spacing: 10.0,
        }
    }
}

impl FitParams {
    pub fn with_box(self, width: u32, height: u32) -> Self {
        Self {
            box_width: width as f32,
            box_height: height as f32,
            ..self
        }
    }
}

/// Finds the largest font size in `[min_size, max_size]` at which `lines`,
/// word-wrapped to the box width, also fit the box height. When nothing fits
/// the layout computed at `min_size` is returned with `fits == false`.
pub fn fit(lines: &[String], params: &FitParams, font: Option<&FontMetrics>) -> FittedLayout {
    let min_size = params.min_size.max(1);
    let max_size = params.max_size.max(min_size);

    let mut size = max_size;
    loop {
        let wrapped = wrap_lines(lines, size as f32, params.box_width, font);
        if fits_box(&wrapped, params) {
            debug!(size, lines = wrapped.len(), "caption fit");
            return FittedLayout {
                font_size: size,
                lines: wrapped,
                line_spacing: params.line_spacing,
                fits: true,
            };
        }
        if size == min_size {
            debug!(size, lines = wrapped.len(), "caption overflows at minimum size");
            return FittedLayout {
                font_size: size,
                lines: wrapped,
                line_spacing: params.line_spacing,
                fits: false,
            };
        }
        size = size.saturating_sub(FONT_SIZE_STEP).max(min_size);
    }
}

/// Fits once at `max_size`, scales the resulting size by `scale_pct` and fits
/// again with the scaled size as the new ceiling, so line breaks follow the
/// scaled size.
pub fn fit_scaled(
    lines: &[String],
    params: &FitParams,
    scale_pct: u32,
    font: Option<&FontMetrics>,
) -> FittedLayout {
    let base = fit(lines, params, font);
    let scaled = (base.font_size as u64 * scale_pct as u64 / 100) as u32;
    let scaled = scaled.max(params.min_size);
    debug!(base = base.font_size, scaled, scale_pct, "scaled caption size");
    let rescaled = FitParams {
        max_size: scaled,
        ..*params
    };
    fit(lines, &rescaled, font)
}

fn fits_box(wrapped: &[WrappedLine], params: &FitParams) -> bool {
    if wrapped.is_empty() {
        return false;
    }
    let total: f32 = wrapped
        .iter()
        .map(|line| line.height + params.line_spacing)
        .sum();
    let max_width = wrapped.iter().map(|line| line.width).fold(0.0, f32::max);
    total - params.line_spacing <= params.box_height && max_width <= params.box_width
}

/// One fit pass: greedy word wrap of every non-blank line at `font_size`.
fn wrap_lines(
    lines: &[String],
    font_size: f32,
    box_width: f32,
    font: Option<&FontMetrics>,
) -> Vec<WrappedLine> {
    let mut wrapped = Vec::new();
    for raw in lines {
        let mut current = String::new();
        for word in raw.split_whitespace() {
            if current.is_empty() {
                current.push_str(word);
                continue;
            }
            let trial = format!("{} {}", current, word);
            if measure_text_width_px(&trial, font_size, font) <= box_width {
                current = trial;
            } else {
                wrapped.push(measure_line(std::mem::take(&mut current), font_size, font));
                current.push_str(word);
            }
        }
        if !current.is_empty() {
            wrapped.push(measure_line(current, font_size, font));
        }
    }
    wrapped
}

fn measure_line(text: String, font_size: f32, font: Option<&FontMetrics>) -> WrappedLine {
    WrappedLine {
        width: measure_text_width_px(&text, font_size, font),
        height: measure_text_height_px(&text, font_size, font),
        text,
    }
}
