use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, Rgba, RgbaImage};
use resvg::render;
use std::io::Cursor;
use std::sync::Arc;
use tiny_skia::Pixmap;
use usvg::{Options, Tree, fontdb};

use super::font::{FontMetrics, ResolvedCaptionFont, ascender_px};
use super::{BoxPx, FittedLayout, OverlayStyle, Rgb};

/// Draws caption boxes and fitted text onto copies of source images. The font
/// database is built once and shared by every job of a batch.
pub struct Compositor {
    fontdb: Arc<fontdb::Database>,
    font: Option<ResolvedCaptionFont>,
}

impl Compositor {
    /// `font == None` renders the box only and measures text with estimated
    /// metrics; text is drawn with whatever default family `db` provides.
    pub fn new(mut db: fontdb::Database, font: Option<ResolvedCaptionFont>) -> Self {
        if let Some(font) = font.as_ref() {
            db.load_font_data(font.metrics.data().to_vec());
        }
        Self {
            fontdb: Arc::new(db),
            font,
        }
    }

    pub fn metrics(&self) -> Option<&FontMetrics> {
        self.font.as_ref().map(|font| &font.metrics)
    }

    pub fn family(&self) -> Option<&str> {
        self.font.as_ref().map(|font| font.family.as_str())
    }

    pub fn render(
        &self,
        source: &DynamicImage,
        geometry: BoxPx,
        overlay: &OverlayStyle,
        layout: &FittedLayout,
        font_color: Rgb,
    ) -> Result<RgbaImage> {
        let mut working = source.to_rgba8();
        let (width, height) = working.dimensions();
        let svg = self.overlay_svg(width, height, geometry, overlay, layout, font_color);
        let layer = self.rasterize(&svg, width, height)?;
        image::imageops::overlay(&mut working, &layer, 0, 0);
        Ok(working)
    }

    fn overlay_svg(
        &self,
        width: u32,
        height: u32,
        geometry: BoxPx,
        overlay: &OverlayStyle,
        layout: &FittedLayout,
        font_color: Rgb,
    ) -> String {
        let mut svg = String::new();
        svg.push_str(&format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
            w = width,
            h = height
        ));
        push_box(&mut svg, geometry, overlay);

        let font_size = layout.font_size as f32;
        let ascender = ascender_px(font_size, self.metrics());
        let block_height = layout.total_height();
        let mut cursor = geometry.y as f32 + ((geometry.h as f32 - block_height) / 2.0).floor();
        let family = self.family();
        for line in &layout.lines {
            let x = geometry.x as f32 + ((geometry.w as f32 - line.width) / 2.0).floor();
            let baseline = cursor + ascender;
            let family_attr = family
                .map(|family| format!(r#" font-family="{}""#, escape_xml(family)))
                .unwrap_or_default();
            // Drawn advance follows the measured width.
            let length_attr = if line.width > 0.0 {
                format!(
                    r#" textLength="{}" lengthAdjust="spacingAndGlyphs""#,
                    line.width
                )
            } else {
                String::new()
            };
            svg.push_str(&format!(
                r#"<text x="{x}" y="{y}" font-size="{size}" fill="{color}"{family}{length}>{text}</text>"#,
                x = x,
                y = baseline,
                size = font_size,
                color = font_color.to_hex(),
                family = family_attr,
                length = length_attr,
                text = escape_xml(&line.text)
            ));
            cursor += line.height + layout.line_spacing;
        }

        svg.push_str("</svg>");
        svg
    }

    fn rasterize(&self, svg: &str, width: u32, height: u32) -> Result<RgbaImage> {
        let options = Options {
            fontdb: Arc::clone(&self.fontdb),
            ..Options::default()
        };
        let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse overlay SVG")?;
        let mut pixmap =
            Pixmap::new(width, height).ok_or_else(|| anyhow!("empty image size"))?;
        let mut pixmap_mut = pixmap.as_mut();
        render(&tree, tiny_skia::Transform::identity(), &mut pixmap_mut);

        let mut layer = RgbaImage::new(width, height);
        for (pixel, src) in layer.pixels_mut().zip(pixmap.pixels()) {
            let color = src.demultiply();
            *pixel = Rgba([color.red(), color.green(), color.blue(), color.alpha()]);
        }
        Ok(layer)
    }
}

/// Fill first, then the outline drawn inside the box edge. The box covers
/// exactly `w` x `h` pixels starting at `(x, y)`.
fn push_box(svg: &mut String, geometry: BoxPx, overlay: &OverlayStyle) {
    let BoxPx { x, y, w, h } = geometry;
    svg.push_str(&format!(
        r#"<rect x="{x}" y="{y}" width="{w}" height="{h}" fill="{fill}" fill-opacity="{alpha}"/>"#,
        fill = overlay.fill_color.to_hex(),
        alpha = overlay.fill_alpha as f32 / 255.0
    ));
    let stroke = overlay.outline_width;
    if stroke == 0 {
        return;
    }
    if stroke * 2 >= w.min(h) {
        svg.push_str(&format!(
            r#"<rect x="{x}" y="{y}" width="{w}" height="{h}" fill="{color}"/>"#,
            color = overlay.outline_color.to_hex()
        ));
        return;
    }
    let half = stroke as f32 / 2.0;
    svg.push_str(&format!(
        r#"<rect x="{sx}" y="{sy}" width="{sw}" height="{sh}" fill="none" stroke="{color}" stroke-width="{stroke}"/>"#,
        sx = x as f32 + half,
        sy = y as f32 + half,
        sw = (w - stroke) as f32,
        sh = (h - stroke) as f32,
        color = overlay.outline_color.to_hex(),
        stroke = stroke
    ));
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut cursor = Cursor::new(&mut bytes);
    image
        .write_to(&mut cursor, image::ImageFormat::Png)
        .with_context(|| "failed to encode PNG")?;
    Ok(bytes)
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caption::font::{default_fallback_families, resolve_caption_font};
    use crate::caption::{FitParams, WrappedLine, fit};

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    fn red_image() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(40, 40, RED))
    }

    fn geometry() -> BoxPx {
        BoxPx {
            x: 10,
            y: 10,
            w: 20,
            h: 20,
        }
    }

    fn empty_layout() -> FittedLayout {
        FittedLayout {
            font_size: 10,
            lines: Vec::new(),
            line_spacing: 10.0,
            fits: false,
        }
    }

    fn close(a: u8, b: u8) -> bool {
        (a as i16 - b as i16).abs() <= 2
    }

    #[test]
    fn fill_is_blended_inside_the_box_only() {
        let compositor = Compositor::new(fontdb::Database::new(), None);
        let overlay = OverlayStyle {
            fill_color: Rgb::BLACK,
            fill_alpha: 100,
            outline_color: Rgb::WHITE,
            outline_width: 0,
        };
        let out = compositor
            .render(&red_image(), geometry(), &overlay, &empty_layout(), Rgb::WHITE)
            .expect("render");

        let inside = out.get_pixel(20, 20);
        assert!(close(inside[0], 155), "{:?}", inside);
        assert_eq!(inside[1], 0);
        assert_eq!(inside[3], 255);
        assert!(close(out.get_pixel(10, 10)[0], 155));
        assert_eq!(*out.get_pixel(2, 2), RED);
        assert_eq!(*out.get_pixel(35, 20), RED);
    }

    #[test]
    fn outline_is_drawn_inside_the_box_edge() {
        let compositor = Compositor::new(fontdb::Database::new(), None);
        let overlay = OverlayStyle {
            fill_color: Rgb::BLACK,
            fill_alpha: 0,
            outline_color: Rgb::WHITE,
            outline_width: 2,
        };
        let out = compositor
            .render(&red_image(), geometry(), &overlay, &empty_layout(), Rgb::WHITE)
            .expect("render");

        for (x, y) in [(10, 20), (11, 20), (29, 20), (20, 10), (20, 29)] {
            let pixel = out.get_pixel(x, y);
            assert!(pixel[1] > 250 && pixel[2] > 250, "({x},{y}) = {:?}", pixel);
        }
        assert_eq!(*out.get_pixel(20, 20), RED);
        assert_eq!(*out.get_pixel(9, 20), RED);
        assert_eq!(*out.get_pixel(30, 20), RED);
    }

    #[test]
    fn rendering_is_repeatable_and_leaves_source_untouched() {
        let compositor = Compositor::new(fontdb::Database::new(), None);
        let source = red_image();
        let before = source.clone();
        let lines = vec!["Hello".to_string(), "World".to_string()];
        let layout = fit(&lines, &FitParams::default().with_box(20, 20), None);

        let first = compositor
            .render(&source, geometry(), &OverlayStyle::default(), &layout, Rgb::WHITE)
            .expect("render");
        let second = compositor
            .render(&source, geometry(), &OverlayStyle::default(), &layout, Rgb::WHITE)
            .expect("render");
        assert_eq!(first, second);
        assert_eq!(source, before);
    }

    #[test]
    fn box_outside_the_image_is_ignored() {
        let compositor = Compositor::new(fontdb::Database::new(), None);
        let geometry = BoxPx {
            x: -100,
            y: 60,
            w: 20,
            h: 20,
        };
        let out = compositor
            .render(&red_image(), geometry, &OverlayStyle::default(), &empty_layout(), Rgb::WHITE)
            .expect("render");
        assert!(out.pixels().all(|pixel| *pixel == RED));
    }

    #[test]
    fn svg_centers_lines_inside_the_box() {
        let compositor = Compositor::new(fontdb::Database::new(), None);
        let layout = FittedLayout {
            font_size: 10,
            lines: vec![
                WrappedLine {
                    text: "a & b".to_string(),
                    width: 8.0,
                    height: 10.0,
                },
                WrappedLine {
                    text: "c".to_string(),
                    width: 4.0,
                    height: 6.0,
                },
            ],
            line_spacing: 2.0,
            fits: true,
        };
        let svg = compositor.overlay_svg(
            40,
            40,
            geometry(),
            &OverlayStyle::default(),
            &layout,
            Rgb::WHITE,
        );
        assert!(svg.contains(r##"<text x="16" y="19" font-size="10" fill="#ffffff" textLength="8" lengthAdjust="spacingAndGlyphs">a &amp; b</text>"##));
        assert!(svg.contains(r##"<text x="18" y="31" font-size="10" fill="#ffffff" textLength="4" lengthAdjust="spacingAndGlyphs">c</text>"##));
    }

    #[test]
    fn text_is_drawn_when_a_system_font_exists() {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        let Ok(font) = resolve_caption_font(&db, None, None, default_fallback_families()) else {
            return;
        };
        let compositor = Compositor::new(db, Some(font));
        let source = DynamicImage::ImageRgba8(RgbaImage::from_pixel(200, 100, Rgba([0, 0, 0, 255])));
        let geometry = BoxPx {
            x: 0,
            y: 0,
            w: 200,
            h: 100,
        };
        let overlay = OverlayStyle {
            fill_alpha: 0,
            outline_width: 0,
            ..OverlayStyle::default()
        };
        let lines = vec!["MMMM".to_string()];
        let params = FitParams::default().with_box(200, 100);
        let layout = fit(&lines, &params, compositor.metrics());
        let out = compositor
            .render(&source, geometry, &overlay, &layout, Rgb::WHITE)
            .expect("render");
        assert!(out.pixels().any(|pixel| pixel[0] > 128));
    }

    #[test]
    fn box_covers_exactly_its_width_and_height() {
        let compositor = Compositor::new(fontdb::Database::new(), None);
        let overlay = OverlayStyle {
            fill_color: Rgb::BLACK,
            fill_alpha: 255,
            outline_color: Rgb::WHITE,
            outline_width: 0,
        };
        let out = compositor
            .render(&red_image(), geometry(), &overlay, &empty_layout(), Rgb::WHITE)
            .expect("render");
        assert_eq!(*out.get_pixel(10, 10), Rgba([0, 0, 0, 255]));
        assert_eq!(*out.get_pixel(29, 29), Rgba([0, 0, 0, 255]));
        assert_eq!(*out.get_pixel(30, 29), RED);
        assert_eq!(*out.get_pixel(29, 30), RED);
        assert_eq!(*out.get_pixel(30, 30), RED);
    }

    #[test]
    fn kerned_text_stays_within_its_measured_width() {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        let Ok(font) = resolve_caption_font(&db, None, None, default_fallback_families()) else {
            return;
        };
        let compositor = Compositor::new(db, Some(font));
        let source = DynamicImage::ImageRgba8(RgbaImage::from_pixel(400, 100, Rgba([0, 0, 0, 255])));
        let geometry = BoxPx {
            x: 0,
            y: 0,
            w: 400,
            h: 100,
        };
        let overlay = OverlayStyle {
            fill_alpha: 0,
            outline_width: 0,
            ..OverlayStyle::default()
        };
        let lines = vec!["AVAVAV WAVE To".to_string()];
        let params = FitParams {
            max_size: 40,
            ..FitParams::default().with_box(400, 100)
        };
        let layout = fit(&lines, &params, compositor.metrics());
        let line = &layout.lines[0];
        let left = ((400.0 - line.width) / 2.0).floor();
        let right = left + line.width;
        let out = compositor
            .render(&source, geometry, &overlay, &layout, Rgb::WHITE)
            .expect("render");
        for (x, _, pixel) in out.enumerate_pixels() {
            if pixel[0] > 128 {
                assert!(
                    x as f32 >= left - 2.0 && x as f32 <= right + 2.0,
                    "ink at x={x} outside [{left}, {right}]"
                );
            }
        }
    }

    #[test]
    fn encode_png_produces_decodable_image() {
        let image = RgbaImage::from_pixel(3, 2, RED);
        let bytes = encode_png(&image).expect("encode");
        let decoded = image::load_from_memory(&bytes).expect("decode").to_rgba8();
        assert_eq!(decoded, image);
    }
}
