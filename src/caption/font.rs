use anyhow::{Context, Result, anyhow};
use globset::{GlobBuilder, GlobMatcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use ttf_parser::Face;
use ttf_parser::name_id;
use usvg::fontdb;

const ESTIMATED_ASCENDER_EM: f32 = 0.8;
const ESTIMATED_INK_HEIGHT_EM: f32 = 1.0;

#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    units_per_em: u16,
    space_advance: u16,
    ascender: i16,
    family: Option<String>,
    face_index: u32,
}

impl std::fmt::Debug for FontMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontMetrics")
            .field("family", &self.family)
            .field("units_per_em", &self.units_per_em)
            .field("face_index", &self.face_index)
            .finish_non_exhaustive()
    }
}

impl FontMetrics {
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn scale(&self, font_size: f32) -> f32 {
        font_size / self.units_per_em.max(1) as f32
    }
}

pub fn load_font_metrics(path: &Path) -> Result<FontMetrics> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read font: {}", path.display()))?;
    load_font_metrics_from_data(&data, None)
        .map_err(|err| anyhow!("failed to parse font: {} ({})", path.display(), err))
}

#[derive(Debug, Clone)]
pub struct ResolvedCaptionFont {
    pub metrics: FontMetrics,
    pub family: String,
}

#[cfg(target_os = "macos")]
pub fn default_fallback_families() -> &'static [&'static str] {
    &["NotoSans", "Helvetica", "Arial", "sans-serif"]
}

#[cfg(target_os = "windows")]
pub fn default_fallback_families() -> &'static [&'static str] {
    &["NotoSans", "Arial", "sans-serif"]
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub fn default_fallback_families() -> &'static [&'static str] {
    &["NotoSans", "DejaVu Sans", "Liberation Sans", "sans-serif"]
}

/// Resolves the caption font. A configured path or family that cannot be
/// loaded is replaced by the first available fallback family; only running
/// out of fallbacks is an error.
pub fn resolve_caption_font(
    db: &fontdb::Database,
    font_path: Option<&Path>,
    font_family: Option<&str>,
    fallback: &[&str],
) -> Result<ResolvedCaptionFont> {
    if let Some(path) = font_path {
        match load_font_metrics(path) {
            Ok(metrics) => {
                let family = metrics
                    .family()
                    .map(|name| name.to_string())
                    .or_else(|| font_family.map(|name| name.to_string()))
                    .unwrap_or_else(|| "sans-serif".to_string());
                return Ok(ResolvedCaptionFont { metrics, family });
            }
            Err(err) => warn!("{:#}; using a default font instead", err),
        }
    }

    if let Some(family) = font_family {
        match load_font_metrics_from_family(db, family) {
            Ok(resolved) => return Ok(resolved),
            Err(err) => warn!("{:#}; using a default font instead", err),
        }
    }

    for candidate in fallback {
        if let Ok(resolved) = load_font_metrics_from_family(db, candidate) {
            debug!(family = %resolved.family, "resolved fallback font");
            return Ok(resolved);
        }
    }

    Err(anyhow!("no fallback fonts found"))
}

/// Font files (`*.ttf`, `*.otf`) directly inside `dir`, sorted by path.
pub fn list_font_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let matcher = font_file_matcher()?;
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list font directory: {}", dir.display()))?;
    let mut fonts = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read font directory: {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .file_name()
            .map(|name| matcher.is_match(Path::new(name)))
            .unwrap_or(false);
        if matches {
            fonts.push(path);
        }
    }
    fonts.sort();
    Ok(fonts)
}

/// Maps a `--font` value to a file: an existing path is used as is, otherwise
/// the value is looked up by file name in the font directory.
pub(crate) fn locate_font(value: &str, font_dir: Option<&Path>) -> Result<PathBuf> {
    let direct = PathBuf::from(value);
    if direct.is_file() {
        return Ok(direct);
    }
    if let Some(dir) = font_dir.filter(|dir| dir.is_dir()) {
        for path in list_font_files(dir)? {
            let name = path.file_name().and_then(|name| name.to_str());
            if name == Some(value) {
                return Ok(path);
            }
        }
    }
    Ok(direct)
}

fn font_file_matcher() -> Result<GlobMatcher> {
    let glob = GlobBuilder::new("*.{ttf,otf}")
        .case_insensitive(true)
        .build()
        .with_context(|| "failed to build font file pattern")?;
    Ok(glob.compile_matcher())
}

pub fn measure_text_width_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    if let Some(font) = font {
        if let Ok(face) = Face::parse(&font.data, font.face_index) {
            let mut advance = 0u32;
            for ch in text.chars() {
                if ch == '\n' {
                    continue;
                }
                if ch == ' ' {
                    advance = advance.saturating_add(font.space_advance as u32);
                    continue;
                }
                if let Some(glyph) = face.glyph_index(ch) {
                    let glyph_advance = face.glyph_hor_advance(glyph).unwrap_or(font.space_advance);
                    advance = advance.saturating_add(glyph_advance as u32);
                } else {
                    advance = advance.saturating_add(font.space_advance as u32);
                }
            }
            return advance as f32 * font.scale(font_size);
        }
    }
    estimate_text_width_units(text) * font_size
}

/// Ink height of `text`: from the top of the tallest glyph to the bottom of
/// the lowest one.
pub fn measure_text_height_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    if let Some(font) = font {
        if let Ok(face) = Face::parse(&font.data, font.face_index) {
            let mut top: Option<i16> = None;
            let mut bottom: Option<i16> = None;
            for ch in text.chars().filter(|ch| !ch.is_whitespace()) {
                let Some(rect) = face
                    .glyph_index(ch)
                    .and_then(|glyph| face.glyph_bounding_box(glyph))
                else {
                    continue;
                };
                top = Some(top.map_or(rect.y_max, |value| value.max(rect.y_max)));
                bottom = Some(bottom.map_or(rect.y_min, |value| value.min(rect.y_min)));
            }
            return match (top, bottom) {
                (Some(top), Some(bottom)) => {
                    (top as f32 - bottom as f32).max(0.0) * font.scale(font_size)
                }
                _ => 0.0,
            };
        }
    }
    if text.trim().is_empty() {
        0.0
    } else {
        font_size * ESTIMATED_INK_HEIGHT_EM
    }
}

pub(crate) fn ascender_px(font_size: f32, font: Option<&FontMetrics>) -> f32 {
    match font {
        Some(font) => font.ascender as f32 * font.scale(font_size),
        None => font_size * ESTIMATED_ASCENDER_EM,
    }
}

fn estimate_char_units_for_width(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.25
    } else if ch.is_ascii_alphanumeric() {
        0.55
    } else if ch.is_ascii() {
        0.35
    } else if matches!(
        ch as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0x31F0..=0x31FF
    ) {
        1.0
    } else {
        0.9
    }
}

fn estimate_text_width_units(text: &str) -> f32 {
    text.chars().map(estimate_char_units_for_width).sum()
}

fn load_font_metrics_from_data(data: &[u8], preferred_family: Option<&str>) -> Result<FontMetrics> {
    let mut fallback = None;
    let shared = Arc::new(data.to_vec());
    let count = ttf_parser::fonts_in_collection(data).unwrap_or(1);
    for index in 0..count {
        if let Ok(face) = Face::parse(data, index) {
            let family = extract_family_name(&face);
            let units_per_em = face.units_per_em().max(1);
            let space_advance = face
                .glyph_index(' ')
                .and_then(|id| face.glyph_hor_advance(id))
                .unwrap_or(units_per_em / 2);
            let metrics = FontMetrics {
                data: Arc::clone(&shared),
                units_per_em,
                space_advance,
                ascender: face.ascender(),
                family: family.clone(),
                face_index: index,
            };
            if let (Some(preferred), Some(found)) = (preferred_family, &family) {
                if found.eq_ignore_ascii_case(preferred) {
                    return Ok(metrics);
                }
            }
            if fallback.is_none() {
                fallback = Some(metrics);
            }
        }
    }
    fallback.ok_or_else(|| anyhow!("failed to parse font data"))
}

fn load_font_metrics_from_family(
    db: &fontdb::Database,
    family: &str,
) -> Result<ResolvedCaptionFont> {
    let is_sans = family.eq_ignore_ascii_case("sans-serif");
    let families = if is_sans {
        vec![fontdb::Family::SansSerif]
    } else {
        vec![fontdb::Family::Name(family)]
    };
    let query = fontdb::Query {
        families: &families,
        ..Default::default()
    };
    let id = db
        .query(&query)
        .ok_or_else(|| anyhow!("font not found: {}", family))?;
    let (data, face_index) = db
        .with_face_data(id, |data, index| (data.to_vec(), index))
        .ok_or_else(|| anyhow!("failed to load font data: {}", family))?;
    let mut metrics = load_font_metrics_from_data(&data, (!is_sans).then_some(family))?;
    if metrics.face_index != face_index {
        if let Ok(exact) = load_face_at(&data, face_index) {
            metrics = exact;
        }
    }
    let resolved_family = metrics
        .family()
        .map(|name| name.to_string())
        .unwrap_or_else(|| family.to_string());
    Ok(ResolvedCaptionFont {
        metrics,
        family: resolved_family,
    })
}

fn load_face_at(data: &[u8], index: u32) -> Result<FontMetrics> {
    let face = Face::parse(data, index).map_err(|err| anyhow!("{}", err))?;
    let units_per_em = face.units_per_em().max(1);
    Ok(FontMetrics {
        data: Arc::new(data.to_vec()),
        units_per_em,
        space_advance: face
            .glyph_index(' ')
            .and_then(|id| face.glyph_hor_advance(id))
            .unwrap_or(units_per_em / 2),
        ascender: face.ascender(),
        family: extract_family_name(&face),
        face_index: index,
    })
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}
