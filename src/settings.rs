use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::caption::{BoxSettings, CaptionStyle, FitParams, OverlayStyle, Rgb};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

pub const MIN_FONT_SCALE_PCT: u32 = 80;
pub const MAX_FONT_SCALE_PCT: u32 = 200;
pub const MAX_OUTLINE_WIDTH: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxMode {
    Fixed,
    Percent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoxConfig {
    pub mode: BoxMode,
    pub width: u32,
    pub height: u32,
    pub x_offset: i32,
    pub y_offset: i32,
    pub width_pct: f32,
    pub height_pct: f32,
    pub x_offset_pct: f32,
    pub y_offset_pct: f32,
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            mode: BoxMode::Fixed,
            width: 400,
            height: 200,
            x_offset: 0,
            y_offset: 0,
            width_pct: 80.0,
            height_pct: 30.0,
            x_offset_pct: 0.0,
            y_offset_pct: 0.0,
        }
    }
}

impl BoxConfig {
    pub fn to_box_settings(&self) -> BoxSettings {
        match self.mode {
            BoxMode::Fixed => BoxSettings::Fixed {
                width: self.width,
                height: self.height,
                x_offset: self.x_offset,
                y_offset: self.y_offset,
            },
            BoxMode::Percent => BoxSettings::Percent {
                width_pct: self.width_pct,
                height_pct: self.height_pct,
                x_offset_pct: self.x_offset_pct,
                y_offset_pct: self.y_offset_pct,
            },
        }
    }

    fn apply(&mut self, incoming: &BoxFile) {
        if let Some(mode) = incoming.mode {
            self.mode = mode;
        }
        if let Some(width) = incoming.width {
            self.width = width;
        }
        if let Some(height) = incoming.height {
            self.height = height;
        }
        if let Some(offset) = incoming.x_offset {
            self.x_offset = offset;
        }
        if let Some(offset) = incoming.y_offset {
            self.y_offset = offset;
        }
        if let Some(pct) = incoming.width_pct {
            self.width_pct = pct;
        }
        if let Some(pct) = incoming.height_pct {
            self.height_pct = pct;
        }
        if let Some(pct) = incoming.x_offset_pct {
            self.x_offset_pct = pct;
        }
        if let Some(pct) = incoming.y_offset_pct {
            self.y_offset_pct = pct;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub font_path: Option<String>,
    pub font_family: Option<String>,
    pub font_dir: Option<String>,
    pub font_color: Rgb,
    pub font_scale_pct: u32,
    pub max_font_size: u32,
    pub min_font_size: u32,
    pub line_spacing: f32,
    pub fill_color: Rgb,
    pub fill_alpha: u8,
    pub outline_color: Rgb,
    pub outline_width: u32,
    pub box_config: BoxConfig,
    overrides: HashMap<String, BoxFile>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            font_path: None,
            font_family: None,
            font_dir: Some("font".to_string()),
            font_color: Rgb::WHITE,
            font_scale_pct: 100,
            max_font_size: 120,
            min_font_size: 10,
            line_spacing: 10.0,
            fill_color: Rgb::BLACK,
            fill_alpha: 100,
            outline_color: Rgb::WHITE,
            outline_width: 2,
            box_config: BoxConfig::default(),
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    font: Option<FontSettings>,
    layout: Option<LayoutSettings>,
    overlay: Option<OverlaySettings>,
    #[serde(rename = "box")]
    box_settings: Option<BoxFile>,
    overrides: Option<HashMap<String, BoxFile>>,
}

#[derive(Debug, Default, Deserialize)]
struct FontSettings {
    path: Option<String>,
    family: Option<String>,
    dir: Option<String>,
    color: Option<String>,
    scale: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct LayoutSettings {
    max_size: Option<u32>,
    min_size: Option<u32>,
    line_spacing: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct OverlaySettings {
    fill_color: Option<String>,
    fill_alpha: Option<i64>,
    outline_color: Option<String>,
    outline_width: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BoxFile {
    mode: Option<BoxMode>,
    width: Option<u32>,
    height: Option<u32>,
    x_offset: Option<i32>,
    y_offset: Option<i32>,
    width_pct: Option<f32>,
    height_pct: Option<f32>,
    x_offset_pct: Option<f32>,
    y_offset_pct: Option<f32>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    ensure_home_settings_file()?;

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings
                .merge_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        }
    }

    settings.validate()?;
    Ok(settings)
}

impl Settings {
    pub fn merge_str(&mut self, content: &str) -> Result<()> {
        let parsed: SettingsFile = toml::from_str(content)?;
        self.merge(parsed)
    }

    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(font) = incoming.font {
            if let Some(path) = font.path {
                if !path.trim().is_empty() {
                    self.font_path = Some(path);
                }
            }
            if let Some(family) = font.family {
                if !family.trim().is_empty() {
                    self.font_family = Some(family);
                }
            }
            if let Some(dir) = font.dir {
                if !dir.trim().is_empty() {
                    self.font_dir = Some(dir);
                }
            }
            if let Some(color) = font.color {
                self.font_color = Rgb::parse_hex(&color)?;
            }
            if let Some(scale) = font.scale {
                self.font_scale_pct = clamp_scale(scale);
            }
        }
        if let Some(layout) = incoming.layout {
            if let Some(size) = layout.max_size {
                self.max_font_size = size;
            }
            if let Some(size) = layout.min_size {
                self.min_font_size = size;
            }
            if let Some(spacing) = layout.line_spacing {
                self.line_spacing = spacing;
            }
        }
        if let Some(overlay) = incoming.overlay {
            if let Some(color) = overlay.fill_color {
                self.fill_color = Rgb::parse_hex(&color)?;
            }
            if let Some(alpha) = overlay.fill_alpha {
                self.fill_alpha = alpha.clamp(0, 255) as u8;
            }
            if let Some(color) = overlay.outline_color {
                self.outline_color = Rgb::parse_hex(&color)?;
            }
            if let Some(width) = overlay.outline_width {
                self.outline_width = clamp_outline(width);
            }
        }
        if let Some(box_file) = incoming.box_settings {
            self.box_config.apply(&box_file);
        }
        if let Some(overrides) = incoming.overrides {
            for (name, value) in overrides {
                self.overrides.insert(name, value);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_font_size == 0 {
            return Err(anyhow!("layout.min_size must be at least 1"));
        }
        if self.max_font_size < self.min_font_size {
            return Err(anyhow!(
                "layout.max_size ({}) must not be below layout.min_size ({})",
                self.max_font_size,
                self.min_font_size
            ));
        }
        if !(self.line_spacing >= 0.0) {
            return Err(anyhow!("layout.line_spacing must not be negative"));
        }
        Ok(())
    }

    pub fn set_font_scale(&mut self, pct: i64) {
        self.font_scale_pct = clamp_scale(pct);
    }

    pub fn set_outline_width(&mut self, width: i64) {
        self.outline_width = clamp_outline(width);
    }

    pub fn caption_style(&self) -> CaptionStyle {
        CaptionStyle {
            font_color: self.font_color,
            font_scale_pct: self.font_scale_pct,
            overlay: OverlayStyle {
                fill_color: self.fill_color,
                fill_alpha: self.fill_alpha,
                outline_color: self.outline_color,
                outline_width: self.outline_width,
            },
            fit: FitParams {
                max_size: self.max_font_size,
                min_size: self.min_font_size,
                line_spacing: self.line_spacing,
                ..FitParams::default()
            },
        }
    }

    /// Box placement for `image_name`: the global `[box]` settings with any
    /// `[overrides."<image_name>"]` entry merged on top.
    pub fn box_for(&self, image_name: &str) -> BoxSettings {
        match self.overrides.get(image_name) {
            Some(incoming) => {
                let mut merged = self.box_config.clone();
                merged.apply(incoming);
                merged.to_box_settings()
            }
            None => self.box_config.to_box_settings(),
        }
    }
}

fn clamp_scale(pct: i64) -> u32 {
    pct.clamp(MIN_FONT_SCALE_PCT as i64, MAX_FONT_SCALE_PCT as i64) as u32
}

fn clamp_outline(width: i64) -> u32 {
    width.clamp(0, MAX_OUTLINE_WIDTH as i64) as u32
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".bulk-captioner"))
        }
    })
}
