use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use usvg::fontdb;

pub mod archive;
pub mod batch;
pub mod caption;
pub mod logging;
pub mod settings;
pub mod table;
mod test_util;

pub use archive::{DEFAULT_ARCHIVE_NAME, DirectorySink, MemorySink, OutputSink, ZipSink};
pub use batch::{BatchReport, CaptionJob, ImageSet, OutputNamer, render_job, run_batch};
pub use caption::{
    BoxPx, BoxSettings, CaptionStyle, Compositor, FitParams, FittedLayout, OverlayStyle, Rgb,
    WrappedLine, fit, fit_scaled,
};
pub use settings::Settings;
pub use table::{CaptionRow, load_caption_table};

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub captions: Option<String>,
    pub images: Option<String>,
    pub output: Option<String>,
    pub font: Option<String>,
    pub font_dir: Option<String>,
    pub font_family: Option<String>,
    pub font_color: Option<String>,
    pub font_scale: Option<i64>,
    pub fill_color: Option<String>,
    pub fill_alpha: Option<i64>,
    pub outline_color: Option<String>,
    pub outline_width: Option<i64>,
    pub box_width: Option<u32>,
    pub box_height: Option<u32>,
    pub x_offset: Option<i32>,
    pub y_offset: Option<i32>,
    pub box_percent: bool,
    pub report: Option<String>,
    pub settings_path: Option<String>,
    pub list_fonts: bool,
}

pub fn run(config: Config) -> Result<String> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    apply_cli_overrides(&mut settings, &config)?;

    if config.list_fonts {
        return list_fonts(&settings);
    }

    let captions = config
        .captions
        .as_deref()
        .ok_or_else(|| anyhow!("--captions is required"))?;
    let images_dir = config
        .images
        .as_deref()
        .ok_or_else(|| anyhow!("--images is required"))?;

    let rows = table::load_caption_table(Path::new(captions))?;
    if rows.is_empty() {
        return Err(anyhow!("caption table has no rows: {}", captions));
    }
    let images = ImageSet::scan(Path::new(images_dir))?;
    info!(rows = rows.len(), images = images.len(), "loaded inputs");

    let compositor = build_compositor(&settings)?;

    let output = config
        .output
        .clone()
        .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string());
    let mut sink = open_sink(Path::new(&output))?;
    let report = run_batch(&rows, &images, &settings, &compositor, sink.as_mut())?;

    if let Some(path) = config.report.as_deref() {
        let json = serde_json::to_vec_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report: {}", path))?;
    }

    Ok(format!("{} -> {}", report.summary(), output))
}

fn apply_cli_overrides(settings: &mut Settings, config: &Config) -> Result<()> {
    if let Some(font) = config.font.as_ref() {
        settings.font_path = Some(font.clone());
    }
    if let Some(dir) = config.font_dir.as_ref() {
        settings.font_dir = Some(dir.clone());
    }
    if let Some(family) = config.font_family.as_ref() {
        settings.font_family = Some(family.clone());
    }
    if let Some(color) = config.font_color.as_deref() {
        settings.font_color = Rgb::parse_hex(color).context("invalid --font-color")?;
    }
    if let Some(scale) = config.font_scale {
        settings.set_font_scale(scale);
    }
    if let Some(color) = config.fill_color.as_deref() {
        settings.fill_color = Rgb::parse_hex(color).context("invalid --fill-color")?;
    }
    if let Some(alpha) = config.fill_alpha {
        settings.fill_alpha = alpha.clamp(0, 255) as u8;
    }
    if let Some(color) = config.outline_color.as_deref() {
        settings.outline_color = Rgb::parse_hex(color).context("invalid --outline-color")?;
    }
    if let Some(width) = config.outline_width {
        settings.set_outline_width(width);
    }
    if let Some(width) = config.box_width {
        settings.box_config.width = width;
    }
    if let Some(height) = config.box_height {
        settings.box_config.height = height;
    }
    if let Some(offset) = config.x_offset {
        settings.box_config.x_offset = offset;
    }
    if let Some(offset) = config.y_offset {
        settings.box_config.y_offset = offset;
    }
    if config.box_percent {
        settings.box_config.mode = settings::BoxMode::Percent;
    }
    if settings.box_config.mode == settings::BoxMode::Percent {
        let ignored = pixel_box_flags(config);
        if !ignored.is_empty() {
            warn!(
                "{} ignored: the box is sized in percent ([box] width_pct/height_pct)",
                ignored.join(", ")
            );
        }
    }
    Ok(())
}

/// Pixel box flags given on the command line, which only apply to fixed boxes.
fn pixel_box_flags(config: &Config) -> Vec<&'static str> {
    [
        ("--box-width", config.box_width.is_some()),
        ("--box-height", config.box_height.is_some()),
        ("--x-offset", config.x_offset.is_some()),
        ("--y-offset", config.y_offset.is_some()),
    ]
    .into_iter()
    .filter_map(|(flag, given)| given.then_some(flag))
    .collect()
}

fn list_fonts(settings: &Settings) -> Result<String> {
    let dir = settings
        .font_dir
        .as_deref()
        .ok_or_else(|| anyhow!("no font directory configured"))?;
    let fonts = caption::list_font_files(Path::new(dir))?;
    if fonts.is_empty() {
        return Err(anyhow!("no fonts found in {} (expected .ttf or .otf files)", dir));
    }
    let names: Vec<String> = fonts
        .iter()
        .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
        .map(|name| name.to_string())
        .collect();
    Ok(names.join("\n"))
}

fn build_compositor(settings: &Settings) -> Result<Compositor> {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    let font_dir = settings.font_dir.as_deref().map(Path::new);
    let font_path: Option<PathBuf> = settings
        .font_path
        .as_deref()
        .map(|value| caption::locate_font(value, font_dir))
        .transpose()?;
    let font = caption::resolve_caption_font(
        &db,
        font_path.as_deref(),
        settings.font_family.as_deref(),
        caption::default_fallback_families(),
    )
    .with_context(|| "failed to load a caption font")?;
    debug!(family = %font.family, "caption font");
    Ok(Compositor::new(db, Some(font)))
}

fn open_sink(output: &Path) -> Result<Box<dyn OutputSink>> {
    let is_zip = output
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);
    if is_zip {
        Ok(Box::new(ZipSink::create(output)?))
    } else {
        Ok(Box::new(DirectorySink::create(output)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BoxMode;
    use tempfile::tempdir;

    #[test]
    fn cli_overrides_clamp_and_switch_box_mode() {
        let mut settings = Settings::default();
        let config = Config {
            font_scale: Some(500),
            fill_alpha: Some(-5),
            outline_width: Some(40),
            font_color: Some("#0f0".to_string()),
            box_percent: true,
            ..Config::default()
        };
        apply_cli_overrides(&mut settings, &config).expect("overrides");
        assert_eq!(settings.font_scale_pct, 200);
        assert_eq!(settings.fill_alpha, 0);
        assert_eq!(settings.outline_width, 10);
        assert_eq!(settings.font_color, Rgb(0, 255, 0));
        assert_eq!(settings.box_config.mode, BoxMode::Percent);
        assert!(matches!(settings.box_for("any.png"), BoxSettings::Percent { .. }));
    }

    #[test]
    fn cli_overrides_reject_bad_colors() {
        let mut settings = Settings::default();
        let config = Config {
            font_color: Some("white".to_string()),
            ..Config::default()
        };
        let err = apply_cli_overrides(&mut settings, &config).expect_err("bad color");
        assert!(format!("{:#}", err).contains("invalid --font-color"));
    }

    #[test]
    fn pixel_box_flags_lists_given_flags() {
        let config = Config {
            box_width: Some(300),
            y_offset: Some(-20),
            ..Config::default()
        };
        assert_eq!(pixel_box_flags(&config), vec!["--box-width", "--y-offset"]);
        assert!(pixel_box_flags(&Config::default()).is_empty());
    }

    #[test]
    fn open_sink_picks_zip_by_extension() {
        let dir = tempdir().expect("tempdir");
        let archive = dir.path().join("out.ZIP");
        let mut sink = open_sink(&archive).expect("zip sink");
        sink.write("a.png", b"png").expect("write");
        sink.finish().expect("finish");
        let file = std::fs::File::open(&archive).expect("open archive");
        let mut zip = zip::ZipArchive::new(file).expect("read archive");
        assert_eq!(zip.len(), 1);
        assert!(zip.by_name("a.png").is_ok());

        let folder = dir.path().join("pngs");
        let mut sink = open_sink(&folder).expect("dir sink");
        sink.write("b.png", b"png").expect("write");
        sink.finish().expect("finish");
        assert_eq!(std::fs::read(folder.join("b.png")).expect("read"), b"png");
    }

    #[test]
    fn list_fonts_prints_file_names() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("B.ttf"), b"x").expect("write");
        std::fs::write(dir.path().join("A.otf"), b"x").expect("write");
        let mut settings = Settings::default();
        settings.font_dir = Some(dir.path().display().to_string());
        assert_eq!(list_fonts(&settings).expect("list"), "A.otf\nB.ttf");

        let empty = tempdir().expect("tempdir");
        settings.font_dir = Some(empty.path().display().to_string());
        assert!(list_fonts(&settings).is_err());
    }
}
