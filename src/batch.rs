use anyhow::{Context, Result, anyhow};
use globset::{GlobBuilder, GlobMatcher};
use image::{DynamicImage, GenericImageView, RgbaImage};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::archive::OutputSink;
use crate::caption::{BoxPx, CaptionStyle, Compositor, FittedLayout, encode_png, fit_scaled};
use crate::settings::Settings;
use crate::table::CaptionRow;

/// Source images addressed by file name.
#[derive(Debug, Default, Clone)]
pub struct ImageSet {
    files: HashMap<String, PathBuf>,
}

impl ImageSet {
    /// Collects `*.jpg`, `*.jpeg` and `*.png` files (any case) directly inside
    /// `dir`.
    pub fn scan(dir: &Path) -> Result<Self> {
        let matcher = image_file_matcher()?;
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list image directory: {}", dir.display()))?;
        let mut files = HashMap::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read image directory: {}", dir.display()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if matcher.is_match(Path::new(name)) {
                files.insert(name.to_string(), path.clone());
            }
        }
        debug!(count = files.len(), dir = %dir.display(), "scanned images");
        Ok(Self { files })
    }

    pub fn insert(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.files.insert(name.into(), path.into());
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(|path| path.as_path())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn image_file_matcher() -> Result<GlobMatcher> {
    let glob = GlobBuilder::new("*.{jpg,jpeg,png}")
        .case_insensitive(true)
        .build()
        .with_context(|| "failed to build image file pattern")?;
    Ok(glob.compile_matcher())
}

/// Everything needed to caption one image, with the box already resolved to
/// pixels for that image.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionJob {
    pub row: usize,
    pub image_name: String,
    pub lines: Vec<String>,
    pub geometry: BoxPx,
    pub style: CaptionStyle,
}

impl CaptionJob {
    pub fn from_row(row: &CaptionRow, image_width: u32, image_height: u32, settings: &Settings) -> Self {
        let geometry = settings
            .box_for(&row.image_filename)
            .resolve(image_width, image_height);
        let mut style = settings.caption_style();
        style.fit = style.fit.with_box(geometry.w, geometry.h);
        Self {
            row: row.row,
            image_name: row.image_filename.clone(),
            lines: row.lines.clone(),
            geometry,
            style,
        }
    }
}

/// Fits the job's text and composites it onto a copy of `source`.
pub fn render_job(
    job: &CaptionJob,
    source: &DynamicImage,
    compositor: &Compositor,
) -> Result<(RgbaImage, FittedLayout)> {
    let layout = fit_scaled(
        &job.lines,
        &job.style.fit,
        job.style.font_scale_pct,
        compositor.metrics(),
    );
    if !layout.fits && !layout.lines.is_empty() {
        warn!(
            row = job.row,
            image = %job.image_name,
            size = layout.font_size,
            "caption does not fit its box even at the minimum font size"
        );
    }
    let image = compositor.render(
        source,
        job.geometry,
        &job.style.overlay,
        &layout,
        job.style.font_color,
    )?;
    Ok((image, layout))
}

/// Assigns `<stem>.png` to the first output of a stem and `<stem>_<n>.png`
/// to repeats. Sources sharing a stem (`cat.png`, `cat.jpg`) share one
/// counter, and a name already handed out is never returned twice.
#[derive(Debug, Default)]
pub struct OutputNamer {
    counts: HashMap<String, usize>,
    used: HashSet<String>,
}

impl OutputNamer {
    pub fn next_name(&mut self, image_name: &str) -> String {
        let stem = Path::new(image_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(image_name);
        let count = self.counts.entry(stem.to_string()).or_insert(0);
        loop {
            *count += 1;
            let name = if *count > 1 {
                format!("{}_{}.png", stem, count)
            } else {
                format!("{}.png", stem)
            };
            if self.used.insert(name.clone()) {
                return name;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderedOutput {
    pub name: String,
    pub row: usize,
    pub image: String,
    pub font_size: u32,
    pub lines: usize,
    pub fits: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedJob {
    pub row: usize,
    pub image: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub rendered: Vec<RenderedOutput>,
    pub skipped: Vec<SkippedJob>,
}

impl BatchReport {
    pub fn summary(&self) -> String {
        let mut text = format!(
            "rendered {} image(s), skipped {}",
            self.rendered.len(),
            self.skipped.len()
        );
        let overflowing = self.rendered.iter().filter(|output| !output.fits).count();
        if overflowing > 0 {
            text.push_str(&format!(", {} caption(s) overflow their box", overflowing));
        }
        text
    }
}

/// Renders every row in order, writing each output to `sink` before the next
/// row starts. Problems with a single row are logged and recorded as skipped;
/// sink failures abort the batch.
pub fn run_batch(
    rows: &[CaptionRow],
    images: &ImageSet,
    settings: &Settings,
    compositor: &Compositor,
    sink: &mut dyn OutputSink,
) -> Result<BatchReport> {
    let mut report = BatchReport::default();
    let mut namer = OutputNamer::default();

    for row in rows {
        let rendered = match caption_row(row, images, settings, compositor) {
            Ok(rendered) => rendered,
            Err(err) => {
                let reason = format!("{:#}", err);
                warn!(row = row.row, image = %row.image_filename, "skipping row: {}", reason);
                report.skipped.push(SkippedJob {
                    row: row.row,
                    image: row.image_filename.clone(),
                    reason,
                });
                continue;
            }
        };
        let (png, layout) = rendered;
        let name = namer.next_name(&row.image_filename);
        sink.write(&name, &png)?;
        info!(output = %name, row = row.row, size = layout.font_size, "rendered caption");
        report.rendered.push(RenderedOutput {
            name,
            row: row.row,
            image: row.image_filename.clone(),
            font_size: layout.font_size,
            lines: layout.lines.len(),
            fits: layout.fits || layout.lines.is_empty(),
        });
    }

    sink.finish()?;
    Ok(report)
}

fn caption_row(
    row: &CaptionRow,
    images: &ImageSet,
    settings: &Settings,
    compositor: &Compositor,
) -> Result<(Vec<u8>, FittedLayout)> {
    if row.image_filename.is_empty() {
        return Err(anyhow!("empty image filename"));
    }
    let path = images
        .get(&row.image_filename)
        .ok_or_else(|| anyhow!("missing image: {}", row.image_filename))?;
    let source = image::open(path)
        .with_context(|| format!("failed to decode image: {}", path.display()))?;
    let (width, height) = source.dimensions();
    let job = CaptionJob::from_row(row, width, height, settings);
    debug!(row = job.row, image = %job.image_name, geometry = ?job.geometry, "caption job");
    let (image, layout) = render_job(&job, &source, compositor)?;
    let png = encode_png(&image)?;
    Ok((png, layout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemorySink;
    use image::{Rgba, RgbaImage};
    use tempfile::tempdir;
    use usvg::fontdb;

    fn row(row: usize, image: &str, lines: &[&str]) -> CaptionRow {
        CaptionRow {
            row,
            image_filename: image.to_string(),
            lines: lines.iter().map(|line| line.to_string()).collect(),
        }
    }

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) {
        RgbaImage::from_pixel(width, height, Rgba([20, 40, 60, 255]))
            .save(dir.join(name))
            .expect("write png");
    }

    fn compositor() -> Compositor {
        Compositor::new(fontdb::Database::new(), None)
    }

    #[test]
    fn output_namer_suffixes_repeats() {
        let mut namer = OutputNamer::default();
        assert_eq!(namer.next_name("cat.png"), "cat.png");
        assert_eq!(namer.next_name("cat.png"), "cat_2.png");
        assert_eq!(namer.next_name("dog.jpg"), "dog.png");
        assert_eq!(namer.next_name("cat.png"), "cat_3.png");
        assert_eq!(namer.next_name("archive.tar.jpeg"), "archive.tar.png");
    }

    #[test]
    fn output_namer_shares_counters_across_extensions() {
        let mut namer = OutputNamer::default();
        assert_eq!(namer.next_name("cat.png"), "cat.png");
        assert_eq!(namer.next_name("cat.jpg"), "cat_2.png");
        assert_eq!(namer.next_name("cat_3.jpeg"), "cat_3.png");
        assert_eq!(namer.next_name("cat.PNG"), "cat_4.png");
        assert_eq!(namer.next_name("cat_2.png"), "cat_2_2.png");
    }

    #[test]
    fn same_stem_sources_get_distinct_outputs() {
        let dir = tempdir().expect("tempdir");
        write_png(dir.path(), "cat.png", 32, 32);
        image::RgbImage::from_pixel(32, 32, image::Rgb([90, 90, 90]))
            .save(dir.path().join("cat.jpg"))
            .expect("write jpeg");
        let images = ImageSet::scan(dir.path()).expect("scan");
        let rows = vec![row(1, "cat.png", &["png"]), row(2, "cat.jpg", &["jpg"])];
        let mut sink = MemorySink::default();
        let report = run_batch(&rows, &images, &Settings::default(), &compositor(), &mut sink)
            .expect("batch");
        assert_eq!(sink.names(), vec!["cat.png", "cat_2.png"]);
        let images: Vec<_> = report.rendered.iter().map(|out| out.image.as_str()).collect();
        assert_eq!(images, vec!["cat.png", "cat.jpg"]);
    }

    #[test]
    fn overflowing_captions_render_at_min_size_and_are_reported() {
        let dir = tempdir().expect("tempdir");
        write_png(dir.path(), "tiny.png", 64, 64);
        let images = ImageSet::scan(dir.path()).expect("scan");
        let mut settings = Settings::default();
        settings
            .merge_str("[box]\nwidth = 12\nheight = 12\n")
            .expect("merge");
        let rows = vec![
            row(1, "tiny.png", &["A LONG CAPTION THAT MUST WRAP ACROSS MULTIPLE LINES"]),
            row(2, "tiny.png", &[]),
        ];
        let mut sink = MemorySink::default();
        let report = run_batch(&rows, &images, &settings, &compositor(), &mut sink)
            .expect("batch");

        assert_eq!(sink.names(), vec!["tiny.png", "tiny_2.png"]);
        let long = &report.rendered[0];
        assert!(!long.fits);
        assert_eq!(long.font_size, settings.min_font_size);
        assert!(long.lines >= 2);
        let blank = &report.rendered[1];
        assert!(blank.fits);
        assert_eq!(blank.lines, 0);
        assert_eq!(
            report.summary(),
            "rendered 2 image(s), skipped 0, 1 caption(s) overflow their box"
        );
    }

    #[test]
    fn duplicate_rows_produce_numbered_outputs() {
        let dir = tempdir().expect("tempdir");
        write_png(dir.path(), "cat.png", 64, 48);
        let images = ImageSet::scan(dir.path()).expect("scan");
        let rows = vec![
            row(1, "cat.png", &["one"]),
            row(2, "cat.png", &["two"]),
            row(3, "cat.png", &["three"]),
        ];
        let mut sink = MemorySink::default();
        let report = run_batch(&rows, &images, &Settings::default(), &compositor(), &mut sink)
            .expect("batch");
        assert_eq!(sink.names(), vec!["cat.png", "cat_2.png", "cat_3.png"]);
        assert_eq!(report.rendered.len(), 3);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn missing_images_are_skipped_without_stopping_the_batch() {
        let dir = tempdir().expect("tempdir");
        write_png(dir.path(), "a.png", 32, 32);
        write_png(dir.path(), "b.png", 32, 32);
        std::fs::write(dir.path().join("broken.png"), b"not a png").expect("write");
        let images = ImageSet::scan(dir.path()).expect("scan");
        let rows = vec![
            row(1, "a.png", &["first"]),
            row(2, "missing.png", &["lost"]),
            row(3, "broken.png", &["bad"]),
            row(4, "", &["nameless"]),
            row(5, "b.png", &["second"]),
        ];
        let mut sink = MemorySink::default();
        let report = run_batch(&rows, &images, &Settings::default(), &compositor(), &mut sink)
            .expect("batch");

        assert_eq!(sink.names(), vec!["a.png", "b.png"]);
        let skipped: Vec<_> = report.skipped.iter().map(|job| job.row).collect();
        assert_eq!(skipped, vec![2, 3, 4]);
        assert!(report.skipped[0].reason.contains("missing image: missing.png"));
        assert!(report.skipped[1].reason.contains("failed to decode image"));
        assert_eq!(report.summary(), "rendered 2 image(s), skipped 3");
    }

    #[test]
    fn outputs_are_png_with_source_dimensions() {
        let dir = tempdir().expect("tempdir");
        image::RgbImage::from_pixel(50, 30, image::Rgb([200, 10, 10]))
            .save(dir.path().join("photo.jpg"))
            .expect("write jpeg");
        let images = ImageSet::scan(dir.path()).expect("scan");
        let rows = vec![row(1, "photo.jpg", &["caption"])];
        let mut sink = MemorySink::default();
        run_batch(&rows, &images, &Settings::default(), &compositor(), &mut sink).expect("batch");

        let (name, bytes) = &sink.files[0];
        assert_eq!(name, "photo.png");
        assert_eq!(
            image::guess_format(bytes).expect("format"),
            image::ImageFormat::Png
        );
        let decoded = image::load_from_memory(bytes).expect("decode");
        assert_eq!(decoded.dimensions(), (50, 30));
    }

    #[test]
    fn scan_ignores_other_files() {
        let dir = tempdir().expect("tempdir");
        write_png(dir.path(), "UPPER.PNG", 4, 4);
        std::fs::write(dir.path().join("notes.txt"), b"x").expect("write");
        std::fs::write(dir.path().join("photo.JPEG"), b"x").expect("write");
        let images = ImageSet::scan(dir.path()).expect("scan");
        assert_eq!(images.len(), 2);
        assert!(images.get("UPPER.PNG").is_some());
        assert!(images.get("photo.JPEG").is_some());
        assert!(images.get("notes.txt").is_none());
    }

    #[test]
    fn job_box_follows_image_overrides() {
        let mut settings = Settings::default();
        settings
            .merge_str("[overrides.\"cat.png\"]\nwidth = 100\nheight = 50\n")
            .expect("merge");
        let cat = CaptionJob::from_row(&row(1, "cat.png", &["hi"]), 400, 300, &settings);
        assert_eq!(
            cat.geometry,
            BoxPx {
                x: 150,
                y: 125,
                w: 100,
                h: 50
            }
        );
        assert_eq!(cat.style.fit.box_width, 100.0);
        assert_eq!(cat.style.fit.box_height, 50.0);

        let dog = CaptionJob::from_row(&row(2, "dog.png", &["hi"]), 400, 300, &settings);
        assert_eq!(dog.geometry.w, 400);
        assert_eq!(dog.geometry.y, 50);
    }
}
