use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const DEFAULT_ARCHIVE_NAME: &str = "captioned_images.zip";

/// Destination for rendered PNGs, keyed by output file name.
pub trait OutputSink {
    fn write(&mut self, name: &str, png: &[u8]) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct ZipSink<W: Write + Seek> {
    writer: Option<ZipWriter<W>>,
    entries: usize,
}

impl ZipSink<File> {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create archive: {}", path.display()))?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Seek> ZipSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: Some(ZipWriter::new(inner)),
            entries: 0,
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Finalizes the archive and hands back the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        let mut writer = self
            .writer
            .take()
            .context("archive already finished")?;
        writer
            .finish()
            .with_context(|| "failed to finalize zip output")
    }
}

impl<W: Write + Seek> OutputSink for ZipSink<W> {
    fn write(&mut self, name: &str, png: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("archive already finished")?;
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        writer
            .start_file(name, options)
            .with_context(|| format!("failed to write zip entry: {}", name))?;
        writer
            .write_all(png)
            .with_context(|| format!("failed to write zip content: {}", name))?;
        self.entries += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .finish()
                .with_context(|| "failed to finalize zip output")?;
        }
        Ok(())
    }
}

pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }
}

impl OutputSink for DirectorySink {
    fn write(&mut self, name: &str, png: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        std::fs::write(&path, png)
            .with_context(|| format!("failed to write output image: {}", path.display()))
    }
}

/// Collects outputs in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub files: Vec<(String, Vec<u8>)>,
}

impl MemorySink {
    pub fn names(&self) -> Vec<&str> {
        self.files.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl OutputSink for MemorySink {
    fn write(&mut self, name: &str, png: &[u8]) -> Result<()> {
        self.files.push((name.to_string(), png.to_vec()));
        Ok(())
    }
}
