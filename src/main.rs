use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "bulk-captioner",
    version,
    about = "Overlay auto-fitted captions onto a folder of images"
)]
struct Cli {
    /// Caption table (.csv or .xlsx) with an "Image Filename" column
    #[arg(short = 'c', long = "captions")]
    captions: Option<String>,

    /// Directory holding the source images (.jpg/.jpeg/.png)
    #[arg(short = 'i', long = "images")]
    images: Option<String>,

    /// Output archive (.zip) or directory (default: captioned_images.zip)
    #[arg(short = 'o', long = "output")]
    output: Option<String>,

    /// Font file path, or a file name inside the font directory
    #[arg(short = 'f', long = "font")]
    font: Option<String>,

    /// Directory scanned for .ttf/.otf fonts
    #[arg(long = "font-dir")]
    font_dir: Option<String>,

    /// System font family used when no font file is given
    #[arg(long = "font-family")]
    font_family: Option<String>,

    /// Caption text color (#RRGGBB)
    #[arg(long = "font-color")]
    font_color: Option<String>,

    /// Font scale in percent (80-200)
    #[arg(long = "font-scale")]
    font_scale: Option<i64>,

    /// Box fill color (#RRGGBB)
    #[arg(long = "fill-color")]
    fill_color: Option<String>,

    /// Box fill opacity (0-255)
    #[arg(long = "fill-alpha")]
    fill_alpha: Option<i64>,

    /// Box outline color (#RRGGBB)
    #[arg(long = "outline-color")]
    outline_color: Option<String>,

    /// Box outline width in pixels (0-10)
    #[arg(long = "outline-width")]
    outline_width: Option<i64>,

    #[arg(long = "box-width")]
    box_width: Option<u32>,

    #[arg(long = "box-height")]
    box_height: Option<u32>,

    /// Horizontal offset of the box from the image center
    #[arg(long = "x-offset", allow_hyphen_values = true)]
    x_offset: Option<i32>,

    /// Vertical offset of the box from the image center
    #[arg(long = "y-offset", allow_hyphen_values = true)]
    y_offset: Option<i32>,

    /// Size and place the box in percent of each image (see [box] in settings)
    #[arg(long = "box-percent")]
    box_percent: bool,

    /// Write a JSON report of rendered and skipped rows
    #[arg(long = "report")]
    report: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// List fonts in the font directory and exit
    #[arg(long = "list-fonts")]
    list_fonts: bool,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    bulk_captioner::logging::init(cli.verbose)?;

    let config = bulk_captioner::Config {
        captions: cli.captions,
        images: cli.images,
        output: cli.output,
        font: cli.font,
        font_dir: cli.font_dir,
        font_family: cli.font_family,
        font_color: cli.font_color,
        font_scale: cli.font_scale,
        fill_color: cli.fill_color,
        fill_alpha: cli.fill_alpha,
        outline_color: cli.outline_color,
        outline_width: cli.outline_width,
        box_width: cli.box_width,
        box_height: cli.box_height,
        x_offset: cli.x_offset,
        y_offset: cli.y_offset,
        box_percent: cli.box_percent,
        report: cli.report,
        settings_path: cli.read_settings,
        list_fonts: cli.list_fonts,
    };

    let output = bulk_captioner::run(config)?;
    println!("{}", output);
    Ok(())
}
