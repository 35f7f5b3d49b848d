use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use image::{DynamicImage, ImageReader, Rgb};
use imageproc::drawing;
use log::{info, warn};
use serde::Serialize;

use virion_count::config::{AnalysisConfig, ImagingMode};
use virion_count::aggregate::{PassAggregator, PassSummary};
use virion_count::error::{Result, VirionError};
use virion_count::image_funcs::{normalize_by_median, to_gray_u8, Plane};
use virion_count::markers::MarkerTemplate;
use virion_count::pipeline::{analyze_chip, PassInput, PassOutcome, PassSource};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Exoviewer,
    InLiquid,
}

/// Counts particles on every spot of a chip. The input directory holds one
/// `spot_NNN` directory per spot, each holding one `pass_NNN` directory of
/// focal plane images per pass.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Chip directory.
    #[arg(short, long)]
    input: String,

    /// Image of the chip's fiducial marker.
    #[arg(short, long)]
    marker: String,

    /// JSON analysis parameters, applied over the --mode preset. A "mode"
    /// in the file replaces --mode.
    #[arg(short, long)]
    config: Option<String>,

    /// Imaging setup the chip was scanned on.
    #[arg(long, value_enum, default_value_t = Mode::Exoviewer)]
    mode: Mode,

    /// Directory for annotated focus plane images and per-spot results.
    #[arg(short, long)]
    output: Option<String>,

    /// Bins of the per-pass contrast histograms written with the results.
    /// They span the contrast window, or 0..20% without one.
    #[arg(long, default_value_t = 20)]
    histogram_bins: usize,
}

#[derive(Serialize)]
struct SpotReport<'a> {
    spot: u32,
    passes: Vec<&'a PassSummary>,
    contrast_range: (f64, f64),
    histograms: BTreeMap<u32, Vec<u32>>,
}

fn spot_report(aggregator: &PassAggregator, bins: usize, range: (f64, f64)) -> SpotReport<'_> {
    let passes: Vec<&PassSummary> = aggregator.summaries().collect();
    let histograms = passes.iter()
        .filter_map(|s| aggregator.histogram(s.record.pass, bins, range)
                    .map(|h| (s.record.pass, h)))
        .collect();
    SpotReport{spot: aggregator.spot(), passes, contrast_range: range, histograms}
}

// Number following `prefix` in a directory name such as "spot_012".
fn numbered(path: &Path, prefix: &str) -> Option<u32> {
    path.file_name()?.to_str()?.strip_prefix(prefix)?.parse().ok()
}

fn numbered_dirs(dir: &Path, prefix: &str) -> Result<BTreeMap<u32, PathBuf>> {
    let mut found = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(n) = numbered(&path, prefix) {
            found.insert(n, path);
        }
    }
    Ok(found)
}

fn is_plane_image(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()),
             Some("png") | Some("tif") | Some("tiff"))
}

fn load_plane(path: &Path) -> Result<Plane> {
    Ok(ImageReader::open(path)?.decode()?.to_luma32f())
}

struct DirPassSource {
    spot: u32,
    pass_dirs: BTreeMap<u32, PathBuf>,
    // Every pass number seen on the chip; a spot lacking one reports it
    // missing.
    chip_passes: Vec<u32>,
    output: Option<PathBuf>,
}

impl PassSource for DirPassSource {
    fn spot(&self) -> u32 {
        self.spot
    }

    fn passes(&self) -> Vec<u32> {
        self.chip_passes.clone()
    }

    fn load(&mut self, pass: u32) -> Result<PassInput> {
        let missing = VirionError::MissingPassData{spot: self.spot, pass};
        let Some(dir) = self.pass_dirs.get(&pass) else {
            return Err(missing);
        };
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_plane_image(path))
            .collect();
        if files.is_empty() {
            return Err(missing);
        }
        files.sort();
        let planes = files.iter().map(|f| load_plane(f)).collect::<Result<Vec<Plane>>>()?;
        info!("Spot {} pass {}: {} planes from {:?}", self.spot, pass, planes.len(), dir);
        Ok(PassInput{pass, stack: normalize_by_median(planes)?, enhanced: None})
    }

    fn finished(&mut self, input: &PassInput, outcome: &PassOutcome) {
        let Some(output) = &self.output else {
            return;
        };
        let record = &outcome.record;
        let focus = to_gray_u8(input.stack.plane(record.focus_plane));
        let mut img_color = DynamicImage::ImageLuma8(focus).into_rgb8();
        if let Some(geometry) = &record.geometry {
            drawing::draw_hollow_circle_mut(
                &mut img_color,
                (geometry.center_x as i32, geometry.center_y as i32),
                geometry.radius as i32,
                Rgb::<u8>([0, 0, 255]));
        }
        // Accepted particles green, rejected blobs red.
        let styles = [(&outcome.accepted, [0, 255, 0]), (&outcome.rejected, [255, 0, 0])];
        for (blobs, color) in styles {
            for v in blobs {
                let (row, col) = v.blob.centroid;
                drawing::draw_hollow_circle_mut(
                    &mut img_color, (col as i32, row as i32), 4, Rgb::<u8>(color));
            }
        }
        let mut path = output.clone();
        path.push(format!("spot_{:03}.pass_{:03}.png", record.spot, record.pass));
        if let Err(e) = img_color.save(&path) {
            warn!("Could not write {:?}: {}", path, e);
        }
    }
}

fn main() -> std::result::Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mode = match args.mode {
        Mode::Exoviewer => ImagingMode::Exoviewer,
        Mode::InLiquid => ImagingMode::InLiquid,
    };
    let config = match &args.config {
        Some(path) => AnalysisConfig::from_json_file(Path::new(path), mode)?,
        None => AnalysisConfig::for_mode(mode),
    };
    config.validate()?;
    if args.histogram_bins == 0 {
        return Err("--histogram-bins must be positive".into());
    }
    let contrast_range = config.contrast_window.unwrap_or((0.0, 20.0));
    let template = MarkerTemplate::Single(load_plane(Path::new(&args.marker))?);

    let output = args.output.as_ref().map(PathBuf::from);
    if let Some(dir) = &output {
        fs::create_dir_all(dir)?;
    }

    let spots = numbered_dirs(Path::new(&args.input), "spot_")?;
    let mut pass_dirs = BTreeMap::new();
    for (&spot, dir) in &spots {
        pass_dirs.insert(spot, numbered_dirs(dir, "pass_")?);
    }
    let mut chip_passes: Vec<u32> =
        pass_dirs.values().flat_map(|passes| passes.keys().copied()).collect();
    chip_passes.sort_unstable();
    chip_passes.dedup();
    info!("{} spots, passes {:?}", spots.len(), chip_passes);

    let sources: Vec<Box<dyn PassSource>> = pass_dirs.into_iter().map(|(spot, pass_dirs)| {
        Box::new(DirPassSource{
            spot, pass_dirs,
            chip_passes: chip_passes.clone(),
            output: output.clone(),
        }) as Box<dyn PassSource>
    }).collect();

    for (spot, result) in analyze_chip(sources, &config, &template) {
        match result {
            Ok(aggregator) => {
                aggregator.log_totals();
                if let Some(dir) = &output {
                    let report = spot_report(&aggregator, args.histogram_bins, contrast_range);
                    let mut path = dir.clone();
                    path.push(format!("spot_{:03}.json", spot));
                    fs::write(&path, serde_json::to_string_pretty(&report)?)?;
                }
            },
            Err(e) => warn!("Spot {}: {}", spot, e),
        }
    }
    Ok(())
}
