mod autotune;
mod codec;
mod dispatch;
mod error;
mod frame_table;
mod handles;
mod loader;
mod progress;
mod util;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use codec::Precision;
use dispatch::{DispatchConfig, Dispatcher, LoadedImage};
use error::ErrorKind;
use handles::ImageStore;
use indicatif::HumanBytes;
use loader::{Completion, DatLayout, FrameLoader, LoadRequest, LoaderConfig};
use progress::{BrowseSummary, ProgressConfig, ProgressMode, ProgressReporter};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "datframe",
    version,
    about = "Decode multi-frame sensor captures (.dat) into grayscale PNG frames"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print how many frames a tabled capture holds
    Count { file: PathBuf },

    /// Decode one sub-frame of a tabled capture to PNG
    Frame {
        file: PathBuf,
        index: u32,

        /// Output PNG path
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value_t = 512)]
        rows: u32,

        #[arg(long, default_value_t = 512)]
        cols: u32,
    },

    /// Decode a whole file as one raw image of the given precision
    Render {
        file: PathBuf,

        /// Output PNG path
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value_t = 512)]
        rows: u32,

        #[arg(long, default_value_t = 512)]
        cols: u32,

        #[arg(long, value_enum, default_value_t = Precision::Float64)]
        precision: Precision,
    },

    /// Expand files and folders into the ordered frame list
    List {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[arg(long, default_value_t = 512)]
        rows: u32,

        #[arg(long, default_value_t = 512)]
        cols: u32,

        /// How .dat files are read: tabled (multi-frame) or whole (single raw image)
        #[arg(long, value_enum, default_value_t = DatLayout::Tabled)]
        layout: DatLayout,

        /// Print descriptors as a JSON array
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Page through a selection frame by frame and write every displayed image
    Browse {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Directory receiving one image per visited frame
        #[arg(long)]
        out_dir: PathBuf,

        #[arg(long, default_value_t = 512)]
        rows: u32,

        #[arg(long, default_value_t = 512)]
        cols: u32,

        /// How .dat files are read: tabled (multi-frame) or whole (single raw image)
        #[arg(long, value_enum, default_value_t = DatLayout::Tabled)]
        layout: DatLayout,

        /// Sample type for whole-layout captures.
        #[arg(long, value_enum, default_value_t = Precision::Float64)]
        precision: Precision,

        /// Concurrent decode worker cap. Default: auto.
        #[arg(long)]
        workers: Option<usize>,

        /// First frame to visit.
        #[arg(long, default_value_t = 0)]
        start: usize,

        /// Visit at most this many frames.
        #[arg(long)]
        limit: Option<usize>,

        /// Walk the window from its last frame back to its first.
        #[arg(long, default_value_t = false)]
        reverse: bool,

        /// Write a JSON record (output path, source MD5, error kind) per visited frame.
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Count { file } => {
            let dispatcher = Dispatcher::new(1, ImageStore::new());
            let count = dispatcher
                .get_frame_count(&file)
                .wait()
                .with_context(|| format!("reading frame table of {}", file.display()))?;
            println!("{}", count);
        }

        Commands::Frame {
            file,
            index,
            output,
            rows,
            cols,
        } => {
            let dispatcher = Dispatcher::new(1, ImageStore::new());
            let pending = dispatcher.get_frame(&file, index, rows, cols);
            write_single(&dispatcher, pending.wait(), &output)
                .with_context(|| format!("decoding frame {} of {}", index, file.display()))?;
        }

        Commands::Render {
            file,
            output,
            rows,
            cols,
            precision,
        } => {
            let dispatcher = Dispatcher::new(1, ImageStore::new());
            let pending = dispatcher.get_whole_image(&file, rows, cols, precision);
            write_single(&dispatcher, pending.wait(), &output)
                .with_context(|| format!("decoding {} as {:?}", file.display(), precision))?;
        }

        Commands::List {
            inputs,
            rows,
            cols,
            layout,
            json,
            progress,
        } => {
            let files = util::expand_inputs(&inputs).context("listing inputs")?;
            let reporter = ProgressReporter::new("list", 0, ProgressConfig::new(progress));
            let handle = reporter.handle();
            let store = ImageStore::new();
            let tune = DispatchConfig::default().resolve(largest_file_len(&files));
            let mut loader = FrameLoader::new(
                LoaderConfig {
                    dat_layout: layout,
                    precision: Precision::default(),
                },
                Dispatcher::new(tune.decode_workers, store),
                Arc::new(handle.clone()),
            );

            handle.set_stage("expanding selection");
            loader.process_selection(&files, rows, cols)?;
            loader.wait_idle();
            let _ = reporter.finish(format!("{} frames", loader.total_frames()));

            if json {
                println!("{}", serde_json::to_string_pretty(loader.descriptors())?);
            } else {
                for desc in loader.descriptors() {
                    println!("{}", desc.display_name);
                }
            }
        }

        Commands::Browse {
            inputs,
            out_dir,
            rows,
            cols,
            layout,
            precision,
            workers,
            start,
            limit,
            reverse,
            manifest,
            progress,
        } => {
            let summary = browse(
                &inputs,
                &out_dir,
                rows,
                cols,
                LoaderConfig {
                    dat_layout: layout,
                    precision,
                },
                DispatchConfig {
                    max_workers: workers,
                },
                BrowseWindow {
                    start,
                    limit,
                    reverse,
                },
                manifest.as_deref(),
                ProgressConfig::new(progress),
            )?;
            print_browse_summary(&summary);
        }
    }

    Ok(())
}

fn write_single(
    dispatcher: &Dispatcher,
    result: error::DecodeResult<LoadedImage>,
    output: &Path,
) -> Result<()> {
    let loaded = result?;
    let blob = dispatcher
        .store()
        .get(&loaded.handle)
        .context("decoded image was revoked before it could be written")?;
    std::fs::write(output, &blob.bytes)
        .with_context(|| format!("writing {}", output.display()))?;
    dispatcher.store().revoke(&loaded.handle);

    match loaded.dims {
        Some((rows, cols)) => println!(
            "wrote {} ({}x{}) md5={}",
            output.display(),
            cols,
            rows,
            loaded.md5
        ),
        None => println!("wrote {} md5={}", output.display(), loaded.md5),
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct BrowseWindow {
    start: usize,
    limit: Option<usize>,
    reverse: bool,
}

#[derive(Debug, Serialize)]
struct VisitedFrame {
    index: usize,
    display_name: String,
    output: Option<PathBuf>,
    md5: Option<String>,
    error_kind: Option<ErrorKind>,
    error: Option<String>,
}

#[allow(clippy::too_many_arguments)]
fn browse(
    inputs: &[PathBuf],
    out_dir: &Path,
    rows: u32,
    cols: u32,
    loader_cfg: LoaderConfig,
    dispatch_cfg: DispatchConfig,
    window: BrowseWindow,
    manifest: Option<&Path>,
    progress_cfg: ProgressConfig,
) -> Result<BrowseSummary> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating output dir {}", out_dir.display()))?;

    let files = util::expand_inputs(inputs).context("listing inputs")?;
    if files.is_empty() {
        bail!("no input files found");
    }

    let tune = dispatch_cfg.resolve(largest_file_len(&files));
    let store = ImageStore::new();
    let dispatcher = Dispatcher::new(tune.decode_workers, store.clone());
    let decode_workers = dispatcher.workers();

    let reporter = ProgressReporter::new("browse", 0, progress_cfg);
    let handle = reporter.handle();
    handle.log(format!(
        "decode workers={} cores={} ram_avail={}",
        decode_workers,
        tune.cores,
        HumanBytes(tune.ram_avail)
    ));

    let mut loader = FrameLoader::new(loader_cfg, dispatcher, Arc::new(handle.clone()));

    handle.set_stage("expanding selection");
    loader.process_selection(&files, rows, cols)?;
    let mut descriptor_count = 0;
    let mut failed_files = 0;
    let mut first_load = Vec::new();
    for completion in loader.wait_idle() {
        match completion {
            Completion::SelectionExpanded {
                descriptors,
                failed_files: failed,
            } => {
                descriptor_count = descriptors;
                failed_files = failed;
            }
            other => first_load.push(other),
        }
    }

    let start = window.start;
    let end = window
        .limit
        .map_or(descriptor_count, |n| start.saturating_add(n).min(descriptor_count));
    handle.set_total(end.saturating_sub(start) as u64);
    handle.set_stage("decoding frames");

    let mut visits = Vec::new();
    if start < end {
        let first = if window.reverse { end - 1 } else { start };
        // Expansion already loaded frame 0.
        let mut completions = if first == 0 {
            first_load
        } else {
            match loader.load_frame(first as isize) {
                LoadRequest::Started => loader.wait_idle(),
                LoadRequest::Dropped | LoadRequest::Cleared => Vec::new(),
            }
        };

        loop {
            let mut last = None;
            for completion in completions {
                match completion {
                    Completion::FrameLoaded { index } => {
                        let visit = write_current(&loader, out_dir)?;
                        if let Some(path) = &visit.output {
                            handle.set_current(Some(path.display().to_string()));
                        }
                        visits.push(visit);
                        last = Some(index);
                        handle.inc(1);
                    }
                    Completion::FrameFailed { index, error } => {
                        visits.push(VisitedFrame {
                            index,
                            display_name: loader
                                .descriptors()
                                .get(index)
                                .map(|d| d.display_name.clone())
                                .unwrap_or_default(),
                            output: None,
                            md5: None,
                            error_kind: Some(error.kind()),
                            error: Some(error.to_string()),
                        });
                        last = Some(index);
                        handle.inc(1);
                    }
                    Completion::SelectionExpanded { .. } => {}
                }
            }

            let finished = match last {
                None => true,
                Some(i) if window.reverse => i <= start,
                Some(i) => i + 1 >= end,
            };
            if finished {
                break;
            }
            let step = if window.reverse {
                loader.prev_frame()
            } else {
                loader.next_frame()
            };
            completions = match step {
                Some(LoadRequest::Started) => loader.wait_idle(),
                _ => break,
            };
        }
        handle.set_current(None);
    }

    drop(loader);
    let leaked = store.live_count();
    if leaked > 0 {
        handle.warning(format!("{} images still registered after teardown", leaked));
    }

    if let Some(path) = manifest {
        let json = serde_json::to_vec_pretty(&visits)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }

    let written = visits.iter().filter(|v| v.output.is_some()).count();
    let outcome = reporter.finish("browse complete");

    Ok(BrowseSummary {
        output_dir: out_dir.to_path_buf(),
        descriptor_count,
        visited_frames: outcome.frames_done,
        written_frames: written,
        failed_frames: visits.len() - written,
        failed_files,
        decode_workers,
        elapsed: outcome.elapsed,
        avg_frames_per_sec: outcome.avg_frames_per_sec,
        warning_count: outcome.warning_count,
        warnings: outcome.warnings,
    })
}

// Saves the displayed frame as `<index>_<display name>.<ext>`.
fn write_current(loader: &FrameLoader, out_dir: &Path) -> Result<VisitedFrame> {
    let index = loader.current_index().context("no frame on display")?;
    let desc = loader
        .current_descriptor()
        .context("loaded frame has no descriptor")?;
    let image = loader
        .current_image()
        .context("loaded frame has no image")?;
    let blob = loader
        .store()
        .get(image)
        .with_context(|| format!("image {} is no longer registered", image))?;

    let stem: String = desc
        .display_name
        .chars()
        .map(|c| if c == '#' || std::path::is_separator(c) { '_' } else { c })
        .collect();
    let path = out_dir.join(format!(
        "{:05}_{}.{}",
        index,
        stem,
        extension_for_mime(blob.mime)
    ));
    std::fs::write(&path, &blob.bytes).with_context(|| format!("writing {}", path.display()))?;

    Ok(VisitedFrame {
        index,
        display_name: desc.display_name.clone(),
        output: Some(path),
        md5: loader.current_md5().map(str::to_string),
        error_kind: None,
        error: None,
    })
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/bmp" => "bmp",
        "image/gif" => "gif",
        "image/tiff" => "tif",
        _ => "png",
    }
}

fn largest_file_len(files: &[PathBuf]) -> u64 {
    files
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .max()
        .unwrap_or(0)
}

fn print_browse_summary(summary: &BrowseSummary) {
    println!(
        "Browse summary: output={} duration={} rate={} frames={} written={} failed={} visited={} failed_files={} workers={} warnings={}",
        summary.output_dir.display(),
        util::fmt_duration(summary.elapsed),
        progress::format_rate(summary.avg_frames_per_sec),
        summary.descriptor_count,
        summary.written_frames,
        summary.failed_frames,
        summary.visited_frames,
        summary.failed_files,
        summary.decode_workers,
        summary.warning_count,
    );
    for warning in &summary.warnings {
        println!("  warning: {}", warning);
    }
}
