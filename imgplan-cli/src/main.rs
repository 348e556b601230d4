use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use imgplan::validity::{self, CancelHandle, Cancellable};
use imgplan::{ImageSource, OutputFormat, Planner, PlannerConfig, PngCompression};

#[derive(Parser)]
#[command(name = "imgplan")]
#[command(about = "Probe, downsample and rotate images under a memory budget", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to ~/.config/imgplan/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, default_value_t)]
    verbose: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true, default_value_t)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Print the natural size of each image without decoding it
    Probe {
        #[arg(required = true, value_name = "INPUT")]
        inputs: Vec<PathBuf>,
    },

    /// Print the sample size each image would be decoded at
    SampleSize {
        #[arg(required = true, value_name = "INPUT")]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Decode images subsampled to fit the bounding box
    Decode {
        #[arg(required = true, value_name = "INPUT")]
        inputs: Vec<PathBuf>,

        /// Output directory
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        output_dir: PathBuf,

        /// Stop starting new images after the first failure
        #[arg(long, default_value_t)]
        fail_fast: bool,

        #[command(flatten)]
        plan: PlanArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Decode an image to fit the bounding box, then rotate it
    Rotate {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Clockwise angle in degrees
        #[arg(short, long, allow_hyphen_values = true)]
        angle: f32,

        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        #[command(flatten)]
        plan: PlanArgs,

        #[command(flatten)]
        format: OutputArgs,
    },

    /// Show the effective configuration, optionally saving it
    Config {
        #[command(flatten)]
        plan: PlanArgs,

        #[command(flatten)]
        output: OutputArgs,

        /// Write the configuration back to the config file
        #[arg(long, default_value_t)]
        save: bool,
    },
}

#[derive(Args)]
struct PlanArgs {
    /// Largest width to hold in memory
    #[arg(long, value_name = "PIXELS")]
    max_width: Option<u32>,

    /// Largest height to hold in memory
    #[arg(long, value_name = "PIXELS")]
    max_height: Option<u32>,

    /// Byte budget for a single decoded image
    #[arg(long, value_name = "BYTES")]
    max_alloc: Option<u64>,

    /// Give up on an image after this many non-memory faults
    #[arg(long, value_name = "COUNT", conflicts_with = "unbounded_retries")]
    fault_retries: Option<u32>,

    /// Retry non-memory faults forever
    #[arg(long, default_value_t)]
    unbounded_retries: bool,
}

#[derive(Args)]
struct OutputArgs {
    /// Image format
    #[arg(long, value_enum)]
    format: Option<ImageFormatArg>,

    /// JPEG quality (1-100)
    #[arg(long, value_name = "QUALITY", default_value_t = 85)]
    quality: u8,

    /// PNG compression level
    #[arg(long, value_enum, default_value_t = PngCompressionArg::Default)]
    png_compression: PngCompressionArg,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ImageFormatArg {
    Jpeg,
    Png,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum PngCompressionArg {
    Fast,
    Default,
    Best,
}

impl From<PngCompressionArg> for PngCompression {
    fn from(arg: PngCompressionArg) -> Self {
        match arg {
            PngCompressionArg::Fast => PngCompression::Fast,
            PngCompressionArg::Default => PngCompression::Default,
            PngCompressionArg::Best => PngCompression::Best,
        }
    }
}

impl PlanArgs {
    fn apply(&self, config: &mut PlannerConfig) {
        if let Some(max_width) = self.max_width {
            config.max_width = max_width;
        }
        if let Some(max_height) = self.max_height {
            config.max_height = max_height;
        }
        if self.max_alloc.is_some() {
            config.max_alloc = self.max_alloc;
        }
        if self.fault_retries.is_some() {
            config.fault_retry_limit = self.fault_retries;
        }
        if self.unbounded_retries {
            config.fault_retry_limit = None;
        }
    }
}

impl OutputArgs {
    fn apply(&self, config: &mut PlannerConfig) -> Result<()> {
        if self.quality == 0 || self.quality > 100 {
            anyhow::bail!("Quality must be between 1 and 100");
        }

        config.output = match self.format {
            Some(ImageFormatArg::Jpeg) => OutputFormat::Jpeg {
                quality: self.quality,
            },
            Some(ImageFormatArg::Png) => OutputFormat::Png {
                compression: self.png_compression.into(),
            },
            None => config.output,
        };
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose, cli.quiet);

    let config_path = cli.config.clone().or_else(PlannerConfig::config_path);
    let mut config = config_path
        .as_deref()
        .and_then(PlannerConfig::load_from)
        .unwrap_or_default();

    match &cli.command {
        Command::Probe { inputs } => {
            let planner = config.planner();
            for input in inputs {
                match planner.dimensions(ImageSource::Path(input)) {
                    Some(dims) => println!("{}: {}x{}", input.display(), dims.width, dims.height),
                    None => println!("{}: unknown", input.display()),
                }
            }
        }
        Command::SampleSize { inputs, plan } => {
            plan.apply(&mut config);
            let bounds = config.bounds()?;
            let planner = config.planner();
            for input in inputs {
                let sample = planner.sample_size(ImageSource::Path(input), bounds);
                println!("{}: {sample}", input.display());
            }
        }
        Command::Decode {
            inputs,
            output_dir,
            fail_fast,
            plan,
            output,
        } => {
            plan.apply(&mut config);
            output.apply(&mut config)?;
            decode_batch(inputs, output_dir, *fail_fast, &config, cli.quiet)?;
        }
        Command::Rotate {
            input,
            angle,
            output,
            plan,
            format,
        } => {
            plan.apply(&mut config);
            format.apply(&mut config)?;
            rotate_file(input, *angle, output, &config)?;
            if !cli.quiet {
                log::info!("Done: {}", output.display());
            }
        }
        Command::Config {
            plan,
            output,
            save,
        } => {
            plan.apply(&mut config);
            output.apply(&mut config)?;
            config.bounds()?;
            println!("{}", serde_json::to_string_pretty(&config)?);

            if *save {
                let path = config_path.context("Could not determine the config path")?;
                config
                    .save_to(&path)
                    .with_context(|| format!("Failed to save config to {}", path.display()))?;
                log::info!("Saved config to {}", path.display());
            }
        }
    }

    Ok(())
}

fn setup_logging(verbose: bool, quiet: bool) {
    if quiet {
        return;
    }

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn decode_batch(
    inputs: &[PathBuf],
    output_dir: &Path,
    fail_fast: bool,
    config: &PlannerConfig,
    quiet: bool,
) -> Result<()> {
    let bounds = config.bounds()?;
    let planner = config.planner();
    let outputs = output_paths(inputs, output_dir, config.output)?;

    if !output_dir.exists() {
        std::fs::create_dir_all(output_dir).context("Failed to create output directory")?;
    }

    if config.fault_retry_limit.is_none() && validity::is_main_thread() {
        log::warn!("Retrying faults without limit on the main thread, a corrupt input will hang");
    }

    let batch = CancelHandle::new();
    batch.start();

    let failures: Vec<_> = inputs
        .par_iter()
        .zip(outputs.par_iter())
        .filter_map(|(input, output)| {
            if batch.is_cancelled() {
                log::debug!("Skipping {}", input.display());
                return None;
            }

            let result = decode_file(&planner, input, output, bounds, config.output);
            match result {
                Ok(()) => {
                    if !quiet {
                        log::info!("{} -> {}", input.display(), output.display());
                    }
                    None
                }
                Err(e) => {
                    log::warn!("Failed to decode {}: {:#}", input.display(), e);
                    if fail_fast {
                        validity::cancel(Some(&batch), false);
                    }
                    Some(input.clone())
                }
            }
        })
        .collect();

    batch.finish();

    if !failures.is_empty() {
        anyhow::bail!("{} of {} images failed", failures.len(), inputs.len());
    }

    Ok(())
}

/// Output file for each input, named after its stem. Fails when two inputs
/// would land on the same file, before anything is decoded.
fn output_paths(inputs: &[PathBuf], output_dir: &Path, format: OutputFormat) -> Result<Vec<PathBuf>> {
    let mut claimed: HashMap<PathBuf, &Path> = HashMap::new();
    inputs
        .iter()
        .map(|input| {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy())
                .unwrap_or_else(|| "image".into());
            let output = output_dir.join(format!("{stem}.{}", format.extension()));
            if let Some(previous) = claimed.insert(output.clone(), input) {
                anyhow::bail!(
                    "{} and {} would both be written to {}",
                    previous.display(),
                    input.display(),
                    output.display()
                );
            }
            Ok(output)
        })
        .collect()
}

fn decode_file(
    planner: &Planner,
    input: &Path,
    output: &Path,
    bounds: imgplan::BoundingBox,
    format: OutputFormat,
) -> Result<()> {
    let img = planner
        .decode(ImageSource::Path(input), bounds)
        .with_context(|| format!("Failed to decode {}", input.display()))?;

    write_image(&img, output, format)
}

fn rotate_file(input: &Path, angle: f32, output: &Path, config: &PlannerConfig) -> Result<()> {
    let planner = config.planner();
    let img = planner
        .decode(ImageSource::Path(input), config.bounds()?)
        .with_context(|| format!("Failed to decode {}", input.display()))?;

    let rotated = planner
        .rotate(Some(&img), angle)
        .context("Failed to rotate image")?
        .context("Image is empty")?;

    write_image(&rotated, output, config.output)
}

fn write_image(img: &imgplan::image::DynamicImage, path: &Path, format: OutputFormat) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    imgplan::image::encode(img, &mut writer, format)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writer.flush()?;
    Ok(())
}
