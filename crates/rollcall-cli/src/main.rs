use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use rollcall_core::Identity;
use rollcall_engine::{
    backup, enroll_image, import_dir, list_unknowns, register_unknown, stats, summarize, AnyOf,
    AttendanceLedger, Config, FaceIdentifier, FrameBudget, FrameSource, GalleryStore, OnnxEmbedder,
    SessionLoop, SessionSummary, StopFlag, TimeLimit,
};
use rollcall_hw::{Camera, ImageDirSource};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance tracker", version)]
struct Cli {
    /// Configuration file (TOML). Defaults to ~/.config/rollcall/config.toml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an attendance session until Ctrl-C, a limit, or the end of input
    Run(RunArgs),
    /// Enroll a face from an image file
    Enroll {
        /// Identity to enroll under (e.g. a student number)
        #[arg(short, long)]
        identity: String,
        /// Label for this face model (e.g., "front", "glasses")
        #[arg(short, long, default_value = "front")]
        label: String,
        image: PathBuf,
    },
    /// Enroll every image in a directory; identity = file name up to the first '_'
    Import {
        dir: PathBuf,
        #[arg(short, long, default_value = "import")]
        label: String,
    },
    /// List enrolled face models
    List {
        /// Only models for this identity
        #[arg(short, long)]
        identity: Option<String>,
    },
    /// Remove an enrolled face model
    Remove {
        /// Model ID to remove
        id: String,
    },
    /// Enroll a saved unknown-face crop under an identity
    RegisterUnknown {
        /// Crop file from the unknowns directory
        file: PathBuf,
        #[arg(short, long)]
        identity: String,
        #[arg(short, long, default_value = "registered")]
        label: String,
        /// Keep the crop file after enrolling it
        #[arg(long)]
        keep: bool,
    },
    /// List saved unknown-face crops
    Unknowns,
    /// Summarize a session file
    Summary { file: PathBuf },
    /// Attendance totals across session files
    Stats {
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Directory of session files (defaults to the configured output directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Copy a session file to a timestamped backup
    Backup {
        file: PathBuf,
        /// Backup directory (defaults to <output_dir>/backups)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args)]
struct RunArgs {
    /// Read frames from an image directory instead of the camera
    #[arg(long)]
    images: Option<PathBuf>,
    /// Camera device (overrides configuration)
    #[arg(long)]
    device: Option<String>,
    /// Directory for the new session file
    #[arg(long, conflicts_with = "resume")]
    output_dir: Option<PathBuf>,
    /// Continue an existing session file instead of starting a new one
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,
    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,
    /// Analyse at most one frame per this many milliseconds
    #[arg(long)]
    min_interval_ms: Option<u64>,
}

#[derive(Serialize)]
struct RunReport {
    session_file: PathBuf,
    gallery_size: usize,
    /// Distinct unmatched faces.
    unknown_faces: usize,
    /// Every unmatched face sighting, repeats included.
    unknown_sightings: u64,
    summary: SessionSummary,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Enroll {
            identity,
            label,
            image,
        } => {
            let identity = Identity::new(&identity)?;
            let store = GalleryStore::open(&config.db_path)?;
            let mut embedder = OnnxEmbedder::load(&config)?;
            let model = enroll_image(&mut embedder, &store, &image, &identity, &label)?;
            println!("Enrolled {} ({}) as model {}", model.identity, model.label, model.id);
            Ok(())
        }
        Commands::Import { dir, label } => {
            let store = GalleryStore::open(&config.db_path)?;
            let mut embedder = OnnxEmbedder::load(&config)?;
            let report = import_dir(&mut embedder, &store, &dir, &label)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::List { identity } => {
            let store = GalleryStore::open(&config.db_path)?;
            let models = match identity {
                Some(identity) => store.list_for(&Identity::new(&identity)?)?,
                None => store.list()?,
            };
            if models.is_empty() {
                println!("No models enrolled");
            }
            for m in &models {
                println!(
                    "{}  {:<16} {:<10} {}",
                    m.id,
                    m.identity.as_str(),
                    m.label,
                    m.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Commands::Remove { id } => {
            let store = GalleryStore::open(&config.db_path)?;
            if !store.remove(&id)? {
                bail!("no face model with id {id}");
            }
            println!("Removed model {id}");
            Ok(())
        }
        Commands::RegisterUnknown {
            file,
            identity,
            label,
            keep,
        } => {
            let identity = Identity::new(&identity)?;
            let store = GalleryStore::open(&config.db_path)?;
            let mut embedder = OnnxEmbedder::load(&config)?;
            let model = if keep {
                enroll_image(&mut embedder, &store, &file, &identity, &label)?
            } else {
                register_unknown(&mut embedder, &store, &file, &identity, &label)?
            };
            println!("Registered {} as {} (model {})", file.display(), model.identity, model.id);
            Ok(())
        }
        Commands::Unknowns => {
            let crops = list_unknowns(&config.unknowns_dir)
                .with_context(|| format!("reading {}", config.unknowns_dir.display()))?;
            if crops.is_empty() {
                println!("No unknown faces saved");
            }
            for crop in crops {
                println!("{}", crop.display());
            }
            Ok(())
        }
        Commands::Stats { from, to, dir } => {
            if let (Some(from), Some(to)) = (from, to) {
                if from > to {
                    bail!("--from {from} is after --to {to}");
                }
            }
            let dir = dir.unwrap_or_else(|| config.output_dir.clone());
            let stats = stats(&dir, from, to).with_context(|| format!("reading {}", dir.display()))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Commands::Backup { file, dir } => {
            let dir = dir.unwrap_or_else(|| config.output_dir.join("backups"));
            let copy = backup(&file, &dir, Local::now()).with_context(|| format!("backing up {}", file.display()))?;
            println!("Backed up {} to {}", file.display(), copy.display());
            Ok(())
        }
        Commands::Summary { file } => {
            let summary = summarize(&file).with_context(|| format!("reading {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
    }
}

/// Run a session on a blocking worker; Ctrl-C sets the stop flag and waits
/// for the current frame to finish.
async fn run(mut config: Config, args: RunArgs) -> Result<()> {
    if let Some(device) = args.device {
        config.camera_device = device;
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(secs) = args.duration {
        config.max_duration_secs = Some(secs);
    }
    if let Some(ms) = args.min_interval_ms {
        config.min_interval_ms = ms;
    }

    let stop_flag = StopFlag::new();
    let mut stop = AnyOf::new().with(stop_flag.clone());
    if let Some(secs) = config.max_duration_secs {
        stop = stop.with(TimeLimit(Duration::from_secs(secs)));
    }
    if let Some(frames) = args.max_frames {
        stop = stop.with(FrameBudget(frames));
    }

    let images = args.images;
    let resume = args.resume;
    let mut worker = tokio::task::spawn_blocking(move || {
        run_blocking(&config, images.as_deref(), resume.as_deref(), &stop)
    });

    let report = tokio::select! {
        joined = &mut worker => joined??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; stopping after the current frame");
            stop_flag.trigger();
            worker.await??
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.summary.termination.is_clean() {
        bail!("session ended abnormally: {:?}", report.summary.termination);
    }
    Ok(())
}

fn run_blocking(
    config: &Config,
    images: Option<&Path>,
    resume: Option<&Path>,
    stop: &AnyOf,
) -> Result<RunReport> {
    let gallery = GalleryStore::open(&config.db_path)?.list()?;
    let gallery_size = gallery.len();
    let mut detector = FaceIdentifier::load(config, gallery)?;

    let mut source: Box<dyn FrameSource> = match images {
        Some(dir) => Box::new(
            ImageDirSource::open(dir).with_context(|| format!("opening image directory {}", dir.display()))?,
        ),
        None => {
            let mut camera =
                Camera::open(&config.camera_device, config.camera_width, config.camera_height)?;
            camera.discard(config.warmup_frames)?;
            Box::new(camera)
        }
    };

    let mut ledger = match resume {
        Some(path) => AttendanceLedger::resume(path)?,
        None => AttendanceLedger::create(&config.session_path(Local::now()))?,
    };
    let session_file = ledger.sink().path().to_path_buf();
    tracing::info!(file = %session_file.display(), "recording attendance");

    let summary = SessionLoop::new(config.session_options()).run(&mut source, &mut detector, &mut ledger, stop);

    Ok(RunReport {
        session_file,
        gallery_size,
        unknown_faces: detector.unknown_faces(),
        unknown_sightings: detector.unknown_sightings(),
        summary,
    })
}
