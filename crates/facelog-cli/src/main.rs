use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facelog_core::{CascadeDetector, DetectorParams, FaceDetector};
use facelog_hw::{CameraSource, CaptureSettings, V4l2Source};
use facelog_store::Store;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facelog", about = "facelog face recognition kiosk CLI")]
struct Cli {
    /// SQLite event database
    #[arg(long, env = "FACELOG_DB_PATH", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage identity rows
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    /// Show the most recent detections
    Detections {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Camera diagnostics
    Camera {
        #[command(subcommand)]
        command: CameraCommand,
    },
    /// Run the face cascade on an image file and print the boxes as JSON
    Detect {
        path: PathBuf,
        #[arg(
            long,
            env = "FACELOG_CASCADE_PATH",
            default_value = "haarcascade/haarcascade_frontalface_default.xml"
        )]
        cascade: PathBuf,
        #[arg(long, default_value_t = 1.3)]
        scale_factor: f64,
        #[arg(long, default_value_t = 5)]
        min_neighbors: u32,
    },
}

#[derive(Subcommand)]
enum UsersCommand {
    /// Add an identity; its id is the label to train the recognizer with
    Add { name: String },
    /// List identities
    List,
}

#[derive(Subcommand)]
enum CameraCommand {
    /// List V4L2 capture devices
    List,
    /// Open a camera, read one frame, and release it
    Test {
        /// Device indices to try, in order
        #[arg(long, env = "FACELOG_CAMERA_INDICES", value_delimiter = ',', default_value = "0,1")]
        indices: Vec<u32>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(facelog_store::default_db_path);

    match cli.command {
        Commands::Users { command } => {
            let store = open_store(&db_path)?;
            match command {
                UsersCommand::Add { name } => {
                    let id = store.add_identity(&name)?;
                    println!("Added identity {id}: {}", name.trim());
                }
                UsersCommand::List => {
                    let identities = store.identities()?;
                    if identities.is_empty() {
                        println!("No identities");
                    }
                    for identity in identities {
                        println!(
                            "{:>4}  {:<24} {}",
                            identity.id, identity.name, identity.created_at
                        );
                    }
                }
            }
        }
        Commands::Detections { limit } => {
            let store = open_store(&db_path)?;
            let rows = store.recent(limit)?;
            if rows.is_empty() {
                println!("No detections");
            }
            for row in rows {
                println!("{}  {}", row.detection_time, row.name);
            }
        }
        Commands::Camera { command } => match command {
            CameraCommand::List => {
                let devices = facelog_hw::list_devices();
                if devices.is_empty() {
                    println!("No capture devices found");
                }
                for d in devices {
                    println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
                }
            }
            CameraCommand::Test { indices } => {
                println!("Running camera diagnostics...");
                let mut source = V4l2Source::new(indices.clone(), CaptureSettings::default());
                tracing::debug!(?indices, "acquiring camera");
                let Some(mut camera) = source.acquire() else {
                    bail!("no camera could be opened at indices {indices:?}");
                };
                println!("Opened {}", camera.describe());
                let result = camera.read();
                camera.release();
                let frame = result.context("failed to read a frame")?;
                println!(
                    "Frame {}: {}x{}, mean brightness {:.1}",
                    frame.sequence,
                    frame.width(),
                    frame.height(),
                    frame.avg_brightness()
                );
            }
        },
        Commands::Detect {
            path,
            cascade,
            scale_factor,
            min_neighbors,
        } => {
            let params = DetectorParams {
                scale_factor,
                min_neighbors,
                ..DetectorParams::default()
            };
            let detector = CascadeDetector::load(&cascade, params)
                .with_context(|| format!("failed to load cascade {}", cascade.display()))?;
            let rgb = image::open(&path)
                .with_context(|| format!("failed to read image {}", path.display()))?
                .to_rgb8();
            let gray = facelog_hw::frame::rgb_to_gray(&rgb);
            let faces = detector.detect(&gray);
            tracing::info!(
                image = %path.display(),
                stages = detector.stage_count(),
                faces = faces.len(),
                "detection complete"
            );
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
    }

    Ok(())
}

fn open_store(path: &std::path::Path) -> Result<Store> {
    tracing::debug!(path = %path.display(), "opening event store");
    Store::open(path).with_context(|| format!("failed to open database {}", path.display()))
}
