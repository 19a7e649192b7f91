use anyhow::{Context, Result};
use chrono::NaiveTime;
use clap::{Parser, Subcommand};
use rollcall_core::schedule::parse_clock_time;
use rollcall_core::{load_gallery, CaptureLoop, Clock, LocalClock, ScanOutcome, Scanner};
use rollcall_hw::Camera;
use rollcall_models::{FaceNetEmbedder, ScrfdDetector};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod feed;
mod reporter;

use commands::LineCommands;
use config::Config;
use feed::LiveFeed;
use reporter::HttpReporter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-scan attendance marking")]
struct Cli {
    /// TOML configuration file (ROLLCALL_* variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the camera and scan on demand ('s' + Enter to scan, 'q' + Enter to quit)
    Run,
    /// Build the gallery and list the identities it holds
    Gallery,
    /// Show the timetable and the activity in session
    Schedule {
        /// Time to look up instead of now (HH:MM)
        #[arg(long, value_parser = parse_at)]
        at: Option<NaiveTime>,
    },
    /// Match the face in a still image against the gallery
    Identify {
        /// Image file containing one face
        image: PathBuf,
        /// Run the full timetable-gated scan and post attendance on a match
        #[arg(long)]
        report: bool,
        /// Time to use for the timetable instead of now (HH:MM)
        #[arg(long, value_parser = parse_at)]
        at: Option<NaiveTime>,
    },
    /// List video capture devices
    Devices,
}

fn parse_at(s: &str) -> Result<NaiveTime, String> {
    parse_clock_time(s).map_err(|e| e.to_string())
}

/// Local time unless pinned from the command line.
struct CliClock(Option<NaiveTime>);

impl Clock for CliClock {
    fn now(&self) -> NaiveTime {
        self.0.unwrap_or_else(|| LocalClock.now())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config),
        Commands::Gallery => list_gallery(&config),
        Commands::Schedule { at } => show_schedule(&config, at),
        Commands::Identify { image, report, at } => identify(&config, &image, report, at),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
    }
}

fn load_models(config: &Config) -> Result<(ScrfdDetector, FaceNetEmbedder)> {
    let detector = ScrfdDetector::load(&config.detector_model_path(), config.detector_confidence)
        .context("loading face detector")?;
    let embedder = FaceNetEmbedder::load(
        &config.embedder_model_path(),
        &config.embedding_output,
        config.embedder_input_size,
    )
    .context("loading face embedder")?;
    Ok((detector, embedder))
}

fn build_scanner(
    config: &Config,
    clock: CliClock,
) -> Result<Scanner<ScrfdDetector, FaceNetEmbedder, HttpReporter, CliClock>> {
    let timetable = config.timetable()?;
    let (detector, mut embedder) = load_models(config)?;

    let gallery = load_gallery(&config.gallery_dir, &mut embedder)?;
    if gallery.is_empty() {
        tracing::warn!(dir = %config.gallery_dir.display(), "gallery is empty; no face can match");
    }

    let reporter = HttpReporter::new(&config.attendance_endpoint, config.report_timeout())?;
    tracing::info!(
        identities = gallery.len(),
        endpoint = %reporter.endpoint(),
        "scanner ready"
    );

    Ok(Scanner::new(
        detector,
        embedder,
        reporter,
        clock,
        gallery,
        timetable,
        config.scan_settings(),
    ))
}

fn run(config: &Config) -> Result<()> {
    let scanner = build_scanner(config, CliClock(None))?;

    let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)?;
    let mut stream = camera.stream()?;
    if config.warmup_frames > 0 {
        tracing::info!(count = config.warmup_frames, "discarding warmup frames");
        stream.discard(config.warmup_frames)?;
    }

    let mut feed = LiveFeed::new(stream);
    let mut commands = LineCommands::stdin().context("reading operator commands")?;
    let mut capture = CaptureLoop::new(scanner, config.poll_interval());

    match capture.run(&mut feed, &mut commands) {
        Ok(summary) => tracing::info!(
            scans = summary.scans,
            matches = summary.matches,
            reported = summary.reported,
            "session finished"
        ),
        Err(e) => tracing::error!(error = %e, "capture stopped"),
    }
    Ok(())
}

fn list_gallery(config: &Config) -> Result<()> {
    let (_, mut embedder) = load_models(config)?;
    let gallery = load_gallery(&config.gallery_dir, &mut embedder)?;

    println!(
        "{} identities in {} (embedding dim {})",
        gallery.len(),
        config.gallery_dir.display(),
        gallery.dim().map_or_else(|| "-".to_string(), |d| d.to_string())
    );
    for entry in gallery.entries() {
        println!("  {:<20} {}", entry.identity, entry.source.display());
    }
    Ok(())
}

fn show_schedule(config: &Config, at: Option<NaiveTime>) -> Result<()> {
    let timetable = config.timetable()?;
    let now = CliClock(at).now();

    for entry in timetable.entries() {
        println!("  {entry}");
    }
    match timetable.lookup(now) {
        Some(activity) => println!("At {}: {activity}", now.format("%H:%M")),
        None => println!("At {}: none scheduled", now.format("%H:%M")),
    }
    Ok(())
}

fn identify(config: &Config, path: &std::path::Path, report: bool, at: Option<NaiveTime>) -> Result<()> {
    let frame = image::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .to_rgb8();
    let mut scanner = build_scanner(config, CliClock(at))?;

    if report {
        match scanner.scan(&frame)? {
            ScanOutcome::NothingScheduled => println!("No activity scheduled; nothing reported"),
            ScanOutcome::NoFace { .. } => println!("No face detected"),
            ScanOutcome::NoMatch { best, .. } => {
                println!("No match (closest: {:?} at {:.4})", best.identity, best.similarity)
            }
            ScanOutcome::Matched { record, similarity, reported } => println!(
                "{} matched at {similarity:.4} for {}; {}",
                record.reg_no,
                record.subject,
                if reported { "attendance marked" } else { "report failed" }
            ),
        }
        return Ok(());
    }

    println!("Activity: {}", scanner.current_activity().unwrap_or("none scheduled"));
    match scanner.identify(&frame)? {
        None => println!("No face detected"),
        Some(result) if result.matched => println!(
            "Match: {} ({:.4})",
            result.identity.as_deref().unwrap_or_default(),
            result.similarity
        ),
        Some(result) => println!("No match (closest: {:?} at {:.4})", result.identity, result.similarity),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::parse_from(["rollcall"]);
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_identify_args() {
        let cli = Cli::parse_from(["rollcall", "identify", "probe.jpg", "--report", "--at", "09:30", "-c", "r.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("r.toml")));
        match cli.command {
            Some(Commands::Identify { image, report, at }) => {
                assert_eq!(image, PathBuf::from("probe.jpg"));
                assert!(report);
                assert_eq!(at, NaiveTime::from_hms_opt(9, 30, 0));
            }
            _ => panic!("expected identify"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_time() {
        assert!(Cli::try_parse_from(["rollcall", "schedule", "--at", "9:30"]).is_err());
    }

    #[test]
    fn test_cli_clock_pinned() {
        let t = NaiveTime::from_hms_opt(13, 5, 0).unwrap();
        assert_eq!(CliClock(Some(t)).now(), t);
    }
}
