//! `boxtrack` command-line entry point.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use boxtrack_cli::pipeline;

/// Replay a 3D detections file through the online tracker.
#[derive(Parser, Debug)]
#[command(name = "boxtrack")]
#[command(about = "Online IMM-EKF multi-object tracking over 3D detections", long_about = None)]
struct Args {
    /// Tracker configuration (YAML)
    #[arg(long)]
    config: PathBuf,

    /// Input detections (JSON, {"frames": [...]})
    #[arg(long)]
    detections: PathBuf,

    /// Output tracks path (JSON, {"tracks": [...]})
    #[arg(long)]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    match pipeline::run(&args.config, &args.detections, &args.output) {
        Ok(summary) => {
            info!(
                "wrote {} track rows over {} frames to {}",
                summary.rows,
                summary.frames,
                args.output.display()
            );
        }
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    }
}
