use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};

mod capture;
mod config;
mod flow;
mod interfaces;
mod transmit;
mod vxlan;

use capture::Stats;
use config::Config;
use transmit::{DryRunTransmitter, Transmit, UdpTransmitter};

#[derive(Parser, Debug)]
#[command(name = "vxlan-tap")]
#[command(about = "Mirror traffic from every non-control interface to a VXLAN collector")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Log verbosity
    #[arg(short, long, value_enum, default_value_t = Verbosity::Normal)]
    verbosity: Verbosity,

    /// Run the capture pipeline without sending anything
    #[arg(long)]
    dry_run: bool,

    /// Seconds between statistics reports (0 disables them)
    #[arg(long, default_value = "30")]
    stats_interval: u64,

    /// Mirror the frames of a PCAP file instead of live interfaces, then exit
    #[arg(long)]
    replay: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Verbosity {
    /// No output
    Quiet,
    /// Startup, interface and error messages
    Normal,
    /// Everything, including a trace per mirrored packet
    Packets,
}

impl Verbosity {
    fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::OFF,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Packets => LevelFilter::TRACE,
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn print_summary(stats: &Stats, start_time: Instant) {
    let totals = stats.snapshot();
    info!("======= MIRROR SUMMARY =======");
    info!("Uptime: {:.2} seconds", start_time.elapsed().as_secs_f64());
    info!("Frames captured: {}", totals.captured);
    info!(
        "Datagrams sent: {} ({:.2} MB)",
        totals.sent_packets,
        totals.sent_bytes as f64 / (1024.0 * 1024.0)
    );
    info!("Frames dropped: {}", totals.dropped);
    info!("Fallback source ports: {}", totals.fallback_ports);
    info!("==============================");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.verbosity.level_filter())
        .init();

    let config = Arc::new(
        Config::load(&args.config)
            .with_context(|| format!("Failed to load config {}", args.config.display()))?,
    );

    let transmitter: Arc<dyn Transmit> = if args.dry_run {
        info!("Dry run: mirrored packets will not be sent");
        Arc::new(DryRunTransmitter)
    } else {
        Arc::new(UdpTransmitter::new(config.dest_host.clone(), config.dest_port))
    };
    let stats = Arc::new(Stats::default());

    let start_time = Instant::now();

    if let Some(path) = args.replay.clone() {
        let filter = capture::build_filter(&config.dest_host, config.dest_port, config.user_filter());
        let vni = config.vni;
        let replay_stats = stats.clone();
        let frames = tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut session = capture::CaptureSession::from_savefile(&path, &filter)?;
            info!("Replaying {} with filter: {}", session.device(), session.filter());
            let mirror = capture::Mirror::new(session.device(), vni, session.link(), transmitter, replay_stats);
            Ok(session.run(&mirror)?)
        })
        .await
        .context("Replay task failed")??;

        info!("Replay finished: {} frames matched the filter", frames);
        print_summary(&stats, start_time);
        return Ok(());
    }

    let devices = interfaces::discover().and_then(interfaces::require_devices)?;
    info!("Found {} capture devices", devices.len());

    let selected = interfaces::qualify(devices, &config.control_net);
    if selected.is_empty() {
        warn!(
            "Every interface is loopback or inside control network {}, nothing to mirror",
            config.control_net
        );
    }

    let mut started = 0;
    for device in selected {
        let name = device.name.clone();
        match capture::spawn_capture(device, config.clone(), transmitter.clone(), stats.clone()) {
            Ok(_) => started += 1,
            Err(e) => error!("Failed to start capture thread for {}: {}", name, e),
        }
    }
    info!(
        "Mirroring {} interfaces to {}:{} (vni {})",
        started, config.dest_host, config.dest_port, config.vni
    );

    let stats_handle = (args.stats_interval > 0).then(|| {
        let stats = stats.clone();
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            let mut last = stats.snapshot();
            let mut last_time = Instant::now();

            loop {
                interval.tick().await;

                let now_stats = stats.snapshot();
                let now = Instant::now();
                let elapsed = now.duration_since(last_time).as_secs_f64();
                let pps = (now_stats.sent_packets - last.sent_packets) as f64 / elapsed;

                info!(
                    "Captured: {} - Sent: {} ({} bytes) - Rate: {} pps - Dropped: {} - Fallback ports: {}",
                    now_stats.captured,
                    now_stats.sent_packets,
                    now_stats.sent_bytes,
                    pps as u64,
                    now_stats.dropped,
                    now_stats.fallback_ports
                );

                last = now_stats;
                last_time = now;
            }
        })
    });

    shutdown_signal().await;
    info!("Received shutdown signal, stopping...");
    if let Some(handle) = stats_handle {
        handle.abort();
    }

    print_summary(&stats, start_time);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::try_parse_from(["vxlan-tap"]).unwrap();
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert_eq!(args.verbosity, Verbosity::Normal);
        assert!(!args.dry_run);
        assert_eq!(args.stats_interval, 30);
    }

    #[test]
    fn test_verbosity_levels() {
        let args = Args::try_parse_from(["vxlan-tap", "-v", "packets", "--dry-run"]).unwrap();
        assert_eq!(args.verbosity.level_filter(), LevelFilter::TRACE);
        assert!(args.dry_run);
        assert_eq!(Verbosity::Quiet.level_filter(), LevelFilter::OFF);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
