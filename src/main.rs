use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sparemap::{check_root, Target};
use std::time::{Duration, UNIX_EPOCH};

const BUILD_TIMESTAMP: u64 = const_parse_u64(env!("BUILD_TIMESTAMP"));
const GIT_HASH: &str = env!("GIT_HASH");

const fn const_parse_u64(s: &str) -> u64 {
    let bytes = s.as_bytes();
    let mut result: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        result = result * 10 + (bytes[i] - b'0') as u64;
        i += 1;
    }
    result
}

fn format_build_time() -> String {
    let dt = UNIX_EPOCH + Duration::from_secs(BUILD_TIMESTAMP);
    let secs = dt.duration_since(UNIX_EPOCH).unwrap().as_secs();
    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    let (year, month, day) = days_to_ymd(days_since_epoch);

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        year, month, day, hours, minutes, seconds
    )
}

fn days_to_ymd(days: u64) -> (u64, u64, u64) {
    let mut remaining = days as i64;
    let mut year = 1970i64;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining < days_in_year {
            break;
        }
        remaining -= days_in_year;
        year += 1;
    }

    let days_in_months: [i64; 12] = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1i64;
    for days in days_in_months {
        if remaining < days {
            break;
        }
        remaining -= days;
        month += 1;
    }

    (year as u64, month as u64, (remaining + 1) as u64)
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

fn version_long() -> String {
    format!(
        "{} (built {} git:{})",
        env!("CARGO_PKG_VERSION"),
        format_build_time(),
        GIT_HASH
    )
}

#[derive(Parser)]
#[command(name = "sparemapctl")]
#[command(author, version, about = "Transparent sector remapping for failing block devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Arguments shared by every subcommand that attaches a target
/// (spec.md §6 construction string: `<main_dev> <spare_dev> [spare_meta_sectors]`).
#[derive(clap::Args)]
struct TargetArgs {
    /// Path to the primary device or image file
    main_device: String,

    /// Path to the spare device or image file
    spare_device: String,

    /// Sectors reserved per superblock copy
    #[arg(long)]
    meta_sectors: Option<u32>,

    /// Additional `key=value` configuration options (repeatable)
    #[arg(long = "option")]
    options: Vec<String>,
}

impl TargetArgs {
    fn construction_args(&self) -> Vec<String> {
        let mut args = vec![self.main_device.clone(), self.spare_device.clone()];
        if let Some(meta_sectors) = self.meta_sectors {
            args.push(meta_sectors.to_string());
        }
        args.extend(self.options.iter().cloned());
        args
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Attach a target and report its initial status
    Attach(TargetArgs),

    /// Attach a target and print its status line
    Status(TargetArgs),

    /// Force an immediate remap of one main-device sector
    Remap {
        #[command(flatten)]
        target: TargetArgs,
        /// Main-device sector number to remap
        sector: u64,
    },

    /// Clear accumulated error and remap counters
    ClearStats(TargetArgs),

    /// Report on-spare superblock copy agreement
    MetadataStatus(TargetArgs),

    /// Enable or disable automatic remapping
    SetAutoRemap {
        #[command(flatten)]
        target: TargetArgs,
        /// "true"/"1" to enable, "false"/"0" to disable
        enabled: String,
    },

    /// Show detailed version and build information
    Version,
}

fn attach(args: &TargetArgs) -> Result<Target> {
    if !check_root() {
        eprintln!("Warning: sparemapctl normally requires root to open raw block devices.");
    }
    let construction_args = args.construction_args();
    Target::construct(&construction_args)
        .with_context(|| format!("failed to attach {} / {}", args.main_device, args.spare_device))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Attach(args) => {
            let target = attach(&args)?;
            println!("attached {} / {}", target.main_path().display(), target.spare_path().display());
            println!("{}", target.status_line());
            target.teardown()?;
        }

        Commands::Status(args) => {
            let target = attach(&args)?;
            println!("{}", target.status_line());
            target.teardown()?;
        }

        Commands::Remap { target, sector } => {
            let target = attach(&target)?;
            let reply = target
                .message("remap", &[sector.to_string()])
                .with_context(|| format!("remap of sector {} failed", sector))?;
            println!("{}", reply);
            target.teardown()?;
        }

        Commands::ClearStats(args) => {
            let target = attach(&args)?;
            let reply = target.message("clear_stats", &[])?;
            println!("{}", reply);
            target.teardown()?;
        }

        Commands::MetadataStatus(args) => {
            let target = attach(&args)?;
            let reply = target.message("metadata_status", &[])?;
            println!("{}", reply);
            target.teardown()?;
        }

        Commands::SetAutoRemap { target, enabled } => {
            let target = attach(&target)?;
            let reply = target.message("set_auto_remap", &[enabled])?;
            println!("{}", reply);
            target.teardown()?;
        }

        Commands::Version => {
            println!("sparemapctl {}", version_long());
        }
    }

    Ok(())
}
