// CLI definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hidlink::HidLinkConfig;

#[derive(Parser)]
#[command(name = "hidlink")]
#[command(author, version, about = "Single-device HID connection manager")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file path (default: ~/.config/hidlink/hidlink.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Vendor ID to match (decimal or 0x-prefixed hex)
    #[arg(long, global = true, value_parser = parse_id)]
    pub vid: Option<u16>,

    /// Product ID to match (decimal or 0x-prefixed hex)
    #[arg(long, global = true, value_parser = parse_id)]
    pub pid: Option<u16>,

    /// Delay between polls in milliseconds
    #[arg(long, global = true)]
    pub interval_ms: Option<u64>,

    /// Maximum bytes read per input report
    #[arg(long, global = true)]
    pub buffer_size: Option<usize>,

    /// Devices prefix each report with a report ID byte
    #[arg(long, global = true)]
    pub numbered_reports: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List attached devices matching the criteria
    #[command(visible_alias = "ls")]
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect and hex-dump input reports until Ctrl-C (default)
    #[command(visible_alias = "w")]
    Watch,

    /// Show the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        write: bool,
    },
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(HidLinkConfig::default_path)
    }

    /// Apply command-line overrides on top of the loaded config
    pub fn apply(&self, config: &mut HidLinkConfig) {
        if let Some(vid) = self.vid {
            config.criteria.vendor_id = vid;
        }
        if let Some(pid) = self.pid {
            config.criteria.product_id = pid;
        }
        if let Some(ms) = self.interval_ms {
            config.poller.interval_ms = ms;
        }
        if let Some(size) = self.buffer_size {
            config.poller.report_buffer_size = size;
        }
        if self.numbered_reports {
            config.transport.numbered_reports = true;
        }
    }
}

/// Parse a USB id given as decimal or 0x-prefixed hex
fn parse_id(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid id '{s}': {e}"))
}
