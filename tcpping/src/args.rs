use std::{net::IpAddr, path::PathBuf};

use clap::{ArgAction, Parser};

/// Measure TCP round-trip latency between a Pitcher and a Catcher
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Opts {
    /// Run as Pitcher: send probes to <HOST> and report round-trip times
    #[arg(short = 'p', long, conflicts_with = "catcher")]
    pub pitcher: bool,

    /// Run as Catcher: accept one Pitcher and echo its probes
    #[arg(short = 'c', long)]
    pub catcher: bool,

    /// [Pitcher] port to connect to, [Catcher] port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// [Catcher] address to listen on
    #[arg(long, value_name = "IP_ADDRESS")]
    pub bind: Option<IpAddr>,

    /// [Pitcher] messages per second
    #[arg(long, value_name = "RATE")]
    pub mps: Option<u32>,

    /// [Pitcher] probe size in bytes (50..=3000, anything else falls back to
    /// 300)
    #[arg(long, allow_negative_numbers = true)]
    pub size: Option<i64>,

    /// [Pitcher] duration of the run in seconds
    #[arg(long, short)]
    pub duration: Option<u64>,

    /// [Pitcher] save every round trip as a CSV row to this file
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Interface to bind to
    #[arg(long, short)]
    pub iface: Option<String>,

    /// Provide a config file instead of the options above
    #[arg(
        long,
        conflicts_with_all = [
            "pitcher", "catcher", "port", "bind", "mps", "size", "duration", "file",
            "iface", "hosts",
        ]
    )]
    pub config_file: Option<PathBuf>,

    /// More output, repeat for trace level
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// [Pitcher] host to send probes to
    #[arg(value_name = "HOST")]
    pub hosts: Vec<String>,
}
