use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use flux_link::engine::EngineConfig;
use flux_link::port::PortConfig;
use flux_link::proto::command::BusType;

use crate::logging::LogLevel;

#[derive(Parser, Debug, Clone)]
#[command(name = "flux-link", about = "Flux controller protocol engine and host probe")]
pub struct Cli {
    /// Log verbosity on stderr
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    pub log_level: LogLevel,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Run the device engine on a serial port with a simulated drive
    Serve(ServeOpts),
    /// Print device info and bandwidth stats
    Info(SerialOpts),
    /// Capture flux from a drive and summarise each revolution
    Read(ReadOpts),
    /// Abort any stream in progress and return the device to idle
    Clear(SerialOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device path
    #[arg(long, default_value = "/dev/ttyACM0")]
    pub dev: String,
    /// Baud rate
    #[arg(long, default_value_t = 9600)]
    pub baud: u32,
    /// Enable RTS/CTS
    #[arg(long, default_value_t = false)]
    pub rtscts: bool,
    /// Read timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,
}

impl SerialOpts {
    pub fn port_config(&self) -> PortConfig {
        PortConfig {
            dev: self.dev.clone(),
            baud: self.baud,
            rtscts: self.rtscts,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Flux sample clock in Hz
    #[arg(long, default_value_t = 72_000_000)]
    pub sample_freq: u32,
    /// Hardware type reported by GET_INFO
    #[arg(long, default_value_t = 1)]
    pub hw_type: u16,
    /// Captured events buffered before a read overflows
    #[arg(long, default_value_t = 4096)]
    pub capture_buffer: usize,
    /// Host silence during a write before it underflows, in milliseconds
    #[arg(long, default_value_t = 250)]
    pub starve_ms: u64,
    /// Bandwidth log interval in seconds (0 disables)
    #[arg(long, default_value_t = 10.0)]
    pub stats: f64,
}

impl ServeOpts {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            hw_type: self.hw_type,
            sample_freq: self.sample_freq,
            capture_buffer: self.capture_buffer.max(1),
            write_starve_us: self.starve_ms * 1000,
            ..EngineConfig::default()
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum BusArg {
    Ibmpc,
    Shugart,
}

impl From<BusArg> for BusType {
    fn from(b: BusArg) -> Self {
        match b {
            BusArg::Ibmpc => BusType::IbmPc,
            BusArg::Shugart => BusType::Shugart,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ReadOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Drive interface
    #[arg(long, value_enum, default_value_t = BusArg::Ibmpc)]
    pub bus: BusArg,
    /// Drive unit
    #[arg(long, default_value_t = 0)]
    pub unit: u8,
    /// Cylinder to seek to
    #[arg(long, default_value_t = 0)]
    pub cyl: u8,
    /// Head
    #[arg(long, default_value_t = 0)]
    pub side: u8,
    /// Revolutions to capture
    #[arg(long, default_value_t = 2)]
    pub revs: u8,
}
