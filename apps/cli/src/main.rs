use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use grdfu_core::{BdAddr, BlePlatform, DfuSession, SessionConfig, UpdateRequest};
use tracing::{error, info};

mod progress;

use progress::ProgressListener;

#[derive(Parser, Debug)]
#[command(author, version, about = "Goodix GR5xxx BLE DFU Tool", long_about = None)]
struct Cli {
    /// Session configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Target {
    /// Device address, e.g. C0:11:22:33:44:55. Defaults to the configured one.
    #[arg(short, long)]
    address: Option<String>,

    /// Image or resource file to download
    file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Update firmware at the image's own load address
    App {
        #[command(flatten)]
        target: Target,
        /// Use the fast programming path of AppBootloader devices
        #[arg(long)]
        fast: bool,
    },
    /// Update firmware through a copy slot (dual bank)
    Copy {
        #[command(flatten)]
        target: Target,
        /// Copy slot address; AppBootloader devices recommend one when omitted
        #[arg(long, value_parser = parse_u32)]
        copy_addr: Option<u32>,
        #[arg(long)]
        fast: bool,
    },
    /// Write a resource blob to internal or external flash
    Resource {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_parser = parse_u32)]
        addr: u32,
        #[arg(long)]
        ext_flash: bool,
        #[arg(long)]
        fast: bool,
    },
    /// Update firmware through a separate DFU boot firmware
    Boot {
        #[command(flatten)]
        target: Target,
        /// Address the DFU boot firmware advertises at
        #[arg(long)]
        boot_address: String,
    },
    /// Update firmware over FastDfu
    FastApp {
        #[command(flatten)]
        target: Target,
    },
    /// Update firmware through a copy slot over FastDfu
    FastCopy {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_parser = parse_u32)]
        copy_addr: u32,
    },
    /// Write a resource blob over FastDfu
    FastResource {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_parser = parse_u32)]
        addr: u32,
        #[arg(long)]
        ext_flash: bool,
    },
    /// Write a configuration file holding the defaults
    InitConfig {
        #[arg(default_value = "grdfu.toml")]
        path: PathBuf,
    },
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number {:?}: {}", s, e))
}

#[cfg(feature = "btleplug")]
fn open_platform() -> Result<Arc<dyn BlePlatform>> {
    let platform = grdfu_core::transport::BtleplugPlatform::new()?;
    Ok(Arc::new(platform))
}

#[cfg(not(feature = "btleplug"))]
fn open_platform() -> Result<Arc<dyn BlePlatform>> {
    Err(anyhow!(
        "No BLE backend compiled in; rebuild grdfu with `--features btleplug`"
    ))
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };

    let (target, request, fast) = match cli.command {
        Command::InitConfig { path } => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration written");
            return Ok(());
        }
        Command::App { target, fast } => (target, UpdateRequest::Firmware, fast),
        Command::Copy {
            target,
            copy_addr,
            fast,
        } => (target, UpdateRequest::FirmwareCopy { copy_addr }, fast),
        Command::Resource {
            target,
            addr,
            ext_flash,
            fast,
        } => (target, UpdateRequest::Resource { ext_flash, addr }, fast),
        Command::Boot {
            target,
            boot_address,
        } => {
            let boot_addr: BdAddr = boot_address.parse()?;
            (target, UpdateRequest::FirmwareViaDfuBoot { boot_addr }, false)
        }
        Command::FastApp { target } => (target, UpdateRequest::FastFirmware, false),
        Command::FastCopy { target, copy_addr } => {
            (target, UpdateRequest::FastFirmwareCopy { copy_addr }, false)
        }
        Command::FastResource {
            target,
            addr,
            ext_flash,
        } => (target, UpdateRequest::FastResource { ext_flash, addr }, false),
    };

    config.fast_mode |= fast;
    let address = target
        .address
        .or_else(|| config.address.clone())
        .ok_or_else(|| anyhow!("No device address given; pass --address or set it in the config"))?;
    let address: BdAddr = address.parse()?;
    let data = std::fs::read(&target.file)
        .with_context(|| format!("Failed to read {}", target.file.display()))?;

    info!(addr = %address, file = %target.file.display(), "Starting GRDFU");
    let platform = open_platform()?;
    let session = DfuSession::with_listener(config, platform, Arc::new(ProgressListener::new()));
    session.start(address, request, data).join()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("0x01040000"), Ok(0x0104_0000));
        assert_eq!(parse_u32("0X10"), Ok(16));
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn test_resource_arguments() {
        let cli = Cli::try_parse_from([
            "grdfu",
            "resource",
            "--address",
            "C0:11:22:33:44:55",
            "--addr",
            "0x00200000",
            "--ext-flash",
            "res.bin",
        ])
        .unwrap();
        let Command::Resource {
            target,
            addr,
            ext_flash,
            fast,
        } = cli.command
        else {
            panic!("unexpected command");
        };
        assert_eq!(addr, 0x0020_0000);
        assert!(ext_flash);
        assert!(!fast);
        assert_eq!(target.file, PathBuf::from("res.bin"));
    }
}
