use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build {
        /// Include the btleplug BLE backend
        #[arg(long)]
        ble: bool,
    },
    /// Run the CLI with the btleplug backend
    Run {
        /// Arguments passed to grdfu
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run the test suite
    Test,
    /// Check formatting and lints
    Lint,
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { ble } => {
            println!("Building project...");
            if *ble {
                cargo(&["build", "--workspace", "--features", "grdfu-cli/btleplug"], "Build")?;
            } else {
                cargo(&["build", "--workspace"], "Build")?;
            }
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let mut cmd = vec!["run", "-p", "grdfu-cli", "--features", "btleplug", "--"];
            cmd.extend(args.iter().map(String::as_str));
            cargo(&cmd, "Run")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Lint => {
            println!("Linting...");
            cargo(&["fmt", "--all", "--check"], "Format check")?;
            cargo(
                &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"],
                "Clippy",
            )?;
        }
    }

    Ok(())
}
