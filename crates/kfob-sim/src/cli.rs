//! CLI command definitions and argument parsing

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::config::SimConfig;
use crate::runner::{parse_pin, Provisioning, Simulator};

/// KFOB Simulator - a file-backed KeyFOB token and a simulated ORWL host
#[derive(Parser, Debug)]
#[command(name = "kfob-sim")]
#[command(version, about = "KFOB Simulator - KeyFOB token and ORWL host")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (environment variables are used otherwise)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Token state file, overrides the configured path
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print reports as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write identity fields and the first PIN
    Provision(ProvisionArgs),
    /// Run a full association against a simulated ORWL host
    Pair(PairArgs),
    /// Show association status and identity
    Status,
    /// Wipe the token
    Reset(ResetArgs),
}

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Serial number, 16 bytes as hex
    #[arg(long)]
    pub serial: Option<String>,

    /// Unique ID, 16 bytes as hex
    #[arg(long)]
    pub unique_id: Option<String>,

    /// Display name
    #[arg(long)]
    pub name: Option<String>,

    /// Six-digit PIN
    #[arg(long)]
    pub pin: Option<String>,
}

#[derive(Args, Debug)]
pub struct PairArgs {
    /// PIN to verify during pairing; also hands over a pair key
    #[arg(long)]
    pub pin: Option<String>,
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Skip the confirmation check
    #[arg(long)]
    pub yes: bool,
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub fn execute_with_config(self, mut config: SimConfig) -> anyhow::Result<()> {
        if let Some(state) = self.state {
            config.state_path = state;
        }
        let mut sim = Simulator::open(&config)?;

        match self.command {
            Commands::Provision(args) => {
                let values = Provisioning {
                    serial_number: args.serial.as_deref().map(decode_hex).transpose()?,
                    unique_id: args.unique_id.as_deref().map(decode_hex).transpose()?,
                    display_name: args.name,
                    pin: args.pin.as_deref().map(parse_pin).transpose()?,
                };
                sim.provision(&values)?;
                println!("provisioned {}", config.state_path.display());
            }
            Commands::Pair(args) => {
                let pin = args.pin.as_deref().map(parse_pin).transpose()?;
                let report = sim.pair(pin.as_ref())?;
                if self.json {
                    print_json(&report)?;
                } else {
                    println!("pairing state: {}", report.pairing_state);
                    println!("requests:      {} ({} rejected)", report.requests, report.rejected);
                }
            }
            Commands::Status => {
                let report = sim.status()?;
                if self.json {
                    print_json(&report)?;
                } else {
                    println!("pairing state:      {}", report.pairing_state);
                    println!("association status: {}", report.association_status);
                    println!(
                        "pin:                configured={} blocked={} tries={}",
                        report.pin_configured, report.pin_blocked, report.pin_tries_remaining
                    );
                    println!("serial number:      {}", or_dash(report.serial_number.as_deref()));
                    println!("unique id:          {}", or_dash(report.unique_id.as_deref()));
                    println!("display name:       {}", or_dash(report.display_name.as_deref()));
                }
            }
            Commands::Reset(args) => {
                if !args.yes {
                    anyhow::bail!("refusing to wipe {} without --yes", config.state_path.display());
                }
                sim.reset()?;
                println!("token wiped");
            }
        }
        Ok(())
    }
}

fn decode_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    hex::decode(text.trim()).with_context(|| format!("invalid hex: {}", text))
}

fn or_dash(value: Option<&str>) -> &str {
    value.unwrap_or("-")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
