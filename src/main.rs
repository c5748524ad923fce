//! Command-line front end for labbridge.
//!
//! Provides one-shot access to the instruments named in the lab
//! configuration:
//! - List serial ports and whether they can be opened
//! - Print a device catalog
//! - Connect, snapshot and disconnect (`status`)
//! - Read or write a single register
//! - List the gases an Alicat controller can switch to
//!
//! # Usage
//!
//! ```bash
//! labbridge ports
//! labbridge registers mfc
//! labbridge --config config/labbridge.toml status mfc
//! labbridge write mfc FLOW_RATE 1200
//! labbridge --simulate read psu VOLTAGE_SET
//! labbridge gases alicat --search co2
//! ```
//!
//! `--simulate` answers every configured device from an in-memory model
//! instead of opening ports.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use labbridge::catalog::{Access, Value};
use labbridge::config::{DeviceConfig, DeviceEntry, DeviceKind, LabConfig, DEFAULT_CONFIG_PATH};
use labbridge::drivers::{Alicat, Driver, Reading};
use labbridge::logging::{self, OutputFormat};
use labbridge::session::{SessionManager, SystemConnector};
use labbridge::{sim, transport};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "labbridge")]
#[command(about = "Talk to the lab's serial and Modbus instruments", long_about = None)]
struct Cli {
    /// Lab configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Answer from simulated instruments instead of real ports
    #[arg(long, global = true)]
    simulate: bool,

    /// Overrides the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Print the register catalog of a device kind
    Registers {
        /// mfc, heater, ultrasonic, psu, laser, robot or alicat
        kind: DeviceKind,
    },

    /// Connect to a configured device and print every readable register
    Status {
        /// Device id from the configuration
        device: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Read one register
    Read { device: String, register: String },

    /// Write one register
    Write {
        device: String,
        register: String,
        /// Integer, float or 0x-prefixed hex
        value: String,
    },

    /// List standard gases and defined mixes of an Alicat controller
    Gases {
        device: String,

        /// Only names (or mix numbers) containing this text
        #[arg(long)]
        search: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LabConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    logging::init_from_config(&config, cli.log_format).map_err(|e| anyhow!(e))?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Registers { kind } => {
            print_catalog(kind);
            Ok(())
        }
        Commands::Status { device, json } => {
            let lab = Lab::open(&config, cli.simulate)?;
            lab.status(&device, json).await
        }
        Commands::Read { device, register } => {
            let lab = Lab::open(&config, cli.simulate)?;
            lab.read(&device, &register).await
        }
        Commands::Write {
            device,
            register,
            value,
        } => {
            let value =
                Value::parse(&value).ok_or_else(|| anyhow!("'{value}' is not a number"))?;
            let lab = Lab::open(&config, cli.simulate)?;
            lab.write(&device, &register, value).await
        }
        Commands::Gases { device, search } => {
            let lab = Lab::open(&config, cli.simulate)?;
            lab.gases(&device, search.as_deref()).await
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = transport::ports::list_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for port in ports {
        let state = if transport::ports::is_available(&port.device) {
            "available"
        } else {
            "busy"
        };
        println!(
            "{:<16} {:<10} {:<28} {}",
            port.device,
            state,
            port.description,
            port.hwid.unwrap_or_default()
        );
    }
    Ok(())
}

fn print_catalog(kind: DeviceKind) {
    let catalog = kind.catalog();
    println!("{} ({}), identity register {}", catalog.device, kind.default_protocol().name(), catalog.identity);
    for register in catalog.registers {
        let access = match register.access {
            Access::ReadOnly => "R",
            Access::WriteOnly => "W",
            Access::ReadWrite => "RW",
        };
        let range = register
            .range
            .map(|(min, max)| format!("{min}..={max}"))
            .unwrap_or_default();
        println!(
            "{:<26} 0x{:04X} {:<3} {:<14} {}",
            register.name, register.address, access, range, register.description
        );
    }
}

/// Configured devices and a manager that can reach them.
struct Lab<'a> {
    config: &'a LabConfig,
    manager: SessionManager,
}

impl<'a> Lab<'a> {
    fn open(config: &'a LabConfig, simulate: bool) -> Result<Self> {
        let settings = config.session.settings();
        let manager = if simulate {
            let mut devices: Vec<(DeviceKind, DeviceConfig)> = Vec::new();
            for entry in config.enabled_devices() {
                devices.push((entry.kind, entry.device_config()?));
            }
            info!(devices = devices.len(), "using simulated instruments");
            SessionManager::new(sim::connector(devices.iter().map(|(k, c)| (*k, c))))
        } else {
            SessionManager::new(SystemConnector)
        };
        Ok(Self {
            config,
            manager: manager.with_settings(settings),
        })
    }

    fn entry(&self, id: &str) -> Result<&'a DeviceEntry> {
        let entry = self
            .config
            .device(id)
            .ok_or_else(|| anyhow!("No device '{id}' in the configuration"))?;
        if !entry.enabled {
            return Err(anyhow!("Device '{id}' is disabled"));
        }
        Ok(entry)
    }

    /// Connect, run `f`, disconnect whatever `f` returned.
    async fn with_session<T, F, Fut>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(SessionManager, labbridge::session::Connected) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let entry = self.entry(id)?;
        let device_config = entry.device_config()?.with_label(entry.id.clone());
        let connected = self
            .manager
            .connect(entry.kind, device_config)
            .await
            .with_context(|| format!("Failed to connect to {id}"))?;
        let session = connected.id;
        let result = f(self.manager.clone(), connected).await;
        self.manager.disconnect(session).await?;
        result
    }

    async fn status(&self, id: &str, json: bool) -> Result<()> {
        let kind = self.entry(id)?.kind;
        self.with_session(id, |_, connected| async move {
            let catalog = kind.catalog();
            let mut readings = Vec::new();
            for (name, value) in connected.snapshot {
                readings.push(Reading::new(catalog.get(&name)?, value));
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&readings)?);
                return Ok(());
            }
            for reading in readings {
                match reading.label {
                    Some(label) => println!("{:<26} {} ({label})", reading.register, reading.value),
                    None => println!("{:<26} {}", reading.register, reading.value),
                }
            }
            Ok(())
        })
        .await
    }

    async fn read(&self, id: &str, register: &str) -> Result<()> {
        self.with_session(id, |manager, connected| async move {
            let value = manager.read_register(connected.id, register).await?;
            println!("{register} = {value}");
            Ok(())
        })
        .await
    }

    async fn write(&self, id: &str, register: &str, value: Value) -> Result<()> {
        self.with_session(id, |manager, connected| async move {
            manager
                .write_register(connected.id, register, value.clone())
                .await
                .with_context(|| format!("Failed to write {register}"))?;
            println!("{register} <- {value}");
            Ok(())
        })
        .await
    }

    async fn gases(&self, id: &str, search: Option<&str>) -> Result<()> {
        self.with_session(id, |manager, connected| async move {
            let alicat = Alicat::attach(&manager, connected.id)
                .with_context(|| format!("{id} is not an Alicat controller"))?;
            let inventory = alicat.all_gases(search).await?;
            println!("{}", serde_json::to_string_pretty(&inventory)?);
            Ok(())
        })
        .await
    }
}
