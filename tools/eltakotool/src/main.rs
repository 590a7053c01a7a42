//! eltakotool - Command-line front end for the Eltako RS485 bus
//!
//! Locks and unlocks the bus, watches bus traffic, enumerates devices and
//! reads device memory over a serial line (FAM14, FGW14-USB).

mod logging;

use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use eltakobus::message::{EltakoDiscoveryReply, EltakoDiscoveryRequest, BODY_LEN};
use eltakobus::{
    lock_bus, prettify, unlock_bus, BusCache, BusConfig, BusError, BusExt, BusInterface, EchoMode,
    Esp2Message, FileStorage, LockConfig, Readahead, ReceivedQueue, SerialBus, Telegram,
    UnlockStatus,
};

#[derive(Parser)]
#[command(name = "eltakotool")]
#[command(about = "Eltako RS485 bus tool")]
#[command(long_about = "Eltako RS485 bus tool

Examples:
  eltakotool --port /dev/ttyUSB0 lock          # Lock the bus
  eltakotool listen --ensure-unlocked          # Make the FAM re-enumerate, then watch
  eltakotool discover --max-address 32         # Find devices at bus addresses 1..=32
  eltakotool --cache bus.json read-mem 5       # Dump the memory of device 5

Settings come from --config, then ELTAKOBUS_* environment variables
(e.g. ELTAKOBUS_SERIAL__PORT), then the flags below.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Serial port the bus is attached to
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Whether the line echoes sent telegrams
    #[arg(long, global = true, value_enum)]
    echo: Option<EchoArg>,

    /// Cache responses in this file while the bus is locked
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum EchoArg {
    Auto,
    Enabled,
    Disabled,
}

impl From<EchoArg> for EchoMode {
    fn from(arg: EchoArg) -> Self {
        match arg {
            EchoArg::Auto => EchoMode::Auto,
            EchoArg::Enabled => EchoMode::Enabled,
            EchoArg::Disabled => EchoMode::Disabled,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Lock the bus
    Lock,

    /// Release the FAM to normal operation
    Unlock,

    /// Display telegrams seen on the bus without sending
    Listen {
        /// Lock and unlock first, forcing a FAM to re-enumerate
        #[arg(long)]
        ensure_unlocked: bool,
    },

    /// Scan bus addresses for devices
    Discover {
        /// Highest bus address to probe
        #[arg(long, default_value_t = 254)]
        max_address: u8,
    },

    /// Read the memory of one device
    ReadMem {
        /// Bus address of the device
        address: u8,

        /// Last memory row to read (default: 255)
        #[arg(long)]
        memory_size: Option<u8>,
    },

    /// Send a raw telegram body (h_seq/len, org, data, id, status) as 11 hex bytes
    SendRaw {
        #[arg(value_parser = parse_hex_byte, num_args = BODY_LEN, required = true)]
        data: Vec<u8>,
    },
}

fn parse_hex_byte(value: &str) -> std::result::Result<u8, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("'{value}' is not a hex byte: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let mut config = BusConfig::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.serial.port = port;
    }
    if let Some(echo) = cli.echo {
        config.serial.echo = echo.into();
    }
    if let Some(cache) = cli.cache {
        config.cache_file = Some(cache);
    }
    config.validate()?;

    let serial = SerialBus::open(&config.serial)
        .await
        .with_context(|| format!("Failed to open bus at {}", config.serial.port))?;

    match &config.cache_file {
        Some(path) => {
            let storage = FileStorage::open(path)
                .with_context(|| format!("Failed to open cache file {}", path.display()))?;
            let bus = Readahead::new(BusCache::with_storage(serial, storage));
            let (cache, lock) = (bus.inner(), &config.lock);
            let unlock = move || cache.release(lock);
            run(&bus, unlock, cli.command, &config.lock).await
        },
        None => {
            let (line, lock) = (&serial, &config.lock);
            let unlock = move || unlock_bus(line, lock);
            run(&serial, unlock, cli.command, &config.lock).await
        },
    }
}

/// Execute one command
///
/// `unlock` must put an unlock request on the line even when a cache below
/// `bus` would answer it from memory.
async fn run<B, U, F>(bus: &B, unlock: U, command: Commands, lock: &LockConfig) -> Result<()>
where
    B: BusInterface + ReceivedQueue,
    U: Fn() -> F,
    F: Future<Output = eltakobus::Result<UnlockStatus>>,
{
    match command {
        Commands::Lock => {
            let status = lock_bus(bus, lock).await?;
            print_status(status.is_confirmed(), &status);
        },
        Commands::Unlock => {
            let status = unlock().await?;
            print_status(status.is_confirmed(), &status);
        },
        Commands::Listen { ensure_unlocked } => {
            if ensure_unlocked {
                lock_bus(bus, lock).await?;
                let status = unlock().await?;
                print_status(status.is_confirmed(), &status);
            }
            listen(bus).await;
        },
        Commands::Discover { max_address } => {
            locked(bus, lock, &unlock, discover(bus, max_address)).await?;
        },
        Commands::ReadMem {
            address,
            memory_size,
        } => {
            locked(bus, lock, &unlock, read_mem(bus, address, memory_size)).await?;
        },
        Commands::SendRaw { data } => {
            let body: [u8; BODY_LEN] = data
                .as_slice()
                .try_into()
                .context("A telegram body has exactly 11 bytes")?;
            let request = Esp2Message::new(body);
            println!("{} {}", "Sending".bright_cyan(), prettify(&request));
            let reply = bus.exchange_any(&request).await?;
            println!("{} {}", "Reply".bright_cyan(), reply);
        },
    }
    Ok(())
}

/// Run `work` with the bus locked, unlocking afterwards even if it failed
async fn locked<B, U, F, W>(bus: &B, lock: &LockConfig, unlock: &U, work: W) -> Result<()>
where
    B: BusInterface + ReceivedQueue,
    U: Fn() -> F,
    F: Future<Output = eltakobus::Result<UnlockStatus>>,
    W: Future<Output = eltakobus::Result<()>>,
{
    let status = lock_bus(bus, lock).await?;
    print_status(status.is_confirmed(), &status);

    let result = work.await;

    let status = unlock().await?;
    print_status(status.is_confirmed(), &status);
    result.map_err(Into::into)
}

fn print_status(confirmed: bool, status: &dyn std::fmt::Display) {
    if confirmed {
        println!("{}", status.to_string().green());
    } else {
        println!("{}", status.to_string().yellow());
    }
}

async fn listen<B: ReceivedQueue>(bus: &B) {
    let mut seen_polling = false;
    let mut seen_force_polling = false;

    loop {
        let message = tokio::select! {
            message = bus.recv() => message,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(message) = message else {
            println!("{}", "Serial line closed".red());
            break;
        };

        match prettify(&message) {
            Telegram::Poll(_) => {
                if !seen_polling {
                    seen_polling = true;
                    println!("There is a device on the bus that polls for messages.");
                }
            },
            Telegram::PollForced(_) => {
                if !seen_force_polling {
                    seen_force_polling = true;
                    println!("There is a device on the bus that force-polls for messages.");
                }
            },
            telegram => println!("{telegram}"),
        }
    }
}

async fn discover<B: BusInterface>(bus: &B, max_address: u8) -> eltakobus::Result<()> {
    println!("Scanning the bus for devices with addresses...");
    let mut found = 0usize;
    // u16 so the scan can step past 255
    let mut address: u16 = 1;

    while address <= u16::from(max_address) {
        let request = EltakoDiscoveryRequest {
            address: address as u8,
        };
        match bus.exchange::<EltakoDiscoveryReply, _>(&request).await {
            Ok(reply) => {
                println!("{} {}", "Discovered:".bright_green(), reply);
                found += 1;
                // a device occupies reported_size consecutive addresses
                address += u16::from(reply.reported_size.max(1));
            },
            Err(BusError::Timeout(_)) => address += 1,
            Err(err) => return Err(err),
        }
    }

    println!("Bus scan completed, {found} device(s) found.");
    Ok(())
}

async fn read_mem<B: BusInterface>(
    bus: &B,
    address: u8,
    memory_size: Option<u8>,
) -> eltakobus::Result<()> {
    let rows = bus.read_mem(address, memory_size).await?;
    println!("Memory of device {address}:");
    for (row, value) in rows.iter().enumerate() {
        println!("  {row:3}: {}", eltakobus::message::hex_string(value));
    }
    Ok(())
}
