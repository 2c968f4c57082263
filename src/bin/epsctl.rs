//! Command-line front end exercising the `epsctl` library surface.
//!
//! Real USB access is out of scope (platform-specific, see `SPEC_FULL.md`
//! §4.1); `--fake` drives the facade against an in-memory loopback
//! transport instead, purely to demonstrate the command surface end to end.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use epsctl::{ControlBackend, D4ControlBackend, Device, LoopbackTransport, Printer, Registry, Transport};

#[derive(Parser)]
#[command(name = "epsctl", version, about = "Control Epson inkjet printers over D4/END4")]
struct Cli {
    /// Printer model, as known to the bundled device registry.
    #[arg(long, default_value = "XP-900")]
    model: String,

    /// Run against an in-memory loopback transport instead of a real device.
    #[arg(long, default_value_t = true)]
    fake: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the device's vendor status structure.
    Status,
    /// Print each waste-ink counter's current value and maximum.
    Waste,
    /// Zero every waste-ink counter the device profile knows about.
    ResetWaste,
    /// Run a cleaning cycle at the given level.
    Clean {
        #[arg(default_value_t = 1)]
        level: u8,
    },
    /// Restart the device.
    Restart,
    /// Print the device's raw 1284 identification fields.
    Identify,
    /// List every model the bundled registry knows about.
    ListModels,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(cli: Cli) -> Result<(), epsctl::Error> {
    let registry = Registry::load()?;

    if let Command::ListModels = cli.command {
        for model in registry.model_ids() {
            println!("{model}");
        }
        return Ok(());
    }

    let device: Device = registry.by_model(&cli.model)?;
    if !cli.fake {
        eprintln!("no real USB transport is bundled; pass --fake or provide one out of process");
        return Ok(());
    }

    let transport: Box<dyn Transport> = Box::new(fake_transport_for(&device));
    let backend: Box<dyn ControlBackend> = Box::new(D4ControlBackend::connect(transport)?);
    let mut printer = Printer::new(backend, device);

    match cli.command {
        Command::Status => {
            let status = printer.get_status()?;
            println!("{status:#?}");
        }
        Command::Waste => {
            for (value, max) in printer.get_waste()? {
                println!("{value}/{max}");
            }
        }
        Command::ResetWaste => {
            printer.reset_waste()?;
            println!("waste counters reset");
        }
        Command::Clean { level } => {
            printer.clean(level)?;
            println!("cleaning cycle started at level {level}");
        }
        Command::Restart => {
            printer.restart()?;
            println!("restart requested");
        }
        Command::Identify => {
            for (key, value) in printer.identify()? {
                println!("{key}: {value}");
            }
        }
        Command::ListModels => unreachable!("handled above"),
    }

    Ok(())
}

/// A loopback transport pre-scripted with just enough D4 handshake traffic
/// to let `D4ControlBackend::connect` succeed against nothing in particular.
fn fake_transport_for(device: &Device) -> LoopbackTransport {
    let mut transport = LoopbackTransport::new(format!("MFG:EPSON;MDL:{};", String::from_utf8_lossy(&device.model)));
    transport.push_reply(&[0u8; 8]);
    // Every channel-0 reply carries credit=1, replenishing the one unit
    // each command spends so the next command can send.
    transport.push_reply(&epsctl::D4Packet::new(0, 0, 1, 0, vec![0x80, 0x00, 0x10]).encode());
    transport.push_reply(&epsctl::D4Packet::new(0, 0, 1, 0, vec![0x89, 0x00, 5]).encode());
    let mut open_reply = vec![0x81, 0x00, 5, 5];
    open_reply.extend_from_slice(&64u16.to_be_bytes());
    open_reply.extend_from_slice(&1u16.to_be_bytes());
    open_reply.extend_from_slice(&1u16.to_be_bytes());
    transport.push_reply(&epsctl::D4Packet::new(0, 0, 1, 0, open_reply).encode());
    // Credit reply for open_named_channel's own grant_credit call.
    transport.push_reply(&epsctl::D4Packet::new(0, 0, 1, 0, vec![0x83, 0x00]).encode());
    transport.set_max_starved_reads(0);
    transport
}
