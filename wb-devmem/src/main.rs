//! # wb-devmem
//!
//! Read and write registers on a remote Wishbone bus, in the manner of `devmem`.
//!
//! ## Overview
//!
//! The device is reached over one of three transports: direct Ethernet (`--udp`),
//! a memory-mapped PCIe window (`--pcie`) or a UART link behind a proxy relay (`--proxy`).
//! The `sim` subcommand hosts a simulated device instead, for bring-up without hardware.
//!
//! The process exit code identifies the kind of failure, see
//! [`ErrorKind::exit_code`](etherbone_client::error::ErrorKind::exit_code).
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use env_logger::Env;
use etherbone_client::{
    RegisterClient,
    config::Builder,
    error::ClientError,
    transport::{AnyTransport, Endpoint, PcieTarget},
};
use etherbone_protocol::{Address, Width};
use etherbone_server::{
    MemoryBus,
    relay::{Relay, RelayConfig},
    server,
};

const DEFAULT_WINDOW_SIZE: usize = 0x1000;

#[derive(Parser)]
#[command(about = "Register access to Wishbone buses over Etherbone", long_about = None)]
struct Args {
    #[arg(long, help = "Device reachable over UDP", conflicts_with_all = ["pcie", "proxy"])]
    udp: Option<SocketAddr>,

    #[arg(long, help = "UIO node or PCI resource file of the device window", conflicts_with = "proxy")]
    pcie: Option<PathBuf>,

    #[arg(long, help = "Offset of the window in the PCIe resource", value_parser = maybe_hex::<usize>, default_value = "0")]
    offset: usize,

    #[arg(long, help = "Size of the PCIe window in bytes", value_parser = maybe_hex::<usize>, default_value_t = DEFAULT_WINDOW_SIZE)]
    size: usize,

    #[arg(long, help = "Proxy relay forwarding to the device's UART")]
    proxy: Option<SocketAddr>,

    #[arg(long, help = "Time to wait for the first reply, in microseconds")]
    timeout_us: Option<u64>,

    #[arg(long, help = "Retransmissions before the device counts as unreachable")]
    retries: Option<u32>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Eq, PartialEq, Clone)]
enum Command {
    #[command(flatten)]
    Access(Access),
    /// Serve a simulated device backed by memory
    Sim {
        #[arg(short, long, default_value = "127.0.0.1:1234")]
        listen: SocketAddr,
        #[arg(long, help = "Speak the relay's envelope protocol over TCP instead of UDP")]
        relay: bool,
        #[arg(long, help = "Delay before every reply, in milliseconds", default_value = "0")]
        reply_delay_ms: u64,
    },
}

#[derive(Subcommand, Eq, PartialEq, Clone)]
enum Access {
    /// Read one register
    Read {
        #[arg(value_parser = maybe_hex::<u64>)]
        address: Address,
        #[arg(short, long, help = "Access width in bytes", value_parser = parse_width, default_value = "4")]
        width: Width,
    },
    /// Write one register
    Write {
        #[arg(value_parser = maybe_hex::<u64>)]
        address: Address,
        #[arg(value_parser = maybe_hex::<u64>)]
        value: u64,
        #[arg(short, long, help = "Access width in bytes", value_parser = parse_width, default_value = "4")]
        width: Width,
    },
    /// Read consecutive registers
    ReadBlock {
        #[arg(value_parser = maybe_hex::<u64>)]
        address: Address,
        #[arg(value_parser = maybe_hex::<usize>)]
        count: usize,
        #[arg(short, long, help = "Access width in bytes", value_parser = parse_width, default_value = "4")]
        width: Width,
    },
    /// Write consecutive registers
    WriteBlock {
        #[arg(value_parser = maybe_hex::<u64>)]
        address: Address,
        #[arg(value_parser = maybe_hex::<u64>, num_args = 1.., required = true)]
        values: Vec<u64>,
        #[arg(short, long, help = "Access width in bytes", value_parser = parse_width, default_value = "4")]
        width: Width,
    },
}

fn parse_width(s: &str) -> Result<Width, String> {
    let bytes = maybe_hex::<usize>(s)?;
    Width::from_bytes(bytes).ok_or_else(|| format!("width must be 1, 2, 4 or 8, not {}", bytes))
}

/// Big-endian bytes of `value`, which must fit into `width`.
fn value_bytes(value: u64, width: Width) -> Result<Vec<u8>, String> {
    let bytes = value.to_be_bytes();
    let (high, low) = bytes.split_at(bytes.len() - width.bytes());
    if high.iter().any(|b| *b != 0) {
        return Err(format!("Value 0x{:x} does not fit into {}", value, width));
    }
    Ok(low.to_vec())
}

fn format_value(bytes: &[u8]) -> String {
    let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    format!("0x{:0digits$x}", value, digits = bytes.len() * 2)
}

fn endpoint(args: &Args) -> Option<Endpoint> {
    if let Some(addr) = args.udp {
        Some(Endpoint::Udp(addr))
    } else if let Some(path) = &args.pcie {
        Some(Endpoint::Pcie(PcieTarget::new(path, args.offset, args.size)))
    } else {
        args.proxy.map(Endpoint::Proxy)
    }
}

fn simulate(listen: SocketAddr, relay: bool, reply_delay: Duration) -> Result<(), Box<dyn Error>> {
    if !relay {
        log::info!("Simulating a device on udp://{}", listen);
        let server = server::Builder::new()
            .reply_delay(reply_delay)
            .build(MemoryBus::new());
        return server.listen(listen);
    }

    log::info!("Simulating a relayed device on tcp://{}", listen);
    let config = RelayConfig {
        reply_delay,
        ..RelayConfig::default()
    };
    let relay = Relay::new(Arc::new(Mutex::new(MemoryBus::new())), config);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        tokio::select! {
            result = relay.listen(listen) => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                Ok(())
            }
        }
    })?;
    Ok(())
}

fn access(args: &Args, access: Access) -> Result<(), Box<dyn Error>> {
    let Some(endpoint) = endpoint(args) else {
        return Err("No device given. Use --udp <addr>, --pcie <path> or --proxy <addr>".into());
    };
    let mut builder = match endpoint {
        Endpoint::Udp(_) => Builder::udp(),
        Endpoint::Pcie(_) => Builder::pcie(),
        Endpoint::Proxy(_) => Builder::proxy(),
    };
    if let Some(timeout_us) = args.timeout_us {
        builder = builder.base_timeout(Duration::from_micros(timeout_us));
    }
    if let Some(retries) = args.retries {
        builder = builder.max_retries(retries);
    }
    let config = builder.build();
    log::debug!("Connecting to {} with {:?}", endpoint, config);

    let client = RegisterClient::<AnyTransport>::open(endpoint, config)?;
    match access {
        Access::Read { address, width } => {
            println!("{}", format_value(&client.read(address, width)?));
        }
        Access::Write {
            address,
            value,
            width,
        } => {
            client.write(address, width, &value_bytes(value, width)?)?;
        }
        Access::ReadBlock {
            address,
            count,
            width,
        } => {
            let values = client.read_block(address, count, width)?;
            for (index, value) in values.iter().enumerate() {
                let offset = (index * width.bytes()) as u64;
                println!("0x{:08x}: {}", address + offset, format_value(value));
            }
        }
        Access::WriteBlock {
            address,
            values,
            width,
        } => {
            let values = values
                .into_iter()
                .map(|value| value_bytes(value, width))
                .collect::<Result<Vec<_>, _>>()?;
            client.write_block(address, &values, width)?;
        }
    }
    Ok(())
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    match args.command.clone() {
        Command::Access(command) => access(&args, command),
        Command::Sim {
            listen,
            relay,
            reply_delay_ms,
        } => simulate(listen, relay, Duration::from_millis(reply_delay_ms)),
    }
}

fn exit_code(error: &(dyn Error + 'static)) -> u8 {
    error
        .downcast_ref::<ClientError>()
        .map_or(1, |e| e.kind().exit_code())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(exit_code(e.as_ref()))
        }
    }
}

#[test]
fn values_must_fit_width() {
    assert_eq!(value_bytes(0xbeef, Width::Half).unwrap(), vec![0xbe, 0xef]);
    assert_eq!(value_bytes(0x1, Width::Double).unwrap(), vec![0, 0, 0, 0, 0, 0, 0, 1]);
    assert!(value_bytes(0x1_0000, Width::Half).is_err());
}

#[test]
fn values_are_printed_at_full_width() {
    assert_eq!(format_value(&[0x00, 0x2a]), "0x002a");
    assert_eq!(format_value(&[0xde, 0xad, 0xbe, 0xef]), "0xdeadbeef");
}

#[test]
fn client_errors_keep_their_exit_code() {
    use etherbone_client::error::{ErrorKind, SessionError};

    let unreachable: Box<dyn Error> =
        ClientError::Session(SessionError::Unreachable { id: 0, attempts: 4 }).into();
    assert_eq!(
        exit_code(unreachable.as_ref()),
        ErrorKind::Unreachable.exit_code()
    );
    let other: Box<dyn Error> = "no device".into();
    assert_eq!(exit_code(other.as_ref()), 1);
}

#[test]
fn command_line_is_consistent() {
    use clap::CommandFactory;
    Args::command().debug_assert();
}
