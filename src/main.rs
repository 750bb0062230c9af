//! ripmesh: maintains a mesh of IPv4-in-IPv4 tunnels and the routes through
//! them, driven by RIP advertisements on the local multicast group.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read as _};
use std::net::{Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context as _, Result, ensure};
use clap::Parser;
use ip_network::Ipv4Network;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod bitset;
mod bootstrap;
mod engine;
mod kernel;
mod model;
mod prefix_map;
mod rip;

use engine::{Engine, ROUTE_TIMEOUT, Settings};
use kernel::{Kernel, LinuxKernel};
use model::{Model, Policy};
use prefix_map::PrefixMap;

const MAX_DATAGRAM: usize = 65536;

/// Tunnel-mesh daemon driven by RIP advertisements.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'd', long)]
    foreground: bool,

    /// Print the state discovered from the kernel and exit.
    #[arg(short = 'D', long)]
    dump: bool,

    /// Route table that receives the tunnel routes.
    #[arg(short = 'T', long, default_value_t = 44)]
    rtable: u32,

    /// SO_MARK applied to the listener socket, for policy routing.
    #[arg(short = 'B', long)]
    listen_mark: Option<u32>,

    /// Honor advertisements inside this network (repeatable). Without any,
    /// everything is accepted.
    #[arg(short = 'A', long = "accept")]
    accept: Vec<Ipv4Network>,

    /// Ignore advertisements inside this network (repeatable).
    #[arg(short = 'I', long = "ignore")]
    ignore: Vec<Ipv4Network>,

    /// Interface ordinals that are statically managed: never allocated,
    /// never torn down (repeatable).
    #[arg(short = 's', long = "static-ifnum")]
    static_ifnums: Vec<u32>,

    /// Replay length-framed advertisement packets from a file instead of
    /// listening on the network.
    #[arg(short = 'f', long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// RIPv2 simple authentication password.
    #[arg(short = 'p', long, env = "RIPMESH_PASSWORD")]
    password: Option<String>,

    /// Outer (transport) address of this host.
    local_outer: Ipv4Addr,

    /// Inner (mesh) address of this host.
    local_inner: Ipv4Addr,
}

#[expect(
    clippy::print_stderr,
    reason = "no logger is active when we are printing this error"
)]
fn main() {
    match try_main() {
        Ok(()) => {}
        Err(e) => {
            // Print the chain of errors manually to avoid it looking like a
            // crash with a stacktrace.
            eprintln!("{e:#}");

            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    if let Some(password) = &cli.password {
        ensure!(
            password.len() <= rip::PASSWORD_LEN,
            "password must be at most {} bytes",
            rip::PASSWORD_LEN
        );
    }

    let kernel = LinuxKernel::new(cli.rtable)
        .with_context(|| format!("failed to attach to route table {}", cli.rtable))?;
    let mut engine = Engine::new(
        kernel,
        build_policy(&cli.accept, &cli.ignore),
        Settings {
            outer_local: cli.local_outer,
            inner_local: cli.local_inner,
            route_timeout: ROUTE_TIMEOUT,
            static_ifnums: cli.static_ifnums.iter().copied().collect::<HashSet<_>>(),
        },
    );

    engine.bootstrap(Instant::now()).context("discovery failed")?;

    if cli.dump {
        dump_state(engine.model());
        return Ok(());
    }

    let mut source = match &cli.replay {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open replay file {}", path.display()))?;
            PacketSource::Replay(BufReader::new(file))
        }
        None => {
            let socket = kernel::open_listener(cli.listen_mark)?;
            tracing::info!(
                group = %kernel::linux::RIP_GROUP,
                port = kernel::linux::RIP_PORT,
                rtable = cli.rtable,
                "listening for advertisements"
            );
            PacketSource::Socket(socket)
        }
    };

    if !cli.foreground {
        daemonize()?;
    }

    run(&mut engine, &mut source, cli.password.as_deref())
}

/// One datagram per iteration; all of a datagram's effects reach the kernel
/// before the next one is read, and the expiry pass runs once per datagram.
fn run<K: Kernel>(
    engine: &mut Engine<K>,
    source: &mut PacketSource,
    password: Option<&str>,
) -> Result<()> {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let Some(len) = source.next_packet(&mut buf)? else {
            tracing::info!("replay file exhausted");
            return Ok(());
        };
        let now = Instant::now();
        match rip::parse(&buf[..len], password) {
            Ok(responses) => {
                for resp in &responses {
                    engine.process_response(resp, now)?;
                }
            }
            Err(e) => tracing::debug!("dropping datagram: {e}"),
        }
        engine.expire(now)?;
    }
}

enum PacketSource {
    Socket(UdpSocket),
    /// Length-framed packets (u16 big-endian prefix) for replay testing.
    Replay(BufReader<File>),
}

impl PacketSource {
    /// Blocks for the next packet; `None` means the replay file hit EOF.
    fn next_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self {
            Self::Socket(socket) => {
                let (len, from) = socket
                    .recv_from(buf)
                    .context("failed to receive advertisement")?;
                tracing::trace!(%from, len, "datagram received");
                Ok(Some(len))
            }
            Self::Replay(reader) => {
                let mut header = [0u8; 2];
                match reader.read_exact(&mut header) {
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                    other => other.context("failed to read replay frame header")?,
                }
                let len = usize::from(u16::from_be_bytes(header));
                ensure!(len <= buf.len(), "replay frame of {len} bytes is oversized");
                reader
                    .read_exact(&mut buf[..len])
                    .context("replay frame truncated")?;
                Ok(Some(len))
            }
        }
    }
}

fn build_policy(accept: &[Ipv4Network], ignore: &[Ipv4Network]) -> PrefixMap<Policy> {
    let mut policy = PrefixMap::new();
    for net in accept {
        policy.get_or_insert_with(*net, || Policy::Accept);
    }
    for net in ignore {
        policy.get_or_insert_with(*net, || Policy::Ignore);
    }
    if accept.is_empty() {
        let catch_all = Ipv4Network::new_truncate(Ipv4Addr::UNSPECIFIED, 0)
            .expect("/0 is a valid prefix length");
        policy.get_or_insert_with(catch_all, || Policy::Accept);
    }
    policy
}

#[expect(
    clippy::print_stdout,
    reason = "dump mode exists to write the discovered state to stdout"
)]
fn dump_state(model: &Model) {
    if model.tunnels.is_empty() {
        println!("no tunnels");
        return;
    }
    for (_, tunnel) in model.tunnels.iter() {
        println!(
            "tunnel {} ({} -> {}) inner {} -> {}{}",
            tunnel.ifname,
            tunnel.outer_local,
            tunnel.outer_remote,
            tunnel.inner_local,
            tunnel.inner_remote,
            if tunnel.static_if { " static" } else { "" },
        );
        for net in &tunnel.routes {
            println!("    route {net}");
        }
    }
}

fn daemonize() -> Result<()> {
    // SAFETY: still single-threaded at this point; nothing observes the fork.
    if unsafe { libc::daemon(0, 0) } != 0 {
        return Err(anyhow::Error::new(std::io::Error::last_os_error()).context("failed to daemonize"));
    }
    Ok(())
}
