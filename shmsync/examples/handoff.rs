use clap::{Parser, Subcommand};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use shmsync::{Fifo, Shared};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info};

type HandoffFifo = Fifo<1024>;

#[derive(Parser, Debug)]
#[command(name = "handoff")]
#[command(about = "Hand a shared fifo to an unrelated process over a unix socket", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "/tmp/shmsync_handoff.sock")]
    socket: PathBuf,

    #[arg(short, long, default_value_t = 100_000)]
    count: u64,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Create the fifo, send it to a consumer and fill it.
    Serve {
        /// Wait for an externally started consumer instead of spawning one.
        #[arg(long)]
        no_spawn: bool,
    },
    /// Receive the fifo and drain it.
    Connect,
}

fn serve(args: &Args, no_spawn: bool) -> Result<(), Box<dyn std::error::Error>> {
    let fifo = Shared::new(HandoffFifo::new())?;
    fifo.init()?;
    let memory_fd = fifo.fd().ok_or("memfd region has no descriptor")?;

    let _ = std::fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket)?;
    info!(socket = %args.socket.display(), "listening for consumer");

    let consumer = if no_spawn {
        None
    } else {
        let child = Command::new(std::env::current_exe()?)
            .arg("--socket")
            .arg(&args.socket)
            .arg("--count")
            .arg(args.count.to_string())
            .arg("connect")
            .spawn()?;
        info!(pid = child.id(), "spawned consumer");
        Some(child)
    };

    let (stream, _) = listener.accept()?;

    let size_bytes = fifo.region_size().to_le_bytes();
    let iov = [std::io::IoSlice::new(&size_bytes)];
    let fds = [memory_fd.as_raw_fd()];
    let cmsg = ControlMessage::ScmRights(&fds[..]);
    sendmsg::<()>(
        stream.as_fd().as_raw_fd(),
        &iov,
        &[cmsg],
        MsgFlags::empty(),
        None,
    )?;
    info!(
        memory_fd = memory_fd.as_raw_fd(),
        region_size = fifo.region_size(),
        "sent fifo to consumer"
    );

    let start = Instant::now();
    for value in 0..args.count {
        fifo.push(value);
    }
    info!(
        count = args.count,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "finished producing"
    );

    if let Some(mut child) = consumer {
        let status = child.wait()?;
        info!(?status, "consumer exited");
        if !status.success() {
            return Err("consumer reported a failure".into());
        }
    }
    let _ = std::fs::remove_file(&args.socket);
    Ok(())
}

fn receive_fd(stream: &UnixStream) -> Result<(OwnedFd, usize), Box<dyn std::error::Error>> {
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let mut size_buf = [0u8; 8];
    let mut iov = [std::io::IoSliceMut::new(&mut size_buf)];

    let msg = recvmsg::<()>(
        stream.as_fd().as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )?;

    let mut memory_fd = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                memory_fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
                break;
            }
        }
    }
    let memory_fd = memory_fd.ok_or("failed to receive memory fd")?;

    let first = msg.iovs().next().ok_or("missing region size")?;
    let region_size = usize::from_le_bytes(first[..8].try_into()?);
    Ok((memory_fd, region_size))
}

fn connect(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let stream = UnixStream::connect(&args.socket)?;
    let (memory_fd, region_size) = receive_fd(&stream)?;
    debug!(memory_fd = memory_fd.as_raw_fd(), region_size, "received fifo");

    // SAFETY: the producer is this same binary and sends a `Shared<HandoffFifo>`.
    let fifo = unsafe { Shared::<HandoffFifo>::from_fd(memory_fd)? };
    shmsync::install_handler()?;

    let start = Instant::now();
    for expected in 0..args.count {
        let value = fifo.pop();
        if value != expected {
            return Err(format!("expected {}, got {}", expected, value).into());
        }
    }
    info!(
        count = args.count,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "all items received in order"
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    debug!(?args, "handoff configuration");

    match args.role {
        Role::Serve { no_spawn } => serve(&args, no_spawn),
        Role::Connect => connect(&args),
    }
}
