//! Raw TCP tunnel into a network namespace.
//!
//! A client outside the overlay reaches `ip:port` inside it through a
//! `socat` child entered into the namespace; the child's stdin and stdout
//! form the stream.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::process::Stdio;

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite, Join};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{Error, Result};

pub type TunnelStream = Join<ChildStdout, ChildStdin>;

pub struct Tunnel {
    child: Child,
    stream: TunnelStream,
    target: SocketAddr,
}

impl Tunnel {
    /// Shuttle bytes between `client` and the target until both sides
    /// close, then reap the child. Returns bytes sent and received.
    pub async fn pipe<S>(mut self, client: &mut S) -> Result<(u64, u64)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = pipe(client, &mut self.stream).await;
        if let Err(e) = self.child.kill().await {
            debug!("Tunnel child to {} already gone: {}", self.target, e);
        }
        let (sent, received) = result?;
        info!(
            "Tunnel to {} closed after {} bytes out, {} bytes in",
            self.target, sent, received
        );
        Ok((sent, received))
    }
}

fn command(netns: &Path, target: SocketAddr) -> Command {
    let mut cmd = Command::new("nsenter");
    cmd.arg(format!("--net={}", netns.display()))
        .arg("--")
        .arg("socat")
        .arg("STDIO")
        .arg(format!("TCP:{}", target));
    cmd
}

/// Start a tunnel to `ip:port` inside the namespace at `netns`.
pub async fn connect(netns: &Path, ip: IpAddr, port: u16) -> Result<Tunnel> {
    if port == 0 {
        return Err(Error::InvalidInput("tunnel port must not be 0".into()));
    }
    let target = SocketAddr::new(ip, port);
    let mut cmd = command(netns, target);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("tunnel child for {} has no stdio", target),
        )));
    };
    debug!("Tunnel to {} via {}", target, netns.display());
    Ok(Tunnel {
        child,
        stream: tokio::io::join(stdout, stdin),
        target,
    })
}

/// Copy both directions between `a` and `b` until both reach EOF.
/// Returns bytes copied from `a` to `b` and from `b` to `a`.
pub async fn pipe<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    Ok(tokio::io::copy_bidirectional(a, b).await?)
}
