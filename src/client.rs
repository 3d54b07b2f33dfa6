use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::UnixStream;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::protocol::{Packet, PacketCodec, PacketKind, PacketWriter};

/// Ask the supervisor listening at `socket` to build with `args`.
///
/// Output lines are printed as they arrive; the returned value is the build's
/// exit code, or 1 if the supervisor rejected the request. The first Ctrl-C
/// cancels the build and the completion is still awaited.
pub async fn run_build(socket: &Path, args: &[String]) -> Result<i32> {
    let stream = UnixStream::connect(socket).await.with_context(|| {
        format!(
            "Failed to connect to build supervisor at {}. Is it running?",
            socket.display()
        )
    })?;
    let (reader, writer) = stream.into_split();
    let writer = PacketWriter::new(writer);

    let command_line = shlex::try_join(args.iter().map(String::as_str))
        .context("build arguments cannot be quoted")?;
    writer.write_packet(PacketKind::Compile, command_line).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut inbound = FramedRead::new(reader, PacketCodec);
    let mut cancel_sent = false;

    loop {
        tokio::select! {
            result = &mut ctrl_c, if !cancel_sent => {
                result.context("failed to listen for Ctrl-C")?;
                eprintln!("Cancelling build...");
                writer.write_packet(PacketKind::Cancel, Bytes::new()).await?;
                cancel_sent = true;
            }
            packet = inbound.next() => {
                let Some(packet) = packet else {
                    bail!("build supervisor closed the connection before the build completed");
                };
                if let Some(code) = handle_packet(&packet?) {
                    return Ok(code);
                }
            }
        }
    }
}

/// Print one packet; returns the exit code once the build is over.
fn handle_packet(packet: &Packet) -> Option<i32> {
    match packet.kind() {
        Some(PacketKind::Running) => {
            println!("{}", packet.text());
            None
        }
        Some(PacketKind::Complete) => Some(packet.exit_code().unwrap_or(-1)),
        Some(PacketKind::Error) => {
            eprintln!("Error: {}", packet.text());
            Some(1)
        }
        _ => {
            debug!(tag = packet.tag, "ignoring packet");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::time::{sleep, timeout, Duration};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::server::{self, ServerOptions};
    use crate::test_support::{script_command, BuildDir, WAIT};

    #[test]
    fn running_lines_do_not_finish_the_build() {
        let packet = Packet::new(PacketKind::Running, "compiling");
        assert_eq!(handle_packet(&packet), None);
    }

    #[test]
    fn complete_and_error_finish_the_build() {
        assert_eq!(handle_packet(&Packet::complete(2)), Some(2));
        assert_eq!(handle_packet(&Packet::complete(-15)), Some(-15));
        assert_eq!(
            handle_packet(&Packet::new(PacketKind::Error, "Build already in progress")),
            Some(1)
        );
    }

    #[test]
    fn malformed_complete_reports_failure() {
        let packet = Packet::new(PacketKind::Complete, Bytes::from_static(b"\x00"));
        assert_eq!(handle_packet(&packet), Some(-1));
    }

    async fn start_server(dir: &BuildDir) -> (PathBuf, CancellationToken) {
        let socket = dir.path().join("supervisor.sock");
        let shutdown = CancellationToken::new();
        let options = ServerOptions {
            socket: socket.clone(),
            build_dir: dir.path().to_path_buf(),
            command: script_command(),
            listen: true,
        };
        tokio::spawn(server::run(options, shutdown.clone()));

        timeout(WAIT, async {
            while !socket.exists() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("supervisor never bound its socket");
        (socket, shutdown)
    }

    #[tokio::test]
    async fn builds_through_a_listening_supervisor() {
        let dir = BuildDir::new();
        let (socket, shutdown) = start_server(&dir).await;

        let code = timeout(WAIT, run_build(&socket, &["hello".to_string()]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 0);

        // The supervisor keeps serving after a peer disconnects.
        let code = timeout(WAIT, run_build(&socket, &["fail".to_string()]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 3);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn missing_supervisor_is_reported() {
        let dir = BuildDir::new();
        let err = run_build(&dir.path().join("absent.sock"), &[]).await.unwrap_err();
        assert!(err.to_string().contains("Is it running?"), "{err}");
    }
}
