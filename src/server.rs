use std::collections::HashMap;
use std::path::PathBuf;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{Packet, PacketCodec, PacketKind, PacketWriter};
use crate::supervisor::{Build, BuildCommand, BuildId};
use crate::transport::{self, SocketListener};

pub const BUILD_IN_PROGRESS: &str = "Build already in progress";
pub const NO_BUILD_IN_PROGRESS: &str = "No build in progress";

/// Where and how the supervisor serves builds.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Socket, FIFO or device path of the peer connection.
    pub socket: PathBuf,
    /// Working directory for every build.
    pub build_dir: PathBuf,
    pub command: BuildCommand,
    /// Bind `socket` and accept peers instead of connecting to it.
    pub listen: bool,
}

/// Serve builds until shutdown is requested or the peer goes away.
///
/// In connect mode the session's result is returned as is, so a peer
/// disconnect surfaces as [`Error::StreamClosed`]. In listen mode peers are
/// served one at a time, which keeps at most one build running.
pub async fn run(options: ServerOptions, shutdown: CancellationToken) -> Result<()> {
    if !options.listen {
        let (reader, writer) = transport::connect(&options.socket).await?;
        info!(socket = %options.socket.display(), "connected to peer");
        let session = Session::new(
            reader,
            PacketWriter::new(writer),
            options.build_dir,
            options.command,
            shutdown,
        );
        return session.run().await;
    }

    let listener = SocketListener::bind(&options.socket)?;
    info!(
        socket = %listener.path().display(),
        build_dir = %options.build_dir.display(),
        "build supervisor listening"
    );

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let (reader, writer) = accepted;
        info!("peer connected");

        let session = Session::new(
            reader,
            PacketWriter::new(writer),
            options.build_dir.clone(),
            options.command.clone(),
            shutdown.child_token(),
        );
        match session.run().await {
            Ok(()) => break,
            Err(Error::StreamClosed) => info!("peer disconnected"),
            Err(err) => warn!(error = %err, "session ended with an error"),
        }
    }

    info!("build supervisor shutting down");
    Ok(())
}

enum Event {
    Shutdown,
    Completed(BuildId),
    Packet(Option<Result<Packet>>),
}

/// Command loop for one connected peer.
///
/// The session is the only owner of build state. Output tasks report
/// completion over a channel rather than touching that state themselves.
pub struct Session<R> {
    inbound: FramedRead<R, PacketCodec>,
    writer: PacketWriter,
    build_dir: PathBuf,
    command: BuildCommand,
    active: Option<Build>,
    /// Cancelled builds whose completion has not been reported yet.
    cancelled: HashMap<BuildId, Build>,
    next_build_id: BuildId,
    completions_tx: mpsc::UnboundedSender<BuildId>,
    completions: mpsc::UnboundedReceiver<BuildId>,
    shutdown: CancellationToken,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        reader: R,
        writer: PacketWriter,
        build_dir: PathBuf,
        command: BuildCommand,
        shutdown: CancellationToken,
    ) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        Self {
            inbound: FramedRead::new(reader, PacketCodec),
            writer,
            build_dir,
            command,
            active: None,
            cancelled: HashMap::new(),
            next_build_id: 1,
            completions_tx,
            completions,
            shutdown,
        }
    }

    /// Process packets and build completions until shutdown or stream
    /// failure.
    ///
    /// Builds still running when the loop ends are sent SIGTERM, and the
    /// session only returns once every build it started has exited.
    pub async fn run(mut self) -> Result<()> {
        let result = self.run_loop().await;
        if let Some(build) = self.active.take() {
            info!(build_id = build.id(), "session ending; stopping active build");
            build.stop();
            self.cancelled.insert(build.id(), build);
        }

        for (id, build) in std::mem::take(&mut self.cancelled) {
            info!(build_id = id, "waiting for build to exit");
            let code = build.join().await;
            info!(build_id = id, exit_code = code, "build exited after session end");
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        loop {
            let event = tokio::select! {
                () = self.shutdown.cancelled() => Event::Shutdown,
                Some(id) = self.completions.recv() => Event::Completed(id),
                packet = self.inbound.next() => Event::Packet(packet),
            };

            match event {
                Event::Shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                Event::Completed(id) => self.build_completed(id).await?,
                Event::Packet(None) => return Err(Error::StreamClosed),
                Event::Packet(Some(packet)) => self.handle_packet(packet?).await?,
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        info!(tag = packet.tag, size = packet.payload.len(), "received packet");

        match packet.kind() {
            Some(PacketKind::Error) => {
                error!(payload = %packet.text(), "received error packet from peer");
            }
            Some(PacketKind::Compile) => self.compile(&packet).await?,
            Some(PacketKind::Cancel) => self.cancel().await?,
            Some(PacketKind::Started | PacketKind::Running | PacketKind::Complete) | None => {
                error!(tag = packet.tag, "unrecognized packet kind");
                reply_error(&self.writer, format!("Unrecognized packet type: {}", packet.tag))
                    .await?;
            }
        }
        Ok(())
    }

    async fn compile(&mut self, packet: &Packet) -> Result<()> {
        if self.active.is_some() {
            return reply_error(&self.writer, BUILD_IN_PROGRESS).await;
        }

        let command_line = packet.text();
        let Some(args) = shlex::split(&command_line) else {
            warn!(%command_line, "malformed quoting in build arguments");
            let message = format!("Invalid build arguments: {command_line}");
            return reply_error(&self.writer, message).await;
        };

        let id = self.next_build_id;
        self.next_build_id += 1;
        info!(build_id = id, dir = %self.build_dir.display(), ?args, "starting build");

        match Build::start(
            id,
            &self.command,
            &self.build_dir,
            &args,
            self.writer.clone(),
            self.completions_tx.clone(),
        ) {
            Ok(build) => {
                self.active = Some(build);
                Ok(())
            }
            Err(err) => {
                error!(build_id = id, error = %err, "failed to start build");
                reply_error(&self.writer, format!("Failed to start build: {err}")).await
            }
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        let Some(build) = self.active.take() else {
            return reply_error(&self.writer, NO_BUILD_IN_PROGRESS).await;
        };

        info!(build_id = build.id(), "cancelling running build");
        build.stop();
        self.cancelled.insert(build.id(), build);
        Ok(())
    }

    async fn build_completed(&mut self, id: BuildId) -> Result<()> {
        let build = match self.active.take_if(|build| build.id() == id) {
            Some(build) => build,
            None => match self.cancelled.remove(&id) {
                Some(build) => build,
                None => panic!("unknown build {id} flagged its completion"),
            },
        };

        let code = build.join().await;
        info!(build_id = id, exit_code = code, "reporting build completion");
        self.writer.send(Packet::complete(code)).await
    }
}

async fn reply_error(writer: &PacketWriter, message: impl Into<String>) -> Result<()> {
    let message = message.into();
    warn!(reply = %message, "replying with error");
    writer.write_packet(PacketKind::Error, message).await
}
