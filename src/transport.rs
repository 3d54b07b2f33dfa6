//! Byte streams the supervisor can talk over.
//!
//! A peer is reached either by connecting to an existing endpoint (a Unix
//! socket, FIFO or character device such as a virtio serial port) or by
//! listening on a Unix socket path.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::{Error, Result};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Permission mode for sockets created by [`SocketListener::bind`].
pub const SOCKET_MODE: u32 = 0o600;

/// Open a duplex stream to the endpoint at `path`.
///
/// Unix sockets are connected to. Anything else is opened read-write with
/// separate read and write handles, so a blocked read never holds up output.
pub async fn connect(path: &Path) -> Result<(BoxedReader, BoxedWriter)> {
    let metadata = tokio::fs::metadata(path).await?;

    if metadata.file_type().is_socket() {
        let stream = UnixStream::connect(path).await?;
        debug!(path = %path.display(), "connected to unix socket");
        return Ok(boxed(stream));
    }

    let path = path.to_path_buf();
    let (reader, writer) = tokio::task::spawn_blocking(move || -> io::Result<_> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let writer = file.try_clone()?;
        Ok((file, writer))
    })
    .await
    .map_err(io::Error::other)??;
    debug!("opened stream endpoint");

    let reader: BoxedReader = Box::new(tokio::fs::File::from_std(reader));
    let writer: BoxedWriter = Box::new(tokio::fs::File::from_std(writer));
    Ok((reader, writer))
}

fn boxed(stream: UnixStream) -> (BoxedReader, BoxedWriter) {
    let (reader, writer) = stream.into_split();
    (Box::new(reader), Box::new(writer))
}

/// A listening Unix socket that removes its path when dropped.
#[derive(Debug)]
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind at `path`, replacing a stale socket but never any other file.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a unix socket", path.display()),
                )));
            }
            debug!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

        Ok(Self { listener, path })
    }

    pub async fn accept(&self) -> Result<(BoxedReader, BoxedWriter)> {
        let (stream, _addr) = self.listener.accept().await?;
        debug!("accepted connection");
        Ok(boxed(stream))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let is_socket = std::fs::symlink_metadata(&self.path)
            .map(|metadata| metadata.file_type().is_socket())
            .unwrap_or(false);
        if is_socket {
            debug!(path = %self.path.display(), "cleaning up socket file");
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
