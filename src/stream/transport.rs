// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Local socket transport for client connections.
//!
//! Unix domain sockets on unix, named pipes on windows.

use std::io;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a client can be served over.
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> StreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type ClientStream = Box<dyn StreamIo>;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, ServerOptions};

pub struct Listener {
    #[cfg(unix)]
    inner: UnixListener,
    #[cfg(windows)]
    pipe: String,
}

/// Bind the endpoint, replacing a stale socket file.
pub fn bind(path: &Path) -> io::Result<Listener> {
    #[cfg(unix)]
    {
        cleanup(path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Listener {
            inner: UnixListener::bind(path)?,
        })
    }

    #[cfg(windows)]
    {
        Ok(Listener {
            pipe: pipe_name(path),
        })
    }
}

pub async fn connect(path: &Path) -> io::Result<ClientStream> {
    #[cfg(unix)]
    {
        Ok(Box::new(UnixStream::connect(path).await?))
    }

    #[cfg(windows)]
    {
        let name = pipe_name(path);
        let mut attempts = 0;
        loop {
            match ClientOptions::new().open(&name) {
                Ok(client) => return Ok(Box::new(client)),
                Err(_) if attempts < 50 => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Listener {
    pub async fn accept(&self) -> io::Result<ClientStream> {
        #[cfg(unix)]
        {
            let (stream, _addr) = self.inner.accept().await?;
            Ok(Box::new(stream))
        }

        #[cfg(windows)]
        {
            let server = ServerOptions::new().create(&self.pipe)?;
            server.connect().await?;
            Ok(Box::new(server))
        }
    }
}

/// Remove the socket file if present.
pub fn cleanup(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[cfg(windows)]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(windows)]
fn pipe_name(path: &Path) -> String {
    let name = path.to_string_lossy();
    if name.starts_with(r"\\.\pipe\") {
        name.into_owned()
    } else {
        format!(r"\\.\pipe\{}", name)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("foreman.sock");

        let listener = bind(&path).unwrap();
        assert!(path.exists());

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = connect(&path).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        assert!(bind(&path).is_ok());
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect(&dir.path().join("missing.sock")).await.err().unwrap();
        assert!(matches!(
            err.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
        ));
    }

    #[test]
    fn test_cleanup_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.sock");
        assert!(cleanup(&path).is_ok());
    }
}
