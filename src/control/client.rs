//! Client side of the local control channel, used by the CLI.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::protocol::{LocalFrame, StatusPayload};
use crate::{Error, Result};

use super::endpoint;

/// How long the CLI waits for any single frame from the bridge.
const READ_DEADLINE: Duration = Duration::from_secs(10);

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected local client session.
pub struct LocalClient {
    lines: Lines<BufReader<BoxedRead>>,
    write: BoxedWrite,
}

impl LocalClient {
    /// Connect to the local endpoint.
    ///
    /// # Errors
    ///
    /// `NotRunning` when no bridge answers.
    pub async fn connect() -> Result<Self> {
        let (read, write) = connect_endpoint().await?;
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    /// Send one frame.
    pub async fn send(&mut self, frame: &LocalFrame) -> Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        self.write.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Read the next frame.
    pub async fn next_frame(&mut self) -> Result<LocalFrame> {
        let line = tokio::time::timeout(READ_DEADLINE, self.lines.next_line())
            .await
            .map_err(|_| Error::Timeout("no reply from bridge".to_string()))??
            .ok_or_else(|| Error::Transport("bridge closed the connection".to_string()))?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Read frames until a status snapshot arrives.
    pub async fn wait_status(&mut self) -> Result<StatusPayload> {
        loop {
            if let LocalFrame::Status(status) = self.next_frame().await? {
                return Ok(status);
            }
        }
    }

    /// Send a command and wait for its `ok`/`error` outcome, skipping
    /// interleaved broadcasts.
    pub async fn request_ok(&mut self, frame: &LocalFrame) -> Result<()> {
        self.send(frame).await?;
        loop {
            match self.next_frame().await? {
                LocalFrame::Ok {} => return Ok(()),
                LocalFrame::Error(e) => return Err(Error::Internal(e.message)),
                LocalFrame::Status(_) | LocalFrame::Activity(_) => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected reply: {}",
                        serde_json::to_string(&other).unwrap_or_default()
                    )));
                }
            }
        }
    }

    /// One `ping`, exactly one `pong`.
    pub async fn ping(&mut self) -> Result<()> {
        self.send(&LocalFrame::Ping {}).await?;
        loop {
            match self.next_frame().await? {
                LocalFrame::Pong {} => return Ok(()),
                LocalFrame::Status(_) | LocalFrame::Activity(_) => {}
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected reply: {}",
                        serde_json::to_string(&other).unwrap_or_default()
                    )));
                }
            }
        }
    }
}

#[cfg(unix)]
async fn connect_endpoint() -> Result<(BoxedRead, BoxedWrite)> {
    let stream = tokio::net::UnixStream::connect(endpoint::socket_path())
        .await
        .map_err(|_| Error::NotRunning("bridge is not running".to_string()))?;
    let (read, write) = tokio::io::split(stream);
    Ok((Box::new(read), Box::new(write)))
}

#[cfg(windows)]
async fn connect_endpoint() -> Result<(BoxedRead, BoxedWrite)> {
    let raw = std::fs::read_to_string(endpoint::port_file_path())
        .map_err(|_| Error::NotRunning("bridge is not running".to_string()))?;
    let port: u16 = raw
        .trim()
        .parse()
        .map_err(|_| Error::NotRunning("bridge is not running".to_string()))?;
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|_| Error::NotRunning("bridge is not running".to_string()))?;
    let (read, write) = tokio::io::split(stream);
    Ok((Box::new(read), Box::new(write)))
}
