//! Line-oriented message protocol for the client/proxy/node TCP links.
//!
//! Wire format: every message is one or more `\n`-terminated text lines.
//! Multi-line messages are bracketed by marker lines starting with `!`;
//! payload lines have each `!` escaped to `!_` before sending, so a payload
//! line can never be mistaken for a marker.

use crate::error::{MeshError, MeshResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

// Marker lines. A marker counts only when it is the entire line; the reader
// compares against the raw line before unescaping.
pub const FILE_NAME: &str = "!FILE_NAME";
pub const FILE_CONTENT: &str = "!FILE_CONTENT";
pub const FILE_END: &str = "!FILE_END";
pub const FORCE_LOGOFF: &str = "!FORCE_LOGOFF";
pub const LISTRESULT: &str = "!LISTRESULT";
pub const LISTRESULT_END: &str = "!LISTRESULT_END";
pub const INFO: &str = "!INFO";
pub const INFO_END: &str = "!INFO_END";
pub const SIZE_START: &str = "!SIZE_START";
pub const SIZE_END: &str = "!SIZE_END";
pub const FILENAME_REQUEST: &str = "!FILENAME_REQUEST";
pub const PERFORM_DOWNLOAD: &str = "!PERFORM_DOWNLOAD";

/// Escape payload text so none of its lines collides with a marker.
pub fn escape(text: &str) -> String {
    text.replace('!', "!_")
}

/// Reverse [`escape`].
pub fn unescape(text: &str) -> String {
    text.replace("!_", "!")
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Plain text line: commands, status replies, error reports.
    Text(String),
    /// Complete file transfer, name plus content.
    File { name: String, content: String },
    /// File names offered by a node.
    FileList(Vec<String>),
    /// Proxy-initiated logoff notice to a client.
    ForceLogoff,
    /// Ask a node for the names it serves.
    FileNamesRequest,
    /// Ask a node for the size of one file.
    SizeRequest(String),
    /// Size reply; `-1` means the file does not exist.
    Size(i64),
    /// Ask a node to deliver the file named in the preceding size request.
    DownloadRequest,
}

impl Message {
    /// Short variant name, used when reporting an unexpected message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Text(_) => "Text",
            Message::File { .. } => "File",
            Message::FileList(_) => "FileList",
            Message::ForceLogoff => "ForceLogoff",
            Message::FileNamesRequest => "FileNamesRequest",
            Message::SizeRequest(_) => "SizeRequest",
            Message::Size(_) => "Size",
            Message::DownloadRequest => "DownloadRequest",
        }
    }
}

/// Decodes messages from a buffered byte stream.
pub struct MessageReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next complete message.
    ///
    /// Returns [`MeshError::ConnectionClosed`] once the peer has shut down
    /// its writing side, including mid-message.
    pub async fn read(&mut self) -> MeshResult<Message> {
        let line = self.read_line().await?;
        match line.as_str() {
            FILE_NAME => self.read_file().await,
            LISTRESULT => self.read_list().await,
            INFO => self.read_size_request().await,
            SIZE_START => self.read_size().await,
            FORCE_LOGOFF => Ok(Message::ForceLogoff),
            FILENAME_REQUEST => Ok(Message::FileNamesRequest),
            PERFORM_DOWNLOAD => Ok(Message::DownloadRequest),
            _ => Ok(Message::Text(unescape(&line))),
        }
    }

    async fn read_line(&mut self) -> MeshResult<String> {
        let mut line = String::new();
        let n = self.inner.read_line(&mut line).await?;
        if n == 0 {
            return Err(MeshError::ConnectionClosed);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(line)
    }

    async fn read_file(&mut self) -> MeshResult<Message> {
        let name = self.read_block(FILE_CONTENT).await?;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == FILE_END {
                break;
            }
            lines.push(unescape(&line));
        }
        Ok(Message::File {
            name,
            content: lines.join("\n"),
        })
    }

    // List entries travel unescaped.
    async fn read_list(&mut self) -> MeshResult<Message> {
        let mut names = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == LISTRESULT_END {
                break;
            }
            names.push(line);
        }
        Ok(Message::FileList(names))
    }

    async fn read_size_request(&mut self) -> MeshResult<Message> {
        let name = self.read_block(INFO_END).await?;
        Ok(Message::SizeRequest(name))
    }

    async fn read_size(&mut self) -> MeshResult<Message> {
        let text = self.read_block(SIZE_END).await?;
        let size = text
            .parse::<i64>()
            .map_err(|_| MeshError::Protocol(format!("bad size payload: {:?}", text)))?;
        Ok(Message::Size(size))
    }

    /// Read payload lines up to the `end` marker; the last line wins.
    async fn read_block(&mut self, end: &str) -> MeshResult<String> {
        let mut value = String::new();
        loop {
            let line = self.read_line().await?;
            if line == end {
                return Ok(value);
            }
            value = unescape(&line);
        }
    }
}

/// Encodes messages onto a byte stream, flushing once per message.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send any message, dispatching to the matching encoder.
    pub async fn send(&mut self, message: &Message) -> MeshResult<()> {
        match message {
            Message::Text(text) => self.send_text(text).await,
            Message::File { name, content } => self.send_file(name, content).await,
            Message::FileList(names) => self.send_file_list(names).await,
            Message::ForceLogoff => self.send_force_logoff().await,
            Message::FileNamesRequest => self.send_file_names_request().await,
            Message::SizeRequest(name) => self.send_size_request(name).await,
            Message::Size(size) => self.send_size(*size).await,
            Message::DownloadRequest => self.send_download_request().await,
        }
    }

    pub async fn send_text(&mut self, text: &str) -> MeshResult<()> {
        self.write_line(&escape(text)).await?;
        self.flush().await
    }

    pub async fn send_file(&mut self, name: &str, content: &str) -> MeshResult<()> {
        self.write_line(FILE_NAME).await?;
        self.write_line(&escape(name)).await?;
        self.write_line(FILE_CONTENT).await?;
        for line in content.lines() {
            self.write_line(&escape(line)).await?;
        }
        self.write_line(FILE_END).await?;
        self.flush().await
    }

    pub async fn send_file_list(&mut self, names: &[String]) -> MeshResult<()> {
        self.write_line(LISTRESULT).await?;
        for name in names {
            self.write_line(name).await?;
        }
        self.write_line(LISTRESULT_END).await?;
        self.flush().await
    }

    pub async fn send_size_request(&mut self, name: &str) -> MeshResult<()> {
        self.write_line(INFO).await?;
        self.write_line(&escape(name)).await?;
        self.write_line(INFO_END).await?;
        self.flush().await
    }

    pub async fn send_size(&mut self, size: i64) -> MeshResult<()> {
        self.write_line(SIZE_START).await?;
        self.write_line(&size.to_string()).await?;
        self.write_line(SIZE_END).await?;
        self.flush().await
    }

    pub async fn send_force_logoff(&mut self) -> MeshResult<()> {
        self.write_line(FORCE_LOGOFF).await?;
        self.flush().await
    }

    pub async fn send_file_names_request(&mut self) -> MeshResult<()> {
        self.write_line(FILENAME_REQUEST).await?;
        self.flush().await
    }

    pub async fn send_download_request(&mut self) -> MeshResult<()> {
        self.write_line(PERFORM_DOWNLOAD).await?;
        self.flush().await
    }

    /// Shut down the underlying stream, signalling EOF to the peer.
    pub async fn shutdown(&mut self) -> MeshResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> MeshResult<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        Ok(())
    }

    async fn flush(&mut self) -> MeshResult<()> {
        self.inner.flush().await?;
        Ok(())
    }
}
