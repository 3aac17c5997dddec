//! mesh-client: filemesh interactive client.
//!
//! Connects to the proxy, forwards console lines as text commands, prints
//! replies, and saves incoming file transfers under the download directory.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use mesh_core::{MeshError, Message, MessageReader, MessageWriter};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

/// mesh-client — filemesh interactive client
#[derive(Parser, Debug)]
#[command(name = "mesh-client", version, about = "filemesh interactive client")]
struct Cli {
    /// Proxy host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Proxy TCP port
    #[arg(long, default_value_t = 12290)]
    port: u16,

    /// Directory for downloaded files
    #[arg(long, default_value = "downloads")]
    download_dir: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("mesh_client=debug,mesh_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("mesh_client=warn,mesh_core=warn")
            .with_target(false)
            .init();
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("mesh-client: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let addr = format!("{}:{}", cli.host, cli.port);
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to proxy at {addr}"))?;
    info!(addr = %addr, "connected to proxy");

    let (read, write) = stream.into_split();
    let mut writer = MessageWriter::new(write);
    let mut reader_task = tokio::spawn(read_loop(read, PathBuf::from(&cli.download_dir)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }

                let mut tokens = line.split_whitespace();
                if tokens.next() == Some("!exit") {
                    if tokens.next().is_some() {
                        println!("Wrong parameters - Usage: !exit");
                        continue;
                    }
                    let _ = writer.send_text(&line).await;
                    println!("Exit success!");
                    break;
                }

                if let Err(e) = writer.send_text(&line).await {
                    eprintln!("Failed to send to proxy: {e}");
                    break;
                }
            }
            _ = &mut reader_task => break,
        }
    }

    let _ = writer.shutdown().await;
    reader_task.abort();
    info!("disconnected");
    Ok(())
}

/// Renders everything the proxy sends until the connection ends or the
/// proxy logs us off.
async fn read_loop<R>(read: R, download_dir: PathBuf)
where
    R: AsyncRead + Unpin,
{
    let mut reader = MessageReader::new(BufReader::new(read));
    loop {
        match reader.read().await {
            Ok(Message::Text(line)) => println!("{line}"),
            Ok(Message::File { name, content }) => {
                match save_download(&download_dir, &name, &content) {
                    Ok(path) => println!("Saved download to {}", path.display()),
                    Err(e) => eprintln!("Could not save download {name}: {e}"),
                }
            }
            Ok(Message::ForceLogoff) => {
                println!("Received force logoff message, terminating!");
                return;
            }
            Ok(other) => warn!(kind = other.kind(), "ignoring unexpected message from proxy"),
            Err(MeshError::ConnectionClosed) => {
                println!("Connection to proxy was closed, terminating!");
                return;
            }
            Err(e) => {
                eprintln!("Connection to proxy failed: {e}");
                return;
            }
        }
    }
}

/// Reduces a served file name to its base name. Separators and dot
/// components never escape the download directory.
fn sanitize_name(name: &str) -> Option<&str> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    (!base.is_empty() && base != "." && base != "..").then_some(base)
}

fn save_download(dir: &Path, name: &str, content: &str) -> io::Result<PathBuf> {
    let Some(base) = sanitize_name(name) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unusable file name: {name:?}"),
        ));
    };
    std::fs::create_dir_all(dir)?;
    let path = dir.join(base);
    std::fs::write(&path, content)?;
    Ok(path)
}
