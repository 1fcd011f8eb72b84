//! Seekable streaming over NNTP-hosted segments.
//!
//! Builds a client against the server named by `NNTP_HOST`/`NNTP_PORT`
//! (optional `NNTP_TLS`, `NNTP_USER`/`NNTP_PASS`), treats the message-ids
//! on the command line as one file's catalog, and exercises the stream: a
//! head read, a seek to the middle, then a sequential scan to the end.
//!
//! Articles must carry the `X-Part-Range` header that `RawCodec` expects.
//!
//! Run with:
//! ```bash
//! NNTP_HOST=news.example.com cargo run --example stream_read -- part1@example part2@example
//! ```

use std::env;
use std::io::SeekFrom;
use std::time::Instant;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use newsreel_stream::{catalog, Credentials, Newsreel, RawCodec, ServerConfig};

fn server_from_env() -> anyhow::Result<ServerConfig> {
    let host = env::var("NNTP_HOST").context("NNTP_HOST must be set")?;
    let port = match env::var("NNTP_PORT") {
        Ok(port) => port.parse().context("NNTP_PORT must be a port number")?,
        Err(_) => 119,
    };
    let mut server = ServerConfig::new("primary", host, port);
    server.tls = env::var("NNTP_TLS").is_ok();
    if let (Ok(user), Ok(pass)) = (env::var("NNTP_USER"), env::var("NNTP_PASS")) {
        server.credentials = Some(Credentials::new(user, pass));
    }
    Ok(server)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let ids: Vec<String> = env::args().skip(1).collect();
    anyhow::ensure!(
        !ids.is_empty(),
        "pass the file's message-ids in catalog order"
    );

    println!("\n📡 Newsreel Streaming Example");
    println!("==============================\n");

    let client = Newsreel::builder()
        .server(server_from_env()?)
        .codec(RawCodec)
        .build()
        .await?;

    let segments = catalog(ids);
    let size = client.file_size(&segments).await?;
    println!("📦 {} segments, {} bytes\n", segments.len(), size);

    let mut stream = client.open_stream(segments, Some(size));

    let mut head = vec![0u8; 64.min(size as usize)];
    stream.read_exact(&mut head).await?;
    println!(
        "🔍 head: {:02x?}…",
        &head[..16.min(head.len())]
    );

    let middle = size / 2;
    stream.seek(SeekFrom::Start(middle)).await?;
    let started = Instant::now();
    let mut scanned = 0u64;
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        scanned += n as u64;
    }
    println!(
        "⏩ read {} bytes from offset {} in {:.2?}",
        scanned,
        middle,
        started.elapsed()
    );

    println!("\n🩺 Server health:");
    for row in client.server_health().await {
        println!(
            "   {}: available={} failures={} successes={}",
            row.id, row.available, row.total_failures, row.total_successes
        );
    }

    client.dispose().await;
    Ok(())
}
