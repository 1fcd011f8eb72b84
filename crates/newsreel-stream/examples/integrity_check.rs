//! Sampled integrity checking for one file.
//!
//! Stats a sample of the file's articles through the configured server
//! (never downloading bodies), streams progress to stdout, and prints the
//! final report as JSON. A conclusively missing file (three consecutive
//! absent segments) is reported as gone without checking the rest.
//!
//! Run with:
//! ```bash
//! NNTP_HOST=news.example.com cargo run --example integrity_check -- show.mkv part1@example part2@example
//! ```

use std::env;

use anyhow::Context;

use newsreel_stream::{catalog, Credentials, IntegrityRequest, Newsreel, RawCodec, ServerConfig};

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

    let mut args = env::args().skip(1);
    let name = args.next().context("first argument is the file name")?;
    let ids: Vec<String> = args.collect();
    anyhow::ensure!(!ids.is_empty(), "pass the file's message-ids after the name");

    println!("\n🔎 Newsreel Integrity Check");
    println!("============================\n");

    let client = Newsreel::builder()
        .server(server_from_env()?)
        .codec(RawCodec)
        .build()
        .await?;

    let request = IntegrityRequest::new(&name, catalog(ids))
        .sampling_rate(0.25)
        .concurrency(8)
        .on_progress(|finished, sampled| {
            if finished % 10 == 0 || finished == sampled {
                println!("   …{finished}/{sampled}");
            }
        });

    match client.check_integrity(request).await {
        Ok(report) => {
            println!("\n📋 Report:");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Err(err) if err.is_not_found() => {
            println!("\n❌ {name} is gone: {err}");
        }
        Err(err) => {
            client.dispose().await;
            return Err(err.into());
        }
    }

    client.dispose().await;
    Ok(())
}
