use clap::Parser;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;

use socks5_test_proxy::connect_with_digest;

/// Negotiate a digest with a running SOCKS5 test proxy and send a message on
/// the resulting raw connection.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, value_name = "ADDRESS", default_value = "127.0.0.1:1080")]
    proxy: SocketAddr,

    #[arg(long, value_name = "DIGEST")]
    digest: String,

    #[arg(long, value_name = "TEXT", default_value = "hello")]
    message: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match run(&args).await {
        Ok(()) => {
            println!("Digest '{}' negotiated with {}", args.digest, args.proxy);
            std::process::exit(0);
        }
        Err(e) => {
            println!("SOCKS5 digest handshake failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    println!("Connecting to SOCKS5 proxy at {}...", args.proxy);

    let mut stream = connect_with_digest(args.proxy, &args.digest).await?;
    stream.write_all(args.message.as_bytes()).await?;
    stream.flush().await?;
    println!("Sent {} byte(s) on the raw connection", args.message.len());

    Ok(())
}
