use clap::Parser;
use log::LevelFilter;
use socks5_test_proxy::common::config::ProxyConfig;
use socks5_test_proxy::common::logger;
use socks5_test_proxy::Socks5TestProxy;

/// Fallback logger that writes to stderr when log4rs fails to initialise.
struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= LevelFilter::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Standalone SOCKS5 digest proxy. Logs every negotiated session until
/// interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    #[arg(long, value_name = "ADDRESS")]
    listen_address: Option<String>,

    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[arg(long, value_name = "MILLIS")]
    startup_timeout_ms: Option<u64>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match ProxyConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => ProxyConfig::default(),
    };

    if let Some(listen_address) = args.listen_address {
        config.listen_address = listen_address;
    }
    if let Some(log_level) = args.log_level {
        config.log.level = log_level;
    }
    if let Some(startup_timeout_ms) = args.startup_timeout_ms {
        config.startup_timeout_ms = startup_timeout_ms;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if args.print_config {
        match config.to_toml_string() {
            Ok(dump) => print!("{}", dump),
            Err(e) => {
                eprintln!("Failed to render configuration: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = logger::setup_logger(&config.log) {
        eprintln!("Failed to initialize logger: {}", e);
        if log::set_boxed_logger(Box::new(SimpleLogger)).is_ok() {
            log::set_max_level(LevelFilter::Info);
        }
    }

    log::info!("Starting with config: {:?}", config);

    let proxy = match Socks5TestProxy::from_config(&config) {
        Ok(proxy) => proxy,
        Err(e) => {
            log::error!("Failed to bind to {}: {}", config.listen_address, e);
            std::process::exit(1);
        }
    };

    println!("SOCKS5 test proxy listening on {}", proxy.local_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to wait for shutdown signal: {}", e);
    }
    log::info!("Received shutdown signal");

    let sessions = proxy.session_count();
    proxy.stop().await;
    log::info!("Stopped after {} session(s)", sessions);
}
