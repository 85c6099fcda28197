//! tunport CLI エントリーポイント

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tunport::forward::{parse_forward_specs, ForwardSpec};
use tunport::keys::{
    encode_base64_key, generate_keypair, parse_base64_key, public_key_of, read_key_file,
};
use tunport::{EgressService, ForwardService, IngressService, Lifecycle, Outcome};

/// ログ出力形式
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    /// 人間が読みやすい形式
    #[default]
    Console,
    /// JSON 形式（構造化ログ）
    Json,
}

/// Encrypted point-to-point tunnel that forwards TCP ports in either direction
#[derive(Parser, Debug)]
#[command(name = "tunport")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, default_value = "console", env = "TUNPORT_LOG_FORMAT")]
    log_format: LogFormat,

    /// Log output file (default: stdout)
    #[arg(long, global = true, env = "TUNPORT_LOG_OUTPUT")]
    log_output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a peer and expose local services to it (egress)
    ///
    /// Each --expose localPort:localAddress:peerPort makes localAddress:localPort
    /// reachable from the peer as virtual port peerPort.
    Expose {
        /// Path to file containing the private key (base64)
        #[arg(long, env = "TUNPORT_PRIVATE_KEY")]
        private_key: PathBuf,

        /// Path to file containing the peer's public key (base64)
        #[arg(long, env = "TUNPORT_PEER_PUBLIC_KEY")]
        peer_public_key: PathBuf,

        /// Forward rule localPort:localAddress:peerPort (repeatable)
        #[arg(long = "expose", required = true)]
        expose: Vec<String>,

        /// Peer endpoint to connect to (host:port)
        endpoint: String,
    },

    /// Wait for a peer and make its exposed services reachable locally (ingress)
    ///
    /// Each --expose localPort:localAddress:peerPort listens on
    /// localAddress:localPort and forwards to the peer's virtual port peerPort.
    Listen {
        /// Path to file containing the private key (base64)
        #[arg(long, env = "TUNPORT_PRIVATE_KEY")]
        private_key: PathBuf,

        /// Path to file containing the peer's public key (base64)
        #[arg(long, env = "TUNPORT_PEER_PUBLIC_KEY")]
        peer_public_key: PathBuf,

        /// UDP port to accept the peer on
        #[arg(short = 'l', long, env = "TUNPORT_LISTEN_PORT")]
        listen_port: u16,

        /// Forward rule localPort:localAddress:peerPort (repeatable)
        #[arg(long = "expose", required = true)]
        expose: Vec<String>,
    },

    /// Generate a new private key (base64)
    Genkey,

    /// Read a private key (base64) from stdin and print its public key
    Pubkey,
}

/// ログ出力先の MakeWriter 実装
struct FileWriter(Arc<Mutex<std::fs::File>>);

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

impl Clone for FileWriter {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FileWriter {
    type Writer = FileWriter;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn init_logging(format: LogFormat, output: Option<&Path>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_path) = output {
        // ファイルに出力（append モード）
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("Failed to open log file: {:?}", log_path))?;
        let writer = FileWriter(Arc::new(Mutex::new(file)));

        match format {
            LogFormat::Console => {
                tracing_subscriber::fmt()
                    .with_writer(writer)
                    .with_env_filter(env_filter)
                    .init();
            }
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .with_writer(writer)
                    .with_env_filter(env_filter)
                    .json()
                    .init();
            }
        }
    } else {
        match format {
            LogFormat::Console => {
                tracing_subscriber::fmt()
                    .with_writer(std::io::stdout)
                    .with_env_filter(env_filter)
                    .init();
            }
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .with_writer(std::io::stdout)
                    .with_env_filter(env_filter)
                    .json()
                    .init();
            }
        }
    }

    Ok(())
}

/// 鍵ファイルを読み、トンネルデバイスに渡す 16 進数形式で返す
fn load_key(path: &Path) -> Result<String> {
    read_key_file(path).with_context(|| format!("Failed to load key from {:?}", path))
}

/// SIGINT / SIGTERM を受けるたびにシグナル名をチャネルへ流す
fn spawn_signal_forwarder() -> Result<mpsc::Receiver<&'static str>> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            if tx.send(name).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// サービスをライフサイクルに載せて実行する
///
/// 強制終了の場合はこの関数から戻らずプロセスを終了する。
async fn run_service<S: ForwardService>(service: Arc<S>) -> Result<()> {
    let signals = spawn_signal_forwarder()?;
    let lifecycle = Lifecycle::new();

    match lifecycle.run(service, signals).await? {
        Outcome::Completed | Outcome::Drained => {
            info!("Shutdown complete");
            Ok(())
        }
        Outcome::Forced => {
            error!("Forced shutdown");
            std::process::exit(1);
        }
    }
}

async fn run_expose(
    private_key: &Path,
    peer_public_key: &Path,
    specs: Vec<ForwardSpec>,
    endpoint: &str,
) -> Result<()> {
    let private_key = load_key(private_key)?;
    let peer_public_key = load_key(peer_public_key)?;

    let service = EgressService::new(&private_key, endpoint, &peer_public_key)
        .context("Failed to create egress service")?;
    for spec in &specs {
        let (port, upstream) = spec.egress_rule();
        service.add_forward(port, upstream);
    }

    info!("Connecting to peer at {}", endpoint);
    run_service(Arc::new(service)).await
}

async fn run_listen(
    private_key: &Path,
    peer_public_key: &Path,
    listen_port: u16,
    specs: Vec<ForwardSpec>,
) -> Result<()> {
    let private_key = load_key(private_key)?;
    let peer_public_key = load_key(peer_public_key)?;

    let service = IngressService::new(&private_key, &peer_public_key, listen_port)
        .context("Failed to create ingress service")?;
    for spec in &specs {
        let (addr, port) = spec.ingress_rule();
        service.add_forward(addr, port);
    }

    info!("Waiting for peer on UDP port {}", listen_port);
    run_service(Arc::new(service)).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Genkey => {
            let (private_key, _) = generate_keypair();
            println!("{}", encode_base64_key(&private_key));
            return Ok(());
        }
        Commands::Pubkey => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read private key from stdin")?;
            let private_key = parse_base64_key(&input).context("Invalid private key")?;
            println!("{}", encode_base64_key(&public_key_of(&private_key)));
            return Ok(());
        }
        _ => {}
    }

    init_logging(cli.log_format, cli.log_output.as_deref())?;

    match cli.command {
        Commands::Expose {
            private_key,
            peer_public_key,
            expose,
            endpoint,
        } => {
            let specs = parse_forward_specs(&expose).context("Invalid --expose")?;
            run_expose(&private_key, &peer_public_key, specs, &endpoint).await?;
        }
        Commands::Listen {
            private_key,
            peer_public_key,
            listen_port,
            expose,
        } => {
            let specs = parse_forward_specs(&expose).context("Invalid --expose")?;
            run_listen(&private_key, &peer_public_key, listen_port, specs).await?;
        }
        Commands::Genkey | Commands::Pubkey => {}
    }

    Ok(())
}
