use anyhow::{bail, Context};
use avs_client::{
    AvsConfig, AvsError, ClientHandler, ConnectionState, Directive, ProtocolClient,
    StaticTokenSource,
};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "avs-client", about = "Talk to the Alexa Voice Service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the service is reachable with the current token
    Ping,
    /// Open the downchannel and print directives until Ctrl+C
    Listen {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Send a recording (16 kHz mono 16-bit WAV, or raw PCM) to the recognizer
    Recognize {
        file: PathBuf,
        /// Where audio directives are written
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Send an event carrying only a token
    Event {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        token: String,
    },
}

/// Handler callbacks forwarded to the command that is waiting on them
enum Outcome {
    Ping(avs_client::Result<()>),
    Sync(avs_client::Result<()>),
    Directives(avs_client::Result<Vec<Directive>>),
    DownchannelDirective(String),
    State(ConnectionState, Option<AvsError>),
    EventSent(avs_client::Result<()>),
    Alert(String),
}

struct ChannelHandler {
    tx: mpsc::UnboundedSender<Outcome>,
}

impl ChannelHandler {
    fn forward(&self, outcome: Outcome) {
        let _ = self.tx.send(outcome);
    }
}

impl ClientHandler for ChannelHandler {
    fn on_ping(&mut self, result: avs_client::Result<()>) {
        self.forward(Outcome::Ping(result));
    }

    fn on_sync(&mut self, result: avs_client::Result<()>) {
        self.forward(Outcome::Sync(result));
    }

    fn on_directives(&mut self, result: avs_client::Result<Vec<Directive>>) {
        self.forward(Outcome::Directives(result));
    }

    fn on_downchannel_directive(&mut self, json: String) {
        self.forward(Outcome::DownchannelDirective(json));
    }

    fn on_downchannel_state(&mut self, state: ConnectionState, error: Option<AvsError>) {
        self.forward(Outcome::State(state, error));
    }

    fn on_event_sent(&mut self, namespace: &str, name: &str, result: avs_client::Result<()>) {
        log::debug!("Event {}.{} finished", namespace, name);
        self.forward(Outcome::EventSent(result));
    }

    fn on_alert(&mut self, token: &str) {
        self.forward(Outcome::Alert(token.to_string()));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = AvsConfig::from_env().context("Invalid AVS configuration")?;
    let tokens = match StaticTokenSource::from_env() {
        Ok(tokens) => tokens,
        Err(e) => {
            eprintln!("❌ {}", e);
            eprintln!("   Please set it with: export AVS_ACCESS_TOKEN=your_token_here");
            std::process::exit(1);
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = ProtocolClient::new(config, Arc::new(tokens), ChannelHandler { tx })?;
    log::info!("🚀 Initializing avs-client");

    match cli.command {
        Command::Ping => {
            client.ping()?;
            loop {
                match next(&mut rx).await? {
                    Outcome::Ping(Ok(())) => {
                        println!("✅ Ping succeeded");
                        break;
                    }
                    Outcome::Ping(Err(e)) => bail!("Ping failed: {}", e),
                    _ => {}
                }
            }
        }
        Command::Listen { seconds } => listen(&client, &mut rx, seconds).await?,
        Command::Recognize { file, out_dir } => {
            let audio = read_audio(&file)?;
            client.post_recording(audio)?;
            loop {
                match next(&mut rx).await? {
                    Outcome::Directives(Ok(directives)) => {
                        save_directives(&directives, &out_dir)?;
                        break;
                    }
                    Outcome::Directives(Err(e)) => bail!("Recognize failed: {}", e),
                    _ => {}
                }
            }
        }
        Command::Event {
            namespace,
            name,
            token,
        } => {
            client.send_event(&namespace, &name, &token)?;
            loop {
                match next(&mut rx).await? {
                    Outcome::EventSent(Ok(())) => {
                        println!("✅ Sent {}.{}", namespace, name);
                        break;
                    }
                    Outcome::EventSent(Err(e)) => bail!("Event failed: {}", e),
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> anyhow::Result<Outcome> {
    rx.recv().await.context("Client stopped unexpectedly")
}

async fn listen(
    client: &ProtocolClient,
    rx: &mut mpsc::UnboundedReceiver<Outcome>,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    client.start_downchannel()?;
    println!("🎧 Listening for directives...");
    println!("   Press Ctrl+C to exit");

    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            outcome = next(rx) => match outcome? {
                Outcome::State(ConnectionState::Closed, error) => {
                    match error {
                        Some(e) => bail!("Downchannel closed: {}", e),
                        None => {
                            println!("📡 Downchannel closed");
                            break;
                        }
                    }
                }
                Outcome::State(state, _) => println!("📡 Downchannel {}", state),
                Outcome::Sync(Ok(())) => println!("🔄 Device state synchronized"),
                Outcome::Sync(Err(e)) => println!("❌ Sync failed: {}", e),
                Outcome::Ping(Ok(())) => log::info!("💓 Keepalive ok"),
                Outcome::Ping(Err(e)) => println!("💔 Keepalive failed: {}", e),
                Outcome::DownchannelDirective(json) => println!("📨 {}", json),
                Outcome::Alert(token) => println!("⏰ Alert {} is due", token),
                Outcome::Directives(_) | Outcome::EventSent(_) => {}
            },
            _ = &mut deadline => {
                log::info!("Listen time elapsed, shutting down...");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    client.stop_downchannel();
    println!("\n👋 Goodbye!");
    Ok(())
}

/// Raw little-endian 16-bit PCM, from a WAV file or taken as-is
fn read_audio(path: &Path) -> anyhow::Result<Vec<u8>> {
    let is_wav = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if !is_wav {
        return fs::read(path).with_context(|| format!("Failed to read {}", path.display()));
    }

    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate != 16000 || spec.channels != 1 || spec.bits_per_sample != 16 {
        log::warn!(
            "⚠️ {} is {} Hz, {} channel(s), {} bit; the recognizer expects 16 kHz mono 16-bit",
            path.display(),
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        );
    }

    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        pcm.extend_from_slice(&sample?.to_le_bytes());
    }
    log::info!("🎙️ Loaded {} bytes of audio from {}", pcm.len(), path.display());
    Ok(pcm)
}

fn save_directives(directives: &[Directive], out_dir: &Path) -> anyhow::Result<()> {
    if directives.is_empty() {
        println!("🤷 No directives in response");
        return Ok(());
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let mut audio_index = 0;
    for directive in directives {
        if let Some(json) = directive.as_str() {
            println!("📨 {}", json);
        } else if directive.is_audio() {
            audio_index += 1;
            let path = out_dir.join(format!("response_{}.mp3", audio_index));
            fs::write(&path, &directive.payload)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("🔊 Wrote {} bytes of audio to {}", directive.payload.len(), path.display());
        }
    }
    Ok(())
}
