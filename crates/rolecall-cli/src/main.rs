use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use dialoguer::Select;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use rolecall_core::config::Config;
use rolecall_core::error::RoleCallError;
use rolecall_core::types::{MessageId, Role, Sender};
use rolecall_engine::{EngineOptions, SessionEngine, SessionSnapshot};
use rolecall_transport::{ChatBackend, HttpTransport};

#[derive(Parser)]
#[command(
    name = "rolecall",
    about = "Talk to AI personas over text or voice",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available roles
    Roles,

    /// Show one role in full
    Role { id: String },

    /// Check that the server is up
    Health,

    /// Chat with a role interactively
    Chat {
        /// Role to talk to (prompted for when omitted)
        #[arg(short, long)]
        role: Option<String>,

        /// Open the duplex channel and send turns over it while it is up
        #[arg(long)]
        stream: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

/// Install the global subscriber. `RUST_LOG` wins, then `logging.level`,
/// then `--verbose`.
fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();
    let fallback = logging
        .level
        .clone()
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());

    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&fallback));
    for directive in &logging.filters {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring log filter '{directive}': {e}"),
        }
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let to_stdout = logging.output == "stdout";
    match (logging.format.as_str(), to_stdout) {
        ("json", true) => builder.json().with_writer(std::io::stdout).init(),
        ("json", false) => builder.json().with_writer(std::io::stderr).init(),
        (_, true) => builder.with_writer(std::io::stdout).init(),
        (_, false) => builder.with_writer(std::io::stderr).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::config_dir);
    let config = Config::load(&config_path)?;

    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Roles => {
            let http = HttpTransport::from_config(&config);
            let roles = http.list_roles().await?;
            if roles.is_empty() {
                println!("No roles available.");
            }
            for role in roles {
                println!("{:<16} {:<24} {}", role.id, role.name, role.description);
            }
        }
        Commands::Role { id } => {
            let http = HttpTransport::from_config(&config);
            let role = http.get_role(&id).await?;
            println!("{}", serde_json::to_string_pretty(&role)?);
        }
        Commands::Health => {
            let http = HttpTransport::from_config(&config);
            let health = http.health().await?;
            println!("Server: {}", http.base_url());
            println!("Status: {}", health.status);
            if let Some(service) = health.service {
                println!("Service: {service}");
            }
            if let Some(version) = health.version {
                println!("Version: {version}");
            }
        }
        Commands::Chat { role, stream } => chat(&config, role, stream).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => bail!("'{key}' is not set in {}", config_path.display()),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
    }

    Ok(())
}

async fn chat(config: &Config, role_id: Option<String>, stream: bool) -> anyhow::Result<()> {
    let http = Arc::new(HttpTransport::from_config(config));
    let roles = http.list_roles().await?;
    if roles.is_empty() {
        bail!("the server has no roles");
    }

    let role = match role_id {
        Some(id) => find_role(&roles, &id)?,
        None => pick_role(&roles)?,
    };

    let mut options = EngineOptions::from_config(config);
    if !stream {
        options.stream = None;
    }
    // No microphone or speech synthesizer in a terminal.
    let engine = SessionEngine::start(options, http, None, None);
    let printer = tokio::spawn(print_transcript(engine.watch()));

    engine.select_role(role).await?;
    println!("Type a message. /role [id] switches roles, /voice [name] picks a voice, /quit leaves.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();
        let result = match command {
            "" => continue,
            "/quit" | "/exit" => break,
            "/role" => {
                let next = if arg.is_empty() {
                    pick_role(&roles)
                } else {
                    find_role(&roles, arg)
                };
                match next {
                    Ok(role) => engine.select_role(role).await,
                    Err(e) => {
                        eprintln!("{e}");
                        continue;
                    }
                }
            }
            "/voice" => voice_command(&engine, arg).await,
            _ => send_line(&engine, line, stream).await,
        };
        if let Err(e) = result {
            eprintln!("{e}");
        }
    }

    engine.shutdown().await;
    printer.abort();
    Ok(())
}

/// Prefer the duplex channel when streaming; fall back to HTTP while it is
/// down.
async fn send_line(
    engine: &SessionEngine,
    line: &str,
    stream: bool,
) -> rolecall_core::error::Result<()> {
    if stream {
        match engine.send_stream_text(line).await {
            Err(RoleCallError::NotConnected) => {}
            other => return other.map(|_| ()),
        }
    }
    engine.send_text(line).await.map(|_| ())
}

fn find_role(roles: &[Role], id: &str) -> anyhow::Result<Role> {
    roles
        .iter()
        .find(|r| r.id == id)
        .cloned()
        .ok_or_else(|| anyhow!("unknown role '{id}'"))
}

fn pick_role(roles: &[Role]) -> anyhow::Result<Role> {
    let names: Vec<String> = roles
        .iter()
        .map(|r| format!("{} ({})", r.name, r.id))
        .collect();
    let selected = Select::new()
        .with_prompt("Choose a role")
        .items(&names)
        .default(0)
        .interact()?;
    Ok(roles[selected].clone())
}

async fn voice_command(engine: &SessionEngine, name: &str) -> rolecall_core::error::Result<()> {
    if name.is_empty() {
        let voices = engine.voices();
        if voices.is_empty() {
            println!("Speech synthesis is unavailable here.");
        }
        for voice in voices {
            let gender = voice.gender.map(|g| format!("{g:?}")).unwrap_or_default();
            let marker = if voice.default { " *" } else { "" };
            println!("{:<32} {:<8} {gender}{marker}", voice.name, voice.lang);
        }
        return Ok(());
    }
    let name = (name != "auto").then_some(name);
    engine.set_voice(name).await
}

/// Print AI messages as they arrive, streamed replies token by token, plus
/// voice status lines.
async fn print_transcript(mut snapshots: watch::Receiver<Arc<SessionSnapshot>>) {
    let mut session_id = String::new();
    let mut printed = 0;
    let mut partial: Option<(MessageId, usize)> = None;
    let mut status: Option<String> = None;

    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.session_id != session_id {
            session_id = snapshot.session_id.clone();
            printed = 0;
            partial = None;
        }

        let speaker = snapshot
            .active_role
            .as_ref()
            .map(|r| r.name.as_str())
            .unwrap_or("AI");
        let mut stdout = std::io::stdout();
        for message in snapshot.messages.iter().filter(move |m| m.id > printed) {
            let Some(text) = message.text().filter(|_| message.sender == Sender::Ai) else {
                printed = message.id;
                continue;
            };
            let shown = match partial {
                Some((id, len)) if id == message.id => len,
                _ => {
                    print!("{speaker}: ");
                    0
                }
            };
            print!("{}", text.get(shown..).unwrap_or_default());
            if snapshot.streaming == Some(message.id) {
                partial = Some((message.id, text.len()));
                break;
            }
            println!();
            partial = None;
            printed = message.id;
        }
        let _ = stdout.flush();

        if snapshot.status != status {
            if let Some(line) = &snapshot.status {
                println!("  [{line}]");
            }
            status = snapshot.status.clone();
        }
    }
}
