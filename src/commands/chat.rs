//! Chat command - interactive session with one trusted peer.
//!
//! Lines typed at the prompt are sent as chat messages; lines starting with
//! `/` are commands (see `/help`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

use whisperlink::chat::transport::{DefaultDialer, Dialer};
use whisperlink::chat::{ChatConfig, ChatEvent, Connection, ConnectionState, TcpDialer, TcpListener};
use whisperlink::trust::parse_fingerprint;

use super::{load_identity, open_trust_store, CommandExecutor};

/// Chat with a trusted peer.
///
/// Either wait for a peer with --listen, or dial one with
/// --connect <ENDPOINT> <FINGERPRINT>. Both can be combined: while
/// listening you can still dial out with /connect.
#[derive(Args, Debug)]
pub struct ChatCommand {
    /// Accept inbound connections from trusted peers
    #[arg(short, long)]
    pub listen: bool,

    /// Dial a trusted peer
    #[arg(short, long, num_args = 2, value_names = ["ENDPOINT", "FINGERPRINT"])]
    pub connect: Option<Vec<String>>,

    /// Port to listen on, or to dial when the endpoint has none
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl CommandExecutor for ChatCommand {
    fn execute(&self) -> Result<()> {
        if !self.listen && self.connect.is_none() {
            bail!("Nothing to do: pass --listen or --connect <ENDPOINT> <FINGERPRINT>");
        }

        let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
        rt.block_on(self.run())
    }
}

impl ChatCommand {
    async fn run(&self) -> Result<()> {
        let config = ChatConfig::load().context("Failed to load config")?;
        let identity = Arc::new(load_identity()?);
        let trust = Arc::new(open_trust_store()?);
        let dialer = build_dialer(&config).await?;
        let listen_port = self.port.unwrap_or(config.listen_port);

        let (connection, events) = Connection::with_dialer(identity, trust, config, dialer)
            .context("Invalid chat configuration")?;
        let commands = CommandTable::new(SLASH_COMMANDS)?;

        println!("Your fingerprint: {}", connection.fingerprint());

        let printer = tokio::spawn(print_events(events));

        if self.listen {
            let listener = TcpListener::bind(("0.0.0.0", listen_port))
                .await
                .with_context(|| format!("Failed to listen on port {}", listen_port))?;
            println!("Listening on port {}", listen_port);
            let server = connection.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(listener).await {
                    warn!(error = %e, "listener stopped");
                }
            });
        }

        if let Some(target) = &self.connect {
            if let [endpoint, fingerprint] = target.as_slice() {
                connect_to(&connection, endpoint, fingerprint, self.port).await;
            }
        }

        println!("Type /help for commands.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read input")? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('/') {
                match commands.parse(line) {
                    Ok((action, args)) => {
                        if !run_action(&connection, &commands, action, &args).await {
                            break;
                        }
                    }
                    Err(message) => println!("{}", message),
                }
                continue;
            }

            if let Err(e) = connection.send_chat_message(line).await {
                println!("! {}", e);
            }
        }

        if connection.state() == ConnectionState::Connected {
            let _ = connection.disconnect().await;
        }
        printer.abort();
        Ok(())
    }
}

async fn build_dialer(config: &ChatConfig) -> Result<Arc<dyn Dialer>> {
    let dialer = DefaultDialer::new(TcpDialer::from_config(config));

    #[cfg(feature = "tor")]
    let dialer = if config.tor_enabled {
        use whisperlink::chat::transport::TorDialer;

        let base = whisperlink::chat::config::base_dir()
            .context("Unable to determine the config directory")?;
        println!("Bootstrapping Tor...");
        let tor = TorDialer::bootstrap(&base)
            .await
            .context("Failed to bootstrap Tor")?;
        dialer.with_tor(Arc::new(tor))
    } else {
        dialer
    };

    #[cfg(not(feature = "tor"))]
    if config.tor_enabled {
        warn!("tor_enabled is set but this build has no Tor support");
    }

    Ok(dialer.into_shared())
}

async fn connect_to(connection: &Connection, endpoint: &str, fingerprint: &str, port: Option<u16>) {
    let fingerprint = match parse_fingerprint(fingerprint) {
        Ok(fp) => fp,
        Err(e) => {
            println!("! {}", e);
            return;
        }
    };
    println!("Connecting to {}...", endpoint);
    if let Err(e) = connection.connect(endpoint, fingerprint, port).await {
        println!("! {}", e);
    }
}

/// What a slash command does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlashAction {
    Help,
    Status,
    Ping,
    Send,
    Connect,
    Disconnect,
    Hosts,
    Add,
    Remove,
    Rename,
    Fingerprint,
    Quit,
}

struct SlashCommand {
    name: &'static str,
    usage: &'static str,
    min_args: usize,
    action: SlashAction,
}

const SLASH_COMMANDS: &[SlashCommand] = &[
    SlashCommand { name: "help", usage: "/help", min_args: 0, action: SlashAction::Help },
    SlashCommand { name: "status", usage: "/status", min_args: 0, action: SlashAction::Status },
    SlashCommand { name: "ping", usage: "/ping", min_args: 0, action: SlashAction::Ping },
    SlashCommand { name: "send", usage: "/send <path>", min_args: 1, action: SlashAction::Send },
    SlashCommand {
        name: "connect",
        usage: "/connect <endpoint> <fingerprint> [port]",
        min_args: 2,
        action: SlashAction::Connect,
    },
    SlashCommand { name: "disconnect", usage: "/disconnect", min_args: 0, action: SlashAction::Disconnect },
    SlashCommand { name: "hosts", usage: "/hosts", min_args: 0, action: SlashAction::Hosts },
    SlashCommand { name: "add", usage: "/add <endpoint> <fingerprint>", min_args: 2, action: SlashAction::Add },
    SlashCommand { name: "remove", usage: "/remove <endpoint>", min_args: 1, action: SlashAction::Remove },
    SlashCommand {
        name: "rename",
        usage: "/rename <fingerprint> <name>",
        min_args: 2,
        action: SlashAction::Rename,
    },
    SlashCommand { name: "fingerprint", usage: "/fingerprint", min_args: 0, action: SlashAction::Fingerprint },
    SlashCommand { name: "quit", usage: "/quit", min_args: 0, action: SlashAction::Quit },
];

/// Slash commands by name. Built once at start-up; duplicate names are an error.
struct CommandTable {
    commands: &'static [SlashCommand],
    by_name: HashMap<&'static str, usize>,
}

impl CommandTable {
    fn new(commands: &'static [SlashCommand]) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(commands.len());
        for (index, command) in commands.iter().enumerate() {
            if by_name.insert(command.name, index).is_some() {
                bail!("Duplicate chat command: /{}", command.name);
            }
        }
        Ok(Self { commands, by_name })
    }

    /// Split `/name arg...` and check the argument count.
    fn parse<'a>(&self, line: &'a str) -> Result<(SlashAction, Vec<&'a str>), String> {
        let mut parts = line.trim_start_matches('/').split_whitespace();
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        let command = self
            .by_name
            .get(name)
            .map(|&index| &self.commands[index])
            .ok_or_else(|| format!("Unknown command: /{} (try /help)", name))?;

        if args.len() < command.min_args {
            return Err(format!("Usage: {}", command.usage));
        }
        Ok((command.action, args))
    }

    fn usages(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.iter().map(|c| c.usage)
    }
}

/// Run one slash command. Returns `false` when the session should end.
async fn run_action(
    connection: &Connection,
    table: &CommandTable,
    action: SlashAction,
    args: &[&str],
) -> bool {
    let result = match action {
        SlashAction::Help => {
            for usage in table.usages() {
                println!("  {}", usage);
            }
            Ok(())
        }
        SlashAction::Status => {
            print_status(connection);
            Ok(())
        }
        SlashAction::Ping => connection
            .ping()
            .await
            .map(|rtt| println!("pong in {} ms", rtt.as_millis())),
        SlashAction::Send => {
            let path = args.join(" ");
            connection
                .send_file(Path::new(&path))
                .await
                .map(|file_id| println!("sent {} ({})", path, file_id))
        }
        SlashAction::Connect => {
            let port = match args.get(2).map(|p| p.parse::<u16>()) {
                Some(Ok(port)) => Some(port),
                Some(Err(_)) => {
                    println!("! invalid port: {}", args[2]);
                    return true;
                }
                None => None,
            };
            connect_to(connection, args[0], args[1], port).await;
            Ok(())
        }
        SlashAction::Disconnect => connection.disconnect().await,
        SlashAction::Hosts => {
            let hosts = connection.list_hosts();
            if hosts.is_empty() {
                println!("No trusted hosts.");
            }
            for entry in hosts {
                println!("  {:<16} {:<32} {}", entry.label(), entry.endpoint, entry.fingerprint);
            }
            Ok(())
        }
        SlashAction::Add => connection
            .add_host(args[0], args[1])
            .map(|entry| println!("trusted {} at {}", entry.label(), entry.endpoint)),
        SlashAction::Remove => connection
            .remove_host(args[0])
            .map(|entry| println!("removed {}", entry.label())),
        SlashAction::Rename => {
            let name = args[1..].join(" ");
            connection
                .rename_host(args[0], &name)
                .map(|()| println!("renamed to '{}'", name))
        }
        SlashAction::Fingerprint => {
            println!("{}", connection.fingerprint());
            Ok(())
        }
        SlashAction::Quit => return false,
    };

    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

fn print_status(connection: &Connection) {
    let info = connection.status();
    println!("state:    {:?}", info.state);
    if let Some(label) = &info.peer_label {
        println!("peer:     {}", label);
    }
    if let Some(fp) = &info.peer_fingerprint {
        println!("          {}", fp);
    }
    if let Some(endpoint) = &info.endpoint {
        println!("endpoint: {}", endpoint);
    }
    if let Some(direction) = info.direction {
        println!("opened:   {:?}", direction);
    }
    if let Some(at) = info.established_at {
        println!("uptime:   {}s", at.elapsed().as_secs());
    }
    println!("rekeys:   {}", info.rekeys);
    println!("messages: {} sent, {} received", info.messages_sent, info.messages_received);
}

async fn print_events(mut events: UnboundedReceiver<ChatEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Connected { peer, label, endpoint } => {
                println!("* connected to {} at {} ({})", label, endpoint, peer.short());
            }
            ChatEvent::Message { from, text } => println!("<{}> {}", from, text),
            ChatEvent::FileOffered { file_id, file_name, size } => {
                println!("* receiving {} ({} bytes) [{}]", file_name, size, file_id);
            }
            ChatEvent::FileProgress { file_id, received, total } => {
                println!("* [{}] {}/{} chunks", file_id, received, total);
            }
            ChatEvent::FileReceived { file_id, path, size } => {
                println!("* [{}] saved {} ({} bytes)", file_id, path.display(), size);
            }
            ChatEvent::FileSent { file_id } => println!("* [{}] delivered", file_id),
            ChatEvent::FileFailed { file_id, error } => {
                println!("! [{}] transfer failed: {}", file_id, error);
            }
            ChatEvent::Rekeyed { generation } => println!("* session keys rotated ({})", generation),
            ChatEvent::Disconnected { reason } => println!("* {}", reason),
        }
    }
}
