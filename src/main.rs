use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use log::{debug, info, LevelFilter};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use parley::utils;
use parley::{ContactStatus, EngineConfig, EngineEvent, XmppEngine};

/// Command line arguments for Parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Parley: a small XMPP chat client.",
    long_about = "Parley talks to an XMPP server for one-to-one chat.\n\n\
    Credentials come from --username/--password or the XMPP_USERNAME and XMPP_PASSWORD\n\
    environment variables. Server settings come from the config file and XMPP_DOMAIN,\n\
    XMPP_SERVICE, XMPP_CONNECT_TIMEOUT_MS and XMPP_REQUEST_TIMEOUT_MS."
)]
struct Args {
    /// Config file, defaults to <config dir>/parley/config.json
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(short, long, global = true)]
    username: Option<String>,

    #[arg(short, long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the account on the configured domain
    Register,
    /// Print the roster
    Contacts,
    /// Send one message and exit
    Send {
        to: String,
        message: Vec<String>,
    },
    /// Print incoming events until interrupted
    Listen {
        /// Mark each conversation as read after printing it
        #[arg(long)]
        mark_read: bool,
    },
}

fn credentials(args: &Args) -> Result<(String, String)> {
    let username = args
        .username
        .clone()
        .or_else(|| env::var("XMPP_USERNAME").ok())
        .ok_or_else(|| anyhow!("no username: pass --username or set XMPP_USERNAME"))?;

    let password = match args.password.clone().or_else(|| env::var("XMPP_PASSWORD").ok()) {
        Some(password) => password,
        None => {
            eprintln!("Enter password for {}:", username);
            utils::read_line()?
        }
    };
    Ok((username, password))
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let path = match path {
        Some(path) => path.clone(),
        None => EngineConfig::default_path()?,
    };
    let mut config = EngineConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_env();
    debug!("Using config: {:?}", config);
    Ok(config)
}

async fn connect(engine: &XmppEngine, username: &str, password: &str) -> Result<()> {
    let mut events = engine.subscribe();
    if engine.connect(username, password).await {
        engine.unsubscribe(events.id());
        return Ok(());
    }
    // The reason was published as an event
    while let Some(event) = events.try_recv() {
        if let EngineEvent::Error(kind, message) = event {
            bail!("Could not connect as {} ({:?}): {}", username, kind, message);
        }
    }
    bail!("Could not connect as {}", username)
}

fn status_label(status: ContactStatus) -> &'static str {
    match status {
        ContactStatus::Online => "online",
        ContactStatus::Away => "away",
        ContactStatus::Offline => "offline",
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_ref())?;
    let (username, password) = credentials(&args)?;
    let engine = XmppEngine::with_config(config);

    match args.command {
        Command::Register => {
            let outcome = engine.register_account(&username, &password).await?;
            if outcome.already_existed {
                println!("{} already exists", outcome.account);
            } else {
                println!("Registered {} using {}", outcome.account, outcome.shape);
            }
            match outcome.verified {
                Some(true) => println!("Login with the new account succeeded"),
                Some(false) => println!("Warning: could not log in with the new account"),
                None => {}
            }
        }
        Command::Contacts => {
            connect(&engine, &username, &password).await?;
            let contacts = engine.get_contacts();
            if contacts.is_empty() {
                println!("No contacts");
            }
            for contact in contacts {
                println!(
                    "{:<32} {:<20} {:<8} unread: {}",
                    contact.id,
                    contact.name,
                    status_label(contact.status),
                    contact.unread_count
                );
            }
            engine.disconnect().await;
        }
        Command::Send { to, message } => {
            let text = message.join(" ");
            connect(&engine, &username, &password).await?;
            let sent = engine.send_message(&to, &text).await;
            engine.disconnect().await;
            let sent = sent?;
            println!("Sent {} to {}", sent.id, sent.recipient_id);
        }
        Command::Listen { mark_read } => {
            let mut events = engine.subscribe().into_stream();
            connect(&engine, &username, &password).await?;
            println!("Listening as {} (Ctrl-C to quit)", username);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, disconnecting");
                        break;
                    }
                    event = events.next() => {
                        let Some(event) = event else { break };
                        match event {
                            EngineEvent::Message(message) if message.is_inbound() => {
                                println!(
                                    "[{}] {}: {}",
                                    message.timestamp.format("%H:%M:%S"),
                                    message.sender_id,
                                    message.content
                                );
                                if mark_read {
                                    engine.mark_as_read(message.conversation_id.as_str()).await?;
                                }
                            }
                            EngineEvent::Presence(contact, status) => {
                                println!("* {} is now {}", contact, status_label(status));
                            }
                            EngineEvent::SubscriptionRequest(contact) => {
                                println!("* {} wants to see your presence", contact);
                            }
                            EngineEvent::Warning(kind, message) => {
                                println!("! {:?}: {}", kind, message);
                            }
                            EngineEvent::Error(kind, message) => {
                                println!("! {:?}: {}", kind, message);
                            }
                            EngineEvent::Disconnected => {
                                println!("Disconnected");
                                break;
                            }
                            other => debug!("Event: {:?}", other),
                        }
                    }
                }
            }
            tokio::time::timeout(Duration::from_secs(5), engine.disconnect())
                .await
                .ok();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let log_file = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_file, level)?;
    info!("System information: {} {}", env::consts::OS, env::consts::ARCH);

    run(args).await
}
