// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{path::PathBuf, sync::Arc, time::Duration};

use bitchat_core::{
    Chat, ChatDelegate, ChatOptions, Contact, ContactStatus, GossipEngine, Identity,
    JsonFileStore, NodeConfig, Server, SqlitePeerDb, from_address,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "bitchat")]
#[command(about = "Anonymous proof-of-work gated chat over a gossip overlay")]
struct Cli {
    /// Directory holding config.json, peers.db and the identity/contact files.
    #[arg(value_name = "DATA_DIR")]
    data_dir: PathBuf,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Seal identity secrets at rest with this passphrase.
    #[arg(long, value_name = "PASSPHRASE")]
    passphrase: Option<String>,
}

struct PrintDelegate;

impl ChatDelegate for PrintDelegate {
    fn received_message(&self, text: &str, _to: &Identity, from: &ContactStatus) {
        println!("{}: {}", from.contact.label, text);
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&cli.log_level)?,
    };
    if cli.log_json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    std::fs::create_dir_all(&cli.data_dir)?;
    let config = NodeConfig::load_or_create(cli.data_dir.join("config.json"))?;
    if config.use_upnp {
        warn!("use_upnp is set but port mapping is not supported; continuing without it");
    }
    let desired = config.desired_peer_count;
    let gossip = config.gossip.clone();

    let peer_db = SqlitePeerDb::open(cli.data_dir.join("peers.db"))?;
    let server = Server::new(config, peer_db);
    let engine = GossipEngine::start(server.clone(), gossip.clone()).await;
    let store = JsonFileStore::open(&cli.data_dir)?;
    let chat = Chat::start(
        Arc::clone(&engine),
        store,
        ChatOptions {
            pow_target_bits_per_kb: gossip.pow_target_bits_per_kb,
            passphrase: cli.passphrase.clone(),
        },
    )
    .await?;
    chat.set_delegate(Arc::new(PrintDelegate)).await;

    let addr = server.configure().await?;
    info!(%addr, data_dir = %cli.data_dir.display(), "node started");

    let reconnect = {
        let server = server.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECONNECT_INTERVAL);
            loop {
                ticker.tick().await;
                server.connect_to_peers(desired).await;
            }
        })
    };

    let result = run_prompt(&chat).await;

    reconnect.abort();
    engine.shutdown().await;
    server.close().await;
    result
}

fn print_help() {
    println!("commands:");
    println!("  new_ident LABEL            create an identity and make it current");
    println!("  new_contact LABEL ADDRESS  add a contact by address");
    println!("  id LABEL                   switch the current identity");
    println!("  send CONTACT MESSAGE       send MESSAGE from the current identity");
    println!("  list                       show identities and contacts");
    println!("  h                          this help");
    println!("  q                          quit");
}

async fn run_prompt(chat: &Chat) -> anyhow::Result<()> {
    let mut current = chat.identities().await.into_iter().next().map(|i| i.label);
    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let outcome = match command {
            "" => Ok(()),
            "q" => break,
            "h" => {
                print_help();
                Ok(())
            }
            "new_ident" => new_ident(chat, rest, &mut current).await,
            "new_contact" => new_contact(chat, rest).await,
            "id" => switch_identity(chat, rest, &mut current).await,
            "send" => send(chat, rest, current.as_deref()).await,
            "list" => {
                list(chat, current.as_deref()).await;
                Ok(())
            }
            other => Err(anyhow::anyhow!("unknown command '{other}', type h for help")),
        };
        if let Err(err) = outcome {
            println!("error: {err}");
        }
    }
    Ok(())
}

async fn new_ident(chat: &Chat, label: &str, current: &mut Option<String>) -> anyhow::Result<()> {
    if label.is_empty() {
        anyhow::bail!("usage: new_ident LABEL");
    }
    let identity = Identity::generate(label);
    let address = identity.address();
    chat.add_identity(identity).await?;
    println!("{label}: {address}");
    *current = Some(label.to_string());
    Ok(())
}

async fn new_contact(chat: &Chat, args: &str) -> anyhow::Result<()> {
    let Some((label, address)) = args.split_once(' ') else {
        anyhow::bail!("usage: new_contact LABEL ADDRESS");
    };
    let key = from_address(address)?;
    chat.add_contact(Contact::new(label, key)).await?;
    println!("added contact {label}");
    Ok(())
}

async fn switch_identity(
    chat: &Chat,
    label: &str,
    current: &mut Option<String>,
) -> anyhow::Result<()> {
    let identity = chat.get_identity(label).await?;
    println!("using {}: {}", identity.label, identity.address());
    *current = Some(identity.label);
    Ok(())
}

async fn send(chat: &Chat, args: &str, current: Option<&str>) -> anyhow::Result<()> {
    let Some(from) = current else {
        anyhow::bail!("no current identity; create one with new_ident");
    };
    let Some((contact, text)) = args.split_once(' ') else {
        anyhow::bail!("usage: send CONTACT MESSAGE");
    };
    let id = chat.send_message(text.trim(), contact, from).await?;
    println!("sent {id}");
    Ok(())
}

async fn list(chat: &Chat, current: Option<&str>) {
    println!("identities:");
    for identity in chat.identities().await {
        let marker = if current == Some(identity.label.as_str()) { "*" } else { " " };
        println!(" {marker} {}: {}", identity.label, identity.address());
    }
    println!("contacts:");
    for contact in chat.contacts().await {
        println!("   {}: {}", contact.label, contact.address());
    }
}
