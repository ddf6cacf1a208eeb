use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use pocketchat_core_sdk::prelude::*;
use pocketchat_core_sdk::secrets;

/// CLI entry: one screen, one message in, first assistant reply out.
#[derive(Parser, Debug)]
#[command(name = "pocketchat", version, about = "PocketChat single-screen chat client")]
struct Cli {
    /// Database file; the master key lives next to it as `<db>.key`.
    #[arg(long, global = true, default_value = db::DEFAULT_DB_PATH)]
    db: PathBuf,

    /// API base address.
    #[arg(long, global = true, default_value = llm::DEFAULT_API_BASE)]
    api_base: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the encrypted store (empty placeholder credential) and save settings.
    Init {
        #[arg(long, default_value_t = false)]
        enable_telemetry: bool,
    },

    /// Store the API key in the encrypted store.
    SetKey {
        #[arg(long)]
        api_key: String,
    },

    /// Send one message and print the reply.
    Send {
        #[arg(long)]
        prompt: String,
    },

    /// Interactive screen: every line typed is sent; replies show as they arrive.
    Chat,

    /// Serve the chat screen over HTTP.
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::new(&cli.db, Some(cli.api_base.as_str()));
    let store = config.open_store().context("open secret store failed")?;
    config.init_telemetry().context("load telemetry settings failed")?;

    match cli.command {
        Commands::Init { enable_telemetry } => {
            config
                .set_telemetry_enabled(enable_telemetry)
                .context("save telemetry failed")?;
            println!(
                "Initialized {} (key file {}, telemetry={})",
                config.db_path.display(),
                config.key_path.display(),
                enable_telemetry
            );
        }
        Commands::SetKey { api_key } => {
            secrets::provision(&*store, api_key.trim()).context("save api key failed")?;
            println!("Saved api key to {}", secrets::PREFS_NAME);
        }
        Commands::Send { prompt } => {
            let client = config.chat_client(store).context("create client failed")?;
            match client.send(&prompt).await {
                SendOutcome::Success { text } => println!("{}", text),
                other => {
                    if let Some(notice) = ChatScreen::new().apply(other) {
                        bail!("{}", notice);
                    }
                }
            }
        }
        Commands::Chat => {
            let client = config.chat_client(store).context("create client failed")?;
            run_chat(client).await?;
        }
        Commands::Serve { addr } => {
            let client = config.chat_client(store).context("create client failed")?;
            let (session, mut events) = ChatSession::new(client);
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if let ScreenEvent::Notice(notice) = event {
                        tracing::info!("{}", notice);
                    }
                }
            });
            server::run(&addr, session).await?;
        }
    }

    Ok(())
}

/**
 * \brief Read lines from stdin and submit each one; print completions as they land.
 * \details Sends overlap freely; whatever completes last is what the screen shows.
 */
async fn run_chat(client: ChatClient) -> Result<()> {
    let (session, mut events) = ChatSession::new(client);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = Vec::new();

    println!("Type a message and press Enter. Ctrl-D to quit.");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("read stdin failed")? {
                    Some(text) if text.trim().is_empty() => continue,
                    Some(text) => {
                        tracing::debug!("send clicked");
                        pending.retain(|h: &tokio::task::JoinHandle<ScreenEvent>| !h.is_finished());
                        pending.push(session.submit(text));
                    }
                    None => break,
                }
            }
            Some(event) = events.recv() => print_event(&event),
        }
    }

    // Let in-flight sends land before exiting.
    for handle in pending {
        if let Err(err) = handle.await {
            tracing::warn!("send task failed: {}", err);
        }
    }
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    Ok(())
}

fn print_event(event: &ScreenEvent) {
    match event {
        ScreenEvent::Display(text) => println!("{}", text),
        ScreenEvent::Notice(notice) => eprintln!("! {}", notice),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_help_text_is_plain() {
        let mut cmd = Cli::command();
        let help = cmd.render_long_help().to_string();
        assert!(!help.contains("\\brief"), "{}", help);
        for sub in cmd.get_subcommands() {
            let about = sub.get_about().map(|a| a.to_string()).unwrap_or_default();
            assert!(!about.is_empty(), "{} has no help", sub.get_name());
            assert!(!about.contains("\\brief"), "{}: {}", sub.get_name(), about);
        }
    }
}
