use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{CredentialSource, CredentialStore, SolarSshConfig};
use crate::logging::{LogConfig, LogLevel};

#[derive(Parser)]
#[command(name = "solarssh")]
#[command(about = "Terminal client for SolarSSH remote sessions to SolarNode devices")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open an interactive SolarSSH session
    Connect {
        /// SolarNode ID to connect to
        #[arg(long)]
        node_id: Option<u64>,
        /// SolarNet API token id
        #[arg(long)]
        token: Option<String>,
        /// Terminal columns reported to the node
        #[arg(long)]
        cols: Option<u16>,
        /// Terminal lines reported to the node
        #[arg(long)]
        lines: Option<u16>,
        /// Write logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
        log_level: LogLevel,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
    /// Store a SolarNet API token (the secret is prompted for)
    Login {
        #[arg(long)]
        token: String,
    },
    /// Delete the stored API token
    Logout,
    /// Print the endpoint URLs resolved from configuration
    Urls {
        /// Include session-specific URLs for this session id
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        node_id: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show resolved configuration with secrets masked
    Show,
    /// Update values in config.toml
    Set {
        #[arg(long)]
        node_id: Option<u64>,
        #[arg(long)]
        sn_host: Option<String>,
        #[arg(long)]
        ssh_host: Option<String>,
        #[arg(long)]
        ssh_path: Option<String>,
        #[arg(long)]
        tls: Option<bool>,
    },
}

impl Commands {
    /// Logging setup for this command.
    pub fn log_config(&self, config: &SolarSshConfig) -> LogConfig {
        match self {
            Commands::Connect {
                log_file,
                log_level,
                ..
            } => LogConfig {
                level: *log_level,
                file: log_file.clone().or_else(|| config.log_file.clone()),
                interactive: true,
            },
            _ => LogConfig::default(),
        }
    }
}

fn resolve_node_id(flag: Option<u64>, config: &SolarSshConfig) -> Result<u64> {
    flag.or(config.node_id).ok_or_else(|| {
        anyhow!(
            "No SolarNode ID given. Pass --node-id, set SOLARSSH_NODE_ID, or run `solarssh config set --node-id <ID>`"
        )
    })
}

fn prompt_secret(token: &str) -> Result<String> {
    let secret = dialoguer::Password::new()
        .with_prompt(format!("Secret for token {}", token))
        .interact()?;
    Ok(secret)
}

pub async fn handle_cli_command(command: Commands, mut config: SolarSshConfig) -> Result<()> {
    match command {
        Commands::Connect {
            node_id,
            token,
            cols,
            lines,
            ..
        } => {
            let node_id = resolve_node_id(node_id, &config)?;
            if let Some(token) = token {
                if config.token.as_deref() != Some(token.as_str()) {
                    config.secret = None;
                }
                config.token = Some(token);
                config.credential_source = CredentialSource::CommandLine;
            }
            let token = config.token.clone().ok_or_else(|| {
                anyhow!("No SolarNet token configured. Pass --token, set SN_TOKEN, or run `solarssh login --token <TOKEN>`")
            })?;
            let secret = match config.secret.clone() {
                Some(secret) => secret,
                None => prompt_secret(&token)?,
            };

            let settings = crate::terminal::detect_settings(
                cols.or(config.cols),
                lines.or(config.lines),
            );

            crate::runtime::run_session(crate::runtime::SessionOptions {
                urls: config.url_helper(node_id),
                settings,
                token,
                secret,
            })
            .await
        }
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                println!("{}", config.display_masked());
                Ok(())
            }
            ConfigCommands::Set {
                node_id,
                sn_host,
                ssh_host,
                ssh_path,
                tls,
            } => {
                let mut file_config = SolarSshConfig::load_from(&SolarSshConfig::config_path())?;
                if node_id.is_some() {
                    file_config.node_id = node_id;
                }
                if sn_host.is_some() {
                    file_config.sn_host = sn_host;
                }
                if ssh_host.is_some() {
                    file_config.ssh_host = ssh_host;
                }
                if ssh_path.is_some() {
                    file_config.ssh_path = ssh_path;
                }
                if tls.is_some() {
                    file_config.tls = tls;
                }
                file_config.save_to_disk()?;
                println!("Saved {}", SolarSshConfig::config_path().display());
                Ok(())
            }
        },
        Commands::Login { token } => {
            let secret = prompt_secret(&token)?;
            if secret.is_empty() {
                return Err(anyhow!("Token secret must not be empty"));
            }
            CredentialStore::save(&token, &secret)?;
            println!("Token {} saved.", token);
            Ok(())
        }
        Commands::Logout => {
            CredentialStore::delete()?;
            println!("Logged out. Stored token removed.");
            Ok(())
        }
        Commands::Urls {
            session_id,
            node_id,
        } => {
            let node_id = resolve_node_id(node_id, &config)?;
            let urls = config.url_helper(node_id);
            println!("SolarNet API:        {}", urls.sn_base_url());
            println!("Pending instructions: {}", urls.view_pending_instructions_url());
            println!("Node metadata:       {}", urls.view_node_metadata_url());
            println!("Create session:      {}", urls.create_session_url());
            if let Some(id) = session_id {
                println!("Start session:       {}", urls.start_session_url(&id));
                println!("Stop session:        {}", urls.stop_session_url(&id));
                println!("Terminal socket:     {}", urls.terminal_websocket_url(&id));
                println!("Setup GUI:           {}", urls.http_proxy_url(&id));
            }
            Ok(())
        }
    }
}
