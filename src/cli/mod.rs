//! CLI commands for Handoff using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    generate_jwt_secret, get_settings_path, load_settings_from, save_settings_to, validate_settings,
    Settings,
};
use crate::core::models::{parse_status_list, Agent, ChatFilters, Role};
use crate::core::routing::rank_queue;
use crate::identity::JwtGateway;
use crate::store::{RecordStore, SqliteStore};
use crate::sweeper::ExpirySweeper;
use crate::web::build_facade;

/// Handoff - conversation routing and presence engine for support chat.
#[derive(Parser, Debug)]
#[command(name = "handoff")]
#[command(version = "0.1.0")]
#[command(about = "Handoff - assign, transfer and track live support conversations", long_about = None)]
pub struct Commands {
    /// Settings file (default: ~/.handoff/settings.json)
    #[arg(long, global = true, env = "HANDOFF_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, env = "HANDOFF_DB")]
    pub db: Option<PathBuf>,

    /// Secret used to sign and verify agent tokens
    #[arg(long, global = true, env = "HANDOFF_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Emit console logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP API and the typing sweeper
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "HANDOFF_PORT")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,
    },

    /// Write default settings with a fresh token secret and create the database
    Init {
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },

    /// Agent management
    #[command(subcommand)]
    Agent(AgentCommand),

    /// Issue a bearer token for an agent
    Token {
        /// Agent ID
        agent_id: String,
    },

    /// Show the ranked unassigned queue
    Queue {
        /// Comma-separated statuses (default: OPEN)
        #[arg(long)]
        status: Option<String>,

        /// Only this priority
        #[arg(long)]
        priority: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Delete expired typing indicators once
    Sweep,

    /// Merge customers that share an email address
    MergeDuplicates {
        /// Only list the duplicate groups
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Add a new agent
    Add {
        /// Display name
        name: String,

        /// Email address
        email: String,

        /// Grant supervisor permissions
        #[arg(long)]
        supervisor: bool,
    },

    /// Show an agent
    Show {
        /// Agent ID
        agent_id: String,
    },

    /// Disable an agent account
    Disable {
        /// Agent ID
        agent_id: String,
    },
}

impl Commands {
    fn settings_path(&self) -> Result<PathBuf> {
        match &self.settings {
            Some(path) => Ok(path.clone()),
            None => Ok(get_settings_path()?),
        }
    }

    /// Settings from disk (defaults when the file is absent) with CLI and
    /// environment overrides applied.
    pub fn load_settings(&self) -> Result<Settings> {
        let path = self.settings_path()?;
        let mut settings = if path.exists() {
            load_settings_from(&path)?
        } else {
            Settings::default()
        };
        self.apply_overrides(&mut settings);
        if matches!(self.command, Command::Init { .. }) && settings.auth.jwt_secret.trim().is_empty() {
            settings.auth.jwt_secret = generate_jwt_secret();
        }
        validate_settings(&settings)?;
        Ok(settings)
    }

    fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(db) = &self.db {
            settings.database.path = db.clone();
        }
        if let Some(secret) = &self.jwt_secret {
            settings.auth.jwt_secret = secret.clone();
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        if let Command::Serve { port, host } = &self.command {
            if let Some(port) = port {
                settings.web.port = *port;
            }
            if let Some(host) = host {
                settings.web.host = host.clone();
            }
        }
    }

    /// Run the command.
    pub async fn run(&self, settings: Settings) -> Result<()> {
        match &self.command {
            Command::Serve { .. } => cmd_serve(settings).await,
            Command::Init { force } => cmd_init(&self.settings_path()?, settings, *force).await,
            Command::Agent(cmd) => cmd_agent(cmd, &settings).await,
            Command::Token { agent_id } => cmd_token(agent_id, &settings).await,
            Command::Queue {
                status,
                priority,
                limit,
            } => cmd_queue(status.as_deref(), priority.as_deref(), *limit, &settings).await,
            Command::Sweep => cmd_sweep(&settings).await,
            Command::MergeDuplicates { dry_run } => cmd_merge_duplicates(*dry_run, &settings).await,
        }
    }
}

fn open_store(settings: &Settings) -> Result<SqliteStore> {
    let path = settings.database_path()?;
    Ok(SqliteStore::open(
        &path,
        Duration::from_millis(settings.database.busy_timeout_ms),
    )?)
}

// Command implementations

async fn cmd_serve(settings: Settings) -> Result<()> {
    let port = settings.web.port;
    println!("Starting Handoff on {}:{}...", settings.web.host, port);
    println!("API endpoints:");
    println!("  http://localhost:{}/api/chats", port);
    println!("  http://localhost:{}/api/chats/unassigned", port);
    println!("  http://localhost:{}/health", port);
    println!();
    println!("Press Ctrl+C to stop");

    crate::web::run_server(settings)
        .await
        .map_err(|e| anyhow::anyhow!("Web server error: {}", e))
}

async fn cmd_init(path: &std::path::Path, settings: Settings, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Settings already exist at {} (use --force to overwrite)", path.display());
    } else {
        save_settings_to(&settings, path)?;
        println!("✓ Wrote settings to {}", path.display());
    }

    open_store(&settings)?;
    println!("✓ Database ready at {}", settings.database_path()?.display());
    println!();
    println!("Next: handoff agent add <name> <email>");
    Ok(())
}

async fn cmd_agent(cmd: &AgentCommand, settings: &Settings) -> Result<()> {
    let store = open_store(settings)?;

    match cmd {
        AgentCommand::Add {
            name,
            email,
            supervisor,
        } => {
            let role = if *supervisor {
                Role::supervisor()
            } else {
                Role::agent()
            };
            let agent = Agent::new(name.trim(), email.trim(), role);
            store.upsert_agent(&agent).await?;
            println!("✓ Added agent {} ({})", agent.name, agent.id);
            println!("  role: {}", agent.role.name);
        }
        AgentCommand::Show { agent_id } => {
            let agent = store
                .find_agent(agent_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Agent '{}' not found", agent_id))?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
        AgentCommand::Disable { agent_id } => {
            let mut agent = store
                .find_agent(agent_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Agent '{}' not found", agent_id))?;
            agent.is_active = false;
            store.upsert_agent(&agent).await?;
            println!("✓ Disabled agent {}", agent_id);
        }
    }
    Ok(())
}

async fn cmd_token(agent_id: &str, settings: &Settings) -> Result<()> {
    let store = open_store(settings)?;
    let agent = store
        .find_agent(agent_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Agent '{}' not found", agent_id))?;
    if !agent.is_active {
        anyhow::bail!("Agent '{}' is disabled", agent_id);
    }

    let gateway = JwtGateway::new(&settings.auth.jwt_secret, settings.auth.token_ttl_secs);
    println!("{}", gateway.issue(&agent.id, &agent.name)?);
    Ok(())
}

async fn cmd_queue(status: Option<&str>, priority: Option<&str>, limit: u32, settings: &Settings) -> Result<()> {
    let facade = build_facade(settings)?;

    let mut filters = ChatFilters::unassigned().with_page(limit.max(1), 0);
    if let Some(raw) = status {
        filters = filters.with_status(parse_status_list(raw)?);
    }
    if let Some(raw) = priority {
        filters = filters.with_priority(raw.parse()?);
    }

    let now = facade.clock().now();
    let mut entries = facade.assignments().list_unassigned_chats(&filters, now).await?;
    rank_queue(&mut entries);
    entries.truncate(filters.limit as usize);

    if entries.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{:<28} {:<8} {:>5} {:>9} {:>5}", "CHAT", "PRIORITY", "SCORE", "WAITING", "MSGS");
    for entry in entries {
        println!(
            "{:<28} {:<8} {:>5} {:>9} {:>5}",
            entry.chat.id,
            entry.chat.priority,
            entry.priority_score,
            entry.waiting_time_formatted,
            entry.chat.message_count
        );
    }
    Ok(())
}

async fn cmd_sweep(settings: &Settings) -> Result<()> {
    let facade = build_facade(settings)?;
    let sweeper = ExpirySweeper::new(
        Arc::clone(&facade),
        Duration::from_secs(settings.presence.sweep_interval_secs),
    );
    let removed = sweeper.run_once().await?;
    println!("✓ Removed {} expired typing indicators", removed);
    Ok(())
}

async fn cmd_merge_duplicates(dry_run: bool, settings: &Settings) -> Result<()> {
    let facade = build_facade(settings)?;
    let assignments = facade.assignments();

    if dry_run {
        let groups = assignments.find_duplicate_customers().await?;
        if groups.is_empty() {
            println!("No duplicate customers.");
        }
        for group in groups {
            let ids: Vec<&str> = group.iter().map(|c| c.id.as_str()).collect();
            let email = group
                .first()
                .and_then(|c| c.email.as_deref())
                .unwrap_or("-");
            println!("{}: {}", email, ids.join(", "));
        }
        return Ok(());
    }

    let outcomes = assignments.merge_duplicates().await?;
    for outcome in &outcomes {
        println!(
            "✓ {} -> {} ({} messages, {} chats, {} sessions)",
            outcome.merged_customer_id,
            outcome.kept_customer_id,
            outcome.report.messages_moved,
            outcome.report.conversations_moved,
            outcome.report.sessions_moved
        );
    }
    println!("Merged {} duplicate customers", outcomes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_overrides_apply_to_settings() {
        let dir = TempDir::new().unwrap();
        let settings_path = dir.path().join("settings.json");
        let args = Commands::try_parse_from([
            "handoff",
            "--settings",
            settings_path.to_str().unwrap(),
            "--db",
            "/tmp/handoff-test.db",
            "--jwt-secret",
            "0123456789abcdef-s3cret",
            "serve",
            "--port",
            "4000",
        ])
        .unwrap();

        let settings = args.load_settings().unwrap();
        assert_eq!(settings.database.path, PathBuf::from("/tmp/handoff-test.db"));
        assert_eq!(settings.auth.jwt_secret, "0123456789abcdef-s3cret");
        assert_eq!(settings.web.port, 4000);
    }

    #[test]
    fn test_settings_file_is_read() {
        let dir = TempDir::new().unwrap();
        let settings_path = dir.path().join("settings.json");
        let mut on_disk = Settings::default();
        on_disk.auth.jwt_secret = generate_jwt_secret();
        on_disk.web.port = 5050;
        save_settings_to(&on_disk, &settings_path).unwrap();

        let args = Commands::try_parse_from([
            "handoff",
            "--settings",
            settings_path.to_str().unwrap(),
            "sweep",
        ])
        .unwrap();
        assert_eq!(args.load_settings().unwrap().web.port, 5050);
    }

    #[test]
    fn test_serve_refuses_to_start_without_secret() {
        let dir = TempDir::new().unwrap();
        let settings_path = dir.path().join("missing.json");
        let args = Commands::try_parse_from([
            "handoff",
            "--settings",
            settings_path.to_str().unwrap(),
            "serve",
        ])
        .unwrap();
        assert!(args.load_settings().is_err());

        let args = Commands::try_parse_from([
            "handoff",
            "--settings",
            settings_path.to_str().unwrap(),
            "--jwt-secret",
            "handoff-secret-key-change-in-production",
            "token",
            "a1",
        ])
        .unwrap();
        assert!(args.load_settings().is_err());
    }

    #[tokio::test]
    async fn test_init_writes_random_secret() {
        let dir = TempDir::new().unwrap();
        let settings_path = dir.path().join("settings.json");
        let db_path = dir.path().join("handoff.db");
        let parse = || {
            Commands::try_parse_from([
                "handoff",
                "--settings",
                settings_path.to_str().unwrap(),
                "--db",
                db_path.to_str().unwrap(),
                "init",
            ])
            .unwrap()
        };

        let args = parse();
        let settings = args.load_settings().unwrap();
        args.run(settings.clone()).await.unwrap();

        let on_disk = load_settings_from(&settings_path).unwrap();
        assert_eq!(on_disk.auth.jwt_secret, settings.auth.jwt_secret);
        assert!(validate_settings(&on_disk).is_ok());

        let other = TempDir::new().unwrap();
        let other_args = Commands::try_parse_from([
            "handoff",
            "--settings",
            other.path().join("settings.json").to_str().unwrap(),
            "init",
        ])
        .unwrap();
        assert_ne!(other_args.load_settings().unwrap().auth.jwt_secret, on_disk.auth.jwt_secret);
    }

    #[test]
    fn test_subcommands_parse() {
        let args = Commands::try_parse_from(["handoff", "agent", "add", "Ana", "ana@example.com", "--supervisor"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Agent(AgentCommand::Add { supervisor: true, .. })
        ));

        let args = Commands::try_parse_from(["handoff", "merge-duplicates", "--dry-run"]).unwrap();
        assert!(matches!(args.command, Command::MergeDuplicates { dry_run: true }));

        assert!(Commands::try_parse_from(["handoff", "queue", "--limit", "nope"]).is_err());
    }
}
