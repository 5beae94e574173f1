//! fwvault - versioned firewall rule deployment
//!
//! Command-line front end for the [`fwvault`] engine. Every invocation loads
//! the state file, performs one operation and saves the state back when the
//! operation changed anything.
//!
//! # Usage
//!
//! ```bash
//! fwvault rule add --table filter --chain INPUT --action DROP --src 10.0.0.0/24 --priority 50
//! fwvault rule ls --status draft
//! fwvault rule edit 3 --priority 10 --override
//! fwvault deploy -m "block lab subnet"
//! fwvault history --limit 10
//! fwvault diff <from-version> <to-version>
//! fwvault rollback <version>
//! fwvault audit --severity error
//! fwvault status
//! ```

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use fwvault::audit::{AuditAction, AuditFilter, AuditLog, Severity};
use fwvault::command::{
    CreateRuleCommand, DeleteRuleCommand, DeployCommand, RollbackCommand, UpdateRuleCommand,
};
use fwvault::config::{self, EngineConfig};
use fwvault::core::backend::ConfiguredBackend;
use fwvault::core::deploy::DeployOutcome;
use fwvault::core::firewall::{Chain, Rule, RuleId, RulePatch, RuleSpec, RuleStatus, Table};
use fwvault::core::persist;
use fwvault::core::state::FirewallState;
use fwvault::core::store::RuleFilter;
use fwvault::core::versions::HistoryCursor;
use fwvault::utils::{self, truncate_string};
use fwvault::{Error, Firewall};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use uuid::Uuid;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "fwvault")]
#[command(version = build::PKG_VERSION)]
#[command(about = "Versioned firewall rules with deploy and rollback", long_about = None)]
struct Cli {
    /// State file (default: <state dir>/state.json)
    #[arg(long, global = true, value_name = "PATH")]
    state: Option<PathBuf>,
    /// Config file (default: <config dir>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Name recorded in the audit log (default: $USER)
    #[arg(long, global = true)]
    actor: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage rules in the working set
    #[command(subcommand)]
    Rule(RuleCommands),
    /// Snapshot the working set and apply it
    Deploy {
        /// Version description
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// Re-apply an earlier version as a new version
    Rollback {
        version: Uuid,
    },
    /// List versions, newest first
    History {
        #[arg(short, long)]
        limit: Option<usize>,
        /// Continue after this cursor, as printed by a previous page
        #[arg(long, value_name = "CREATED_AT,ID")]
        before: Option<HistoryCursor>,
    },
    /// Unified diff between two versions
    Diff {
        from: Uuid,
        to: Uuid,
    },
    /// Query the audit log, newest first
    Audit {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        severity: Option<Severity>,
        /// e.g. deploy_failed, rule_updated
        #[arg(long)]
        action: Option<AuditAction>,
        #[arg(long = "by")]
        by_actor: Option<String>,
    },
    /// Active version, pending changes and build info
    Status,
    /// Print a version (or the working set) as an iptables-save listing
    Export {
        #[arg(long)]
        version: Option<Uuid>,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    /// Add a DRAFT rule
    Add(RuleArgs),
    /// Change fields of a rule
    Edit {
        id: RuleId,
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        chain: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[command(flatten)]
        fields: EditArgs,
        /// Token from `rule ls` (defaults to the rule's current token)
        #[arg(long)]
        token: Option<DateTime<Utc>>,
        /// Allow editing an APPLIED rule
        #[arg(long = "override")]
        force: bool,
    },
    /// Delete a rule
    Rm {
        id: RuleId,
    },
    /// List rules in evaluation order
    Ls {
        #[arg(long)]
        table: Option<Table>,
        #[arg(long)]
        chain: Option<Chain>,
        #[arg(long)]
        status: Option<RuleStatus>,
        /// Matches addresses, ports, interfaces, protocol and comment
        #[arg(short, long)]
        search: Option<String>,
    },
    Enable {
        id: RuleId,
    },
    Disable {
        id: RuleId,
    },
}

#[derive(Args)]
struct RuleArgs {
    #[arg(long, default_value = "filter")]
    table: String,
    #[arg(long)]
    chain: String,
    #[arg(long)]
    action: String,
    #[command(flatten)]
    fields: EditArgs,
}

#[derive(Args, Default)]
struct EditArgs {
    #[arg(long)]
    priority: Option<i64>,
    #[arg(long = "in-iface")]
    in_interface: Option<String>,
    #[arg(long = "out-iface")]
    out_interface: Option<String>,
    #[arg(long)]
    src: Option<String>,
    #[arg(long)]
    dst: Option<String>,
    #[arg(long = "proto")]
    protocol: Option<String>,
    #[arg(long)]
    sport: Option<i64>,
    #[arg(long)]
    dport: Option<i64>,
    #[arg(long = "log-prefix")]
    log_prefix: Option<String>,
    #[arg(long)]
    disabled: bool,
}

impl RuleArgs {
    fn into_spec(self) -> RuleSpec {
        let f = self.fields;
        RuleSpec {
            priority: f.priority,
            in_interface: f.in_interface,
            out_interface: f.out_interface,
            src_ip: f.src,
            dst_ip: f.dst,
            protocol: f.protocol,
            src_port: f.sport,
            dst_port: f.dport,
            log_prefix: f.log_prefix,
            enabled: f.disabled.then_some(false),
            ..RuleSpec::new(&self.table, &self.chain, &self.action)
        }
    }
}

impl EditArgs {
    fn into_patch(self) -> RulePatch {
        RulePatch {
            priority: self.priority,
            in_interface: self.in_interface.map(Some),
            out_interface: self.out_interface.map(Some),
            src_ip: self.src.map(Some),
            dst_ip: self.dst.map(Some),
            protocol: self.protocol,
            src_port: self.sport.map(Some),
            dst_port: self.dport.map(Some),
            log_prefix: self.log_prefix.map(Some),
            enabled: self.disabled.then_some(false),
            ..RulePatch::default()
        }
    }
}

type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    let cli = Cli::parse();
    init_logging();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    if let Some(mut log_path) = utils::get_state_dir() {
        log_path.push("fwvault.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            tracing_subscriber::fmt()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
}

/// Loaded engine plus where to save it
struct Session {
    fw: Firewall<ConfiguredBackend>,
    config: EngineConfig,
    state_path: PathBuf,
}

impl Session {
    async fn open(cli: &Cli) -> CliResult<Self> {
        let config = match &cli.config {
            Some(path) => config::load_config_from(path).await,
            None => config::load_config().await,
        };

        let state_path = cli
            .state
            .clone()
            .or_else(persist::default_state_path)
            .ok_or("cannot determine state directory; pass --state")?;
        let state = persist::load_state(&state_path)
            .await?
            .unwrap_or_else(FirewallState::new);

        let audit = if config.audit_log_enabled {
            let dir = state_path.parent().unwrap_or_else(|| Path::new("."));
            AuditLog::open(dir.join("audit.log")).await?
        } else {
            AuditLog::in_memory()
        };

        let backend = ConfiguredBackend::from_config(&config.backend);
        let fw = Firewall::with_state(&config, backend, audit, state);
        Ok(Self {
            fw,
            config,
            state_path,
        })
    }

    async fn save(&self) -> CliResult<()> {
        persist::save_state(&self.state_path, &self.fw.snapshot_state().await).await?;
        Ok(())
    }

    /// Saves after `result` whether or not it succeeded; failed deploys are
    /// still recorded in history.
    async fn commit<T>(&self, result: fwvault::Result<T>) -> CliResult<T> {
        self.save().await?;
        Ok(result?)
    }
}

async fn handle_cli(cli: Cli) -> CliResult<()> {
    let session = Session::open(&cli).await?;
    let fw = &session.fw;
    let actor = cli
        .actor
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string());

    match cli.command {
        Commands::Rule(command) => handle_rule(&session, &actor, command).await?,
        Commands::Deploy { message } => {
            let outcome = session
                .commit(fw.deploy(DeployCommand::new(&actor, message)).await)
                .await?;
            print_outcome(&outcome);
        }
        Commands::Rollback { version } => {
            let outcome = session
                .commit(fw.rollback(RollbackCommand::new(&actor, version)).await)
                .await?;
            print_outcome(&outcome);
        }
        Commands::History { limit, before } => {
            let limit = limit.unwrap_or(session.config.history_page_size());
            let page = fw.history(limit, before.as_ref()).await;
            if page.versions.is_empty() {
                println!("No versions yet.");
            }
            for v in &page.versions {
                let marker = if v.is_active { "*" } else { " " };
                let origin = v
                    .rollback_of
                    .map(|from| format!(" (rollback of {from})"))
                    .unwrap_or_default();
                println!(
                    "{marker} {}  {}  {:>4} rules  {}  {}{}",
                    v.id,
                    v.short_hash(),
                    v.rules.len(),
                    v.created_at.format("%Y-%m-%d %H:%M:%S"),
                    truncate_string(&v.description, 50),
                    origin
                );
            }
            if let Some(next) = page.next {
                println!("(more versions: --before {next})");
            }
        }
        Commands::Diff { from, to } => {
            let diff = fw.diff(from, to).await?;
            if diff.is_empty() {
                println!("No differences.");
            } else {
                print!("{diff}");
            }
        }
        Commands::Audit {
            limit,
            severity,
            action,
            by_actor,
        } => {
            let filter = AuditFilter {
                severity,
                action,
                actor: by_actor,
                ..AuditFilter::default()
            };
            for entry in fw.audit().query(filter, limit) {
                let target = entry
                    .target
                    .map(|t| format!(" [{t}]"))
                    .unwrap_or_default();
                println!(
                    "{:>6}  {}  {:<7}  {:<18}  {}{}: {}",
                    entry.id,
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.severity,
                    entry.action,
                    entry.actor,
                    target,
                    entry.message
                );
            }
        }
        Commands::Status => {
            let status = fw.status().await;
            println!(
                "fwvault {} ({} built {})",
                build::PKG_VERSION,
                build::SHORT_COMMIT,
                build::BUILD_TIME
            );
            println!("Backend: {}", status.backend);
            println!("Phase: {}", status.phase);
            match &status.active_version {
                Some(v) => println!(
                    "Active version: {} ({} rules, hash {})",
                    v.id,
                    v.rule_count,
                    &v.hash[..v.hash.len().min(12)]
                ),
                None => println!("Active version: none"),
            }
            println!("Versions: {}", status.version_count);
            println!(
                "Rules: {} total ({} draft, {} pending, {} applied, {} disabled)",
                status.rules.total,
                status.rules.draft,
                status.rules.pending,
                status.rules.applied,
                status.rules.disabled
            );
            if status.has_undeployed_changes {
                println!("Working set has undeployed changes.");
            }
            if let Some(run) = &status.last_run {
                println!("Last run: {} - {}", run.result, run.message);
            }
            println!("Audit entries: {}", status.audit_entries);
        }
        Commands::Export { version } => {
            print!("{}", fw.export(version).await?);
        }
    }
    Ok(())
}

async fn handle_rule(session: &Session, actor: &str, command: RuleCommands) -> CliResult<()> {
    let rules = session.fw.rules();

    match command {
        RuleCommands::Add(args) => {
            let rule = session
                .commit(
                    rules
                        .create(CreateRuleCommand::new(actor, args.into_spec()))
                        .await,
                )
                .await
                .map_err(explain)?;
            println!("Created rule {}", rule.id);
            print_rule(&rule);
        }
        RuleCommands::Edit {
            id,
            table,
            chain,
            action,
            fields,
            token,
            force,
        } => {
            let token = match token {
                Some(token) => token,
                None => rules.get(id).await?.token(),
            };
            let patch = RulePatch {
                table_name: table,
                chain,
                action,
                ..fields.into_patch()
            };
            let mut cmd = UpdateRuleCommand::new(actor, id, token, patch);
            if force {
                cmd = cmd.with_override();
            }
            let rule = session
                .commit(rules.update(cmd).await)
                .await
                .map_err(explain)?;
            println!("Updated rule {}", rule.id);
            print_rule(&rule);
        }
        RuleCommands::Rm { id } => {
            session
                .commit(rules.delete(DeleteRuleCommand::new(actor, id)).await)
                .await?;
            println!("Deleted rule {id}");
        }
        RuleCommands::Ls {
            table,
            chain,
            status,
            search,
        } => {
            let filter = RuleFilter {
                table,
                chain,
                status,
                search,
                ..RuleFilter::default()
            };
            let listed = rules.list(&filter).await;
            if listed.is_empty() {
                println!("No rules.");
            }
            for rule in &listed {
                print_rule(rule);
            }
        }
        RuleCommands::Enable { id } => toggle(session, actor, id, true).await?,
        RuleCommands::Disable { id } => toggle(session, actor, id, false).await?,
    }
    Ok(())
}

async fn toggle(session: &Session, actor: &str, id: RuleId, enabled: bool) -> CliResult<()> {
    let rules = session.fw.rules();
    let token = rules.get(id).await?.token();
    let rule = session
        .commit(rules.set_enabled(actor, id, enabled, token).await)
        .await?;
    println!(
        "Rule {} {}",
        rule.id,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// Expands validation failures into one line per field.
fn explain(e: Box<dyn std::error::Error>) -> Box<dyn std::error::Error> {
    let lines: Vec<String> = match e.downcast_ref::<Error>() {
        Some(err) => err
            .validation_errors()
            .iter()
            .map(|v| format!("  {v}"))
            .collect(),
        None => Vec::new(),
    };
    if lines.is_empty() {
        e
    } else {
        format!("invalid rule:\n{}", lines.join("\n")).into()
    }
}

fn print_rule(rule: &Rule) {
    let d = &rule.definition;
    let mut line = format!(
        "{:>4}  p{:<4} {:<7} {:<6} {:<11} {:<8}",
        rule.id,
        d.priority,
        rule.status,
        d.table,
        d.chain,
        d.action
    );
    line.push_str(&format!(" {} -> {} {}", d.src_ip, d.dst_ip, d.protocol));
    if let Some(port) = d.dst_port {
        line.push_str(&format!(" dport {port}"));
    }
    if !d.enabled {
        line.push_str(" (disabled)");
    }
    println!("{line}");
    println!("      token {}", rule.token().to_rfc3339());
}

fn print_outcome(outcome: &DeployOutcome) {
    match outcome {
        DeployOutcome::Deployed { version } => println!(
            "✓ Version {} is active ({} rules, hash {})",
            version.id,
            version.rule_count,
            &version.hash[..version.hash.len().min(12)]
        ),
        DeployOutcome::Skipped { active } => {
            println!("No changes; version {active} is already active.");
        }
    }
}
