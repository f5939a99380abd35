//! ferri admin binary.
//!
//! Usage:
//!   ferri init
//!   ferri apply edits.jsonl            # JSON lines of edits, `-` for stdin
//!   ferri check /docs/report.pdf read --user amy --host files.example.com
//!   ferri check /docs read --explain
//!   ferri groups amy
//!   ferri root sub.example.com
//!   ferri ls /docs --host files.example.com

mod logging;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use ferri_core::{AccountStore, Catalog, Config, Edit, EditOutcome, FerriDb, TreeStore};
use ferri_types::{AccountId, NodeId, Operation, now_millis};

/// Access-control admin tool for the ferri virtual filesystem.
#[derive(Parser, Debug)]
#[command(name = "ferri", version)]
#[command(about = "Inspect and edit ferri accounts, VFS nodes and permissions")]
struct Args {
    /// Config file (default: <config dir>/ferri/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding `db_path` from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the default config if missing and create the database
    Init,

    /// Apply JSON-lines edits atomically (`-` reads stdin)
    Apply { file: PathBuf },

    /// Decide whether a caller may perform an operation on a node
    Check {
        /// `/`-separated effective names from the host's root
        path: String,
        /// read, see, upload, list, archive or delete
        operation: String,
        /// Username; anonymous when omitted
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value = "localhost")]
        host: String,
        /// Print the deciding rule as JSON
        #[arg(long)]
        explain: bool,
    },

    /// Print the group closure of a user
    Groups { user: String },

    /// Print the root node for a host
    Root { host: String },

    /// List the children of a node the caller may see
    Ls {
        path: String,
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long)]
        user: Option<String>,
        /// Skip the `see` check and show every child
        #[arg(long)]
        all: bool,
    },
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut cfg = Config::load_or_create(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    if let Some(db) = &args.db {
        cfg.db_path = db.clone();
    }
    cfg.ensure_dirs().context("creating data directories")?;
    let _guards = logging::init(&cfg)?;

    let db = FerriDb::open(&cfg.db_path)
        .with_context(|| format!("opening database {}", cfg.db_path.display()))?;
    let catalog = Catalog::with_db(db, cfg.resolver_options()).context("loading catalog")?;

    match args.command {
        Command::Init => {
            println!("config:   {}", config_path.display());
            println!("database: {}", cfg.db_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Apply { file } => apply(&catalog, &file),
        Command::Check {
            path,
            operation,
            user,
            host,
            explain,
        } => check(&catalog, &path, &operation, user.as_deref(), &host, explain),
        Command::Groups { user } => groups(&catalog, &user),
        Command::Root { host } => {
            let node = catalog.resolve_root(&host)?;
            let name = catalog.snapshot().tree().effective_name(node)?;
            println!("{node}\t{name}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Ls {
            path,
            host,
            user,
            all,
        } => ls(&catalog, &path, &host, user.as_deref(), all),
    }
}

fn apply(catalog: &Catalog, file: &Path) -> Result<ExitCode> {
    let text = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?
    };

    let edits = parse_edits(&text)?;
    let outcomes = catalog.apply_all(&edits)?;
    for (edit, outcome) in edits.iter().zip(&outcomes) {
        match outcome {
            EditOutcome::MaskAdded(seq) => println!("{}\tmask {seq}", edit.name()),
            EditOutcome::NodesDeleted(ids) => println!("{}\t{} nodes", edit.name(), ids.len()),
            EditOutcome::Done => println!("{}", edit.name()),
        }
    }
    println!("applied {} edits (version {})", edits.len(), catalog.version());
    Ok(ExitCode::SUCCESS)
}

/// One edit per line. Blank lines and `#` comments are skipped.
fn parse_edits(text: &str) -> Result<Vec<Edit>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("line {}: invalid edit", i + 1))
        })
        .collect()
}

fn check(
    catalog: &Catalog,
    path: &str,
    operation: &str,
    user: Option<&str>,
    host: &str,
    explain: bool,
) -> Result<ExitCode> {
    let Some(operation) = Operation::from_str(operation) else {
        bail!("unknown operation '{operation}'");
    };
    let account = lookup_user(catalog, user)?;
    let node = locate(catalog, host, path)?;

    let snapshot = catalog.snapshot();
    let resolver = snapshot.resolver(catalog.options());
    let allowed = match resolver.explain(account, node, operation, now_millis()) {
        Ok(why) if explain => {
            println!("{}", serde_json::to_string_pretty(&why)?);
            why.allowed
        }
        Ok(why) => {
            println!("{}", if why.allowed { "allow" } else { "deny" });
            why.allowed
        }
        Err(e) => {
            println!("deny (configuration error: {e})");
            false
        }
    };
    Ok(if allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn groups(catalog: &Catalog, user: &str) -> Result<ExitCode> {
    let Some(account) = lookup_user(catalog, Some(user))? else {
        bail!("unknown user '{user}'");
    };
    let snapshot = catalog.snapshot();
    let mut names: Vec<String> = catalog
        .resolve_groups(account)
        .into_iter()
        .filter(|id| *id != account)
        .filter_map(|id| snapshot.accounts().get_account(id))
        .map(|a| a.username.clone())
        .collect();
    names.sort();
    for name in names {
        println!("{name}");
    }
    Ok(ExitCode::SUCCESS)
}

fn ls(catalog: &Catalog, path: &str, host: &str, user: Option<&str>, all: bool) -> Result<ExitCode> {
    let account = lookup_user(catalog, user)?;
    let node = locate(catalog, host, path)?;

    let snapshot = catalog.snapshot();
    let entries: Vec<(String, NodeId)> = if all {
        snapshot
            .tree()
            .children(node)?
            .into_iter()
            .map(|(name, child)| (name, child.id))
            .collect()
    } else {
        snapshot
            .resolver(catalog.options())
            .visible_children(account, node, now_millis())?
    };
    for (name, id) in entries {
        println!("{id}\t{name}");
    }
    Ok(ExitCode::SUCCESS)
}

fn lookup_user(catalog: &Catalog, user: Option<&str>) -> Result<Option<AccountId>> {
    let Some(user) = user else {
        return Ok(None);
    };
    catalog
        .snapshot()
        .accounts()
        .get_account_by_username(user)
        .map(|a| Some(a.id))
        .with_context(|| format!("unknown user '{user}'"))
}

fn locate(catalog: &Catalog, host: &str, path: &str) -> Result<NodeId> {
    let root = catalog
        .resolve_root(host)
        .with_context(|| format!("no root for host '{host}'"))?;
    let node = catalog
        .snapshot()
        .tree()
        .resolve_path(root, path)
        .with_context(|| format!("no node at '{path}' under {host}"))?;
    Ok(node)
}
