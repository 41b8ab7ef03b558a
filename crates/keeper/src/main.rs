//! keeper - Secrets manager for container tooling
//!
//! Commands:
//! - create <NAME> [FILE]: Store a secret (reads stdin when FILE is omitted or "-")
//! - inspect <NAME|ID>...: Show secret metadata as JSON
//! - reveal <NAME|ID>: Print the secret bytes
//! - ls: List secrets
//! - rm <NAME|ID>...: Delete secrets

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keeper::{DriverType, SecretFilter, SecretsManager, StoreOptions};
use keeper_core::{Config, Paths};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keeper")]
#[command(about = "Secrets manager for container tooling - named secrets over pluggable storage drivers")]
#[command(version)]
#[command(after_help = r#"DRIVERS:
    file    One file per secret under --driver-opt path=DIR
            (default: <root>/filedriver)
    pass    gpg-encrypted entries; options root=DIR, key=KEYID, gpghomedir=DIR
    shell   Your own commands; options store=, lookup=, list=, delete=
            The secret ID is available to them as $SECRET_ID

EXAMPLES:
    printf 'hunter2' | keeper create db-password
    keeper create --replace db-password ./password.txt
    keeper ls --filter label=env=prod
    keeper reveal db-password"#)]
struct Cli {
    /// Secrets root directory (default: ~/.local/share/keeper/secrets)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new secret
    Create {
        /// Secret name (letters, digits, . @ _ -)
        name: String,
        /// File holding the secret data ("-" or omitted for stdin)
        file: Option<PathBuf>,
        /// Storage driver (file, pass, shell)
        #[arg(long, short = 'd')]
        driver: Option<String>,
        /// Driver option KEY=VALUE (repeatable)
        #[arg(long = "driver-opt")]
        driver_opts: Vec<String>,
        /// Label KEY=VALUE (repeatable)
        #[arg(long = "label", short = 'l')]
        labels: Vec<String>,
        /// Replace an existing secret with the same name
        #[arg(long)]
        replace: bool,
        /// Succeed without changes if the name is already in use
        #[arg(long)]
        ignore: bool,
    },

    /// Show secret metadata as JSON
    Inspect {
        /// Secret names or IDs
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Print the secret data
    Reveal {
        /// Secret name or ID
        name: String,
    },

    /// List secrets
    #[command(alias = "list")]
    Ls {
        /// Filter: name=PREFIX, id=PREFIX, label=KEY[=VALUE] (repeatable)
        #[arg(long, short = 'f')]
        filter: Vec<String>,
        /// Only print IDs
        #[arg(long, short = 'q')]
        quiet: bool,
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
    },

    /// Delete secrets
    #[command(alias = "delete")]
    Rm {
        /// Secret names or IDs
        #[arg(required = true)]
        names: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let paths = Paths::new();
    let config = Config::load(&paths.config_file())?;
    let root = cli.root.unwrap_or_else(|| paths.secrets());
    let manager = SecretsManager::with_config(&root, config)?;

    match cli.command {
        Commands::Create {
            name,
            file,
            driver,
            driver_opts,
            labels,
            replace,
            ignore,
        } => {
            let options = StoreOptions {
                driver_options: parse_pairs(&driver_opts, "driver option")?,
                labels: parse_pairs(&labels, "label")?,
                replace,
                ignore_if_exists: ignore,
                ..StoreOptions::default()
            };
            cmd_create(&manager, &name, file, driver.as_deref(), options)
        }
        Commands::Inspect { names } => cmd_inspect(&manager, &names),
        Commands::Reveal { name } => cmd_reveal(&manager, &name),
        Commands::Ls {
            filter,
            quiet,
            json,
        } => cmd_ls(&manager, &filter, quiet, json),
        Commands::Rm { names } => cmd_rm(&manager, &names),
    }
}

/// Parse repeated KEY=VALUE arguments
fn parse_pairs(pairs: &[String], what: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                map.insert(key.to_string(), value.to_string());
            }
            _ => bail!("Invalid {} {:?}: expected KEY=VALUE", what, pair),
        }
    }
    Ok(map)
}

/// Store a secret
fn cmd_create(
    manager: &SecretsManager,
    name: &str,
    file: Option<PathBuf>,
    driver: Option<&str>,
    options: StoreOptions,
) -> Result<()> {
    let driver: DriverType = match driver {
        Some(d) => d.parse()?,
        None => manager.default_driver()?,
    };

    // One byte past the limit is enough for the manager to reject it
    let limit = manager.config().max_secret_size;
    let data = match file {
        Some(path) if path.as_os_str() != "-" => {
            let file = File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            read_bounded(file, limit)
                .with_context(|| format!("Failed to read {}", path.display()))?
        }
        _ => read_bounded(std::io::stdin().lock(), limit)
            .context("Failed to read secret data from stdin")?,
    };

    let id = manager.store(name, &data, driver, options)?;
    println!("{}", id);
    Ok(())
}

/// Read at most `limit + 1` bytes
fn read_bounded(reader: impl Read, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut data)?;
    Ok(data)
}

/// Show metadata
fn cmd_inspect(manager: &SecretsManager, names: &[String]) -> Result<()> {
    let secrets = names
        .iter()
        .map(|name| manager.lookup(name))
        .collect::<Result<Vec<_>>>()?;
    println!("{}", serde_json::to_string_pretty(&secrets)?);
    Ok(())
}

/// Print secret bytes unmodified
fn cmd_reveal(manager: &SecretsManager, name: &str) -> Result<()> {
    let (_, data) = manager.lookup_secret_data(name)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&data)?;
    stdout.flush()?;
    Ok(())
}

/// List secrets
fn cmd_ls(manager: &SecretsManager, filters: &[String], quiet: bool, json: bool) -> Result<()> {
    let filters = filters
        .iter()
        .map(|f| f.parse::<SecretFilter>())
        .collect::<Result<Vec<_>>>()?;
    let secrets = manager.list_filtered(&filters)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&secrets)?);
        return Ok(());
    }

    if quiet {
        for secret in &secrets {
            println!("{}", secret.id);
        }
        return Ok(());
    }

    println!(
        "{:<25}  {:<30}  {:<6}  {:<20}  {}",
        "ID", "NAME", "DRIVER", "CREATED", "UPDATED"
    );
    for secret in &secrets {
        println!(
            "{:<25}  {:<30}  {:<6}  {:<20}  {}",
            secret.id,
            secret.name,
            secret.driver.as_str(),
            secret.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            secret.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }

    Ok(())
}

/// Delete secrets, reporting every failure
fn cmd_rm(manager: &SecretsManager, names: &[String]) -> Result<()> {
    let mut failed = 0;
    for name in names {
        match manager.delete(name) {
            Ok(id) => println!("{}", id),
            Err(e) => {
                eprintln!("error: {:#}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("Failed to remove {} of {} secrets", failed, names.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_create() {
        let cli = Cli::try_parse_from([
            "keeper",
            "create",
            "--driver",
            "shell",
            "--driver-opt",
            "store=cat",
            "-l",
            "env=prod",
            "--replace",
            "db-password",
            "-",
        ])
        .unwrap();

        if let Commands::Create {
            name,
            file,
            driver,
            driver_opts,
            labels,
            replace,
            ignore,
        } = cli.command
        {
            assert_eq!(name, "db-password");
            assert_eq!(file, Some(PathBuf::from("-")));
            assert_eq!(driver.as_deref(), Some("shell"));
            assert_eq!(driver_opts, vec!["store=cat"]);
            assert_eq!(labels, vec!["env=prod"]);
            assert!(replace);
            assert!(!ignore);
        } else {
            panic!("Expected Create command");
        }
    }

    #[test]
    fn test_cli_parse_ls() {
        let cli = Cli::try_parse_from(["keeper", "--root", "/tmp/k", "ls", "-f", "name=db", "--json"])
            .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/k")));
        if let Commands::Ls { filter, quiet, json } = cli.command {
            assert_eq!(filter, vec!["name=db"]);
            assert!(!quiet);
            assert!(json);
        } else {
            panic!("Expected Ls command");
        }

        assert!(Cli::try_parse_from(["keeper", "rm"]).is_err());
    }

    #[test]
    fn test_read_bounded_stops_past_limit() {
        let input = vec![b'x'; 1000];
        assert_eq!(read_bounded(&input[..], 8).unwrap().len(), 9);
        assert_eq!(read_bounded(&input[..8], 8).unwrap().len(), 8);
    }

    #[test]
    fn test_parse_pairs() {
        let map = parse_pairs(
            &["a=1".to_string(), "cmd=echo a=b".to_string()],
            "label",
        )
        .unwrap();
        assert_eq!(map.get("a").map(String::as_str), Some("1"));
        assert_eq!(map.get("cmd").map(String::as_str), Some("echo a=b"));

        assert!(parse_pairs(&["novalue".to_string()], "label").is_err());
        assert!(parse_pairs(&["=x".to_string()], "label").is_err());
    }
}
