use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cloudposture::adapter::FixtureAdapter;
use cloudposture::config::{Config, CONFIG_FILE};
use cloudposture::error::ScanError;
use cloudposture::orchestrator::CancelToken;
use cloudposture::output::OutputFormat;
use cloudposture::rules::Severity;
use cloudposture::scope::{ResourceFilter, ScanRequest, Selector};
use cloudposture::ScanOptions;

#[derive(Parser)]
#[command(
    name = "cloudposture",
    about = "Cloud security posture scanner driven by declarative rule sets",
    version,
    author
)]
struct Cli {
    /// Log debug output to stderr (RUST_LOG takes precedence)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan cloud accounts against a rule set directory
    Scan(ScanArgs),

    /// List all checks defined in a rule set directory
    ListRules {
        /// Rule set directory
        #[arg(long, short = 'r', default_value = "rules")]
        rules: PathBuf,

        /// Output format (table, json)
        #[arg(long, short = 'f', default_value = "table")]
        format: String,
    },

    /// Generate a starter .cloudposture.toml config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct ScanArgs {
    /// Rule set directory (defaults to scan.rules_dir from the config)
    #[arg(long, short = 'r')]
    rules: Option<PathBuf>,

    /// Recorded provider responses to scan against
    #[arg(long, short = 'p', env = "CLOUDPOSTURE_PROVIDER")]
    provider: PathBuf,

    /// Config file path
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Account to scan (repeatable; default: every visible account)
    #[arg(long = "account")]
    accounts: Vec<String>,

    /// Account glob to skip (repeatable)
    #[arg(long = "exclude-account")]
    exclude_accounts: Vec<String>,

    /// Region to scan (repeatable; default: every enabled region)
    #[arg(long = "region")]
    regions: Vec<String>,

    /// Region glob to skip (repeatable)
    #[arg(long = "exclude-region")]
    exclude_regions: Vec<String>,

    /// Service to scan (repeatable; default: every rule set)
    #[arg(long = "service")]
    services: Vec<String>,

    /// Service glob to skip (repeatable)
    #[arg(long = "exclude-service")]
    exclude_services: Vec<String>,

    /// Only report this resource: an id, a glob, or type:<resource type>
    #[arg(long)]
    resource: Option<String>,

    /// Accounts scanned concurrently
    #[arg(long)]
    account_concurrency: Option<usize>,

    /// Scan units running concurrently within an account
    #[arg(long)]
    unit_concurrency: Option<usize>,

    /// Write the report bundle to this directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Output format (console, json, sarif)
    #[arg(long, short = 'f', default_value = "console")]
    format: String,

    /// Minimum severity to fail (info, low, medium, high, critical)
    #[arg(long)]
    fail_on: Option<String>,

    /// Write output to file instead of stdout
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Scan(args) => cmd_scan(args),
        Commands::ListRules { rules, format } => cmd_list_rules(rules, format),
        Commands::Init { force } => cmd_init(force),
    };

    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(e.exit_code());
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Exit code for a scan stopped by an interrupt.
const EXIT_INTERRUPTED: i32 = 130;

/// First interrupt stops new scan units and lets running ones finish; a
/// second one exits immediately.
fn install_interrupt_handler(cancel: CancelToken) {
    let result = ctrlc::set_handler(move || {
        if interrupt(&cancel) {
            eprintln!("Interrupted again, exiting without a report");
            process::exit(EXIT_INTERRUPTED);
        }
        eprintln!("Interrupted: finishing running scan units, press Ctrl-C again to abort");
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "could not install interrupt handler");
    }
}

/// Cancel the scan. Returns true when it was already cancelled.
fn interrupt(cancel: &CancelToken) -> bool {
    let repeated = cancel.is_cancelled();
    cancel.cancel();
    repeated
}

fn scan_exit_code(pass: bool, cancelled: bool) -> i32 {
    match (cancelled, pass) {
        (true, _) => EXIT_INTERRUPTED,
        (false, true) => 0,
        (false, false) => 1,
    }
}

fn selector(include: Vec<String>, exclude: Vec<String>) -> Selector {
    Selector {
        only: None,
        include,
        exclude,
    }
}

fn cmd_scan(args: ScanArgs) -> Result<i32, ScanError> {
    let format = OutputFormat::from_str_lenient(&args.format).unwrap_or_else(|| {
        eprintln!("Warning: unknown format '{}', using console", args.format);
        OutputFormat::Console
    });

    let fail_on = args.fail_on.and_then(|s| {
        let sev = Severity::from_str_lenient(&s);
        if sev.is_none() {
            eprintln!("Warning: unknown severity '{}', using config default", s);
        }
        sev
    });

    let resource_filter = args.resource.as_deref().map(ResourceFilter::parse).transpose()?;

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let options = ScanOptions {
        rules_dir: args.rules,
        config_path: args.config,
        request: ScanRequest {
            accounts: selector(args.accounts, args.exclude_accounts),
            regions: selector(args.regions, args.exclude_regions),
            services: selector(args.services, args.exclude_services),
            resource_filter,
        },
        fail_on_override: fail_on,
        account_concurrency: args.account_concurrency,
        unit_concurrency: args.unit_concurrency,
        output_dir: args.output_dir,
        cancel: cancel.clone(),
    };

    let adapter = FixtureAdapter::load(&args.provider)?;
    let report = cloudposture::scan(&adapter, &options)?;
    let rendered = cloudposture::render_report(&report, format)?;

    match args.output {
        Some(out) => std::fs::write(&out, &rendered)?,
        None => print!("{}", rendered),
    }

    if cancel.is_cancelled() {
        eprintln!("Scan interrupted, report is partial");
    }

    // Exit code: 0 = pass, 1 = failing or errored checks, 130 = interrupted
    Ok(scan_exit_code(report.verdict.pass, cancel.is_cancelled()))
}

fn cmd_list_rules(rules_dir: PathBuf, format_str: String) -> Result<i32, ScanError> {
    let rules = cloudposture::list_rules(&rules_dir)?;

    match format_str.as_str() {
        "json" => {
            let json = serde_json::to_string_pretty(&rules)?;
            println!("{}", json);
        }
        _ => {
            println!(
                "{:<32} {:<10} {:<10} {:<20} COMPLIANCE",
                "ID", "SERVICE", "SEVERITY", "RESOURCE"
            );
            println!("{}", "-".repeat(90));
            for rule in &rules {
                println!(
                    "{:<32} {:<10} {:<10} {:<20} {}",
                    rule.id,
                    rule.service,
                    rule.severity.to_string(),
                    rule.resource_type.as_deref().unwrap_or("-"),
                    if rule.compliance.is_empty() {
                        "-".to_string()
                    } else {
                        rule.compliance.join(",")
                    },
                );
            }
        }
    }

    Ok(0)
}

fn cmd_init(force: bool) -> Result<i32, ScanError> {
    let path = PathBuf::from(CONFIG_FILE);

    if path.exists() && !force {
        eprintln!("{} already exists. Use --force to overwrite.", CONFIG_FILE);
        return Ok(1);
    }

    std::fs::write(&path, Config::starter_toml())?;
    println!("Created {}", CONFIG_FILE);

    Ok(0)
}
