//! This crate builds a command line tool for running OS commands on SAP
//! application servers through the `SXPG_CALL_SYSTEM` function module

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod error;
use error::SxpgError;

mod target;
use target::{ConnectionMode, Credentials, Target};

mod rfc;
use rfc::Session;

mod soap;
use soap::{SoapEndpoint, SoapSession};

mod registry;
use registry::{CommandListing, OsFilter};

mod invocation;
use invocation::{InvocationBuilder, RemoteTemp};

mod retrieve;
use retrieve::OutputRetriever;

mod bridge;
use bridge::ExecutionBridge;

mod poc;

mod console;
use console::Console;

#[cfg(test)]
mod fake;

/// Run registered OS commands on a SAP application server through
/// SXPG_CALL_SYSTEM, one at a time or from a console, or write a
/// proof-of-concept command channel for an execution harness
#[derive(Parser, Debug)]
#[command(name = "sxpg", version)]
#[command(group(ArgGroup::new("mode").required(true).args(["list", "exec", "interactive", "rce_poc"])))]
struct Args {
    /// Target SAP application server host name or address
    target: String,
    /// SAP user
    #[arg(env = "SXPG_USER")]
    username: String,
    /// SAP password
    #[arg(env = "SXPG_PASSWORD", hide_env_values = true)]
    password: String,
    /// SAP client number
    #[arg(short, long, default_value = "500")]
    client: String,
    /// System number for a direct connection to the application server
    #[arg(short, long, value_name = "NN", conflicts_with = "mshost")]
    sysnr: Option<String>,
    /// Message server for a load-balanced connection
    #[arg(short, long, value_name = "HOST", requires_all = ["r3name", "group"])]
    mshost: Option<String>,
    /// System ID, required with --mshost
    #[arg(short, long, value_name = "SID")]
    r3name: Option<String>,
    /// Logon group, required with --mshost
    #[arg(short, long)]
    group: Option<String>,
    /// Logon language
    #[arg(long, default_value = "EN")]
    language: String,
    /// Connection timeout in seconds
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,
    /// Disable the RFC trace in generated artifacts
    #[arg(long, action)]
    no_trace: bool,
    /// Command filter, auto-detected from the target when absent
    #[arg(long, value_name = "linux|windows|unix|all|anyos")]
    os: Option<OsFilter>,

    /// List the external commands registered on the target
    #[arg(short, long, action)]
    list: bool,
    /// Print the listing as JSON
    #[arg(long, action, requires = "list")]
    json: bool,
    /// Execute this logical command
    #[arg(short = 'x', long, value_name = "NAME")]
    exec: Option<String>,
    /// Additional parameters for --exec, passed on unmodified
    #[arg(short, long, value_name = "STRING", default_value = "", allow_hyphen_values = true)]
    args: String,
    /// Open a console running one command per line over a single session
    #[arg(short, long, action)]
    interactive: bool,
    /// Send output to a temporary file on the target and read it back
    #[arg(long, action)]
    redirect: bool,
    /// Logical command used to read the temporary file back
    #[arg(long, value_name = "NAME", default_value = "CAT")]
    reader: String,
    /// Directory on the target for temporary output files
    #[arg(long, value_name = "DIR")]
    remote_tmp: Option<String>,
    /// Write a proof-of-concept for this logical command instead of executing
    #[arg(long, value_name = "NAME", num_args = 0..=1, default_missing_value = "ZSH")]
    rce_poc: Option<String>,
    /// Directory receiving the proof-of-concept
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// HTTP port of the SOAP RFC service, 80NN by default
    #[arg(long)]
    http_port: Option<u16>,
    /// Talk HTTPS to the SOAP RFC service
    #[arg(long, action)]
    https: bool,
    /// Accept invalid TLS certificates
    #[arg(long, action, requires = "https")]
    insecure: bool,

    /// More logging, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only log warnings and errors
    #[arg(short, long, action, conflicts_with = "verbose")]
    quiet: bool,
}

impl Args {
    fn target(&self) -> Target {
        let mode = match &self.mshost {
            Some(mshost) => ConnectionMode::LoadBalanced {
                mshost: mshost.clone(),
                r3name: self.r3name.clone().unwrap_or_default(),
                group: self.group.clone().unwrap_or_default(),
            },
            None => ConnectionMode::Direct {
                sysnr: self.sysnr.clone().unwrap_or_else(|| "00".to_string()),
                group: self.group.clone(),
            },
        };
        let mut target = Target::new(
            &self.target,
            &self.client,
            Credentials::new(&self.username, &self.password),
        )
        .with_mode(mode)
        .with_timeout(Duration::from_secs(self.timeout))
        .with_trace(!self.no_trace);
        target.language = self.language.clone();
        target
    }

    fn endpoint(&self) -> SoapEndpoint {
        SoapEndpoint {
            https: self.https,
            port: self.http_port,
            insecure: self.insecure,
        }
    }
}

/// Logs go to stderr so stdout carries nothing but command output
fn init_logging(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "sxpg=warn",
        (false, 0) => "sxpg=info",
        (false, 1) => "sxpg=debug",
        (false, _) => "sxpg=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn generate(args: &Args, command: &str) -> Result<()> {
    let target = args.target();
    info!(command, system = %target, "producing proof-of-concept");
    let artifact = poc::generate(&target, command, &args.output_dir)
        .with_context(|| format!("generating proof-of-concept for {command} on {target}"))?;
    println!("{}", artifact.path.display());
    Ok(())
}

fn connect(args: &Args) -> Result<Session> {
    let target = args.target();
    match &target.mode {
        ConnectionMode::Direct { sysnr, .. } => {
            info!(system = %target, sysnr = %sysnr, client = %target.client, user = %target.credentials.user, "connecting directly")
        }
        ConnectionMode::LoadBalanced { r3name, group, .. } => {
            info!(system = %target, r3name = %r3name, group = %group, client = %target.client, user = %target.credentials.user, "connecting through message server")
        }
    }
    let host = target.to_string();
    let session = SoapSession::connect(target, &args.endpoint())
        .with_context(|| format!("connecting to {host}"))?;
    Ok(Session::new(Box::new(session)))
}

fn run(args: &Args) -> Result<()> {
    if let Some(command) = &args.rce_poc {
        return generate(args, command);
    }

    let session = connect(args)?;
    let filter = match args.os {
        Some(filter) => filter,
        None => registry::detect_remote_os(&*session)
            .with_context(|| format!("detecting the OS of {}", session.target()))?,
    };

    if args.list {
        let commands = registry::list_registered_commands(&*session)
            .with_context(|| format!("listing commands on {}", session.target()))?;
        let listing = CommandListing::new(session.target().identifier(), filter, commands);
        if args.json {
            println!("{}", serde_json::to_string_pretty(&listing)?);
        } else {
            print!("{listing}");
        }
        return Ok(());
    }

    let builder = if args.redirect {
        InvocationBuilder::redirecting(args.remote_tmp.clone().map(RemoteTemp::new))
    } else {
        InvocationBuilder::direct()
    };
    let bridge = ExecutionBridge::new(filter, builder, OutputRetriever::standard(&args.reader));

    if args.interactive {
        return Console::new(&*session, filter, bridge).run();
    }

    if let Some(name) = &args.exec {
        let result = bridge
            .execute(&*session, name, &args.args)
            .with_context(|| format!("executing {name} on {}", session.target()))?;
        print!("{}", result.output);
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = match e.downcast_ref::<SxpgError>() {
                Some(err) => {
                    error!(stage = %err.stage(), "{e:#}");
                    err.stage().exit_code()
                }
                None => {
                    error!("{e:#}");
                    1
                }
            };
            ExitCode::from(code)
        }
    }
}
