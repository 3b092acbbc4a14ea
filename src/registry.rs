//! External OS commands registered on the target (transaction SM69)

use crate::{
    error::SxpgError,
    rfc::{self, RfcSession},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
};
use tracing::{debug, info, warn};

/// One external command as the registry describes it.
/// A read-only view, fetched again for every lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredCommand {
    /// Logical name used with `SXPG_CALL_SYSTEM`
    #[serde(rename = "NAME")]
    pub name: String,
    /// Operating system the definition is restricted to
    #[serde(rename = "OPSYSTEM", default)]
    pub os: String,
    /// Program executed on the host
    #[serde(rename = "OPCOMMAND", default)]
    pub os_command: String,
    /// Parameters always passed to the program
    #[serde(rename = "PARAMETERS", default)]
    pub parameters: String,
    /// Whether callers may append their own parameters
    #[serde(rename = "ADDPAR", default, with = "abap_flag")]
    pub additional_parameters: bool,
    /// Delivered by SAP rather than defined by a customer
    #[serde(rename = "SAPCOMMAND", default, with = "abap_flag")]
    pub sap_defined: bool,
}

/// ABAP booleans are `X` for true and blank for false
mod abap_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *flag { "X" } else { "" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.trim().eq_ignore_ascii_case("X"))
    }
}

/// Which registry entries apply to the target's operating system
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsFilter {
    /// Every entry, whatever it is restricted to
    All,
    /// Only entries valid on any operating system
    AnyOs,
    Linux,
    Windows,
    Unix,
    SunOs,
    Aix,
}

impl OsFilter {
    /// Lower case registry OS labels this filter accepts
    pub fn variants(&self) -> Vec<&'static str> {
        let mut variants = vec!["anyos"];
        match self {
            OsFilter::All => {
                variants.extend([
                    "linux",
                    "unix",
                    "windows",
                    "windows nt",
                    "sunos",
                    "aix",
                    "os/400",
                    "as/400",
                ]);
            }
            OsFilter::AnyOs => {}
            OsFilter::Linux => variants.extend(["linux", "unix"]),
            OsFilter::Windows => variants.extend(["windows nt", "windows"]),
            OsFilter::Unix => variants.extend(["unix", "linux", "sunos", "aix"]),
            OsFilter::SunOs => variants.extend(["sunos", "unix"]),
            OsFilter::Aix => variants.extend(["aix", "unix"]),
        }
        variants
    }

    /// Whether a registry entry restricted to `os` applies
    pub fn matches(&self, os: &str) -> bool {
        if *self == OsFilter::All {
            return true;
        }
        let os = os.trim().to_lowercase();
        self.variants().contains(&os.as_str())
    }

    fn as_str(&self) -> &str {
        match self {
            OsFilter::All => "all",
            OsFilter::AnyOs => "anyos",
            OsFilter::Linux => "linux",
            OsFilter::Windows => "windows",
            OsFilter::Unix => "unix",
            OsFilter::SunOs => "sunos",
            OsFilter::Aix => "aix",
        }
    }
}

impl fmt::Display for OsFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OsFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(OsFilter::All),
            "anyos" => Ok(OsFilter::AnyOs),
            "linux" => Ok(OsFilter::Linux),
            "windows" | "windows nt" => Ok(OsFilter::Windows),
            "unix" => Ok(OsFilter::Unix),
            "sunos" => Ok(OsFilter::SunOs),
            "aix" => Ok(OsFilter::Aix),
            other => Err(format!(
                "unknown OS filter '{other}', expected one of linux, windows, unix, all, anyos"
            )),
        }
    }
}

/// Read every command definition the SAP user may see
pub fn list_registered_commands(session: &dyn RfcSession) -> Result<Vec<RegisteredCommand>, SxpgError> {
    let result = session.call(rfc::COMMAND_LIST_GET, &rfc::record(json!({ "COMMAND_LIST": [] })))?;
    let rows = rfc::table(&result, rfc::COMMAND_LIST_GET, "COMMAND_LIST")?.ok_or_else(|| {
        SxpgError::MalformedResponse {
            function: rfc::COMMAND_LIST_GET.to_string(),
            message: "no COMMAND_LIST in response".to_string(),
        }
    })?;

    let commands = rows
        .iter()
        .map(|row| {
            serde_json::from_value::<RegisteredCommand>(row.clone()).map_err(|e| SxpgError::MalformedResponse {
                function: rfc::COMMAND_LIST_GET.to_string(),
                message: format!("bad COMMAND_LIST row: {e}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!(count = commands.len(), "command list read");
    Ok(commands)
}

fn is_authorization_failure(err: &SxpgError) -> bool {
    match err {
        SxpgError::Authorization { .. } => true,
        SxpgError::RemoteException { exception, .. } => {
            matches!(exception.as_str(), "NO_PERMISSION" | "NOT_AUTHORIZED")
        }
        _ => false,
    }
}

/// Find the registered command called `name`, case-insensitively.
/// If the user may not list the registry, ask for the single definition instead.
pub fn resolve(
    session: &dyn RfcSession,
    name: &str,
    filter: OsFilter,
) -> Result<RegisteredCommand, SxpgError> {
    let not_found = || SxpgError::CommandNotFound {
        target: session.target().to_string(),
        name: name.to_string(),
    };

    match list_registered_commands(session) {
        Ok(commands) => commands
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(name) && filter.matches(&c.os))
            .ok_or_else(not_found),
        Err(e) if is_authorization_failure(&e) => {
            warn!(error = %e, command = name, "cannot list commands, probing the definition directly");
            probe(session, name).map_err(|e| match e.exception() {
                Some("COMMAND_NOT_FOUND") => not_found(),
                _ => e,
            })
        }
        Err(e) => Err(e),
    }
}

/// Existence check for a single command without listing the registry
fn probe(session: &dyn RfcSession, name: &str) -> Result<RegisteredCommand, SxpgError> {
    let result = session.call(
        rfc::COMMAND_DEFINITION_GET,
        &rfc::record(json!({ "COMMANDNAME": name.to_uppercase() })),
    )?;
    let definition = result
        .get("COMMAND_DEFINITION")
        .cloned()
        .ok_or_else(|| SxpgError::MalformedResponse {
            function: rfc::COMMAND_DEFINITION_GET.to_string(),
            message: "no COMMAND_DEFINITION in response".to_string(),
        })?;
    serde_json::from_value(definition).map_err(|e| SxpgError::MalformedResponse {
        function: rfc::COMMAND_DEFINITION_GET.to_string(),
        message: e.to_string(),
    })
}

/// Guess the target's operating system from the output of the registered `ENV` command.
/// Falls back to Linux when the server refuses or lacks the command; transport
/// failures are returned.
pub fn detect_remote_os(session: &dyn RfcSession) -> Result<OsFilter, SxpgError> {
    info!("detecting remote OS via the ENV command");
    let params = rfc::record(json!({
        "COMMANDNAME": "ENV",
        "ADDITIONAL_PARAMETERS": "",
        "EXEC_PROTOCOL": [],
    }));
    let env = session.call(rfc::CALL_SYSTEM, &params).and_then(|result| {
        let lines = rfc::table(&result, rfc::CALL_SYSTEM, "EXEC_PROTOCOL")?.unwrap_or_default();
        Ok(lines
            .iter()
            .filter_map(|line| line.get("MESSAGE").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"))
    });
    match env {
        Ok(env) => {
            let os = classify_environment(&env);
            info!(os = %os, "remote OS detected");
            Ok(os)
        }
        Err(e @ (SxpgError::Authorization { .. } | SxpgError::RemoteException { .. })) => {
            warn!(error = %e, "could not detect remote OS, assuming linux");
            Ok(OsFilter::Linux)
        }
        Err(e) => Err(e),
    }
}

/// Classify an environment variable dump
pub fn classify_environment(env: &str) -> OsFilter {
    let env = env.to_lowercase();
    let any = |markers: &[&str]| markers.iter().any(|m| env.contains(m));

    if any(&["windir=", "windows", "comspec=", "programfiles="]) {
        OsFilter::Windows
    } else if any(&["shell=/bin/bash", "shell=/usr/bin/bash"]) {
        OsFilter::Linux
    } else if any(&["shell=/bin/ksh", "shell=/usr/bin/ksh", "aix", "sunos", "solaris"]) {
        OsFilter::Unix
    } else {
        OsFilter::Linux
    }
}

/// Summary of the registry for display
#[derive(Debug, Serialize)]
pub struct CommandListing {
    pub host: String,
    pub filter: String,
    pub total: usize,
    /// Number of definitions per lower case OS label
    pub per_os: BTreeMap<String, usize>,
    /// Unique commands accepted by the filter, sorted by name
    pub commands: Vec<RegisteredCommand>,
}

impl CommandListing {
    pub fn new(host: &str, filter: OsFilter, all: Vec<RegisteredCommand>) -> Self {
        let mut per_os = BTreeMap::new();
        for command in &all {
            let os = if command.os.trim().is_empty() {
                "unknown".to_string()
            } else {
                command.os.trim().to_lowercase()
            };
            *per_os.entry(os).or_insert(0) += 1;
        }

        let mut unique = BTreeMap::new();
        for command in &all {
            if filter.matches(&command.os) {
                unique.entry(command.name.clone()).or_insert_with(|| command.clone());
            }
        }

        Self {
            host: host.to_string(),
            filter: filter.to_string(),
            total: all.len(),
            per_os,
            commands: unique.into_values().collect(),
        }
    }
}

impl fmt::Display for CommandListing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "External commands on {} (SM69)", self.host)?;
        writeln!(f, "{}", "=".repeat(40))?;
        writeln!(f, "Total commands: {}", self.total)?;
        writeln!(f, "Operating systems: {}", self.per_os.len())?;
        for (os, count) in &self.per_os {
            writeln!(f, "  {os}: {count} commands")?;
        }
        writeln!(f)?;
        if self.commands.is_empty() {
            let known: Vec<&str> = self.per_os.keys().map(String::as_str).collect();
            return writeln!(f, "No commands for OS filter {} (available: {})", self.filter, known.join(", "));
        }
        writeln!(f, "{} unique commands for {}:", self.commands.len(), self.filter)?;
        writeln!(f)?;
        for command in &self.commands {
            writeln!(f, "* {}", command.name)?;
            writeln!(f, "  Underlying command: {}", command.os_command)?;
            if !command.parameters.is_empty() {
                writeln!(f, "  Default params: {}", command.parameters)?;
            }
            if command.additional_parameters {
                writeln!(f, "  Additional parameters: yes")?;
            }
            writeln!(f, "{}", "-".repeat(30))?;
        }
        Ok(())
    }
}
