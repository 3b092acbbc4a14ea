//! A simulated SAP system for tests.
//!
//! Implements the function modules the tool uses against an in-memory
//! registry, a tiny shell and a file system, and records every call.

use crate::{
    error::SxpgError,
    registry::RegisteredCommand,
    retrieve::PROTOCOL_LINE_WIDTH,
    rfc::{self, RfcRecord, RfcSession},
    target::{Credentials, Target},
};
use serde_json::{json, Value};
use std::{
    cell::RefCell,
    collections::HashMap,
};

pub const ID_OUTPUT: &str = "uid=1001(prdadm) gid=1001(sapsys) groups=1001(sapsys)\n";

/// A script printing one line of 200 characters
pub const WIDE_SCRIPT: &str = "wide";

fn command(name: &str, os: &str, os_command: &str, parameters: &str, additional: bool) -> RegisteredCommand {
    RegisteredCommand {
        name: name.to_string(),
        os: os.to_string(),
        os_command: os_command.to_string(),
        parameters: parameters.to_string(),
        additional_parameters: additional,
        sap_defined: !name.starts_with('Z'),
    }
}

pub struct FakeChannel {
    target: Target,
    registry: Vec<RegisteredCommand>,
    scripts: HashMap<String, (String, u32)>,
    files: RefCell<HashMap<String, String>>,
    calls: RefCell<Vec<(String, RfcRecord)>>,
    deny_listing: bool,
    fail_deletes: bool,
    fail_reads: bool,
    omit_protocol: bool,
    broken: Option<String>,
    terminating: Option<String>,
    unreachable: bool,
}

impl FakeChannel {
    /// A Linux application server with a handful of SM69 entries, `ZSH` among them
    pub fn linux(host: &str) -> Self {
        let registry = vec![
            command("ZSH", "Linux", "/bin/sh", "", true),
            command("CAT", "Linux", "cat", "", true),
            command("ENV", "ANYOS", "env", "", false),
            command("LIST_DB2DUMP", "UNIX", "ls", "-l", true),
            command("PS", "Linux", "ps", "", true),
            command("ZCMD", "Windows NT", "cmd.exe", "/c", true),
        ];
        let mut scripts = HashMap::new();
        for (script, output, code) in [
            ("id", ID_OUTPUT, 0),
            ("echo hello", "hello\n", 0),
            ("echo", "\n", 0),
            ("true", "", 0),
            ("uname -a; hostname", "Linux sapprd 5.14.21 x86_64 GNU/Linux\nsapprd\n", 0),
            ("false", "", 1),
        ] {
            scripts.insert(script.to_string(), (output.to_string(), code));
        }
        scripts.insert(WIDE_SCRIPT.to_string(), (format!("{}\n", "w".repeat(200)), 0));
        Self {
            target: Target::new(host, "100", Credentials::new("DDIC", "19920706")),
            registry,
            scripts,
            files: RefCell::new(HashMap::new()),
            calls: RefCell::new(Vec::new()),
            deny_listing: false,
            fail_deletes: false,
            fail_reads: false,
            omit_protocol: false,
            broken: None,
            terminating: None,
            unreachable: false,
        }
    }

    /// Every call fails as if the host were down
    pub fn unreachable(host: &str) -> Self {
        Self {
            unreachable: true,
            ..Self::linux(host)
        }
    }

    /// `SXPG_COMMAND_LIST_GET` is refused for lack of authorization
    pub fn deny_listing(mut self) -> Self {
        self.deny_listing = true;
        self
    }

    /// `EPS_DELETE_FILE` always fails
    pub fn fail_deletes(mut self) -> Self {
        self.fail_deletes = true;
        self
    }

    /// The reader command cannot start
    pub fn fail_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// `SXPG_CALL_SYSTEM` answers without a protocol table
    pub fn omit_protocol(mut self) -> Self {
        self.omit_protocol = true;
        self
    }

    /// Register a command whose program cannot be started
    pub fn with_broken_command(mut self, name: &str) -> Self {
        self.registry.push(command(name, "Linux", "/nonexistent", "", true));
        self.broken = Some(name.to_string());
        self
    }

    /// Register a command that runs but is then reported as terminated
    pub fn with_terminating_command(mut self, name: &str) -> Self {
        self.registry.push(command(name, "Linux", "/bin/sh", "", true));
        self.terminating = Some(name.to_string());
        self
    }

    pub fn put_file(&self, path: &str, contents: &str) {
        self.files.borrow_mut().insert(path.to_string(), contents.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }

    /// Names of the function modules called so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(f, _)| f.clone()).collect()
    }

    /// Parameters of every call of `function`
    pub fn params_of(&self, function: &str) -> Vec<RfcRecord> {
        self.calls
            .borrow()
            .iter()
            .filter(|(f, _)| f == function)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn exception(function: &str, exception: &str, message: &str) -> SxpgError {
        SxpgError::RemoteException {
            function: function.to_string(),
            exception: exception.to_string(),
            message: message.to_string(),
        }
    }

    fn registered(&self, name: &str) -> Option<&RegisteredCommand> {
        self.registry.iter().find(|c| c.name == name)
    }

    /// Run a registered program with its argument vector, returning its
    /// output and exit code
    fn run(&self, command: &RegisteredCommand, argv: &[&str]) -> (String, u32) {
        match command.os_command.as_str() {
            "/bin/sh" => match argv {
                ["-c", script, ..] => self.shell(script),
                _ => (String::new(), 0),
            },
            "cat" => match argv.first().and_then(|path| self.file(path)) {
                Some(contents) => (contents, 0),
                None => (format!("cat: {}: No such file or directory\n", argv.join(" ")), 1),
            },
            "env" => ("SHELL=/bin/bash\nPATH=/usr/sbin:/usr/bin:/bin\nHOME=/home/prdadm\n".to_string(), 0),
            "ps" => ("  PID TTY          TIME CMD\n    1 ?        00:00:01 systemd\n".to_string(), 0),
            "ls" => ("total 0\n".to_string(), 0),
            _ => (String::new(), 0),
        }
    }

    /// `sh -c script`: `${IFS}` stands for a space, a trailing `>path`
    /// sends stdout into a file
    fn shell(&self, script: &str) -> (String, u32) {
        let (script, redirect) = match script.rsplit_once('>') {
            Some((script, path)) if !path.is_empty() => (script, Some(path)),
            _ => (script, None),
        };
        let script = script.replace("${IFS}", " ");
        let (output, code) = self
            .scripts
            .get(&script)
            .cloned()
            .unwrap_or_else(|| (format!("sh: 1: {script}: not found\n"), 127));
        match redirect {
            Some(path) => {
                self.put_file(path, &output);
                (String::new(), code)
            }
            None => (output, code),
        }
    }

    fn call_system(&self, params: &RfcRecord) -> Result<RfcRecord, SxpgError> {
        let function = rfc::CALL_SYSTEM;
        let name = rfc::text(params, "COMMANDNAME").unwrap_or_default();
        let arguments = rfc::text(params, "ADDITIONAL_PARAMETERS").unwrap_or_default();
        let command = self
            .registered(name)
            .ok_or_else(|| Self::exception(function, "COMMAND_NOT_FOUND", "External command not defined"))?;
        if !command.additional_parameters && !arguments.is_empty() {
            return Err(Self::exception(function, "TOO_MANY_PARAMETERS", "Additional parameters not allowed"));
        }
        if self.broken.as_deref() == Some(name) || (self.fail_reads && command.os_command == "cat") {
            return Err(Self::exception(function, "PROGRAM_START_ERROR", "Cannot start external program"));
        }

        // The program gets the words of both fields, never a shell line
        let argv: Vec<&str> = command
            .parameters
            .split(' ')
            .chain(arguments.split(' '))
            .filter(|word| !word.is_empty())
            .collect();
        let (output, code) = self.run(command, &argv);
        if self.terminating.as_deref() == Some(name) {
            return Err(Self::exception(function, "PROGRAM_TERMINATED", "External program terminated abnormally"));
        }

        let protocol: Vec<Value> = output
            .lines()
            .map(|line| {
                let message: String = line.chars().take(PROTOCOL_LINE_WIDTH).collect();
                json!({ "LENGTH": message.len().to_string(), "MESSAGE": message })
            })
            .collect();
        let mut result = rfc::record(json!({
            "STATUS": if code == 0 { "O" } else { "E" },
            "EXITCODE": code.to_string(),
        }));
        if !self.omit_protocol {
            result.insert("EXEC_PROTOCOL".to_string(), Value::Array(protocol));
        }
        Ok(result)
    }
}

impl RfcSession for FakeChannel {
    fn target(&self) -> &Target {
        &self.target
    }

    fn call(&self, function: &str, params: &RfcRecord) -> Result<RfcRecord, SxpgError> {
        self.calls.borrow_mut().push((function.to_string(), params.clone()));
        if self.unreachable {
            return Err(SxpgError::Connection {
                target: self.target.to_string(),
                message: "partner not reached".to_string(),
            });
        }

        match function {
            rfc::COMMAND_LIST_GET if self.deny_listing => Err(SxpgError::Authorization {
                target: self.target.to_string(),
                function: function.to_string(),
                message: "No RFC authorization for function module SXPG_COMMAND_LIST_GET".to_string(),
            }),
            rfc::COMMAND_LIST_GET => {
                let rows = serde_json::to_value(&self.registry).unwrap_or(Value::Null);
                Ok(rfc::record(json!({ "COMMAND_LIST": rows })))
            }
            rfc::COMMAND_DEFINITION_GET => {
                let name = rfc::text(params, "COMMANDNAME").unwrap_or_default();
                let command = self
                    .registered(name)
                    .ok_or_else(|| Self::exception(function, "COMMAND_NOT_FOUND", "External command not defined"))?;
                let definition = serde_json::to_value(command).unwrap_or(Value::Null);
                Ok(rfc::record(json!({ "COMMAND_DEFINITION": definition })))
            }
            rfc::CALL_SYSTEM => self.call_system(params),
            rfc::DELETE_FILE if self.fail_deletes => Err(Self::exception(function, "NO_AUTHORITY", "No authorization")),
            rfc::DELETE_FILE => {
                let path = format!(
                    "{}{}",
                    rfc::text(params, "DIR_NAME").unwrap_or_default(),
                    rfc::text(params, "FILE_NAME").unwrap_or_default()
                );
                match self.files.borrow_mut().remove(&path) {
                    Some(_) => Ok(RfcRecord::new()),
                    None => Err(Self::exception(function, "FILE_NOT_FOUND", "File not found")),
                }
            }
            other => Err(Self::exception(other, "FUNCTION_NOT_FOUND", "Function module not found")),
        }
    }
}
