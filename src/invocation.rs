//! Building the parameters of one `SXPG_CALL_SYSTEM` call

use crate::{
    error::SxpgError,
    registry::RegisteredCommand,
    rfc::{self, RfcRecord},
};
use serde_json::json;
use uuid::Uuid;

/// Width of the parameter field of `SXPG_CALL_SYSTEM`.
/// Default parameters, additional parameters and any redirection share it.
pub const ARGUMENT_FIELD_WIDTH: usize = 128;

/// One call of a registered command.
/// Lives only as long as the execution it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    /// Logical command name as registered
    pub command: String,
    /// Caller's arguments, passed on byte for byte
    pub arguments: String,
    /// File on the target host receiving the command's output, if redirected
    pub output_path: Option<String>,
}

impl Invocation {
    /// Value of the `ADDITIONAL_PARAMETERS` field.
    /// The server splits it on spaces before handing it to the program, so a
    /// redirection is glued to the last word, which the shell evaluates.
    pub fn additional_parameters(&self) -> String {
        match &self.output_path {
            Some(path) => format!("{}{}", self.arguments.trim_end(), redirection_suffix(path)),
            None => self.arguments.clone(),
        }
    }

    /// Parameters of the `SXPG_CALL_SYSTEM` call
    pub fn to_params(&self) -> RfcRecord {
        rfc::record(json!({
            "COMMANDNAME": self.command,
            "ADDITIONAL_PARAMETERS": self.additional_parameters(),
            "EXEC_PROTOCOL": [],
        }))
    }
}

fn redirection_suffix(path: &str) -> String {
    format!(">{path}")
}

/// Directory for redirected output on the target host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTemp {
    pub dir: String,
}

impl RemoteTemp {
    pub fn new(dir: impl Into<String>) -> Self {
        Self { dir: dir.into() }
    }

    /// Usual temporary directory for the command's operating system
    pub fn default_for(command: &RegisteredCommand) -> Self {
        if is_windows(command) {
            Self::new("C:\\Windows\\Temp")
        } else {
            Self::new("/tmp")
        }
    }

    /// A fresh file name inside the directory
    fn unique_path(&self, windows: bool) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let separator = if windows { '\\' } else { '/' };
        let dir = self.dir.trim_end_matches(['/', '\\']);
        format!("{dir}{separator}sxpg_{}.out", &id[..12])
    }
}

fn is_windows(command: &RegisteredCommand) -> bool {
    command.os.to_lowercase().contains("windows")
}

/// Turns a registered command and an argument string into an [`Invocation`]
#[derive(Clone, Debug, Default)]
pub struct InvocationBuilder {
    /// Redirect output into a temporary file, in this directory if given
    redirect: Option<Option<RemoteTemp>>,
}

impl InvocationBuilder {
    /// Output comes back in the call's protocol
    pub fn direct() -> Self {
        Self { redirect: None }
    }

    /// Output goes to a temporary file on the target to be read back afterwards
    pub fn redirecting(dir: Option<RemoteTemp>) -> Self {
        Self { redirect: Some(dir) }
    }

    pub fn redirects(&self) -> bool {
        self.redirect.is_some()
    }

    /// Arguments are never altered: what does not fit is an error.
    /// Shell metacharacters pass through untouched; quoting is the caller's business.
    ///
    /// Redirection only works for commands whose last argument is a shell
    /// script, such as `/bin/sh -c`, because no shell sees the field as a whole.
    pub fn build(&self, command: &RegisteredCommand, arguments: &str) -> Result<Invocation, SxpgError> {
        let output_path = self.redirect.as_ref().map(|dir| {
            let dir = dir.clone().unwrap_or_else(|| RemoteTemp::default_for(command));
            dir.unique_path(is_windows(command))
        });
        let invocation = Invocation {
            command: command.name.clone(),
            arguments: arguments.to_string(),
            output_path,
        };

        let defined = command.parameters.trim_end().chars().count();
        let additional = invocation.additional_parameters().chars().count();
        let separator = usize::from(defined > 0 && additional > 0);
        let length = defined + separator + additional;
        if length > ARGUMENT_FIELD_WIDTH {
            return Err(SxpgError::ArgumentTooLong {
                name: command.name.clone(),
                length,
                limit: ARGUMENT_FIELD_WIDTH,
            });
        }

        let rejected = |reason: String| SxpgError::ArgumentRejected {
            name: command.name.clone(),
            reason,
        };
        if !command.additional_parameters && (!arguments.is_empty() || self.redirects()) {
            return Err(rejected(
                "the command does not accept additional parameters".to_string(),
            ));
        }
        if let Some(c) = arguments.chars().find(|c| c.is_control()) {
            return Err(rejected(format!("contains control character {c:?}")));
        }
        if let Some(path) = &invocation.output_path {
            if arguments.trim().is_empty() {
                return Err(rejected("redirection needs a script to attach to".to_string()));
            }
            if path.contains(char::is_whitespace) {
                return Err(rejected(format!("temporary path '{path}' contains whitespace")));
            }
        }

        Ok(invocation)
    }
}
