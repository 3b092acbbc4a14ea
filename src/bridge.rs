//! Executing a registered command end to end

use crate::{
    error::SxpgError,
    invocation::{Invocation, InvocationBuilder, ARGUMENT_FIELD_WIDTH},
    registry::{self, OsFilter},
    retrieve::{self, OutputRetriever, PROTOCOL_LINE_WIDTH},
    rfc::{self, RfcSession},
};
use serde_json::Value;
use tracing::{info, warn};

/// What came back from one execution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    /// `STATUS` of the call, `O` when the program ended normally
    pub status: Option<String>,
    /// `EXITCODE` of the program, if the server reports one
    pub exit_code: Option<String>,
    /// Captured output, unmodified
    pub output: String,
    /// Raw lines of the call's protocol table
    pub protocol: Vec<String>,
    /// The call as it was sent
    pub invocation: Invocation,
}

impl ExecutionResult {
    /// Whether the server reported a normal end of the program
    pub fn succeeded(&self) -> bool {
        let status_ok = self.status.as_deref().map_or(true, |s| s.trim() != "E");
        let exit_ok = self
            .exit_code
            .as_deref()
            .map(str::trim)
            .map_or(true, |c| c.is_empty() || c == "0");
        status_ok && exit_ok
    }

    /// Whether a line of the output filled the protocol field. Such lines may
    /// have been cut by the server, on the direct path and on read-back alike.
    pub fn possibly_truncated(&self) -> bool {
        self.output
            .lines()
            .any(|line| line.chars().count() >= PROTOCOL_LINE_WIDTH)
    }
}

/// Resolves, builds, calls and retrieves. Never retries: running an
/// arbitrary OS command twice is not something to do behind the user's back.
pub struct ExecutionBridge {
    filter: OsFilter,
    builder: InvocationBuilder,
    retriever: OutputRetriever,
}

impl ExecutionBridge {
    pub fn new(filter: OsFilter, builder: InvocationBuilder, retriever: OutputRetriever) -> Self {
        Self {
            filter,
            builder,
            retriever,
        }
    }

    /// Run the logical command `name` with `arguments` and capture what it printed
    pub fn execute(
        &self,
        session: &dyn RfcSession,
        name: &str,
        arguments: &str,
    ) -> Result<ExecutionResult, SxpgError> {
        let command = registry::resolve(session, name, self.filter)?;
        let invocation = self.builder.build(&command, arguments)?;
        info!(
            command = %invocation.command,
            os_command = %command.os_command,
            parameters = %invocation.additional_parameters(),
            "executing"
        );

        let response = match session.call(rfc::CALL_SYSTEM, &invocation.to_params()) {
            Ok(response) => response,
            Err(e) => {
                if let Some(path) = &invocation.output_path {
                    retrieve::delete_temp_file(session, path);
                }
                return Err(call_error(session, &invocation, e));
            }
        };

        let output = self.retriever.retrieve(session, &invocation, &response)?;
        let protocol = rfc::table(&response, rfc::CALL_SYSTEM, "EXEC_PROTOCOL")?
            .unwrap_or_default()
            .iter()
            .filter_map(|row| row.get("MESSAGE").and_then(Value::as_str).map(str::to_string))
            .collect();

        let result = ExecutionResult {
            status: rfc::text(&response, "STATUS").map(str::to_string),
            exit_code: rfc::text(&response, "EXITCODE").map(str::to_string),
            output,
            protocol,
            invocation,
        };
        if !result.succeeded() {
            warn!(
                status = result.status.as_deref().unwrap_or_default(),
                exit_code = result.exit_code.as_deref().unwrap_or_default(),
                "command reported a failure"
            );
        }
        if result.possibly_truncated() {
            warn!(width = PROTOCOL_LINE_WIDTH, "output lines fill the protocol field and may be truncated");
        }
        Ok(result)
    }
}

/// Translate the exceptions of `SXPG_CALL_SYSTEM` into the stage they belong to
fn call_error(session: &dyn RfcSession, invocation: &Invocation, e: SxpgError) -> SxpgError {
    let target = session.target().to_string();
    let name = invocation.command.clone();
    let (exception, message) = match e {
        SxpgError::RemoteException { exception, message, .. } => (exception, message),
        other => return other,
    };
    match exception.as_str() {
        "COMMAND_NOT_FOUND" => SxpgError::CommandNotFound { target, name },
        "PARAMETERS_TOO_LONG" => SxpgError::ArgumentTooLong {
            name,
            length: invocation.additional_parameters().chars().count(),
            limit: ARGUMENT_FIELD_WIDTH,
        },
        "PARAMETER_EXPECTED" | "TOO_MANY_PARAMETERS" | "SECURITY_RISK" | "ILLEGAL_COMMAND"
        | "WRONG_CHECK_CALL_INTERFACE" => SxpgError::ArgumentRejected {
            name,
            reason: format!("{exception}: {message}"),
        },
        _ => SxpgError::Invocation {
            target,
            name,
            message: format!("{exception}: {message}"),
        },
    }
}
