//! What could possibly go wrong? Look here to find out.
//!
//! Error messages never contain the password of the SAP user.

use crate::rfc;
use std::{
    fmt,
    io,
    path::PathBuf,
    time::Duration,
};

/// The step of an execution or generation run at which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Establishing or using the RFC session
    Connect,
    /// Looking up the logical command in the target's registry
    Resolve,
    /// Constructing the function module parameters
    Build,
    /// Calling `SXPG_CALL_SYSTEM`
    Invoke,
    /// Getting the command output back
    Retrieve,
    /// Writing the proof-of-concept artifact
    Generate,
}

impl Stage {
    fn as_str(&self) -> &str {
        match self {
            Stage::Connect => "connect",
            Stage::Resolve => "resolve",
            Stage::Build => "build",
            Stage::Invoke => "invoke",
            Stage::Retrieve => "retrieve",
            Stage::Generate => "generate",
        }
    }

    /// Process exit code reported when a run fails at this stage
    pub fn exit_code(&self) -> u8 {
        match self {
            Stage::Connect => 2,
            Stage::Resolve => 3,
            Stage::Build => 4,
            Stage::Invoke => 5,
            Stage::Retrieve => 6,
            Stage::Generate => 7,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// These are the things that could go wrong while talking to a SAP system
#[derive(Debug, thiserror::Error)]
pub enum SxpgError {
    /// Session could not be established or the transport broke down
    #[error("connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    /// Transport gave up waiting for the server
    #[error("call to {function} on {target} timed out after {after:?}")]
    Timeout {
        target: String,
        function: String,
        after: Duration,
    },

    /// SAP user lacks the authorization for a function module
    #[error("not authorized to call {function} on {target}: {message}")]
    Authorization {
        target: String,
        function: String,
        message: String,
    },

    /// A function module raised an ABAP exception
    #[error("{function} raised {exception}: {message}")]
    RemoteException {
        function: String,
        exception: String,
        message: String,
    },

    /// The server answered with something we cannot interpret
    #[error("unexpected response from {function}: {message}")]
    MalformedResponse { function: String, message: String },

    /// Logical command is not registered on the target
    #[error("logical command {name} is not registered on {target}")]
    CommandNotFound { target: String, name: String },

    /// Arguments do not fit the parameter field of the function module
    #[error("arguments for {name} are {length} characters long, the limit is {limit}")]
    ArgumentTooLong {
        name: String,
        length: usize,
        limit: usize,
    },

    /// Arguments violate a constraint of the registered command or the field
    #[error("arguments for {name} rejected: {reason}")]
    ArgumentRejected { name: String, reason: String },

    /// `SXPG_CALL_SYSTEM` refused to start or finish the command
    #[error("executing {name} on {target} failed: {message}")]
    Invocation {
        target: String,
        name: String,
        message: String,
    },

    /// Every retrieval strategy that applied failed
    #[error("output of {name} on {target} unavailable: {reason}")]
    OutputUnavailable {
        target: String,
        name: String,
        reason: String,
    },

    /// Proof-of-concept artifact could not be written
    #[error("could not write artifact {}: {source}", .path.display())]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SxpgError {
    /// The stage a failure belongs to
    pub fn stage(&self) -> Stage {
        match self {
            SxpgError::Connection { .. }
            | SxpgError::Timeout { .. }
            | SxpgError::MalformedResponse { .. } => Stage::Connect,
            SxpgError::CommandNotFound { .. } => Stage::Resolve,
            SxpgError::ArgumentTooLong { .. } | SxpgError::ArgumentRejected { .. } => Stage::Build,
            SxpgError::Authorization { function, .. } => match function.as_str() {
                rfc::PING => Stage::Connect,
                rfc::COMMAND_LIST_GET | rfc::COMMAND_DEFINITION_GET => Stage::Resolve,
                rfc::DELETE_FILE => Stage::Retrieve,
                _ => Stage::Invoke,
            },
            SxpgError::RemoteException { .. }
            | SxpgError::Invocation { .. } => Stage::Invoke,
            SxpgError::OutputUnavailable { .. } => Stage::Retrieve,
            SxpgError::ArtifactWrite { .. } => Stage::Generate,
        }
    }

    /// Name of the ABAP exception if the server raised one
    pub fn exception(&self) -> Option<&str> {
        match self {
            SxpgError::RemoteException { exception, .. } => Some(exception),
            _ => None,
        }
    }
}
