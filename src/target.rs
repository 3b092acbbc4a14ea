//! Coordinates and credentials of one SAP application server

use std::{
    fmt,
    time::Duration,
};
use zeroize::Zeroize;

/// Password of the SAP user.
/// Never shown by `Debug` and wiped from memory when dropped.
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    /// Use this only when handing the password to the transport or the artifact
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Password(***)")
    }
}

/// User and password used for the RFC logon
#[derive(Clone, Debug)]
pub struct Credentials {
    pub user: String,
    pub password: Password,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Password::new(password),
        }
    }
}

/// How the application server is reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Straight to the application server with the given system number
    Direct {
        sysnr: String,
        group: Option<String>,
    },
    /// Through the message server of the system, picking a server of the logon group
    LoadBalanced {
        mshost: String,
        r3name: String,
        group: String,
    },
}

/// One SAP application server instance.
/// Built once from the command line and never changed afterwards.
#[derive(Clone, Debug)]
pub struct Target {
    /// Host name or address of the application server
    pub host: String,
    /// Three digit SAP client, e.g. `100`
    pub client: String,
    pub credentials: Credentials,
    pub mode: ConnectionMode,
    /// Logon language
    pub language: String,
    /// Transport timeout for every call
    pub timeout: Duration,
    /// Whether the RFC trace is switched on in generated artifacts
    pub trace: bool,
}

impl Target {
    /// Direct connection with system number `00` and the usual defaults
    pub fn new(host: impl Into<String>, client: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            client: client.into(),
            credentials,
            mode: ConnectionMode::Direct {
                sysnr: "00".to_string(),
                group: None,
            },
            language: "EN".to_string(),
            timeout: Duration::from_secs(30),
            trace: true,
        }
    }

    pub fn with_mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Host that identifies the system: the message server when load balancing,
    /// the application server otherwise
    pub fn identifier(&self) -> &str {
        match &self.mode {
            ConnectionMode::LoadBalanced { mshost, .. } => mshost,
            ConnectionMode::Direct { .. } => &self.host,
        }
    }

    /// System number, if connecting directly
    pub fn sysnr(&self) -> Option<&str> {
        match &self.mode {
            ConnectionMode::Direct { sysnr, .. } => Some(sysnr),
            ConnectionMode::LoadBalanced { .. } => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}
