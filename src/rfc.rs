//! The boundary to the SAP system: calling remote function modules.
//!
//! Parameters and results are flat records the way the SAP connector hands them
//! out: scalar fields are strings, tables are arrays of records.

use crate::{
    error::SxpgError,
    target::Target,
};
use serde_json::{Map, Value};
use std::ops::{Deref, DerefMut};
use tracing::info;

/// Checks that the logon works
pub const PING: &str = "RFC_PING";
/// Executes a registered external OS command
pub const CALL_SYSTEM: &str = "SXPG_CALL_SYSTEM";
/// Lists the external OS commands maintained in SM69
pub const COMMAND_LIST_GET: &str = "SXPG_COMMAND_LIST_GET";
/// Reads the definition of a single external OS command
pub const COMMAND_DEFINITION_GET: &str = "SXPG_COMMAND_DEFINITION_GET";
/// Deletes a file on the application server
pub const DELETE_FILE: &str = "EPS_DELETE_FILE";

/// Parameters of, or result from, one function module call
pub type RfcRecord = Map<String, Value>;

/// An authenticated connection that can call remote function modules.
/// This is the capability every component works against, so tests can
/// substitute a simulated SAP system.
pub trait RfcSession {
    /// The system this session is logged on to
    fn target(&self) -> &Target;

    /// Call `function` with `params` and wait for its result
    fn call(&self, function: &str, params: &RfcRecord) -> Result<RfcRecord, SxpgError>;

    /// Release the connection. Calling it twice must be harmless.
    fn close(&mut self) {}
}

/// Owns a session for the duration of one run and closes it on every exit path
pub struct Session {
    inner: Box<dyn RfcSession>,
}

impl Session {
    pub fn new(inner: Box<dyn RfcSession>) -> Self {
        Self { inner }
    }
}

impl Deref for Session {
    type Target = dyn RfcSession;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.close();
        info!(system = %self.inner.target(), "SAP session closed");
    }
}

/// Turn a `json!` object literal into call parameters
pub fn record(value: Value) -> RfcRecord {
    match value {
        Value::Object(map) => map,
        _ => RfcRecord::new(),
    }
}

/// A scalar field of a result, if present
pub fn text<'a>(record: &'a RfcRecord, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

/// A table of a result.
/// `Ok(None)` if the server did not send the table at all.
pub fn table<'a>(
    record: &'a RfcRecord,
    function: &str,
    field: &str,
) -> Result<Option<&'a [Value]>, SxpgError> {
    match record.get(field) {
        None => Ok(None),
        Some(Value::Array(rows)) => Ok(Some(rows)),
        Some(Value::String(s)) if s.is_empty() => Ok(Some(&[])),
        Some(_) => Err(SxpgError::MalformedResponse {
            function: function.to_string(),
            message: format!("{field} is not a table"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Credentials;
    use serde_json::json;
    use std::{cell::Cell, rc::Rc};

    struct CountingSession {
        target: Target,
        closed: Rc<Cell<u32>>,
    }

    impl RfcSession for CountingSession {
        fn target(&self) -> &Target {
            &self.target
        }

        fn call(&self, _function: &str, _params: &RfcRecord) -> Result<RfcRecord, SxpgError> {
            Ok(RfcRecord::new())
        }

        fn close(&mut self) {
            self.closed.set(self.closed.get() + 1);
        }
    }

    #[test]
    fn session_is_closed_when_dropped() {
        let closed = Rc::new(Cell::new(0));
        {
            let session = Session::new(Box::new(CountingSession {
                target: Target::new("h", "100", Credentials::new("u", "p")),
                closed: closed.clone(),
            }));
            session.call(CALL_SYSTEM, &RfcRecord::new()).unwrap();
            assert_eq!(closed.get(), 0);
        }
        assert_eq!(closed.get(), 1);
    }

    #[test]
    fn tables_are_told_apart_from_scalars() {
        let result = record(json!({
            "STATUS": "O",
            "EXEC_PROTOCOL": [{"MESSAGE": "uid=0(root)"}],
            "EMPTY": "",
        }));
        assert_eq!(text(&result, "STATUS"), Some("O"));
        assert_eq!(table(&result, CALL_SYSTEM, "EXEC_PROTOCOL").unwrap().unwrap().len(), 1);
        assert_eq!(table(&result, CALL_SYSTEM, "EMPTY").unwrap().unwrap().len(), 0);
        assert!(table(&result, CALL_SYSTEM, "MISSING").unwrap().is_none());
        assert!(table(&result, CALL_SYSTEM, "STATUS").is_err());
    }
}
