//! Getting a command's output back.
//!
//! `SXPG_CALL_SYSTEM` only reports what the program printed through its
//! `EXEC_PROTOCOL` table, and not on every release or configuration. When
//! output is redirected into a file on the target it is read back with a
//! second call. Strategies are tried in order until one has the output.

use crate::{
    error::SxpgError,
    invocation::Invocation,
    rfc::{self, RfcRecord, RfcSession},
};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Width of a `MESSAGE` line in the protocol table. The server cuts longer
/// lines, whether they come from the command itself or from the reader.
pub const PROTOCOL_LINE_WIDTH: usize = 128;

/// One way of obtaining the output of a call
pub trait RetrievalStrategy {
    fn name(&self) -> &str;

    /// `Ok(None)` if this strategy has nothing to offer for the call,
    /// an error if it applied but failed
    fn retrieve(
        &self,
        session: &dyn RfcSession,
        invocation: &Invocation,
        response: &RfcRecord,
    ) -> Result<Option<String>, SxpgError>;
}

/// Join the `MESSAGE` lines of a protocol table, one line each
pub fn protocol_text(rows: &[Value]) -> String {
    let mut text = String::new();
    for row in rows {
        let line = row.get("MESSAGE").and_then(Value::as_str).unwrap_or_default();
        if line.chars().count() >= PROTOCOL_LINE_WIDTH {
            warn!(width = PROTOCOL_LINE_WIDTH, "protocol line fills the field and may be truncated");
        }
        text.push_str(line);
        text.push('\n');
    }
    text
}

/// Output as returned in the `EXEC_PROTOCOL` table of the call itself
pub struct ProtocolStrategy;

impl RetrievalStrategy for ProtocolStrategy {
    fn name(&self) -> &str {
        "protocol"
    }

    fn retrieve(
        &self,
        _session: &dyn RfcSession,
        invocation: &Invocation,
        response: &RfcRecord,
    ) -> Result<Option<String>, SxpgError> {
        let Some(rows) = rfc::table(response, rfc::CALL_SYSTEM, "EXEC_PROTOCOL")? else {
            return Ok(None);
        };
        if invocation.output_path.is_some() {
            // Output went to the file; the protocol holds shell diagnostics at most.
            debug!(lines = rows.len(), protocol = %protocol_text(rows), "protocol of redirected call");
            return Ok(None);
        }
        Ok(Some(protocol_text(rows)))
    }
}

/// Output redirected into a file on the target, printed by a registered reader
/// command and deleted afterwards
pub struct TempFileStrategy {
    /// Logical command that prints a file, `CAT` on most systems
    reader: String,
}

impl TempFileStrategy {
    pub fn new(reader: impl Into<String>) -> Self {
        Self { reader: reader.into() }
    }

    fn read(&self, session: &dyn RfcSession, path: &str) -> Result<String, SxpgError> {
        let params = rfc::record(json!({
            "COMMANDNAME": self.reader,
            "ADDITIONAL_PARAMETERS": path,
            "EXEC_PROTOCOL": [],
        }));
        let response = session.call(rfc::CALL_SYSTEM, &params)?;
        let exit_code = rfc::text(&response, "EXITCODE").map(str::trim).unwrap_or("0");
        let rows = rfc::table(&response, rfc::CALL_SYSTEM, "EXEC_PROTOCOL")?.unwrap_or_default();
        if !exit_code.is_empty() && exit_code != "0" {
            return Err(SxpgError::Invocation {
                target: session.target().to_string(),
                name: self.reader.clone(),
                message: format!("exit code {exit_code}: {}", protocol_text(rows).trim_end()),
            });
        }
        Ok(protocol_text(rows))
    }
}

/// Remove the temporary file. Failure only gets logged.
pub fn delete_temp_file(session: &dyn RfcSession, path: &str) {
    let split = path.rfind(['/', '\\']).map(|idx| idx + 1).unwrap_or(0);
    let (dir, file) = path.split_at(split);
    let params = rfc::record(json!({
        "DIR_NAME": dir,
        "FILE_NAME": file,
    }));
    match session.call(rfc::DELETE_FILE, &params) {
        Ok(_) => debug!(path, "temporary output file deleted"),
        Err(e) => warn!(path, error = %e, "could not delete temporary output file"),
    }
}

impl RetrievalStrategy for TempFileStrategy {
    fn name(&self) -> &str {
        "temp-file"
    }

    fn retrieve(
        &self,
        session: &dyn RfcSession,
        invocation: &Invocation,
        _response: &RfcRecord,
    ) -> Result<Option<String>, SxpgError> {
        let Some(path) = &invocation.output_path else {
            return Ok(None);
        };
        let read = self.read(session, path);
        delete_temp_file(session, path);
        read.map(Some)
    }
}

/// Runs the retrieval strategies in order
pub struct OutputRetriever {
    strategies: Vec<Box<dyn RetrievalStrategy>>,
}

impl OutputRetriever {
    pub fn new(strategies: Vec<Box<dyn RetrievalStrategy>>) -> Self {
        Self { strategies }
    }

    /// Protocol first, then the redirected file read with `reader`
    pub fn standard(reader: &str) -> Self {
        Self::new(vec![
            Box::new(ProtocolStrategy),
            Box::new(TempFileStrategy::new(reader)),
        ])
    }

    /// Output of the call. Empty if no strategy had anything, which is what
    /// a command printing nothing looks like; an error only if a strategy failed.
    pub fn retrieve(
        &self,
        session: &dyn RfcSession,
        invocation: &Invocation,
        response: &RfcRecord,
    ) -> Result<String, SxpgError> {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            match strategy.retrieve(session, invocation, response) {
                Ok(Some(output)) => {
                    debug!(strategy = strategy.name(), bytes = output.len(), "output retrieved");
                    return Ok(output);
                }
                Ok(None) => debug!(strategy = strategy.name(), "strategy does not apply"),
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "retrieval failed");
                    failures.push(format!("{}: {e}", strategy.name()));
                }
            }
        }

        if failures.is_empty() {
            Ok(String::new())
        } else {
            Err(SxpgError::OutputUnavailable {
                target: session.target().to_string(),
                name: invocation.command.clone(),
                reason: failures.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeChannel;
    use pretty_assertions::assert_eq;

    fn invocation(output_path: Option<&str>) -> Invocation {
        Invocation {
            command: "ZSH".to_string(),
            arguments: "-c id".to_string(),
            output_path: output_path.map(str::to_string),
        }
    }

    #[test]
    fn protocol_lines_are_joined() {
        let rows = vec![json!({"MESSAGE": "one"}), json!({"MESSAGE": "two"})];
        assert_eq!(protocol_text(&rows), "one\ntwo\n");
        assert_eq!(protocol_text(&[]), "");
    }

    #[test]
    fn protocol_strategy_reads_the_response() {
        let fake = FakeChannel::linux("host.example.com");
        let response = rfc::record(json!({"EXEC_PROTOCOL": [{"MESSAGE": "hello"}]}));
        let out = ProtocolStrategy.retrieve(&fake, &invocation(None), &response).unwrap();
        assert_eq!(out.as_deref(), Some("hello\n"));

        let out = ProtocolStrategy.retrieve(&fake, &invocation(None), &RfcRecord::new()).unwrap();
        assert_eq!(out, None);

        let out = ProtocolStrategy
            .retrieve(&fake, &invocation(Some("/tmp/x.out")), &response)
            .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn temp_file_is_read_and_deleted() {
        let fake = FakeChannel::linux("host.example.com");
        fake.put_file("/tmp/sxpg_1.out", "uid=0(root)\n");
        let strategy = TempFileStrategy::new("CAT");
        let out = strategy
            .retrieve(&fake, &invocation(Some("/tmp/sxpg_1.out")), &RfcRecord::new())
            .unwrap();
        assert_eq!(out.as_deref(), Some("uid=0(root)\n"));
        assert_eq!(fake.file("/tmp/sxpg_1.out"), None);
    }

    #[test]
    fn failed_cleanup_does_not_fail_retrieval() {
        let fake = FakeChannel::linux("host.example.com").fail_deletes();
        fake.put_file("/tmp/sxpg_2.out", "data\n");
        let out = TempFileStrategy::new("CAT")
            .retrieve(&fake, &invocation(Some("/tmp/sxpg_2.out")), &RfcRecord::new())
            .unwrap();
        assert_eq!(out.as_deref(), Some("data\n"));
        assert!(fake.file("/tmp/sxpg_2.out").is_some());
    }

    #[test]
    fn nothing_to_retrieve_is_empty_output() {
        let fake = FakeChannel::linux("host.example.com");
        let retriever = OutputRetriever::standard("CAT");
        let out = retriever.retrieve(&fake, &invocation(None), &RfcRecord::new()).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn failed_read_back_is_not_empty_output() {
        let fake = FakeChannel::linux("host.example.com");
        let retriever = OutputRetriever::standard("CAT");
        let err = retriever
            .retrieve(&fake, &invocation(Some("/tmp/missing.out")), &RfcRecord::new())
            .unwrap_err();
        assert!(matches!(err, SxpgError::OutputUnavailable { .. }), "{err:?}");
    }
}
