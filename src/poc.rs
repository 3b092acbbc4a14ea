//! Proof-of-concept artifacts for an external execution harness.
//!
//! The artifact is a Python module exposing `execute(command) -> str`. It
//! carries its own copy of the target, the credentials and the logical
//! command, and logs on again for every command, so it works without this
//! tool and outside of this process.

use crate::{
    error::SxpgError,
    invocation::ARGUMENT_FIELD_WIDTH,
    target::{ConnectionMode, Target},
};
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::info;

const TEMPLATE: &str = include_str!("poc_template.py");

/// File extension of generated artifacts
pub const ARTIFACT_EXTENSION: &str = "py";

/// A generated artifact and where it was written
#[derive(Debug)]
pub struct PocArtifact {
    pub path: PathBuf,
    pub contents: String,
}

/// Python string literal. JSON string syntax is a subset of it.
fn literal(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// `poc_<host>_<command>.py`; the same inputs always give the same name
pub fn artifact_file_name(target: &Target, command: &str) -> String {
    format!("poc_{}_{command}.{ARTIFACT_EXTENSION}", target.identifier())
}

fn connection_params(target: &Target) -> String {
    let mut lines = Vec::new();
    match &target.mode {
        ConnectionMode::Direct { sysnr, group } => {
            lines.push(format!("conn_params[\"ashost\"] = {}", literal(&target.host)));
            lines.push(format!("conn_params[\"sysnr\"] = {}", literal(sysnr)));
            if let Some(group) = group {
                lines.push(format!("conn_params[\"group\"] = {}", literal(group)));
            }
        }
        ConnectionMode::LoadBalanced { mshost, r3name, group } => {
            lines.push(format!("conn_params[\"mshost\"] = {}", literal(mshost)));
            lines.push(format!("conn_params[\"r3name\"] = {}", literal(r3name)));
            lines.push(format!("conn_params[\"group\"] = {}", literal(group)));
        }
    }
    lines.iter().map(|l| format!("    {l}")).collect::<Vec<_>>().join("\n")
}

/// Replace every `{{KEY}}` in one pass, so substituted values are never rescanned
fn fill(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let value = after
            .find("}}")
            .and_then(|end| values.iter().find(|(key, _)| *key == &after[..end]).map(|(_, v)| (end, v)));
        match value {
            Some((end, value)) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Fill in the template. Pure: equal inputs give byte-identical output.
pub fn render(target: &Target, command: &str) -> String {
    let trace = if target.trace {
        "    conn_params[\"trace\"] = \"3\""
    } else {
        "    # RFC trace disabled"
    };
    fill(
        TEMPLATE,
        &[
            ("SYSTEM", target.identifier().to_string()),
            ("COMMAND", command.to_string()),
            ("COMMAND_LITERAL", literal(command)),
            ("FIELD_WIDTH", ARGUMENT_FIELD_WIDTH.to_string()),
            ("USER", literal(&target.credentials.user)),
            ("PASSWORD", literal(target.credentials.password.expose())),
            ("CLIENT", literal(&target.client)),
            ("LANGUAGE", literal(&target.language)),
            ("CONNECTION_PARAMS", connection_params(target)),
            ("TRACE_PARAM", trace.to_string()),
            ("TIMEOUT", target.timeout.as_secs().to_string()),
        ],
    )
}

/// The name must stay a plain file name inside the output directory
fn check_component(value: &str) -> io::Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{value}' cannot be part of a file name"),
        ));
    }
    Ok(())
}

/// Credentials are in the clear, so only the owner may read the file
fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Write the artifact for `command` on `target` into `output_dir`,
/// replacing an earlier one for the same target and command
pub fn generate(target: &Target, command: &str, output_dir: &Path) -> Result<PocArtifact, SxpgError> {
    let path = output_dir.join(artifact_file_name(target, command));
    let write_error = |source: io::Error| SxpgError::ArtifactWrite {
        path: path.clone(),
        source,
    };

    check_component(target.identifier()).map_err(write_error)?;
    check_component(command).map_err(write_error)?;

    let contents = render(target, command);
    write_private(&path, &contents).map_err(write_error)?;
    info!(path = %path.display(), command, "proof-of-concept written");
    Ok(PocArtifact { path, contents })
}
