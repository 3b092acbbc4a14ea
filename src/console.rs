//! Interactive console: one session, many commands.
//!
//! History lives in memory only and is gone when the console closes.

use crate::{
    bridge::ExecutionBridge,
    error::{Stage, SxpgError},
    registry::{self, CommandListing, OsFilter},
    rfc::RfcSession,
};
use anyhow::Result;
use rustyline::{
    completion::{Completer, Pair},
    config::Config,
    error::ReadlineError,
    highlight::Highlighter,
    hint::Hinter,
    history::DefaultHistory,
    validate::Validator,
    CompletionType, Context, Editor, Helper,
};
use std::io::{self, Write};
use tracing::{error, info, warn};

/// Short names for commands most systems register
const ALIASES: [(&str, &str); 4] = [
    ("ls", "LIST_DB2DUMP"),
    ("cat", "CAT"),
    ("ps", "PS"),
    ("env", "ENV"),
];
const HELP: [&str; 3] = ["h", "help", "?"];
const EXIT: [&str; 3] = ["exit", "quit", "q"];

/// What the user asked for on one line
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    Empty,
    Exit,
    Help,
    Run { command: String, arguments: String },
}

/// The first word names the command, the rest goes to it unmodified
pub fn parse_line(line: &str) -> Line {
    let line = line.trim();
    if line.is_empty() {
        return Line::Empty;
    }
    let (word, arguments) = match line.split_once(' ') {
        Some((word, arguments)) => (word, arguments.trim_start()),
        None => (line, ""),
    };
    if EXIT.iter().any(|exit| exit.eq_ignore_ascii_case(word)) {
        return Line::Exit;
    }
    if HELP.contains(&word) {
        return Line::Help;
    }
    let command = ALIASES
        .iter()
        .find(|(alias, _)| *alias == word)
        .map_or(word, |&(_, name)| name);
    Line::Run {
        command: command.to_string(),
        arguments: arguments.to_string(),
    }
}

/// Completes the first word from the built-ins and the registry
pub struct CommandCompleter {
    names: Vec<String>,
}

impl CommandCompleter {
    pub fn new(registered: impl IntoIterator<Item = String>) -> Self {
        let mut names: Vec<String> = ALIASES
            .iter()
            .map(|(alias, _)| *alias)
            .chain(HELP)
            .chain(["exit"])
            .map(str::to_string)
            .collect();
        for name in registered {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Self { names }
    }

    fn candidates(&self, word: &str) -> Vec<Pair> {
        let word = word.to_lowercase();
        self.names
            .iter()
            .filter(|name| name.to_lowercase().starts_with(&word))
            .map(|name| Pair {
                display: name.clone(),
                replacement: name.clone(),
            })
            .collect()
    }
}

impl Completer for CommandCompleter {
    type Candidate = Pair;

    fn complete(&self, line: &str, pos: usize, _ctx: &Context<'_>) -> rustyline::Result<(usize, Vec<Pair>)> {
        let before = &line[..pos];
        if before.contains(' ') {
            return Ok((pos, Vec::new()));
        }
        Ok((0, self.candidates(before)))
    }
}

impl Hinter for CommandCompleter {
    type Hint = String;
}

impl Highlighter for CommandCompleter {}

impl Validator for CommandCompleter {}

impl Helper for CommandCompleter {}

/// What the loop does after a line was handled
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
    /// Continue with these names for completion
    Refresh(Vec<String>),
}

pub struct Console<'a> {
    session: &'a dyn RfcSession,
    filter: OsFilter,
    bridge: ExecutionBridge,
}

impl<'a> Console<'a> {
    pub fn new(session: &'a dyn RfcSession, filter: OsFilter, bridge: ExecutionBridge) -> Self {
        Self {
            session,
            filter,
            bridge,
        }
    }

    fn listing(&self) -> Result<CommandListing, SxpgError> {
        let commands = registry::list_registered_commands(self.session)?;
        Ok(CommandListing::new(self.session.target().identifier(), self.filter, commands))
    }

    fn command_names(&self) -> Vec<String> {
        match self.listing() {
            Ok(listing) => listing.commands.into_iter().map(|c| c.name).collect(),
            Err(e) => {
                warn!(error = %e, "no registry names for completion");
                Vec::new()
            }
        }
    }

    /// Handle one input line. Failures of a single command are logged and the
    /// console carries on; a broken session ends it.
    pub fn handle(&self, line: &str, out: &mut dyn Write) -> Result<Flow> {
        let outcome = match parse_line(line) {
            Line::Empty => return Ok(Flow::Continue),
            Line::Exit => return Ok(Flow::Exit),
            Line::Help => self.listing().map(|listing| {
                let names = listing.commands.iter().map(|c| c.name.clone()).collect();
                (listing.to_string(), Flow::Refresh(names))
            }),
            Line::Run { command, arguments } => self
                .bridge
                .execute(self.session, &command, &arguments)
                .map(|result| (result.output, Flow::Continue)),
        };
        match outcome {
            Ok((text, flow)) => {
                out.write_all(text.as_bytes())?;
                out.flush()?;
                Ok(flow)
            }
            Err(e) if e.stage() == Stage::Connect => Err(e.into()),
            Err(e) => {
                error!(stage = %e.stage(), "{e}");
                Ok(Flow::Continue)
            }
        }
    }

    /// Prompt until the user leaves
    pub fn run(&self) -> Result<()> {
        let config = Config::builder()
            .history_ignore_space(true)
            .history_ignore_dups(true)?
            .completion_type(CompletionType::List)
            .auto_add_history(true)
            .build();
        let mut editor: Editor<CommandCompleter, DefaultHistory> = Editor::with_config(config)?;
        editor.set_helper(Some(CommandCompleter::new(self.command_names())));

        let prompt = format!("{} ({})$ ", self.session.target(), self.filter);
        let mut stdout = io::stdout();
        loop {
            match editor.readline(&prompt) {
                Ok(line) => match self.handle(&line, &mut stdout)? {
                    Flow::Continue => {}
                    Flow::Exit => break,
                    Flow::Refresh(names) => editor.set_helper(Some(CommandCompleter::new(names))),
                },
                Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        info!(system = %self.session.target(), "console closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fake::{FakeChannel, ID_OUTPUT},
        invocation::InvocationBuilder,
        retrieve::OutputRetriever,
        rfc,
    };
    use pretty_assertions::assert_eq;

    fn console(fake: &FakeChannel) -> Console<'_> {
        let bridge = ExecutionBridge::new(
            OsFilter::Linux,
            InvocationBuilder::direct(),
            OutputRetriever::standard("CAT"),
        );
        Console::new(fake, OsFilter::Linux, bridge)
    }

    fn run(console: &Console<'_>, line: &str) -> (Flow, String) {
        let mut out = Vec::new();
        let flow = console.handle(line, &mut out).unwrap();
        (flow, String::from_utf8(out).unwrap())
    }

    #[test]
    fn lines_name_a_command_and_its_arguments() {
        assert_eq!(parse_line("   "), Line::Empty);
        assert_eq!(parse_line("exit"), Line::Exit);
        assert_eq!(parse_line("QUIT"), Line::Exit);
        assert_eq!(parse_line("?"), Line::Help);
        assert_eq!(
            parse_line("ls /usr/sap"),
            Line::Run {
                command: "LIST_DB2DUMP".to_string(),
                arguments: "/usr/sap".to_string(),
            }
        );
        assert_eq!(
            parse_line("ZSH -c uname${IFS}-a"),
            Line::Run {
                command: "ZSH".to_string(),
                arguments: "-c uname${IFS}-a".to_string(),
            }
        );
    }

    #[test]
    fn commands_and_aliases_run_through_one_session() {
        let fake = FakeChannel::linux("host.example.com");
        let console = console(&fake);
        assert_eq!(run(&console, "ZSH -c id"), (Flow::Continue, ID_OUTPUT.to_string()));
        assert_eq!(run(&console, "ls /tmp"), (Flow::Continue, "total 0\n".to_string()));
        let (_, env) = run(&console, "env");
        assert!(env.contains("SHELL=/bin/bash"));
        let sent = fake.params_of(rfc::CALL_SYSTEM);
        assert_eq!(rfc::text(&sent[1], "COMMANDNAME"), Some("LIST_DB2DUMP"));
        assert_eq!(rfc::text(&sent[1], "ADDITIONAL_PARAMETERS"), Some("/tmp"));
        assert_eq!(run(&console, "q"), (Flow::Exit, String::new()));
    }

    #[test]
    fn failed_commands_do_not_end_the_console() {
        let fake = FakeChannel::linux("host.example.com");
        let console = console(&fake);
        assert_eq!(run(&console, "ZNOPE"), (Flow::Continue, String::new()));
        assert_eq!(run(&console, "env FOO=bar"), (Flow::Continue, String::new()));
        assert_eq!(run(&console, "").0, Flow::Continue);
    }

    #[test]
    fn lost_sessions_end_the_console() {
        let fake = FakeChannel::unreachable("host.example.com");
        let console = console(&fake);
        let mut out = Vec::new();
        let err = console.handle("ZSH -c id", &mut out).unwrap_err();
        let err = err.downcast_ref::<SxpgError>().unwrap();
        assert_eq!(err.stage(), Stage::Connect);
    }

    #[test]
    fn help_lists_the_registry_and_refreshes_completion() {
        let fake = FakeChannel::linux("host.example.com");
        let console = console(&fake);
        let (flow, text) = run(&console, "help");
        assert!(text.contains("* ZSH"));
        match flow {
            Flow::Refresh(names) => {
                assert!(names.contains(&"ZSH".to_string()));
                assert!(!names.contains(&"ZCMD".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn completion_covers_builtins_and_registry() {
        let completer = CommandCompleter::new(["ZSH".to_string(), "LIST_DB2DUMP".to_string(), "ls".to_string()]);
        let names = |word: &str| -> Vec<String> {
            completer.candidates(word).into_iter().map(|p| p.replacement).collect()
        };
        assert_eq!(names("z"), vec!["ZSH".to_string()]);
        assert_eq!(names("l"), vec!["ls".to_string(), "LIST_DB2DUMP".to_string()]);
        assert!(names("e").contains(&"exit".to_string()));
        assert!(names("e").contains(&"env".to_string()));
    }
}
