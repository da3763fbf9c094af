//! Splits a client request body into an ordered sequence of protocol v2
//! commands (`spec.md` §4.1).

use bytes::Bytes;

use crate::error::Error;
use crate::pktline::{PktLine, PktLineParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
    LsRefs,
    Fetch,
}

impl CommandName {
    fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"ls-refs" => Some(CommandName::LsRefs),
            b"fetch" => Some(CommandName::Fetch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandName::LsRefs => "ls-refs",
            CommandName::Fetch => "fetch",
        }
    }
}

/// One parsed command: its name, its argument lines (unparsed, as received),
/// and the exact original pkt-line-framed bytes covering it (command line
/// through the terminating flush, inclusive) for verbatim forwarding.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: CommandName,
    pub args: Vec<Bytes>,
    pub raw: Bytes,
}

impl Command {
    /// Argument lines with a `<key> <value>\n` or `<key>\n` shape, split on
    /// the first space and with the trailing newline stripped.
    pub fn arg_lines(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.args.iter().filter_map(|line| {
            let line = std::str::from_utf8(line).ok()?.trim_end_matches('\n');
            match line.split_once(' ') {
                Some((k, v)) => Some((k, Some(v))),
                None => Some((line, None)),
            }
        })
    }
}

fn strip_command_line(payload: &[u8]) -> Option<&[u8]> {
    let payload = payload.strip_prefix(b"command=")?;
    Some(payload.strip_suffix(b"\n").unwrap_or(payload))
}

/// Parses every command in `body`. An empty body yields an empty vector. An
/// unknown command name, or a command left open at end of input (no
/// terminating flush), is `Error::InvalidArgument`. Bytes following the
/// last successfully parsed command that don't themselves look like a new
/// command are tolerated and discarded.
pub fn parse_commands(body: Bytes) -> Result<Vec<Command>, Error> {
    let total_len = body.len();
    let mut parser = PktLineParser::new(body.clone());
    let mut commands = Vec::new();

    loop {
        let start_offset = total_len - parser.remainder().len();

        let next = match parser.next() {
            Ok(next) => next,
            Err(err) => {
                if commands.is_empty() {
                    return Err(err);
                }
                break; // malformed trailing garbage, tolerated
            }
        };

        let payload = match next {
            None => break,
            Some(PktLine::Flush) | Some(PktLine::Delim) => continue,
            Some(PktLine::Data(payload)) => payload,
        };

        let Some(name_bytes) = strip_command_line(&payload) else {
            if commands.is_empty() {
                return Err(Error::InvalidArgument("expected command= line".into()));
            }
            break; // trailing garbage that isn't a new command
        };

        let Some(name) = CommandName::parse(name_bytes) else {
            return Err(Error::InvalidArgument(format!(
                "unknown command {:?}",
                String::from_utf8_lossy(name_bytes)
            )));
        };

        let mut args = Vec::new();
        loop {
            match parser.next()? {
                None => return Err(Error::InvalidArgument("truncated command".into())),
                Some(PktLine::Flush) => break,
                Some(PktLine::Delim) => continue,
                Some(PktLine::Data(arg)) => args.push(arg),
            }
        }

        let end_offset = total_len - parser.remainder().len();
        let raw = body.slice(start_offset..end_offset);
        commands.push(Command { name, args, raw });
    }

    Ok(commands)
}
