use crate::error::ProtocolViolation;

pub const QUIT: &str = "/quit";

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Quit,
    Say(String),
}

/// Only the exact line `/quit` is a command; everything else is chat.
pub fn parse_command(line: String) -> Command {
    if line == QUIT {
        Command::Quit
    } else {
        Command::Say(line)
    }
}

/// First line of a session: the display name, trimmed.
pub fn parse_name(line: &str) -> Result<String, ProtocolViolation> {
    let name = line.trim();
    if name.is_empty() {
        return Err(ProtocolViolation::EmptyName);
    }

    Ok(name.to_string())
}
