//! Chat text protocol parser and response generator.
//!
//! Client commands are single newline-terminated lines:
//! - `JOIN <nickname>`
//! - `MSG <text>`
//! - `LIST`
//! - `QUIT`
//!
//! The verb is case-insensitive. Everything after the first space is the
//! argument, passed through untouched apart from the line terminator.

/// Nickname used for messages originated by the server itself
pub const SERVER_NICKNAME: &str = "SERVER";

/// Command verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Register a nickname
    Join,
    /// Broadcast a message to everyone else
    Msg,
    /// List registered nicknames
    List,
    /// Leave and close the connection
    Quit,
    /// Anything else
    Unknown,
}

impl Verb {
    fn from_word(word: &str) -> Self {
        match word.to_uppercase().as_str() {
            "JOIN" => Verb::Join,
            "MSG" => Verb::Msg,
            "LIST" => Verb::List,
            "QUIT" => Verb::Quit,
            _ => Verb::Unknown,
        }
    }
}

/// Parsed client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    /// Raw text after the first space, empty if there was none
    pub argument: String,
}

impl Command {
    /// Parse one input line.
    ///
    /// Never fails: malformed input yields `Verb::Unknown`.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);

        let (word, argument) = match line.split_once(' ') {
            Some((word, rest)) => (word, rest),
            None => (line, ""),
        };

        Command {
            verb: Verb::from_word(word),
            argument: argument.to_string(),
        }
    }

    /// True if the argument is empty or only whitespace
    pub fn argument_is_blank(&self) -> bool {
        self.argument.trim().is_empty()
    }
}

/// Response line builders.
///
/// Lines are returned without a terminator; the session appends `\n` on send.
pub struct Response;

impl Response {
    pub fn ok(text: &str) -> String {
        format!("OK: {}", text)
    }

    pub fn error(text: &str) -> String {
        format!("ERROR: {}", text)
    }

    pub fn bye(text: &str) -> String {
        format!("BYE: {}", text)
    }

    /// `USERS: a, b, c`, or `USERS: none online` for an empty list
    pub fn users<S: AsRef<str>>(nicknames: &[S]) -> String {
        if nicknames.is_empty() {
            return "USERS: none online".to_string();
        }
        let joined = nicknames
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(", ");
        format!("USERS: {}", joined)
    }

    /// Broadcast line as seen by recipients
    pub fn chat(sender: &str, text: &str) -> String {
        format!("[{}]: {}", sender, text)
    }
}
