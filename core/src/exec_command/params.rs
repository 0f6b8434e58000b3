use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde::de;
use serde::de::Deserializer;
use shlex::try_join;

use super::record::ProcessMode;

/// Arguments to `execute()`. Deserializes from the `exec_command` tool call
/// as well, where `command` may arrive as a shell string or an argv array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecuteRequest {
    #[serde(alias = "cmd", deserialize_with = "deserialize_command")]
    pub command: String,

    #[serde(default)]
    pub mode: ProcessMode,

    /// Defaults to the configured working directory, then the current one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Active mode only. `None` uses the configured default; `0` never
    /// times out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecuteRequest {
    pub fn new(command: impl Into<String>, mode: ProcessMode) -> Self {
        Self {
            command: command.into(),
            mode,
            cwd: None,
            timeout_ms: None,
        }
    }

    pub fn active(command: impl Into<String>) -> Self {
        Self::new(command, ProcessMode::Active)
    }

    pub fn background(command: impl Into<String>) -> Self {
        Self::new(command, ProcessMode::Background)
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

fn deserialize_command<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CommandSpec {
        Str(String),
        Seq(Vec<String>),
    }

    let command = match CommandSpec::deserialize(deserializer)? {
        CommandSpec::Str(raw) => match parse_bracketed_tokens(&raw) {
            Some(tokens) => join_tokens(&tokens).map_err(de::Error::custom)?,
            None => raw,
        },
        CommandSpec::Seq(parts) => join_tokens(&parts).map_err(de::Error::custom)?,
    };
    if command.trim().is_empty() {
        return Err(de::Error::custom("command must not be empty"));
    }
    Ok(command)
}

fn join_tokens(tokens: &[String]) -> Result<String, String> {
    try_join(tokens.iter().map(String::as_str))
        .map_err(|err| format!("failed to join command parts: {err}"))
}

/// Models sometimes send `"['ls','-la']"` instead of a JSON array.
fn parse_bracketed_tokens(source: &str) -> Option<Vec<String>> {
    let inner = source.trim().strip_prefix('[')?.strip_suffix(']')?;
    let mut tokens = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(quote) = chars.next() else {
            break;
        };
        if quote != '\'' && quote != '"' {
            return None;
        }
        let mut current = String::new();
        let mut escaped = false;
        let mut closed = false;
        for next in chars.by_ref() {
            if escaped {
                current.push(next);
                escaped = false;
                continue;
            }
            match next {
                '\\' => escaped = true,
                c if c == quote => {
                    closed = true;
                    break;
                }
                c => current.push(c),
            }
        }
        if !closed {
            return None;
        }
        tokens.push(current);
    }
    Some(tokens)
}
