//! Remote command lines and the safe-mode guard
//!
//! With safe mode on, the program must be a plain path and every argument is
//! shell-quoted, so nothing reaches the remote shell unescaped. Turning it off
//! passes the command line through verbatim.

use std::fmt;

use crate::error::{HarnessError, Result};

/// Whether command lines are escaped before hitting the remote shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SafeMode {
    #[default]
    Enabled,
    Disabled,
}

impl SafeMode {
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            SafeMode::Enabled
        } else {
            SafeMode::Disabled
        }
    }

    pub fn is_enabled(self) -> bool {
        self == SafeMode::Enabled
    }
}

/// A program plus its arguments, as configured for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '<', '>', '(', ')', '$', '`', '\\', '"', '\'', '*', '?', '[', ']', '#', '~',
    '=', '%', '{', '}', '!',
];

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Render the string handed to the remote exec request
    pub fn render(&self, mode: SafeMode) -> Result<String> {
        let program = self.program.trim();
        if program.is_empty() {
            return Err(HarnessError::UnsafeCommand("empty command".to_string()));
        }

        match mode {
            SafeMode::Enabled => {
                if let Some(bad) = program
                    .chars()
                    .find(|c| c.is_whitespace() || SHELL_METACHARACTERS.contains(c))
                {
                    return Err(HarnessError::UnsafeCommand(format!(
                        "{:?} contains {:?}",
                        program, bad
                    )));
                }
                let mut words = Vec::with_capacity(self.args.len() + 1);
                words.push(program);
                words.extend(self.args.iter().map(String::as_str));
                Ok(shell_words::join(words))
            }
            SafeMode::Disabled => {
                let mut line = program.to_string();
                for arg in &self.args {
                    line.push(' ');
                    line.push_str(arg);
                }
                Ok(line)
            }
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
