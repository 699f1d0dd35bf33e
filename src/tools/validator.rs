//! Command Validation Module
//!
//! This module gates every command before any process is spawned.
//! Validation is a pure accept/reject decision; sanitization is a second,
//! independent pass that strips residual shell metacharacters; tokenization
//! turns the result into an argv so commands never go through a shell.

/// The only command prefix accepted. The invoked tool is fixed.
pub const AZ_PREFIX: &str = "az ";

/// Characters that reject a command outright
const FORBIDDEN_CHARS: [char; 11] = [';', '&', '|', '`', '$', '(', ')', '<', '>', '\n', '\r'];

/// Characters removed by the sanitizer
const STRIPPED_CHARS: [char; 9] = [';', '&', '|', '`', '$', '<', '>', '\n', '\r'];

/// Reasons a command is rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Command is empty")]
    Empty,

    #[error("Command must start with 'az'")]
    MissingPrefix,

    #[error("Command contains forbidden character {0:?}")]
    ForbiddenCharacter(char),

    #[error("Command has unbalanced quotes")]
    Malformed,
}

/// A command that passed validation and sanitization
///
/// The only way to obtain one is [`CommandValidator::validate`], so holding a
/// `ValidatedCommand` proves the gate ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    text: String,
    argv: Vec<String>,
}

impl ValidatedCommand {
    /// Sanitized command text
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Tokenized arguments, `argv[0]` is always `az`
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Whether this is an `az login` invocation
    pub fn is_login(&self) -> bool {
        self.argv.get(1).map(String::as_str) == Some("login")
    }

    /// Build from an already-normalized command string
    ///
    /// Used by the login manager after it rewrites flags. Runs the full
    /// validation again so the invariant cannot be bypassed.
    pub(crate) fn reparse(text: &str) -> Result<Self, ValidationError> {
        CommandValidator::new().validate(text)
    }

    /// Build from argv assembled by this crate, skipping validation
    ///
    /// Only for commands whose arguments come from configuration rather than
    /// a client (service-principal credentials may contain any character).
    /// `display` is what logs and errors show in place of the argv.
    pub(crate) fn trusted(argv: Vec<String>, display: impl Into<String>) -> Self {
        Self {
            text: display.into(),
            argv,
        }
    }
}

impl std::fmt::Display for ValidatedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// Command validator enforcing the `az` allow-list and metacharacter ban
///
/// # Security Principles
///
/// 1. **Fixed Tool**: only commands starting with `az ` are accepted
/// 2. **No Shell Injection**: metacharacters reject, never get escaped
/// 3. **Defense in Depth**: accepted commands are still sanitized
/// 4. **No Shell**: the result is tokenized and spawned as argv
#[derive(Debug, Clone, Default)]
pub struct CommandValidator;

impl CommandValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate, sanitize and tokenize a raw command
    ///
    /// # Example
    ///
    /// ```
    /// use azcli_mcp::tools::CommandValidator;
    ///
    /// let validator = CommandValidator::new();
    /// let cmd = validator.validate("az group list --output table").unwrap();
    /// assert_eq!(cmd.argv()[1], "group");
    /// assert!(validator.validate("az account list; rm -rf /").is_err());
    /// ```
    pub fn validate(&self, command: &str) -> Result<ValidatedCommand, ValidationError> {
        self.check(command)?;

        let text = sanitize_command(command);
        let argv = tokenize(&text).ok_or(ValidationError::Malformed)?;

        if argv.first().map(String::as_str) != Some("az") {
            return Err(ValidationError::MissingPrefix);
        }

        Ok(ValidatedCommand { text, argv })
    }

    /// Accept/reject decision only, no transformation
    pub fn check(&self, command: &str) -> Result<(), ValidationError> {
        let trimmed = command.trim();

        if trimmed.is_empty() {
            return Err(ValidationError::Empty);
        }

        if !trimmed.starts_with(AZ_PREFIX) {
            return Err(ValidationError::MissingPrefix);
        }

        if let Some(c) = trimmed.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            return Err(ValidationError::ForbiddenCharacter(c));
        }

        Ok(())
    }

    /// Convenience wrapper around [`CommandValidator::check`]
    pub fn is_valid(&self, command: &str) -> bool {
        self.check(command).is_ok()
    }
}

/// Strip residual shell metacharacters and surrounding whitespace
///
/// Idempotent: `sanitize_command(&sanitize_command(x)) == sanitize_command(x)`.
pub fn sanitize_command(command: &str) -> String {
    let stripped: String = command
        .chars()
        .filter(|c| !STRIPPED_CHARS.contains(c))
        .collect();

    // Stripping can expose new edge whitespace ("az x ;" -> "az x ")
    stripped.trim().to_string()
}

/// Split a command into argv using POSIX quoting rules
///
/// Returns `None` for unbalanced quotes.
pub fn tokenize(command: &str) -> Option<Vec<String>> {
    shlex::split(command)
}
