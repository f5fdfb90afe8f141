//! Configuration for the prover subprocess and the stepping protocol.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, Result};

/// Configuration for the prover subprocess.
#[derive(Debug, Clone)]
pub struct ProverConfig {
    /// Prover executable. `~` is expanded.
    pub program: String,

    /// Arguments passed to the prover.
    pub args: Vec<String>,

    /// Working directory for the subprocess.
    pub working_dir: Option<PathBuf>,

    /// Absolute timeout for one command's prompt markers, in milliseconds.
    pub command_timeout_ms: u64,

    /// How long `start` waits for the startup prompt, in milliseconds.
    pub startup_timeout_ms: u64,

    /// Quiet window after the last expected marker of a single statement.
    pub single_debounce_ms: u64,

    /// Quiet window after the last expected marker of a batch.
    pub batch_debounce_ms: u64,

    /// Grace window between closing stdin and killing on `stop`.
    pub stop_grace_ms: u64,

    /// Bound on `stop_and_wait` before the process is killed.
    pub stop_wait_timeout_ms: u64,

    /// Sequence id the prover reports at startup.
    pub initial_sequence_id: u64,

    /// Whether `start` blocks until the startup prompt has been read.
    pub await_startup_prompt: bool,

    /// Undo command template; `{id}` is replaced by the target sequence id.
    pub undo_command: String,

    /// Pattern that marks a response segment as a prover error.
    pub error_pattern: String,

    /// Log every command and framed chunk.
    pub verbose: bool,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            program: "easycrypt".to_string(),
            args: vec!["cli".to_string(), "-emacs".to_string()],
            working_dir: None,
            command_timeout_ms: 60_000,
            startup_timeout_ms: 10_000,
            single_debounce_ms: 50,
            batch_debounce_ms: 200,
            stop_grace_ms: 1_000,
            stop_wait_timeout_ms: 3_000,
            initial_sequence_id: 0,
            await_startup_prompt: true,
            undo_command: "undo {id}.".to_string(),
            error_pattern: r"\[error-[^\]]*\]".to_string(),
            verbose: false,
        }
    }
}

impl ProverConfig {
    /// Create a config for a specific prover executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(program) = std::env::var("PROOFSTEP_PROVER") {
            config.program = program;
        }
        if let Ok(args) = std::env::var("PROOFSTEP_PROVER_ARGS") {
            config.args = args.split_whitespace().map(String::from).collect();
        }
        if let Ok(dir) = std::env::var("PROOFSTEP_WORKDIR") {
            config.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(timeout) = std::env::var("PROOFSTEP_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.command_timeout_ms = timeout;
        }
        config.verbose = std::env::var("PROOFSTEP_VERBOSE")
            .map(|s| s != "0" && s.to_lowercase() != "false")
            .unwrap_or(false);
        config
    }

    /// Set the arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the command timeout.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.command_timeout_ms = timeout_ms;
        self
    }

    /// Set both debounce windows.
    pub fn with_debounce(mut self, single_ms: u64, batch_ms: u64) -> Self {
        self.single_debounce_ms = single_ms;
        self.batch_debounce_ms = batch_ms;
        self
    }

    /// Set verbose mode.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Program path with `~` expanded.
    pub fn resolved_program(&self) -> String {
        shellexpand::tilde(&self.program).into_owned()
    }

    /// Absolute timeout for one command.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// How long `start` waits for the startup prompt.
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Grace window between closing input and killing in `stop`.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Wait limit used by `restart` and recovery.
    pub fn stop_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_wait_timeout_ms)
    }

    /// Debounce window for a command expecting `expected` markers.
    pub fn debounce_for(&self, expected: usize) -> Duration {
        if expected > 1 {
            Duration::from_millis(self.batch_debounce_ms)
        } else {
            Duration::from_millis(self.single_debounce_ms)
        }
    }

    /// Compile the text-level protocol rules.
    pub fn protocol(&self) -> Result<ProtocolSyntax> {
        if !self.undo_command.contains("{id}") {
            return Err(Error::Config(format!(
                "undo command template must contain {{id}}: {:?}",
                self.undo_command
            )));
        }
        let error_re = Regex::new(&self.error_pattern).map_err(|e| {
            Error::Config(format!("invalid error pattern {:?}: {}", self.error_pattern, e))
        })?;
        Ok(ProtocolSyntax {
            error_re,
            undo_template: self.undo_command.clone(),
            initial_sequence_id: self.initial_sequence_id,
        })
    }
}

/// Compiled protocol rules shared by the session and the orchestrator.
#[derive(Debug, Clone)]
pub struct ProtocolSyntax {
    error_re: Regex,
    undo_template: String,
    initial_sequence_id: u64,
}

impl ProtocolSyntax {
    /// Render the undo command targeting `state_id`.
    pub fn undo_command(&self, state_id: u64) -> String {
        self.undo_template.replace("{id}", &state_id.to_string())
    }

    /// Extract the prover's error message from a response segment.
    pub fn error_message(&self, segment: &str) -> Option<String> {
        let found = self.error_re.find(segment)?;
        let message = segment[found.start()..].trim();
        Some(message.to_string())
    }

    /// Sequence id of the startup prompt.
    pub fn initial_sequence_id(&self) -> u64 {
        self.initial_sequence_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ProverConfig::default();
        assert_eq!(config.program, "easycrypt");
        assert_eq!(config.args, vec!["cli", "-emacs"]);
        assert_eq!(config.command_timeout_ms, 60_000);
        assert_eq!(config.initial_sequence_id, 0);
        assert!(config.await_startup_prompt);
    }

    #[test]
    fn test_debounce_is_longer_for_batches() {
        let config = ProverConfig::default();
        assert!(config.debounce_for(5) > config.debounce_for(1));
        assert_eq!(config.debounce_for(0), config.debounce_for(1));

        let config = config.with_debounce(10, 80);
        assert_eq!(config.debounce_for(1), Duration::from_millis(10));
        assert_eq!(config.debounce_for(3), Duration::from_millis(80));
    }

    #[test]
    fn test_builder_methods() {
        let config = ProverConfig::with_program("/opt/ec/bin/easycrypt")
            .with_args(["cli"])
            .with_working_dir("/tmp/proofs")
            .with_timeout(5_000)
            .with_verbose(true);
        assert_eq!(config.program, "/opt/ec/bin/easycrypt");
        assert_eq!(config.args, vec!["cli"]);
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp/proofs")));
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert!(config.verbose);
    }

    #[test]
    fn test_undo_command_rendering() {
        let protocol = ProverConfig::default().protocol().unwrap();
        assert_eq!(protocol.undo_command(7), "undo 7.");
    }

    #[test]
    fn test_undo_template_requires_placeholder() {
        let mut config = ProverConfig::default();
        config.undo_command = "undo.".to_string();
        assert!(matches!(config.protocol(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_error_pattern() {
        let mut config = ProverConfig::default();
        config.error_pattern = "[unclosed".to_string();
        assert!(matches!(config.protocol(), Err(Error::Config(_))));
    }

    #[test]
    fn test_error_message_extraction() {
        let protocol = ProverConfig::default().protocol().unwrap();
        let segment = "some banner\n[error-3-0-3-5]unknown symbol: foo\n";
        assert_eq!(
            protocol.error_message(segment).as_deref(),
            Some("[error-3-0-3-5]unknown symbol: foo")
        );
        assert_eq!(protocol.error_message("+ added lemma t\n"), None);
    }
}
