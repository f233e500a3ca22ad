// CommandHandler: recognizes workflow commands (`::set-output name=x::v`,
// `::add-mask::v`, ...) in step output and turns them into effects on the
// run state. Logging commands are handled here; state changes are returned
// to the caller, which owns the run state.

use std::collections::HashSet;

use act_common::{ActionCommand, SecretMasker};

/// Commands understood by the local runner.
const WORKFLOW_COMMANDS: &[&str] = &[
    "set-output",
    "set-env",
    "add-path",
    "add-mask",
    "debug",
    "warning",
    "error",
    "group",
    "endgroup",
];

/// A change to apply to the run state after a command was recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEffect {
    /// Store an output on the current step.
    SetOutput { name: String, value: String },
    /// Add an env variable for later steps.
    SetEnv { name: String, value: String },
    /// Prepend a directory to `PATH` for later steps.
    AddPath(String),
    /// Fully handled by the handler (masking or logging).
    Handled,
}

pub struct CommandHandler {
    registered_commands: HashSet<String>,
    masker: SecretMasker,
    group_depth: usize,
}

impl CommandHandler {
    pub fn new(masker: SecretMasker) -> Self {
        Self {
            registered_commands: WORKFLOW_COMMANDS.iter().map(|c| c.to_string()).collect(),
            masker,
            group_depth: 0,
        }
    }

    /// Process one output line. `None` when the line is not a command.
    pub fn try_process_command(&mut self, line: &str) -> Option<CommandEffect> {
        let cmd = ActionCommand::try_parse(line, &self.registered_commands)?;
        Some(self.dispatch(&cmd))
    }

    pub fn group_depth(&self) -> usize {
        self.group_depth
    }

    fn dispatch(&mut self, cmd: &ActionCommand) -> CommandEffect {
        match cmd.command.as_str() {
            "set-output" => match required_name(cmd) {
                Some(name) => {
                    tracing::debug!(target: "step", "Set output {}={}", name, self.masker.mask_secrets(&cmd.data));
                    CommandEffect::SetOutput {
                        name,
                        value: cmd.data.clone(),
                    }
                }
                None => CommandEffect::Handled,
            },
            "set-env" => match required_name(cmd) {
                Some(name) => {
                    tracing::debug!(target: "step", "Setting env {}={}", name, self.masker.mask_secrets(&cmd.data));
                    CommandEffect::SetEnv {
                        name,
                        value: cmd.data.clone(),
                    }
                }
                None => CommandEffect::Handled,
            },
            "add-path" => {
                let path = cmd.data.trim();
                if path.is_empty() {
                    tracing::warn!(target: "step", "'add-path' command requires a non-empty path");
                    return CommandEffect::Handled;
                }
                tracing::debug!(target: "step", "Prepending PATH: {}", path);
                CommandEffect::AddPath(path.to_string())
            }
            "add-mask" => {
                self.masker.add_value(&cmd.data);
                CommandEffect::Handled
            }
            "debug" => {
                tracing::debug!(target: "step", "{}", self.masker.mask_secrets(&cmd.data));
                CommandEffect::Handled
            }
            "warning" => {
                tracing::warn!(target: "step", "{}", self.annotation(cmd));
                CommandEffect::Handled
            }
            "error" => {
                tracing::error!(target: "step", "{}", self.annotation(cmd));
                CommandEffect::Handled
            }
            "group" => {
                self.group_depth += 1;
                tracing::info!(target: "step", "Group: {}", self.masker.mask_secrets(&cmd.data));
                CommandEffect::Handled
            }
            "endgroup" => {
                self.group_depth = self.group_depth.saturating_sub(1);
                CommandEffect::Handled
            }
            _ => CommandEffect::Handled,
        }
    }

    /// Message of a `warning`/`error` command with its file location, if any.
    fn annotation(&self, cmd: &ActionCommand) -> String {
        let message = self.masker.mask_secrets(&cmd.data);
        match (cmd.property("file"), cmd.property("line")) {
            (Some(file), Some(line)) => format!("{file}:{line}: {message}"),
            (Some(file), None) => format!("{file}: {message}"),
            _ => message,
        }
    }
}

fn required_name(cmd: &ActionCommand) -> Option<String> {
    match cmd.property("name") {
        Some(name) if !name.is_empty() => Some(name.to_string()),
        _ => {
            tracing::warn!(target: "step", "'{}' command requires a 'name' property", cmd.command);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> CommandHandler {
        CommandHandler::new(SecretMasker::new())
    }

    #[test]
    fn plain_lines_are_not_commands() {
        let mut handler = handler();
        assert_eq!(handler.try_process_command("hello world"), None);
        assert_eq!(handler.try_process_command("::unknown::x"), None);
        assert_eq!(handler.try_process_command(""), None);
    }

    #[test]
    fn set_output_and_env() {
        let mut handler = handler();
        assert_eq!(
            handler.try_process_command("::set-output name=version::1.2.3"),
            Some(CommandEffect::SetOutput {
                name: "version".to_string(),
                value: "1.2.3".to_string()
            })
        );
        assert_eq!(
            handler.try_process_command("::set-env name=FOO::bar"),
            Some(CommandEffect::SetEnv {
                name: "FOO".to_string(),
                value: "bar".to_string()
            })
        );
    }

    #[test]
    fn missing_name_is_ignored() {
        let mut handler = handler();
        assert_eq!(
            handler.try_process_command("::set-output::value"),
            Some(CommandEffect::Handled)
        );
    }

    #[test]
    fn add_path_trims_and_rejects_empty() {
        let mut handler = handler();
        assert_eq!(
            handler.try_process_command("::add-path:: /opt/bin "),
            Some(CommandEffect::AddPath("/opt/bin".to_string()))
        );
        assert_eq!(handler.try_process_command("::add-path::"), Some(CommandEffect::Handled));
    }

    #[test]
    fn add_mask_feeds_the_masker() {
        let masker = SecretMasker::new();
        let mut handler = CommandHandler::new(masker.clone());
        assert_eq!(
            handler.try_process_command("::add-mask::hunter2"),
            Some(CommandEffect::Handled)
        );
        assert_eq!(masker.mask_secrets("password is hunter2"), "password is ***");
    }

    #[test]
    fn groups_nest() {
        let mut handler = handler();
        handler.try_process_command("::group::outer");
        handler.try_process_command("::group::inner");
        assert_eq!(handler.group_depth(), 2);
        handler.try_process_command("::endgroup::");
        handler.try_process_command("::endgroup::");
        handler.try_process_command("::endgroup::");
        assert_eq!(handler.group_depth(), 0);
    }

    #[test]
    fn annotation_includes_location() {
        let handler = handler();
        let mut cmd = ActionCommand::new("error");
        cmd.properties.insert("file".to_string(), "src/main.rs".to_string());
        cmd.properties.insert("line".to_string(), "7".to_string());
        cmd.data = "boom".to_string();
        assert_eq!(handler.annotation(&cmd), "src/main.rs:7: boom");
    }
}
