// ActionCommand: workflow commands embedded in step output, in the
// `::command key=value,key2=value2::data` form.

use std::collections::{HashMap, HashSet};

/// A parsed workflow command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCommand {
    /// The command name (e.g. "set-output", "add-mask").
    pub command: String,
    /// Key-value properties attached to the command.
    pub properties: HashMap<String, String>,
    /// The command body.
    pub data: String,
}

/// Delimiter used both as prefix and as separator.
pub const COMMAND_KEY: &str = "::";

struct EscapeMapping {
    token: &'static str,
    replacement: &'static str,
}

// `%` must come last when unescaping so `%250A` decodes to `%0A`, not a newline.
const ESCAPE_DATA_MAPPINGS: &[EscapeMapping] = &[
    EscapeMapping { token: "\r", replacement: "%0D" },
    EscapeMapping { token: "\n", replacement: "%0A" },
    EscapeMapping { token: "%", replacement: "%25" },
];

const ESCAPE_PROPERTY_MAPPINGS: &[EscapeMapping] = &[
    EscapeMapping { token: "\r", replacement: "%0D" },
    EscapeMapping { token: "\n", replacement: "%0A" },
    EscapeMapping { token: ":", replacement: "%3A" },
    EscapeMapping { token: ",", replacement: "%2C" },
    EscapeMapping { token: "%", replacement: "%25" },
];

impl ActionCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            properties: HashMap::new(),
            data: String::new(),
        }
    }

    /// Property value, if present.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Try to parse a command from one output line.
    ///
    /// Returns `None` when the line is not a command or names a command
    /// outside `registered_commands`.
    pub fn try_parse(message: &str, registered_commands: &HashSet<String>) -> Option<ActionCommand> {
        let message = message.trim_start();
        let after_prefix = message.strip_prefix(COMMAND_KEY)?;
        let end_index = after_prefix.find(COMMAND_KEY)?;
        let cmd_info = &after_prefix[..end_index];

        let (command_name, properties_str) = match cmd_info.split_once(' ') {
            Some((name, props)) => (name, props.trim()),
            None => (cmd_info, ""),
        };

        if !registered_commands.contains(command_name) {
            return None;
        }

        let mut command = ActionCommand::new(command_name);

        for entry in properties_str.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some((key, value)) = entry.split_once('=') {
                if !key.is_empty() && !value.is_empty() {
                    command
                        .properties
                        .insert(key.to_string(), unescape(value, ESCAPE_PROPERTY_MAPPINGS));
                }
            }
        }

        command.data = unescape(&after_prefix[end_index + COMMAND_KEY.len()..], ESCAPE_DATA_MAPPINGS);
        Some(command)
    }

    /// Escape command data so it survives a round trip through `try_parse`.
    pub fn escape_data(value: &str) -> String {
        let mut escaped = value.to_string();
        for mapping in ESCAPE_DATA_MAPPINGS.iter().rev() {
            escaped = escaped.replace(mapping.token, mapping.replacement);
        }
        escaped
    }
}

fn unescape(escaped: &str, mappings: &[EscapeMapping]) -> String {
    let mut result = escaped.to_string();
    for mapping in mappings {
        result = result.replace(mapping.replacement, mapping.token);
    }
    result
}
