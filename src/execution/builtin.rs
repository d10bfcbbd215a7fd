//! Built-in Handlers
//!
//! Task handlers and conditions available in every registry created with
//! [`HandlerRegistry::with_builtins`].
//!
//! | id | kind | config |
//! |---|---|---|
//! | `shell` | task | `command`, optional `working_dir` |
//! | `noop` | task | |
//! | `true` / `false` | condition | |
//! | `metadata_present` | condition | `key` |
//! | `metadata_equals` | condition | `key`, `value` |

use std::process::Command;

use log::{debug, error};

use super::registry::{Condition, HandlerRegistry, TaskHandler};
use crate::error::TaskError;
use crate::workflow::{Metadata, TaskConfig};

/// Marker line after which shell output is read back as `KEY=VALUE` metadata.
pub const METADATA_MARKER: &str = "##metadata";

pub(crate) fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register_handler("shell", || ShellTask);
    registry.register_handler("noop", || NoopTask);

    registry.register_condition("true", || Constant(true));
    registry.register_condition("false", || Constant(false));
    registry.register_condition("metadata_present", || MetadataPresent);
    registry.register_condition("metadata_equals", || MetadataEquals);
}

/// Runs `command` with `bash -c`.
///
/// `{KEY}` placeholders are replaced with the first context value of `KEY`;
/// placeholders naming absent keys are left as written.
pub struct ShellTask;

impl TaskHandler for ShellTask {
    fn run(&mut self, context: &mut Metadata, config: &TaskConfig) -> Result<(), TaskError> {
        let template = config
            .get("command")
            .ok_or("shell task requires a 'command' config property")?;
        let command_text = substitute(template, context);

        debug!("Executing: {}", command_text);

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command_text);
        if let Some(dir) = config.get("working_dir") {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir);
        }

        let output = cmd.output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("Command failed with exit code: {:?}", output.status.code());
            if !stderr.trim().is_empty() {
                error!("stderr:\n{}", stderr);
            }
            return Err(format!("command exited with {:?}: {}", output.status.code(), command_text).into());
        }

        if !stdout.trim().is_empty() {
            debug!("stdout:\n{}", stdout);
        }

        for (key, value) in captured_metadata(&stdout) {
            context.add(key, value);
        }

        Ok(())
    }
}

/// Replaces `{KEY}` with the first context value of `KEY`.
fn substitute(template: &str, context: &Metadata) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        result.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match context.get(key) {
                    Some(value) => result.push_str(value),
                    None => {
                        result.push('{');
                        result.push_str(key);
                        result.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                result.push_str(&rest[open..]);
                rest = "";
            }
        }
    }

    result.push_str(rest);
    result
}

/// `KEY=VALUE` lines printed after [`METADATA_MARKER`].
fn captured_metadata(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .skip_while(|line| line.trim() != METADATA_MARKER)
        .skip(1)
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Does nothing.
pub struct NoopTask;

impl TaskHandler for NoopTask {
    fn run(&mut self, _context: &mut Metadata, _config: &TaskConfig) -> Result<(), TaskError> {
        Ok(())
    }
}

struct Constant(bool);

impl Condition for Constant {
    fn evaluate(&self, _context: &Metadata, _config: &TaskConfig) -> bool {
        self.0
    }
}

struct MetadataPresent;

impl Condition for MetadataPresent {
    fn evaluate(&self, context: &Metadata, config: &TaskConfig) -> bool {
        config.get("key").map_or(false, |key| context.contains_key(key))
    }
}

struct MetadataEquals;

impl Condition for MetadataEquals {
    fn evaluate(&self, context: &Metadata, config: &TaskConfig) -> bool {
        match (config.get("key"), config.get("value")) {
            (Some(key), Some(expected)) => context
                .get_all(key)
                .map_or(false, |values| values.iter().any(|v| v == expected)),
            _ => false,
        }
    }
}
