use std::{collections::HashMap, path::Path, process::Command};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};

/// Splits an argument template on whitespace, keeping quoted runs together.
/// Single and double quotes are both honoured; the quotes themselves are dropped.
pub fn split_arguments(template: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_token = false;

    for ch in template.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

/// Replaces `{Name}` placeholders. Unknown placeholders are left as written.
pub fn substitute(argument: &str, values: &HashMap<&str, String>) -> String {
    let mut output = argument.to_string();
    for (name, value) in values {
        output = output.replace(&format!("{{{name}}}"), value);
    }
    output
}

/// Expands the template into an argv list; placeholder values never split into extra arguments.
pub fn build_arguments(template: &str, values: &HashMap<&str, String>) -> Vec<String> {
    split_arguments(template)
        .iter()
        .map(|argument| substitute(argument, values))
        .collect()
}

/// Runs `script` to completion and returns its stdout. A non-zero exit is an error.
pub fn run_script(script: &Path, arguments: &[String], censor: &[&str]) -> Result<String> {
    if !script.exists() {
        return Err(anyhow!("script not found: {}", script.display()));
    }
    let shown: Vec<String> = arguments
        .iter()
        .map(|arg| {
            censor
                .iter()
                .filter(|secret| !secret.is_empty())
                .fold(arg.clone(), |acc, secret| acc.replace(secret, "***"))
        })
        .collect();
    info!("[script] running {} {}", script.display(), shown.join(" "));

    let output = command_for(script)
        .args(arguments)
        .output()
        .with_context(|| format!("failed to start {}", script.display()))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !stdout.trim().is_empty() {
        debug!("[script] stdout: {}", stdout.trim());
    }
    if !stderr.trim().is_empty() {
        warn!("[script] stderr: {}", stderr.trim());
    }
    if !output.status.success() {
        return Err(anyhow!(
            "{} exited with {}{}",
            script.display(),
            output.status,
            if stderr.trim().is_empty() {
                String::new()
            } else {
                format!(": {}", stderr.trim())
            }
        ));
    }
    Ok(stdout)
}

fn command_for(script: &Path) -> Command {
    match script.extension().and_then(|ext| ext.to_str()) {
        Some("ps1") => {
            let mut command = Command::new("powershell.exe");
            command.args(["-ExecutionPolicy", "Bypass", "-File"]).arg(script);
            command
        }
        Some("sh") => {
            let mut command = Command::new("sh");
            command.arg(script);
            command
        }
        _ => Command::new(script),
    }
}
