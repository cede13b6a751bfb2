use std::collections::BTreeMap;
use std::path::PathBuf;

use sb_core::config::{ShellConfig, ShellKind};

use crate::pty::ShellCommand;

/// Resolve a shell selector into the program and arguments to launch.
/// Environment and working directory are left empty; see [`build_command`].
pub fn resolve(shell: &ShellConfig) -> ShellCommand {
    let (program, mut args) = match shell.kind {
        ShellKind::Default => default_shell(),
        ShellKind::Cmd => ("cmd.exe".to_string(), Vec::new()),
        ShellKind::Powershell => ("powershell.exe".to_string(), vec!["-NoLogo".to_string()]),
        ShellKind::Wsl => ("wsl.exe".to_string(), wsl_args(shell)),
    };

    let program = shell.program.clone().unwrap_or(program);
    args.extend(shell.args.iter().cloned());

    ShellCommand {
        name: display_name(&program),
        program,
        args,
        env: Vec::new(),
        cwd: None,
    }
}

/// Resolve the shell and attach the session environment and start
/// directory.
///
/// `TERM` and `COLORTERM` are always set; `environment` entries override
/// them. The working directory is `working_directory` if given, else the
/// shell's `root_dir` (WSL applies `root_dir` inside the distro instead).
pub fn build_command(
    shell: &ShellConfig,
    term: &str,
    environment: &BTreeMap<String, String>,
    working_directory: Option<&str>,
) -> ShellCommand {
    let mut command = resolve(shell);

    let mut env = BTreeMap::new();
    env.insert("TERM".to_string(), term.to_string());
    env.insert("COLORTERM".to_string(), "truecolor".to_string());
    for (k, v) in environment {
        env.insert(k.clone(), v.clone());
    }
    command.env = env.into_iter().collect();

    command.cwd = working_directory
        .map(PathBuf::from)
        .or_else(|| match shell.kind {
            ShellKind::Wsl => None,
            _ => shell.root_dir.as_deref().map(PathBuf::from),
        });

    command
}

fn default_shell() -> (String, Vec<String>) {
    if cfg!(windows) {
        return ("cmd.exe".to_string(), Vec::new());
    }
    let fallback = if cfg!(target_os = "macos") {
        "/bin/zsh"
    } else {
        "/bin/bash"
    };
    let program = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string());
    (program, vec!["-l".to_string()])
}

fn wsl_args(shell: &ShellConfig) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(distro) = shell.wsl_distro.as_deref().filter(|d| !d.is_empty()) {
        args.push("-d".to_string());
        args.push(distro.to_string());
    }
    if let Some(user) = shell.wsl_user.as_deref().filter(|u| !u.is_empty()) {
        args.push("-u".to_string());
        args.push(user.to_string());
    }
    if let Some(dir) = shell.root_dir.as_deref().filter(|d| !d.is_empty()) {
        args.push("--cd".to_string());
        args.push(dir.to_string());
    }
    args
}

fn display_name(program: &str) -> String {
    program
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(program)
        .to_string()
}
