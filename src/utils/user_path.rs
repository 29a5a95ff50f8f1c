#![cfg(not(target_os = "windows"))]

use std::path::Path;
use std::process::{Command, Stdio};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

/// The user's login-shell `PATH`, resolved once.
///
/// Processes launched from a GUI or a service manager inherit a minimal
/// `PATH` that misses version-manager shims, so `bin/rails` or `npm` would
/// resolve to the wrong interpreter or not at all.
pub static USER_PATH: Lazy<String> = Lazy::new(|| match login_shell_path() {
    Some(path) => path,
    None => {
        let fallback = fallback_path();
        debug!("login shell PATH unavailable, using constructed PATH");
        fallback
    }
});

fn login_shell_path() -> Option<String> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());

    // -l only: reads the profile files without the interactive rc files
    let output = Command::new(&shell)
        .args(["-l", "-c", "echo $PATH"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() && path.contains('/') {
                debug!(shell = %shell, "resolved PATH from login shell");
                return Some(path);
            }
            None
        }
        Ok(_) => None,
        Err(e) => {
            warn!(shell = %shell, error = %e, "failed to run login shell");
            None
        }
    }
}

fn fallback_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    let system_path = std::env::var("PATH").unwrap_or_default();

    let candidates = vec![
        format!("{}/bin", home),
        format!("{}/.local/bin", home),
        format!("{}/.rbenv/shims", home),
        format!("{}/.rbenv/bin", home),
        format!("{}/.asdf/shims", home),
        format!("{}/.pyenv/shims", home),
        format!("{}/.volta/bin", home),
        format!("{}/.fnm/current/bin", home),
        "/opt/homebrew/bin".to_string(),
        "/usr/local/bin".to_string(),
        "/usr/bin".to_string(),
        "/bin".to_string(),
    ];

    let mut paths: Vec<String> = candidates
        .into_iter()
        .filter(|p| Path::new(p).exists())
        .collect();

    let nvm_dir = format!("{}/.nvm/versions/node", home);
    if let Ok(entries) = std::fs::read_dir(&nvm_dir) {
        for entry in entries.flatten() {
            let bin_path = entry.path().join("bin");
            if bin_path.exists() {
                paths.insert(0, bin_path.to_string_lossy().to_string());
            }
        }
    }

    merge_paths(paths, &system_path)
}

/// Appends the entries of `system_path` not already present in `preferred`.
pub fn merge_paths(mut preferred: Vec<String>, system_path: &str) -> String {
    for p in system_path.split(':') {
        if !p.is_empty() && !preferred.iter().any(|existing| existing == p) {
            preferred.push(p.to_string());
        }
    }
    preferred.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_paths_keeps_preferred_order_and_dedups() {
        let merged = merge_paths(
            vec!["/home/dev/.rbenv/shims".to_string(), "/usr/bin".to_string()],
            "/usr/bin:/bin::/usr/local/bin",
        );
        assert_eq!(merged, "/home/dev/.rbenv/shims:/usr/bin:/bin:/usr/local/bin");
    }
}
