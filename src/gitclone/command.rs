//! Git subprocess helper.
//!
//! All `git` invocations that talk to an upstream go through [`run_git`],
//! which neutralises any system `url.*.insteadOf` rules matching the target
//! URL (they would rewrite upstream URLs back through the proxy) and injects
//! an in-memory credential helper when a GitHub App token is available.
//! Commands run under a cancellation token; cancellation kills the child.

use std::ffi::OsString;
use std::process::Output;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Arguments that disable `insteadOf`/`pushInsteadOf` rules whose pattern is
/// a prefix of `target_url`, from `git config --get-regexp` output.
pub(crate) fn instead_of_disable_args(config_output: &str, target_url: &str) -> Vec<String> {
    let mut args = Vec::new();
    for line in config_output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(config_key), Some(pattern)) = (fields.next(), fields.next()) else {
            continue;
        };
        if target_url.starts_with(pattern) {
            args.push("-c".to_string());
            args.push(format!("{config_key}="));
        }
    }
    args
}

/// `-c credential.helper=...` that emits the token for credential `get`
/// requests.  The leading empty helper clears any system-configured helpers
/// so the in-process token always wins.
pub(crate) fn credential_helper_args(token: &str) -> Vec<String> {
    let helper = format!(
        "!f() {{ test \"$1\" = get && echo username=x-access-token && printf \"password=%s\\n\" \"{token}\"; }}; f"
    );
    vec![
        "-c".to_string(),
        "credential.helper=".to_string(),
        "-c".to_string(),
        format!("credential.helper={helper}"),
    ]
}

/// Collect the per-invocation config args for a command targeting `url`.
async fn config_args_for_url(
    cancel: &CancellationToken,
    url: &str,
    token: Option<&str>,
) -> Result<Vec<String>> {
    let mut args = Vec::new();

    // Inspect system insteadOf rules; exit status 1 means none exist.
    let mut cmd = Command::new("git");
    cmd.args(["config", "--get-regexp", r"^url\..*\.(insteadof|pushinsteadof)$"]);
    cmd.kill_on_drop(true);
    let output = tokio::select! {
        output = cmd.output() => output.context("spawn git config --get-regexp")?,
        () = cancel.cancelled() => bail!("cancelled while inspecting git config"),
    };
    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        args.extend(instead_of_disable_args(&stdout, url));
    }

    if let Some(token) = token {
        if !token.is_empty() && url.starts_with("https://github.com/") {
            args.extend(credential_helper_args(token));
        }
    }

    Ok(args)
}

/// Run a `git` command to completion, capturing output.
///
/// `url` enables insteadOf neutralisation and credential injection for
/// commands that contact that upstream; pass `None` for purely local
/// operations.  Non-zero exit becomes an error carrying trimmed stderr.
pub(crate) async fn run_git<I, S>(
    cancel: &CancellationToken,
    url: Option<&str>,
    token: Option<&str>,
    args: I,
) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let mut full_args: Vec<OsString> = Vec::new();
    if let Some(url) = url {
        for arg in config_args_for_url(cancel, url, token).await? {
            full_args.push(arg.into());
        }
    }
    full_args.extend(args.into_iter().map(Into::into));

    debug!(args = ?full_args, "running git");

    let mut cmd = Command::new("git");
    cmd.args(&full_args);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);

    let output = tokio::select! {
        output = cmd.output() => output.context("spawn git")?,
        () = cancel.cancelled() => bail!("git command cancelled"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {:?} failed ({}): {}", full_args, output.status, stderr.trim());
    }
    Ok(output)
}

/// Like [`run_git`] but exit status is reported as a boolean instead of an
/// error (`git cat-file -e` style probes).
pub(crate) async fn git_succeeds<I, S>(cancel: &CancellationToken, args: I) -> Result<bool>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let mut cmd = Command::new("git");
    cmd.args(&args);
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);
    let output = tokio::select! {
        output = cmd.output() => output.context("spawn git")?,
        () = cancel.cancelled() => bail!("git command cancelled"),
    };
    Ok(output.status.success())
}
