use std::time::Duration;

use tracing::warn;

/// Run hook commands through `sh -c`, exposing the event through environment
/// variables. Each command gets `timeout` to finish.
///
/// Errors are logged, never propagated. Returns the number of commands that
/// failed, timed out, or exited non-zero.
pub async fn run_hooks(commands: &[String], env_vars: &[(&str, &str)], timeout: Duration) -> usize {
    let mut failures = 0;
    for cmd in commands {
        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", cmd]);
        for (key, val) in env_vars {
            command.env(key, val);
        }
        command.stdout(std::process::Stdio::null());
        command.stderr(std::process::Stdio::null());
        command.kill_on_drop(true);

        match tokio::time::timeout(timeout, command.status()).await {
            Ok(Ok(s)) if s.success() => {}
            Ok(Ok(s)) => {
                failures += 1;
                warn!(hook = %cmd, code = s.code(), "Hook exited non-zero");
            }
            Ok(Err(e)) => {
                failures += 1;
                warn!(hook = %cmd, error = %e, "Hook failed to execute");
            }
            Err(_) => {
                failures += 1;
                warn!(hook = %cmd, timeout_secs = timeout.as_secs(), "Hook timed out");
            }
        }
    }
    failures
}
