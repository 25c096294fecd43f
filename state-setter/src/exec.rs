// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running external commands (membership queries, secure erase)

use slog_error_chain::SlogInlineError;
use tokio::process::Command;

#[derive(Debug)]
pub struct CommandFailureInfo {
    command: String,
    status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum ExecutionError {
    #[error("command line is empty")]
    EmptyCommand,

    #[error("Failed to start execution of [{command}]")]
    ExecutionStart {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

/// Builds a command from `argv`, replacing every `{serial}` with `serial`.
pub fn command_for_serial(
    argv: &[String],
    serial: &str,
) -> Result<Command, ExecutionError> {
    let mut args = argv.iter().map(|arg| arg.replace("{serial}", serial));
    let program = args.next().ok_or(ExecutionError::EmptyCommand)?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

/// Builds a command from `argv` as-is.
pub fn command(argv: &[String]) -> Result<Command, ExecutionError> {
    let (program, args) =
        argv.split_first().ok_or(ExecutionError::EmptyCommand)?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

/// Runs `command` to completion, failing if it couldn't be started or exited
/// unsuccessfully.
pub async fn execute_async(
    command: &mut Command,
) -> Result<std::process::Output, ExecutionError> {
    // The child is killed if this future is dropped.
    command.kill_on_drop(true);
    let output = command.output().await.map_err(|err| {
        ExecutionError::ExecutionStart {
            command: command_to_string(command.as_std()),
            err,
        }
    })?;

    if !output.status.success() {
        return Err(ExecutionError::CommandFailure(Box::new(
            CommandFailureInfo {
                command: command_to_string(command.as_std()),
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
        )));
    }

    Ok(output)
}

#[cfg(test)]
mod test {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_serial_substitution() {
        let cmd =
            command_for_serial(&argv(&["erase", "--serial={serial}"]), "ABC")
                .unwrap();
        assert_eq!(command_to_string(cmd.as_std()), "erase --serial=ABC");
    }

    #[test]
    fn test_empty_command() {
        assert!(matches!(command(&[]), Err(ExecutionError::EmptyCommand)));
        assert!(matches!(
            command_for_serial(&[], "ABC"),
            Err(ExecutionError::EmptyCommand)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_async() {
        let output = execute_async(&mut command(&argv(&["true"])).unwrap())
            .await
            .expect("`true` succeeds");
        assert!(output.status.success());

        let err = execute_async(&mut command(&argv(&["false"])).unwrap())
            .await
            .expect_err("`false` fails");
        assert!(matches!(err, ExecutionError::CommandFailure(_)), "{err:?}");

        let err = execute_async(
            &mut command(&argv(&["/nonexistent/state-setter-test"])).unwrap(),
        )
        .await
        .expect_err("missing binary fails");
        assert!(
            matches!(err, ExecutionError::ExecutionStart { .. }),
            "{err:?}"
        );
    }
}
