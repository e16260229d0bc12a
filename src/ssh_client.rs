use async_ssh2_tokio::client::{AuthMethod, Client, ServerCheckMethod};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use itertools::{Either, Itertools};
use log::debug;
use std::time::Duration;
use thiserror::Error;

const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const CONNECT_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Error, Debug)]
pub enum SshCommandError {
    #[error("timed out connecting to {host}")]
    ConnectTimeout { host: String },
    #[error("{0}")]
    Ssh(#[from] async_ssh2_tokio::Error),
}

#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub host: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

async fn connect(user: &str, key_file: &str, host: &str) -> Result<Client, SshCommandError> {
    let key_file = shellexpand::tilde(key_file).to_string();
    let auth = AuthMethod::with_key_file(&key_file, None);

    let deadline = tokio::time::Instant::now() + CONNECT_DEADLINE;
    loop {
        let attempt = Client::connect(
            (host, crate::tunnel::DEFAULT_SSH_PORT),
            user,
            auth.clone(),
            ServerCheckMethod::NoCheck,
        );
        match tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, attempt).await {
            Ok(Ok(client)) => return Ok(client),
            Ok(Err(err)) if tokio::time::Instant::now() >= deadline => return Err(err.into()),
            Ok(Err(err)) => debug!("retrying connection to {}: {}", host, err),
            Err(_) if tokio::time::Instant::now() >= deadline => {
                return Err(SshCommandError::ConnectTimeout {
                    host: host.to_string(),
                })
            }
            Err(_) => debug!("retrying connection to {}: attempt timed out", host),
        }
        tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
    }
}

/// Runs a command over SSH on one host.
pub async fn run_ssh_command(
    command: &str,
    user: &str,
    key_file: &str,
    host: &str,
) -> Result<CommandOutput, SshCommandError> {
    let client = connect(user, key_file, host).await?;
    let result = client.execute(command).await?;
    Ok(CommandOutput {
        host: host.to_string(),
        stdout: result.stdout,
        stderr: result.stderr,
        exit_code: result.exit_status,
    })
}

/// Runs a command on every host concurrently, partitioning the outcomes into
/// successes and per-host failures.
pub async fn run_on_hosts(
    command: &str,
    user: &str,
    key_file: &str,
    hosts: &[String],
) -> (Vec<CommandOutput>, Vec<(String, SshCommandError)>) {
    let results: Vec<_> = hosts
        .iter()
        .map(|host| async move {
            (
                host.clone(),
                run_ssh_command(command, user, key_file, host).await,
            )
        })
        .collect::<FuturesUnordered<_>>()
        .collect()
        .await;

    results.into_iter().partition_map(|(host, res)| match res {
        Ok(output) => Either::Left(output),
        Err(err) => Either::Right((host, err)),
    })
}
