use crate::config::ConfigError;
use crate::cpu_topology::CpuTopologyError;
use crate::scheduler::plugins::ScoreError;
use crate::ssh_client::SshCommandError;
use crate::tunnel::TunnelError;
use thiserror::Error;
use validator::ValidationErrors;

#[derive(Error, Debug)]
pub enum CoxswainError {
    #[error("Error: {0}")]
    String(String),
    #[error("Error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("Error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Error: {0}")]
    Config(#[from] ConfigError),
    #[error("Error: {0}")]
    Score(#[from] ScoreError),
    #[error("Error: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("Error: {0}")]
    SshCommand(#[from] SshCommandError),
    #[error("Error: {0}")]
    CpuTopology(#[from] CpuTopologyError),
    #[error("Error: {}", .0)]
    ValidationErrors(#[from] ValidationErrors),
}

impl From<String> for CoxswainError {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}
