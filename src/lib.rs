pub mod config;
pub mod cpu_topology;
pub mod errors;
pub mod scheduler;
pub mod ssh_client;
pub mod state;
pub mod tunnel;

mod cli;

pub use cli::coxswain;

#[cfg(test)]
mod test_helpers;
