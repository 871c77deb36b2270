//! Workbench CLI library
//!
//! Drives workbench resources from a workstation: uploads packaged sources
//! when the control plane asks for them, and keeps a self-healing tunnel open
//! to a running notebook.

pub mod artifact;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod readiness;
pub mod resource;
pub mod shutdown;
pub mod suspend;
pub mod tunnel;
pub mod upload;
pub mod watch;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// Workbench - upload, run and connect to workbench resources
#[derive(Parser, Debug)]
#[command(name = "workbench")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to kubeconfig file
    #[arg(long, global = true, env = "WORKBENCH_KUBECONFIG")]
    pub kubeconfig: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Package a source directory and upload it for a resource
    Upload(commands::upload::UploadArgs),
    /// Start a notebook and tunnel to it until interrupted
    Notebook(commands::notebook::NotebookArgs),
    /// Suspend a resource
    Suspend(commands::suspend::SuspendArgs),
    /// Resume a suspended resource
    Resume(commands::suspend::ResumeArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let config = config::load_config()?;
        let cancel = CancellationToken::new();
        let signals = shutdown::install_signal_handler(cancel.clone())?;
        let kubeconfig = self.kubeconfig.as_deref();

        let result = match self.command {
            Commands::Upload(args) => {
                commands::upload::run(args, kubeconfig, &config, cancel.clone()).await
            }
            Commands::Notebook(args) => {
                commands::notebook::run(args, kubeconfig, &config, cancel.clone()).await
            }
            Commands::Suspend(args) => {
                commands::suspend::run_suspend(args, kubeconfig, &config).await
            }
            Commands::Resume(args) => {
                commands::suspend::run_resume(args, kubeconfig, &config, cancel.clone()).await
            }
        };

        signals.abort();
        result
    }
}
