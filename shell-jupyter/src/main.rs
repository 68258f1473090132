//! shell-jupyter kernel
//!
//! A Jupyter kernel that runs notebook cells through an external interpreter.

use anyhow::{Context, Result};
use clap::Parser;
use shell_jupyter::install::{self, InstallOptions, InstallScope};
use shell_jupyter::kernel::run_to_exit;
use shell_jupyter::{ConnectionInfo, Kernel, LanguageInfo, ProcessFactory, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shell-jupyter")]
#[command(about = "Jupyter kernel backed by an external interpreter", long_about = None)]
struct Args {
    /// Path to the Jupyter connection file
    #[arg(value_name = "CONNECTION_FILE", conflicts_with = "connection_file_flag")]
    connection_file: Option<PathBuf>,

    /// Path to the Jupyter connection file
    #[arg(short = 'f', long = "connection-file", value_name = "PATH")]
    connection_file_flag: Option<PathBuf>,

    /// Install the kernel spec
    #[arg(long)]
    install: bool,

    /// Install the kernel spec for the current user only (used with --install)
    #[arg(long, requires = "install")]
    user: bool,

    /// Install the kernel spec into the current environment (used with --install)
    #[arg(long, requires = "install", conflicts_with = "user")]
    sys_prefix: bool,

    /// Interpreter program that cells are piped into
    #[arg(long, env = "SHELL_JUPYTER_INTERPRETER", default_value = "sh")]
    interpreter: String,

    /// Argument passed to the interpreter (repeatable)
    #[arg(
        long = "interpreter-arg",
        value_name = "ARG",
        default_values = ["-s"],
        allow_hyphen_values = true
    )]
    interpreter_args: Vec<String>,

    /// Language name reported to the frontend
    #[arg(long, default_value = "shell")]
    language: String,
}

impl Args {
    fn connection_file(&self) -> Option<&PathBuf> {
        self.connection_file
            .as_ref()
            .or(self.connection_file_flag.as_ref())
    }

    fn install_options(&self) -> InstallOptions {
        InstallOptions {
            scope: if self.sys_prefix {
                InstallScope::SysPrefix
            } else {
                InstallScope::User
            },
            interpreter: self.interpreter.clone(),
            interpreter_args: self.interpreter_args.clone(),
            language: self.language.clone(),
        }
    }

    fn language_info(&self) -> LanguageInfo {
        let mut info = LanguageInfo::shell();
        info.name = self.language.clone();
        info
    }
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout belongs to the frontend launcher
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("shell-jupyter kernel v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    if args.install {
        return install::install_kernel(&args.install_options());
    }

    let Some(connection_file) = args.connection_file() else {
        // Bare invocation: set things up for the user and open a notebook
        install::install_kernel(&args.install_options())?;
        return install::launch_notebook();
    };

    tracing::info!("Loading connection file: {}", connection_file.display());
    let connection = ConnectionInfo::from_file(connection_file)
        .with_context(|| format!("Failed to load {}", connection_file.display()))?;

    run_to_exit(run(&args, connection)).context("Failed to start the runtime")??;

    tracing::info!("Kernel shutdown complete");
    Ok(())
}

async fn run(args: &Args, connection: ConnectionInfo) -> Result<()> {
    let transport = Transport::bind(&connection)
        .await
        .context("Failed to bind kernel sockets")?;
    let (endpoints, io_tasks) = transport.spawn();

    let factory = ProcessFactory::new(args.interpreter.clone(), args.interpreter_args.clone());
    let kernel = Arc::new(
        Kernel::builder(connection, factory)
            .language(args.language_info())
            .build(endpoints.iopub)?,
    );

    tracing::info!("Kernel ready, starting event loop");
    kernel.serve(endpoints.shell, endpoints.control).await?;

    // Every sink is gone once the kernel is dropped, so the writers can finish
    io_tasks.drain().await;
    Ok(())
}
