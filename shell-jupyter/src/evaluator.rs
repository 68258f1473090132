//! Code evaluation backend
//!
//! The kernel hands each cell to an [`Evaluator`] and forwards whatever it
//! captured on stdout and stderr. [`ProcessEvaluator`] runs the cell through
//! an external interpreter program, feeding the code on stdin.

use crate::error::KernelError;
use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Text captured while evaluating one cell
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

/// Runs source text and captures its output
pub trait Evaluator: Send + Sync {
    /// Evaluate `code`, returning captured stdout and stderr
    fn evaluate(&self, code: &str) -> Result<Captured>;

    /// Release any resources held by the evaluator
    fn dispose(&self) {}
}

/// Creates evaluators on demand
pub trait EvaluatorFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Evaluator>>;
}

impl<F> EvaluatorFactory for F
where
    F: Fn() -> Result<Arc<dyn Evaluator>> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn Evaluator>> {
        self()
    }
}

/// Evaluates cells by piping them into an interpreter process
///
/// Each cell runs in a fresh interpreter. On unix the interpreter leads its
/// own process group, and [`Evaluator::dispose`] kills that group, so
/// anything the cell started stops with it.
pub struct ProcessEvaluator {
    program: String,
    args: Vec<String>,
    disposed: AtomicBool,
    /// Pid of the interpreter running the current cell
    running: Mutex<Option<u32>>,
}

impl ProcessEvaluator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            disposed: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }

    fn running(&self) -> MutexGuard<'_, Option<u32>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    tracing::info!("Killing interpreter process group {}", pid);
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::warn!("Failed to kill interpreter process group {}: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn kill_group(pid: u32) {
    tracing::warn!("Cannot stop interpreter {} on this platform", pid);
}

impl Evaluator for ProcessEvaluator {
    fn evaluate(&self, code: &str) -> Result<Captured> {
        if self.disposed.load(Ordering::SeqCst) {
            anyhow::bail!("Evaluator has been disposed");
        }

        tracing::debug!("Running {} chars through {}", code.len(), self.program);

        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("Failed to start interpreter '{}'", self.program))?;

        {
            let mut running = self.running();
            *running = Some(child.id());
            // A dispose that ran between the check above and the spawn
            // never saw this pid.
            if self.disposed.load(Ordering::SeqCst) {
                kill_group(child.id());
            }
        }

        // Written from a separate thread so a chatty interpreter can't fill
        // its stdout pipe while we are still blocked writing stdin.
        let mut stdin = child.stdin.take().context("Interpreter stdin unavailable")?;
        let mut source = code.to_string();
        if !source.ends_with('\n') {
            source.push('\n');
        }
        let writer = std::thread::spawn(move || stdin.write_all(source.as_bytes()));

        let output = child.wait_with_output();
        self.running().take();
        let output = output.context("Failed to collect interpreter output")?;

        match writer.join() {
            Ok(Ok(())) => {}
            // The interpreter may exit before reading all of its input.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e).context("Failed to write code to interpreter"),
            Err(_) => anyhow::bail!("Interpreter input thread panicked"),
        }

        if self.disposed.load(Ordering::SeqCst) {
            anyhow::bail!("Interpreter was stopped by shutdown");
        }

        if !output.status.success() {
            tracing::debug!("Interpreter exited with {}", output.status);
        }

        Ok(Captured {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(pid) = *self.running() {
            kill_group(pid);
        }
    }
}

/// Creates [`ProcessEvaluator`]s for a fixed interpreter command line
#[derive(Debug, Clone)]
pub struct ProcessFactory {
    program: String,
    args: Vec<String>,
}

impl ProcessFactory {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl EvaluatorFactory for ProcessFactory {
    fn create(&self) -> Result<Arc<dyn Evaluator>> {
        tracing::info!("Creating evaluator: {} {:?}", self.program, self.args);
        Ok(Arc::new(ProcessEvaluator::new(
            self.program.clone(),
            self.args.clone(),
        )))
    }
}

/// Owns the kernel's evaluator: created lazily, disposed on shutdown,
/// replaced on restart
pub struct EvaluatorSlot {
    factory: Box<dyn EvaluatorFactory>,
    current: Mutex<Option<Arc<dyn Evaluator>>>,
}

impl EvaluatorSlot {
    pub fn new(factory: Box<dyn EvaluatorFactory>) -> Self {
        Self {
            factory,
            current: Mutex::new(None),
        }
    }

    /// The current evaluator, creating one on first use
    ///
    /// The returned handle is independent of the slot's lock, so a shutdown
    /// can dispose the evaluator while a cell is still running.
    pub fn get_or_create(&self) -> crate::Result<Arc<dyn Evaluator>> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(evaluator) = current.as_ref() {
            return Ok(evaluator.clone());
        }
        let evaluator = self
            .factory
            .create()
            .map_err(|e| KernelError::Evaluator(format!("{:#}", e)))?;
        *current = Some(evaluator.clone());
        Ok(evaluator)
    }

    /// Replace the current evaluator with a fresh one
    pub fn recreate(&self) -> crate::Result<()> {
        let evaluator = self
            .factory
            .create()
            .map_err(|e| KernelError::Evaluator(format!("{:#}", e)))?;
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(evaluator);
        if let Some(previous) = previous {
            previous.dispose();
        }
        Ok(())
    }

    /// Dispose of the current evaluator, if any
    pub fn dispose(&self) {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            tracing::info!("Disposing evaluator");
            previous.dispose();
        }
    }

    pub fn is_live(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
