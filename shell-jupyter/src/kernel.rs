//! Jupyter kernel context and request handlers
//!
//! [`Kernel`] owns everything the message loops share: the codec, the iopub
//! publisher, the session state and the evaluator. Handlers take the decoded
//! request plus the sink for the channel it arrived on, and report failures
//! as [`KernelError`](crate::KernelError) for the loop to log.

use crate::comm::{self, CommCallbacks};
use crate::content::{
    CommClose, CommInfoRequest, CommMsg, CommOpen, ConnectReply, Content, DisplayData,
    ExecuteInput, ExecuteReply, ExecuteRequest, ExecutionState, HistoryReply, InspectReply,
    JsonObject, KernelInfoReply, LanguageInfo, ShutdownReply, ShutdownRequest, Status, Stream,
};
use crate::dispatch::{Dispatcher, Flow, Stop};
use crate::error::{KernelError, Result};
use crate::evaluator::{Captured, EvaluatorFactory, EvaluatorSlot};
use crate::message::{Codec, ConnectionInfo, KernelMessage, PROTOCOL_VERSION};
use crate::session::Session;
use crate::transport::{Endpoint, Sink};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// How long process exit waits on blocking work left over after shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Run `future` to completion on a fresh multi-threaded runtime
///
/// The runtime is then torn down without waiting more than
/// [`SHUTDOWN_GRACE`] for blocking tasks, so a cell that is still evaluating
/// when the kernel shuts down cannot keep the process alive.
pub fn run_to_exit<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(output)
}

/// Encodes messages and queues them on iopub or a reply channel
#[derive(Clone)]
pub struct Publisher {
    codec: Arc<Codec>,
    iopub: Sink,
}

impl Publisher {
    pub fn new(codec: Arc<Codec>, iopub: Sink) -> Self {
        Self { codec, iopub }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Broadcast `content` on iopub in response to `source`
    pub fn publish(&self, source: &KernelMessage, content: impl Into<Content>) -> Result<()> {
        let frames = self.codec.encode(source, &content.into())?;
        self.iopub.send(frames)
    }

    /// Broadcast `content` on iopub with no parent message
    pub fn publish_unparented(&self, content: impl Into<Content>) -> Result<()> {
        let frames = self.codec.encode_unparented(&content.into())?;
        self.iopub.send(frames)
    }

    /// Reply to `source` on the channel it arrived on
    pub fn reply(
        &self,
        sink: &Sink,
        source: &KernelMessage,
        content: impl Into<Content>,
    ) -> Result<()> {
        let frames = self.codec.encode(source, &content.into())?;
        sink.send(frames)
    }
}

/// Builder for [`Kernel`]
pub struct KernelBuilder {
    connection: ConnectionInfo,
    factory: Box<dyn EvaluatorFactory>,
    language: LanguageInfo,
    comms: Vec<(String, CommCallbacks)>,
}

impl KernelBuilder {
    /// Language metadata reported in `kernel_info_reply`
    pub fn language(mut self, language: LanguageInfo) -> Self {
        self.language = language;
        self
    }

    /// Register a comm target before the kernel starts
    pub fn comm(mut self, target_name: impl Into<String>, callbacks: CommCallbacks) -> Self {
        self.comms.push((target_name.into(), callbacks));
        self
    }

    /// Build the kernel, publishing through `iopub`
    pub fn build(self, iopub: Sink) -> Result<Kernel> {
        let codec = Arc::new(Codec::new(self.connection.signer()?));
        let session = Arc::new(Session::new());
        for (target_name, callbacks) in self.comms {
            session.register_comm(&target_name, Arc::new(callbacks));
        }

        tracing::info!("Kernel initialized with session {}", codec.session());

        Ok(Kernel {
            connection: self.connection,
            language: self.language,
            publisher: Publisher::new(codec, iopub),
            session,
            evaluator: EvaluatorSlot::new(self.factory),
        })
    }
}

/// The kernel instance shared by the shell and control loops
pub struct Kernel {
    connection: ConnectionInfo,
    language: LanguageInfo,
    publisher: Publisher,
    session: Arc<Session>,
    evaluator: EvaluatorSlot,
}

impl Kernel {
    pub fn builder(
        connection: ConnectionInfo,
        factory: impl EvaluatorFactory + 'static,
    ) -> KernelBuilder {
        KernelBuilder {
            connection,
            factory: Box::new(factory),
            language: LanguageInfo::shell(),
            comms: Vec::new(),
        }
    }

    pub(crate) fn codec(&self) -> &Codec {
        self.publisher.codec()
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub fn execution_count(&self) -> u32 {
        self.session.execution_count()
    }

    /// Open comm ids and their target names
    pub fn active_comms(&self) -> BTreeMap<String, String> {
        self.session
            .comm_snapshot(None)
            .into_iter()
            .map(|(id, info)| (id, info.target_name))
            .collect()
    }

    /// Register callbacks for a comm target; the last registration wins
    pub fn register_comm(&self, target_name: &str, callbacks: CommCallbacks) {
        tracing::info!("Registering comm target '{}'", target_name);
        self.session.register_comm(target_name, Arc::new(callbacks));
    }

    /// Stop accepting new comms for a target. Comms already open stay open.
    pub fn unregister_comm(&self, target_name: &str) -> bool {
        self.session.unregister_comm(target_name)
    }

    /// Push display data to the frontend that sent the most recent message
    pub fn display(&self, display: DisplayData) -> Result<()> {
        let recipient = self.session.last_message().ok_or(KernelError::NoRecipient)?;
        self.publisher.publish(&recipient, display)
    }

    /// Serve the shell and control channels until shutdown
    ///
    /// Publishes the `starting` status, then runs both loops concurrently.
    /// Returns once either loop handles a non-restart shutdown, a loop's
    /// channel closes, or the process receives Ctrl-C.
    pub async fn serve(self: Arc<Self>, shell: Endpoint, control: Endpoint) -> Result<()> {
        self.publisher
            .publish_unparented(Status::new(ExecutionState::Starting))?;

        let mut loops = JoinSet::new();
        loops.spawn(Dispatcher::new(self.clone(), shell).run());
        loops.spawn(Dispatcher::new(self.clone(), control).run());

        tokio::select! {
            Some(done) = loops.join_next() => match done {
                Ok((channel, Stop::Shutdown)) => {
                    tracing::info!("Shutdown requested on {:?}, exiting", channel)
                }
                Ok((channel, Stop::Closed)) => {
                    tracing::warn!("{:?} channel closed, exiting", channel)
                }
                Err(e) => tracing::error!("Message loop failed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Received SIGINT, shutting down");
            }
        }

        loops.shutdown().await;
        self.evaluator.dispose();
        Ok(())
    }

    fn status(&self, parent: &KernelMessage, state: ExecutionState) -> Result<()> {
        self.publisher.publish(parent, Status::new(state))
    }

    /// Run `f` between busy and idle status broadcasts
    fn busy<T>(&self, parent: &KernelMessage, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.status(parent, ExecutionState::Busy)?;
        let result = f();
        self.status(parent, ExecutionState::Idle)?;
        result
    }

    fn kernel_info_content(&self) -> KernelInfoReply {
        KernelInfoReply {
            status: "ok".to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            implementation: "shell-jupyter".to_string(),
            implementation_version: env!("CARGO_PKG_VERSION").to_string(),
            language_info: self.language.clone(),
            banner: format!(
                "shell-jupyter v{}\nCells run through the {} interpreter",
                env!("CARGO_PKG_VERSION"),
                self.language.name
            ),
            help_links: Vec::new(),
        }
    }

    pub(crate) fn kernel_info(&self, msg: &KernelMessage, reply: &Sink) -> Result<()> {
        self.busy(msg, || {
            self.publisher.reply(reply, msg, self.kernel_info_content())
        })
    }

    pub(crate) async fn execute(
        &self,
        msg: &KernelMessage,
        request: &ExecuteRequest,
        reply: &Sink,
    ) -> Result<()> {
        tracing::info!(
            "Executing code ({} chars, silent={})",
            request.code.len(),
            request.silent
        );

        self.status(msg, ExecutionState::Busy)?;

        let execution_count = if request.silent {
            self.session.execution_count()
        } else {
            self.session.increment_execution_count()
        };

        self.publisher.publish(
            msg,
            ExecuteInput {
                code: request.code.clone(),
                execution_count,
            },
        )?;

        let captured = self.evaluate(&request.code).await;

        self.publisher.publish(msg, Stream::stdout(captured.stdout))?;
        self.publisher.publish(msg, Stream::stderr(captured.stderr))?;

        // Status is always "ok": failures only show up on stderr.
        self.publisher.reply(
            reply,
            msg,
            ExecuteReply {
                status: "ok".to_string(),
                execution_count,
                payload: Vec::new(),
                user_expressions: JsonObject::new(),
            },
        )?;

        self.status(msg, ExecutionState::Idle)
    }

    /// Evaluate on the blocking pool, folding every failure into stderr
    async fn evaluate(&self, code: &str) -> Captured {
        let evaluator = match self.evaluator.get_or_create() {
            Ok(evaluator) => evaluator,
            Err(e) => {
                tracing::error!("{}", e);
                return Captured {
                    stdout: String::new(),
                    stderr: e.to_string(),
                };
            }
        };

        let code = code.to_string();
        match tokio::task::spawn_blocking(move || evaluator.evaluate(&code)).await {
            Ok(Ok(captured)) => captured,
            Ok(Err(e)) => {
                tracing::info!("Evaluation failed: {:#}", e);
                Captured {
                    stdout: String::new(),
                    stderr: format!("{:#}", e),
                }
            }
            Err(e) => {
                tracing::error!("Evaluator task failed: {}", e);
                Captured {
                    stdout: String::new(),
                    stderr: e.to_string(),
                }
            }
        }
    }

    pub(crate) fn connect(&self, msg: &KernelMessage, reply: &Sink) -> Result<()> {
        self.busy(msg, || {
            self.publisher.reply(
                reply,
                msg,
                ConnectReply {
                    shell_port: self.connection.shell_port,
                    iopub_port: self.connection.iopub_port,
                    stdin_port: self.connection.stdin_port,
                    hb_port: self.connection.hb_port,
                },
            )
        })
    }

    pub(crate) fn shutdown(
        &self,
        msg: &KernelMessage,
        request: &ShutdownRequest,
        reply: &Sink,
    ) -> Result<Flow> {
        tracing::info!("Shutdown requested (restart={})", request.restart);

        self.busy(msg, || {
            self.evaluator.dispose();
            self.publisher.reply(
                reply,
                msg,
                ShutdownReply {
                    status: "ok".to_string(),
                    restart: request.restart,
                },
            )?;

            if request.restart {
                self.evaluator.recreate()?;
                Ok(Flow::Continue)
            } else {
                Ok(Flow::Shutdown)
            }
        })
    }

    pub(crate) fn history(&self, msg: &KernelMessage, reply: &Sink) -> Result<()> {
        self.publisher.reply(
            reply,
            msg,
            HistoryReply {
                status: "ok".to_string(),
                history: Vec::new(),
            },
        )
    }

    pub(crate) fn inspect(&self, msg: &KernelMessage, reply: &Sink) -> Result<()> {
        self.publisher.reply(
            reply,
            msg,
            InspectReply {
                status: "ok".to_string(),
                found: false,
                data: JsonObject::new(),
                metadata: JsonObject::new(),
            },
        )
    }

    pub(crate) fn comm_open(&self, msg: &KernelMessage, request: &CommOpen) -> Result<()> {
        self.busy(msg, || {
            comm::open(&self.publisher, &self.session, msg, request)
        })
    }

    pub(crate) fn comm_msg(&self, msg: &KernelMessage, request: &CommMsg) -> Result<()> {
        self.busy(msg, || {
            comm::message(&self.publisher, &self.session, msg, request)
        })
    }

    pub(crate) fn comm_close(&self, msg: &KernelMessage, request: &CommClose) -> Result<()> {
        self.busy(msg, || {
            comm::close(&self.publisher, &self.session, msg, request)
        })
    }

    pub(crate) fn comm_info(
        &self,
        msg: &KernelMessage,
        request: &CommInfoRequest,
        reply: &Sink,
    ) -> Result<()> {
        self.busy(msg, || {
            self.publisher
                .reply(reply, msg, comm::info(&self.session, request))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_run_to_exit_does_not_wait_for_blocking_work() {
        let started = Instant::now();
        let output = run_to_exit(async {
            tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(6)));
            42
        })
        .unwrap();

        assert_eq!(output, 42);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
