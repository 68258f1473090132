//! Test helpers: an in-memory frontend wired to a real kernel

use crate::content::{Content, ExecuteRequest};
use crate::dispatch::{Dispatcher, Stop};
use crate::evaluator::{Captured, Evaluator, EvaluatorFactory};
use crate::kernel::Kernel;
use crate::message::{Codec, ConnectionInfo, Header, KernelMessage, DELIMITER};
use crate::signer::Signer;
use crate::transport::{Channel, Endpoint, Outgoing, Sink};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Frames a frontend would send for `content`, signed with `key`
pub(crate) fn request_frames(key: &str, identity: &[u8], content: &Content) -> Vec<Bytes> {
    let signer = Signer::new(key, "hmac-sha256").unwrap();
    let header =
        serde_json::to_string(&Header::new(content.msg_type(), "client-session", "alice")).unwrap();
    let parent = "{}".to_string();
    let metadata = "{}".to_string();
    let body = content.to_json().unwrap();
    let signature = signer.sign(&[
        header.as_bytes(),
        parent.as_bytes(),
        metadata.as_bytes(),
        body.as_bytes(),
    ]);
    vec![
        Bytes::copy_from_slice(identity),
        Bytes::from_static(DELIMITER),
        Bytes::from(signature),
        Bytes::from(header),
        Bytes::from(parent),
        Bytes::from(metadata),
        Bytes::from(body),
    ]
}

pub(crate) fn connection(key: &str) -> ConnectionInfo {
    ConnectionInfo {
        ip: "127.0.0.1".to_string(),
        transport: "tcp".to_string(),
        signature_scheme: "hmac-sha256".to_string(),
        key: key.to_string(),
        shell_port: 9004,
        iopub_port: 9003,
        stdin_port: 9002,
        control_port: 9001,
        hb_port: 9000,
    }
}

pub(crate) fn execute(code: &str, silent: bool) -> ExecuteRequest {
    ExecuteRequest {
        code: code.to_string(),
        silent,
        store_history: !silent,
        user_expressions: Default::default(),
        allow_stdin: false,
    }
}

/// Holds "block" cells until the test opens it
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn wait(&self) {
        let open = self.open.lock().unwrap();
        let _open = self
            .opened
            .wait_timeout_while(open, Duration::from_secs(10), |open| !*open)
            .unwrap();
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

/// Echoes the code back on stdout. Code starting with "fail" errors, code
/// starting with "block" waits for the gate and ignores dispose.
struct Scripted {
    gate: Arc<Gate>,
}

impl Evaluator for Scripted {
    fn evaluate(&self, code: &str) -> anyhow::Result<Captured> {
        if code.starts_with("fail") {
            anyhow::bail!("boom");
        }
        if code.starts_with("block") {
            self.gate.wait();
        }
        Ok(Captured {
            stdout: format!("ran {}", code),
            stderr: String::new(),
        })
    }
}

struct ScriptedFactory {
    created: Arc<AtomicUsize>,
    gate: Arc<Gate>,
}

impl EvaluatorFactory for ScriptedFactory {
    fn create(&self) -> anyhow::Result<Arc<dyn Evaluator>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Scripted {
            gate: self.gate.clone(),
        }))
    }
}

/// A kernel whose shell, control and iopub output all land on one queue,
/// so tests can assert the exact order across channels
pub(crate) struct Harness {
    pub kernel: Arc<Kernel>,
    key: String,
    client: Codec,
    created: Arc<AtomicUsize>,
    gate: Arc<Gate>,
    out: mpsc::UnboundedReceiver<Outgoing>,
    shell_in: mpsc::UnboundedSender<Vec<Bytes>>,
    control_in: mpsc::UnboundedSender<Vec<Bytes>>,
    shell: Option<Endpoint>,
    control: Option<Endpoint>,
}

impl Harness {
    pub fn new(key: &str) -> Self {
        let created = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Gate::default());
        let (out_tx, out) = mpsc::unbounded_channel();
        let (shell_in, shell_rx) = mpsc::unbounded_channel();
        let (control_in, control_rx) = mpsc::unbounded_channel();

        let kernel = Kernel::builder(
            connection(key),
            ScriptedFactory {
                created: created.clone(),
                gate: gate.clone(),
            },
        )
        .build(Sink::new(Channel::IoPub, out_tx.clone()))
        .unwrap();

        Self {
            kernel: Arc::new(kernel),
            key: key.to_string(),
            client: Codec::new(Signer::new(key, "hmac-sha256").unwrap()),
            created,
            gate,
            out,
            shell_in,
            control_in,
            shell: Some(Endpoint {
                inbound: shell_rx,
                outbound: Sink::new(Channel::Shell, out_tx.clone()),
            }),
            control: Some(Endpoint {
                inbound: control_rx,
                outbound: Sink::new(Channel::Control, out_tx),
            }),
        }
    }

    /// Number of evaluators the kernel has created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Let every "block" cell finish
    pub fn release(&self) {
        self.gate.open();
    }

    pub fn take_shell(&mut self) -> Endpoint {
        self.shell.take().expect("shell endpoint already taken")
    }

    pub fn take_control(&mut self) -> Endpoint {
        self.control.take().expect("control endpoint already taken")
    }

    pub fn spawn_shell(&mut self) -> JoinHandle<(Channel, Stop)> {
        let endpoint = self.take_shell();
        tokio::spawn(Dispatcher::new(self.kernel.clone(), endpoint).run())
    }

    pub fn spawn_control(&mut self) -> JoinHandle<(Channel, Stop)> {
        let endpoint = self.take_control();
        tokio::spawn(Dispatcher::new(self.kernel.clone(), endpoint).run())
    }

    pub fn send_shell(&self, content: impl Into<Content>) {
        self.send_shell_signed_with(&self.key.clone(), content);
    }

    pub fn send_shell_signed_with(&self, key: &str, content: impl Into<Content>) {
        self.send_raw_shell(request_frames(key, b"client", &content.into()));
    }

    pub fn send_raw_shell(&self, frames: Vec<Bytes>) {
        self.shell_in.send(frames).unwrap();
    }

    pub fn send_control(&self, content: impl Into<Content>) {
        let frames = request_frames(&self.key, b"client", &content.into());
        self.control_in.send(frames).unwrap();
    }

    /// The next message the kernel sent, on any channel
    pub async fn next(&mut self) -> (Channel, KernelMessage) {
        let out = tokio::time::timeout(Duration::from_secs(5), self.out.recv())
            .await
            .expect("timed out waiting for kernel output")
            .expect("kernel output closed");
        let msg = self.client.decode(out.frames).unwrap();
        (out.channel, msg)
    }

    pub async fn take(&mut self, n: usize) -> Vec<(Channel, KernelMessage)> {
        let mut messages = Vec::with_capacity(n);
        for _ in 0..n {
            messages.push(self.next().await);
        }
        messages
    }

    /// Assert the kernel sends nothing more for a short while
    pub async fn assert_quiet(&mut self) {
        let extra = tokio::time::timeout(Duration::from_millis(200), self.out.recv()).await;
        if let Ok(Some(out)) = extra {
            let msg = self.client.decode(out.frames).unwrap();
            panic!("unexpected {:?} message: {:?}", out.channel, msg.content);
        }
    }
}
