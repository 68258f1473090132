//! ZeroMQ socket transport
//!
//! Binds the five Jupyter sockets and hands each serviced socket to its own
//! task. Message loops never touch a socket directly: they read frame sets
//! from an inbound channel and write through a cloneable [`Sink`], so the
//! shell loop, the control loop and comm callbacks can all publish on iopub
//! without sharing the socket.

use crate::error::{KernelError, Result};
use crate::message::ConnectionInfo;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use zeromq::{PubSocket, RepSocket, RouterSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

/// How long shutdown waits for queued replies to reach the wire
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The Jupyter sockets ("channels")
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Shell,
    Control,
    Stdin,
    IoPub,
    Heartbeat,
}

/// A frame set queued for a socket
#[derive(Debug)]
pub struct Outgoing {
    pub channel: Channel,
    pub frames: Vec<Bytes>,
}

/// Write handle for one channel
#[derive(Debug, Clone)]
pub struct Sink {
    channel: Channel,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Sink {
    pub fn new(channel: Channel, tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self { channel, tx }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Queue a frame set for sending
    pub fn send(&self, frames: Vec<Bytes>) -> Result<()> {
        self.tx
            .send(Outgoing {
                channel: self.channel,
                frames,
            })
            .map_err(|_| KernelError::ChannelClosed(self.channel))
    }
}

/// A request/reply channel as seen by a message loop
#[derive(Debug)]
pub struct Endpoint {
    pub inbound: mpsc::UnboundedReceiver<Vec<Bytes>>,
    pub outbound: Sink,
}

/// Everything the kernel needs to talk to the frontend
#[derive(Debug)]
pub struct Endpoints {
    pub shell: Endpoint,
    pub control: Endpoint,
    pub iopub: Sink,
}

/// The bound sockets
pub struct Transport {
    shell: RouterSocket,
    iopub: PubSocket,
    control: RouterSocket,
    stdin: RouterSocket,
    heartbeat: RepSocket,
}

impl Transport {
    /// Bind every socket described by the connection info
    pub async fn bind(connection: &ConnectionInfo) -> Result<Self> {
        let mut shell = RouterSocket::new();
        let mut iopub = PubSocket::new();
        let mut control = RouterSocket::new();
        let mut stdin = RouterSocket::new();
        let mut heartbeat = RepSocket::new();

        let shell_addr = connection.socket_addr(connection.shell_port);
        let iopub_addr = connection.socket_addr(connection.iopub_port);
        let control_addr = connection.socket_addr(connection.control_port);
        let stdin_addr = connection.socket_addr(connection.stdin_port);
        let hb_addr = connection.socket_addr(connection.hb_port);

        tracing::info!("Binding shell socket to {}", shell_addr);
        shell.bind(&shell_addr).await?;

        tracing::info!("Binding iopub socket to {}", iopub_addr);
        iopub.bind(&iopub_addr).await?;

        tracing::info!("Binding control socket to {}", control_addr);
        control.bind(&control_addr).await?;

        tracing::info!("Binding stdin socket to {}", stdin_addr);
        stdin.bind(&stdin_addr).await?;

        tracing::info!("Binding heartbeat socket to {}", hb_addr);
        heartbeat.bind(&hb_addr).await?;

        Ok(Self {
            shell,
            iopub,
            control,
            stdin,
            heartbeat,
        })
    }

    /// Move each socket onto its own task
    pub fn spawn(self) -> (Endpoints, IoTasks) {
        let (shell, shell_task) = spawn_router(self.shell, Channel::Shell);
        let (control, control_task) = spawn_router(self.control, Channel::Control);

        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let iopub_task = tokio::spawn(serve_publisher(self.iopub, iopub_rx));
        let heartbeat_task = tokio::spawn(serve_heartbeat(self.heartbeat));

        let endpoints = Endpoints {
            shell,
            control,
            iopub: Sink::new(Channel::IoPub, iopub_tx),
        };
        let tasks = IoTasks {
            writers: vec![shell_task, control_task, iopub_task],
            heartbeat: heartbeat_task,
            _stdin: self.stdin,
        };

        (endpoints, tasks)
    }
}

/// Socket tasks, kept so shutdown can flush them
pub struct IoTasks {
    writers: Vec<JoinHandle<()>>,
    heartbeat: JoinHandle<()>,
    // Bound for the lifetime of the kernel, never read.
    _stdin: RouterSocket,
}

impl IoTasks {
    /// Wait for queued outbound messages to be written, then stop
    ///
    /// Writers finish once every [`Sink`] feeding them has been dropped.
    pub async fn drain(self) {
        for writer in self.writers {
            match tokio::time::timeout(DRAIN_TIMEOUT, writer).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Socket task failed: {}", e),
                Err(_) => tracing::warn!("Timed out flushing outbound messages"),
            }
        }
        self.heartbeat.abort();
    }
}

fn spawn_router(socket: RouterSocket, channel: Channel) -> (Endpoint, JoinHandle<()>) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(serve_router(socket, channel, in_tx, out_rx));
    let endpoint = Endpoint {
        inbound: in_rx,
        outbound: Sink::new(channel, out_tx),
    };
    (endpoint, task)
}

async fn serve_router(
    mut socket: RouterSocket,
    channel: Channel,
    inbound: mpsc::UnboundedSender<Vec<Bytes>>,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
) {
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Ok(msg) => {
                    if inbound.send(msg.into_vec()).is_err() {
                        tracing::debug!("{:?} loop has stopped, dropping message", channel);
                    }
                }
                Err(e) => tracing::warn!("Failed to receive on {:?}: {}", channel, e),
            },
            out = outbound.recv() => match out {
                Some(out) => send_frames(&mut socket, out).await,
                None => break,
            },
        }
    }
    tracing::debug!("{:?} socket task finished", channel);
}

async fn serve_publisher(mut socket: PubSocket, mut outbound: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(out) = outbound.recv().await {
        send_frames(&mut socket, out).await;
    }
    tracing::debug!("IoPub socket task finished");
}

async fn serve_heartbeat(mut socket: RepSocket) {
    loop {
        match socket.recv().await {
            Ok(ping) => {
                if let Err(e) = socket.send(ping).await {
                    tracing::warn!("Failed to echo heartbeat: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to receive heartbeat: {}", e),
        }
    }
}

async fn send_frames<S: SocketSend>(socket: &mut S, out: Outgoing) {
    let channel = out.channel;
    let result = match to_zmq(out.frames) {
        Some(msg) => socket.send(msg).await.map_err(KernelError::from),
        None => Err(KernelError::malformed("empty frame set")),
    };
    if let Err(e) = result {
        tracing::error!("Failed to send on {:?}: {}", channel, e);
    }
}

fn to_zmq(frames: Vec<Bytes>) -> Option<ZmqMessage> {
    let mut frames = frames.into_iter();
    let mut msg = ZmqMessage::from(frames.next()?.to_vec());
    for frame in frames {
        msg.push_back(frame);
    }
    Some(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_zmq_preserves_frame_order() {
        let frames = vec![
            Bytes::from_static(b"id"),
            Bytes::from_static(b"<IDS|MSG>"),
            Bytes::from_static(b"sig"),
        ];
        let msg = to_zmq(frames.clone()).unwrap();
        assert_eq!(msg.into_vec(), frames);
    }

    #[test]
    fn test_to_zmq_rejects_empty() {
        assert!(to_zmq(Vec::new()).is_none());
    }

    #[test]
    fn test_sink_reports_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Sink::new(Channel::IoPub, tx);
        drop(rx);

        let err = sink.send(vec![Bytes::from_static(b"x")]).unwrap_err();
        assert!(matches!(err, KernelError::ChannelClosed(Channel::IoPub)));
    }
}
