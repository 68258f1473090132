//! Message loops
//!
//! One [`Dispatcher`] runs per serviced socket. It receives frame sets in
//! order, decodes and authenticates them, routes each message to its handler
//! and logs any failure before moving on to the next message, so a bad
//! message never stops the loop.

use crate::content::Content;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::message::KernelMessage;
use crate::transport::{Channel, Endpoint};
use bytes::Bytes;
use std::sync::Arc;

/// What a loop does after handling one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Why a loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// A non-restart shutdown was handled
    Shutdown,
    /// The socket task went away
    Closed,
}

pub struct Dispatcher {
    kernel: Arc<Kernel>,
    endpoint: Endpoint,
}

impl Dispatcher {
    pub fn new(kernel: Arc<Kernel>, endpoint: Endpoint) -> Self {
        Self { kernel, endpoint }
    }

    fn channel(&self) -> Channel {
        self.endpoint.outbound.channel()
    }

    /// Process messages until shutdown or until the inbound channel closes
    pub async fn run(mut self) -> (Channel, Stop) {
        let channel = self.channel();
        tracing::info!("Starting {:?} loop", channel);

        while let Some(frames) = self.endpoint.inbound.recv().await {
            match self.handle(frames).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => return (channel, Stop::Shutdown),
                Err(e) => tracing::error!("Failed to handle {:?} message: {}", channel, e),
            }
        }

        (channel, Stop::Closed)
    }

    async fn handle(&self, frames: Vec<Bytes>) -> Result<Flow> {
        let msg = self.kernel.codec().decode(frames)?;
        self.kernel.session().record(&msg);

        tracing::info!(
            "Received {:?} message: {} (identities: {})",
            self.channel(),
            msg.header.msg_type,
            msg.identities.len()
        );

        match self.channel() {
            Channel::Control => self.route_control(&msg),
            _ => self.route_shell(&msg).await,
        }
    }

    async fn route_shell(&self, msg: &KernelMessage) -> Result<Flow> {
        let kernel = &self.kernel;
        let reply = &self.endpoint.outbound;

        match &msg.content {
            Content::KernelInfoRequest(_) => kernel.kernel_info(msg, reply)?,
            Content::ExecuteRequest(request) => kernel.execute(msg, request, reply).await?,
            Content::ConnectRequest(_) => kernel.connect(msg, reply)?,
            Content::ShutdownRequest(request) => return kernel.shutdown(msg, request, reply),
            Content::HistoryRequest(_) => kernel.history(msg, reply)?,
            Content::InspectRequest(_) => kernel.inspect(msg, reply)?,
            Content::CompleteRequest(_)
            | Content::IntellisenseRequest(_)
            | Content::ObjectInfoRequest(_) => {
                tracing::debug!(
                    "Code intelligence is not supported, ignoring {}",
                    msg.header.msg_type
                );
            }
            Content::CommOpen(request) => kernel.comm_open(msg, request)?,
            Content::CommMsg(request) => kernel.comm_msg(msg, request)?,
            Content::CommClose(request) => kernel.comm_close(msg, request)?,
            Content::CommInfoRequest(request) => kernel.comm_info(msg, request, reply)?,
            Content::Unrecognized { msg_type, .. } => {
                tracing::info!("Unhandled message type: {}", msg_type);
            }
            Content::KernelInfoReply(_)
            | Content::ExecuteReply(_)
            | Content::ExecuteInput(_)
            | Content::Stream(_)
            | Content::DisplayData(_)
            | Content::Status(_)
            | Content::ConnectReply(_)
            | Content::ShutdownReply(_)
            | Content::HistoryReply(_)
            | Content::InspectReply(_)
            | Content::CommInfoReply(_) => {
                tracing::warn!("Unexpected {} on shell", msg.header.msg_type);
            }
        }

        Ok(Flow::Continue)
    }

    fn route_control(&self, msg: &KernelMessage) -> Result<Flow> {
        let kernel = &self.kernel;
        let reply = &self.endpoint.outbound;

        match &msg.content {
            Content::ShutdownRequest(request) => kernel.shutdown(msg, request, reply),
            Content::KernelInfoRequest(_) => {
                kernel.kernel_info(msg, reply)?;
                Ok(Flow::Continue)
            }
            _ => {
                tracing::warn!("Unhandled control message: {}", msg.header.msg_type);
                Ok(Flow::Continue)
            }
        }
    }
}
