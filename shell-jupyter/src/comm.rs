//! Comms: named, bidirectional side-channels opened by the frontend
//!
//! A feature that wants a side-channel registers [`CommCallbacks`] under a
//! target name. When the frontend sends `comm_open` for that target the
//! kernel calls `on_open` and tracks the comm id until either side closes
//! it. Callbacks talk back to the frontend through a [`CommSender`].

use crate::content::{CommClose, CommInfoReply, CommInfoRequest, CommMsg, CommOpen, JsonObject};
use crate::error::{KernelError, Result};
use crate::kernel::Publisher;
use crate::message::KernelMessage;
use crate::session::{ActiveComm, Session};
use std::sync::Arc;

type Callback<T> = Box<dyn Fn(&CommSender, &T) -> anyhow::Result<()> + Send + Sync>;

/// The callbacks a comm target provides
pub struct CommCallbacks {
    on_open: Callback<CommOpen>,
    on_message: Callback<CommMsg>,
    on_close: Callback<CommClose>,
}

impl CommCallbacks {
    /// Callbacks that accept everything and do nothing
    pub fn new() -> Self {
        Self {
            on_open: Box::new(|_, _| Ok(())),
            on_message: Box::new(|_, _| Ok(())),
            on_close: Box::new(|_, _| Ok(())),
        }
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&CommSender, &CommOpen) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_open = Box::new(f);
        self
    }

    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&CommSender, &CommMsg) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_message = Box::new(f);
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&CommSender, &CommClose) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_close = Box::new(f);
        self
    }
}

impl Default for CommCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends comm messages back to the frontend that opened the comm
///
/// Messages are published on iopub with the opening request as parent, so
/// they reach the requester even when sent long after the request.
#[derive(Clone)]
pub struct CommSender {
    comm_id: String,
    source: Arc<KernelMessage>,
    publisher: Publisher,
    session: Arc<Session>,
}

impl CommSender {
    pub(crate) fn new(
        comm_id: &str,
        source: Arc<KernelMessage>,
        publisher: Publisher,
        session: Arc<Session>,
    ) -> Self {
        Self {
            comm_id: comm_id.to_string(),
            source,
            publisher,
            session,
        }
    }

    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    /// Send `data` to the frontend as a `comm_msg`
    pub fn send(&self, data: JsonObject) -> Result<()> {
        self.publisher.publish(
            &self.source,
            CommMsg {
                comm_id: self.comm_id.clone(),
                data,
            },
        )
    }

    /// Close the comm from the kernel side
    pub fn close(&self, data: JsonObject) -> Result<()> {
        self.session.remove_comm(&self.comm_id);
        self.publisher.publish(
            &self.source,
            CommClose {
                comm_id: self.comm_id.clone(),
                data,
            },
        )
    }
}

fn callback_error(target_name: &str, err: anyhow::Error) -> KernelError {
    KernelError::Callback {
        target: target_name.to_string(),
        reason: format!("{:#}", err),
    }
}

/// Handle `comm_open`: accept it if the target is registered, decline otherwise
pub(crate) fn open(
    publisher: &Publisher,
    session: &Arc<Session>,
    msg: &KernelMessage,
    request: &CommOpen,
) -> Result<()> {
    let callbacks = if request.target_name.is_empty() {
        None
    } else {
        session.registered_comm(&request.target_name)
    };

    let Some(callbacks) = callbacks else {
        tracing::warn!(
            "No comm target '{}' registered, closing comm {}",
            request.target_name,
            request.comm_id
        );
        return publisher.publish(
            msg,
            CommClose {
                comm_id: request.comm_id.clone(),
                data: JsonObject::new(),
            },
        );
    };

    // Recorded before on_open runs so the callback can already send on, or
    // close, the new comm.
    session.insert_comm(
        &request.comm_id,
        ActiveComm {
            target_name: request.target_name.clone(),
            callbacks: callbacks.clone(),
        },
    );

    let sender = CommSender::new(
        &request.comm_id,
        Arc::new(msg.clone()),
        publisher.clone(),
        session.clone(),
    );
    if let Err(e) = (callbacks.on_open)(&sender, request) {
        session.remove_comm(&request.comm_id);
        return Err(callback_error(&request.target_name, e));
    }

    tracing::info!(
        "Opened comm {} for target '{}'",
        request.comm_id,
        request.target_name
    );
    Ok(())
}

/// Handle `comm_msg`: forward to the comm's target, ignoring unknown ids
pub(crate) fn message(
    publisher: &Publisher,
    session: &Arc<Session>,
    msg: &KernelMessage,
    request: &CommMsg,
) -> Result<()> {
    let Some(comm) = session.active_comm(&request.comm_id) else {
        tracing::warn!("Ignoring message for unknown comm {}", request.comm_id);
        return Ok(());
    };

    let sender = CommSender::new(
        &request.comm_id,
        Arc::new(msg.clone()),
        publisher.clone(),
        session.clone(),
    );
    (comm.callbacks.on_message)(&sender, request)
        .map_err(|e| callback_error(&comm.target_name, e))
}

/// Handle `comm_close`: notify the target and forget the comm
pub(crate) fn close(
    publisher: &Publisher,
    session: &Arc<Session>,
    msg: &KernelMessage,
    request: &CommClose,
) -> Result<()> {
    let Some(comm) = session.active_comm(&request.comm_id) else {
        tracing::warn!("Ignoring close for unknown comm {}", request.comm_id);
        return Ok(());
    };

    let sender = CommSender::new(
        &request.comm_id,
        Arc::new(msg.clone()),
        publisher.clone(),
        session.clone(),
    );
    let result = (comm.callbacks.on_close)(&sender, request)
        .map_err(|e| callback_error(&comm.target_name, e));

    session.remove_comm(&request.comm_id);
    tracing::info!("Closed comm {}", request.comm_id);
    result
}

/// Build `comm_info_reply` from the comms open right now
pub(crate) fn info(session: &Session, request: &CommInfoRequest) -> CommInfoReply {
    let filter = request.target_name.as_deref().filter(|t| !t.is_empty());
    CommInfoReply {
        status: "ok".to_string(),
        comms: session.comm_snapshot(filter),
    }
}
