//! Jupyter message structures and the wire codec
//!
//! A message on the wire is a list of frames:
//!
//! ```text
//! [identity, ..., "<IDS|MSG>", signature, header, parent_header, metadata, content]
//! ```
//!
//! Identities are opaque routing frames that are replayed verbatim on every
//! message sent in response. The four JSON parts after the signature are
//! covered by the HMAC computed by [`Signer`].

use crate::content::Content;
use crate::error::{KernelError, Result};
use crate::signer::Signer;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Frame separating routing identities from the signed message parts
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Protocol version stamped on outgoing headers
pub const PROTOCOL_VERSION: &str = "5.3";

const EMPTY_OBJECT: &str = "{}";

/// Connection information from Jupyter
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnectionInfo {
    pub ip: String,
    pub transport: String,
    pub signature_scheme: String,
    pub key: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
}

impl ConnectionInfo {
    /// Load connection info from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let info: ConnectionInfo = serde_json::from_str(&content)?;
        Ok(info)
    }

    /// Get the socket address for a given port
    pub fn socket_addr(&self, port: u16) -> String {
        format!("{}://{}:{}", self.transport, self.ip, port)
    }

    /// Build the signer described by `key` and `signature_scheme`
    pub fn signer(&self) -> Result<Signer> {
        Signer::new(&self.key, &self.signature_scheme)
    }
}

/// Message header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    pub msg_type: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub version: String,
}

impl Header {
    pub(crate) fn new(msg_type: &str, session: &str, username: &str) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: username.to_string(),
            msg_type: msg_type.to_string(),
            date: chrono::Utc::now().to_rfc3339(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A decoded Jupyter protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMessage {
    pub identities: Vec<Bytes>,
    pub signature: String,
    pub header: Header,
    /// `None` when the sender put `{}` in the parent header slot
    pub parent_header: Option<Header>,
    pub metadata: Value,
    pub content: Content,
}

/// Converts between wire frames and [`KernelMessage`]s
#[derive(Debug, Clone)]
pub struct Codec {
    signer: Signer,
    session: String,
}

impl Codec {
    /// Create a codec for a kernel session
    pub fn new(signer: Signer) -> Self {
        Self {
            signer,
            session: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// The kernel's own session id, used for messages with no parent
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Decode and authenticate a received frame set
    pub fn decode(&self, frames: Vec<Bytes>) -> Result<KernelMessage> {
        let delim_pos = frames
            .iter()
            .position(|f| f.as_ref() == DELIMITER)
            .ok_or_else(|| KernelError::malformed("delimiter not found"))?;

        let parts = &frames[delim_pos + 1..];
        if parts.len() < 5 {
            return Err(KernelError::malformed(format!(
                "expected 5 frames after the delimiter, got {}",
                parts.len()
            )));
        }

        let text = |i: usize| {
            std::str::from_utf8(&parts[i])
                .map_err(|e| KernelError::malformed(format!("frame {} is not UTF-8: {}", i, e)))
        };
        let signature = text(0)?;
        let header_json = text(1)?;
        let parent_json = text(2)?;
        let metadata_json = text(3)?;
        let content_json = text(4)?;

        let header: Header = serde_json::from_str(header_json)
            .map_err(|e| KernelError::malformed(format!("invalid header: {}", e)))?;
        let parent_header = parse_parent(parent_json)?;
        let metadata: Value = serde_json::from_str(metadata_json)
            .map_err(|e| KernelError::malformed(format!("invalid metadata: {}", e)))?;
        let content = Content::parse(&header.msg_type, content_json)?;

        let signed = [
            header_json.as_bytes(),
            parent_json.as_bytes(),
            metadata_json.as_bytes(),
            content_json.as_bytes(),
        ];
        if !self.signer.verify(signature, &signed) {
            return Err(KernelError::SignatureMismatch);
        }

        Ok(KernelMessage {
            identities: frames[..delim_pos].to_vec(),
            signature: signature.to_string(),
            header,
            parent_header,
            metadata,
            content,
        })
    }

    /// Encode `content` as a response to `source`
    ///
    /// The new header copies the session and username of the source header,
    /// the source header becomes the parent, and the source identities are
    /// replayed in front of the delimiter.
    pub fn encode(&self, source: &KernelMessage, content: &Content) -> Result<Vec<Bytes>> {
        let header = Header::new(
            content.msg_type(),
            &source.header.session,
            &source.header.username,
        );
        let parent = serde_json::to_string(&source.header)?;
        self.frames(&source.identities, &header, parent, content)
    }

    /// Encode a message that answers nothing, such as the startup status
    ///
    /// The message type doubles as the single identity frame, which iopub
    /// subscribers see as the topic.
    pub fn encode_unparented(&self, content: &Content) -> Result<Vec<Bytes>> {
        let header = Header::new(content.msg_type(), &self.session, "kernel");
        let topic = Bytes::from(content.msg_type().to_string());
        self.frames(&[topic], &header, EMPTY_OBJECT.to_string(), content)
    }

    fn frames(
        &self,
        identities: &[Bytes],
        header: &Header,
        parent: String,
        content: &Content,
    ) -> Result<Vec<Bytes>> {
        let header = serde_json::to_string(header)?;
        let metadata = EMPTY_OBJECT.to_string();
        let content = content.to_json()?;

        let signature = self.signer.sign(&[
            header.as_bytes(),
            parent.as_bytes(),
            metadata.as_bytes(),
            content.as_bytes(),
        ]);

        let mut frames = Vec::with_capacity(identities.len() + 6);
        frames.extend(identities.iter().cloned());
        frames.push(Bytes::from_static(DELIMITER));
        frames.push(Bytes::from(signature));
        frames.push(Bytes::from(header));
        frames.push(Bytes::from(parent));
        frames.push(Bytes::from(metadata));
        frames.push(Bytes::from(content));
        Ok(frames)
    }
}

fn parse_parent(json: &str) -> Result<Option<Header>> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| KernelError::malformed(format!("invalid parent header: {}", e)))?;
    match &value {
        Value::Object(map) if map.is_empty() => Ok(None),
        _ => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| KernelError::malformed(format!("invalid parent header: {}", e))),
    }
}
