//! Message content types
//!
//! Every message kind the kernel knows about has a typed content struct.
//! [`Content`] is the closed union over all of them, generated from a single
//! table that maps each variant to its `msg_type` tag. Kinds missing from the
//! table decode to [`Content::Unrecognized`] instead of failing.

use crate::error::{KernelError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A JSON object
pub type JsonObject = Map<String, Value>;

fn default_true() -> bool {
    true
}

fn ok() -> String {
    "ok".to_string()
}

// ============================================================================
// Kernel info
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoReply {
    #[serde(default = "ok")]
    pub status: String,
    pub protocol_version: String,
    pub implementation: String,
    pub implementation_version: String,
    pub language_info: LanguageInfo,
    pub banner: String,
    #[serde(default)]
    pub help_links: Vec<HelpLink>,
}

/// Language metadata advertised in `kernel_info_reply`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub name: String,
    pub version: String,
    pub mimetype: String,
    pub file_extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pygments_lexer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codemirror_mode: Option<String>,
}

impl LanguageInfo {
    /// Metadata for POSIX shell source
    pub fn shell() -> Self {
        Self {
            name: "shell".to_string(),
            version: String::new(),
            mimetype: "text/x-sh".to_string(),
            file_extension: ".sh".to_string(),
            pygments_lexer: Some("bash".to_string()),
            codemirror_mode: Some("shell".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpLink {
    pub text: String,
    pub url: String,
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_true")]
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: JsonObject,
    #[serde(default)]
    pub allow_stdin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: String,
    pub execution_count: u32,
    #[serde(default)]
    pub payload: Vec<Value>,
    #[serde(default)]
    pub user_expressions: JsonObject,
}

/// Echo of the code being executed, broadcast on iopub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub code: String,
    pub execution_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub name: String,
    pub text: String,
}

impl Stream {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            name: "stdout".to_string(),
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            name: "stderr".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    pub data: JsonObject,
    #[serde(default)]
    pub metadata: JsonObject,
    #[serde(default)]
    pub transient: JsonObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub execution_state: ExecutionState,
}

impl Status {
    pub fn new(execution_state: ExecutionState) -> Self {
        Self { execution_state }
    }
}

// ============================================================================
// Connect / shutdown / history
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectReply {
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub hb_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownReply {
    #[serde(default = "ok")]
    pub status: String,
    pub restart: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub output: bool,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub hist_access_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryReply {
    #[serde(default = "ok")]
    pub status: String,
    pub history: Vec<Value>,
}

// ============================================================================
// Code intelligence (answered with stubs or not at all)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfoRequest {
    #[serde(default)]
    pub oname: String,
    #[serde(default)]
    pub detail_level: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InspectRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub cursor_pos: usize,
    #[serde(default)]
    pub detail_level: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectReply {
    pub status: String,
    pub found: bool,
    #[serde(default)]
    pub data: JsonObject,
    #[serde(default)]
    pub metadata: JsonObject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub cursor_pos: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntellisenseRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub line: String,
    #[serde(default)]
    pub block: String,
    #[serde(default)]
    pub ch: usize,
}

// ============================================================================
// Comms
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommOpen {
    pub comm_id: String,
    #[serde(default)]
    pub target_name: String,
    #[serde(default)]
    pub data: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommMsg {
    pub comm_id: String,
    #[serde(default)]
    pub data: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommClose {
    pub comm_id: String,
    #[serde(default)]
    pub data: JsonObject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommInfoRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommInfoReply {
    #[serde(default = "ok")]
    pub status: String,
    pub comms: BTreeMap<String, CommInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommInfo {
    pub target_name: String,
}

// ============================================================================
// The content union
// ============================================================================

/// Generates [`Content`] and its tag table from `Variant(Type) => "tag"` rows.
/// Extra `| "alias"` tags are accepted when decoding only.
macro_rules! content_table {
    ($($variant:ident($ty:ty) => $tag:literal $(| $alias:literal)*),* $(,)?) => {
        /// Typed content of a kernel message
        #[derive(Debug, Clone, PartialEq)]
        pub enum Content {
            $($variant($ty),)*
            /// A message kind this kernel does not know, kept verbatim
            Unrecognized { msg_type: String, raw: String },
        }

        impl Content {
            /// Decode `json` as the content of a `msg_type` message
            pub fn parse(msg_type: &str, json: &str) -> Result<Self> {
                match msg_type {
                    $($tag $(| $alias)* => serde_json::from_str(json)
                        .map(Content::$variant)
                        .map_err(|e| {
                            KernelError::malformed(format!("invalid {} content: {}", msg_type, e))
                        }),)*
                    other => Ok(Content::Unrecognized {
                        msg_type: other.to_string(),
                        raw: json.to_string(),
                    }),
                }
            }

            /// The wire `msg_type` tag for this content
            pub fn msg_type(&self) -> &str {
                match self {
                    $(Content::$variant(_) => $tag,)*
                    Content::Unrecognized { msg_type, .. } => msg_type.as_str(),
                }
            }

            /// Serialize the content to JSON text
            pub fn to_json(&self) -> Result<String> {
                match self {
                    $(Content::$variant(content) => Ok(serde_json::to_string(content)?),)*
                    Content::Unrecognized { raw, .. } => Ok(raw.clone()),
                }
            }
        }

        $(
            impl From<$ty> for Content {
                fn from(content: $ty) -> Self {
                    Content::$variant(content)
                }
            }
        )*
    };
}

content_table! {
    KernelInfoRequest(KernelInfoRequest) => "kernel_info_request",
    KernelInfoReply(KernelInfoReply) => "kernel_info_reply",
    ExecuteRequest(ExecuteRequest) => "execute_request",
    ExecuteReply(ExecuteReply) => "execute_reply",
    ExecuteInput(ExecuteInput) => "pyin" | "execute_input",
    Stream(Stream) => "stream",
    DisplayData(DisplayData) => "display_data",
    Status(Status) => "status",
    ConnectRequest(ConnectRequest) => "connect_request",
    ConnectReply(ConnectReply) => "connect_reply",
    ShutdownRequest(ShutdownRequest) => "shutdown_request",
    ShutdownReply(ShutdownReply) => "shutdown_reply",
    HistoryRequest(HistoryRequest) => "history_request",
    HistoryReply(HistoryReply) => "history_reply",
    ObjectInfoRequest(ObjectInfoRequest) => "object_info_request",
    InspectRequest(InspectRequest) => "inspect_request",
    InspectReply(InspectReply) => "inspect_reply",
    CompleteRequest(CompleteRequest) => "complete_request",
    IntellisenseRequest(IntellisenseRequest) => "intellisense_request",
    CommOpen(CommOpen) => "comm_open",
    CommMsg(CommMsg) => "comm_msg",
    CommClose(CommClose) => "comm_close",
    CommInfoRequest(CommInfoRequest) => "comm_info_request",
    CommInfoReply(CommInfoReply) => "comm_info_reply",
}
