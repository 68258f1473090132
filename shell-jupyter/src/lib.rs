//! shell-jupyter library
//!
//! A Jupyter kernel that runs notebook cells through an external interpreter.
//! The pieces are usable on their own: [`Codec`] speaks the wire format,
//! [`Transport`] owns the sockets and [`Kernel`] serves requests.

pub mod comm;
pub mod content;
pub mod dispatch;
pub mod display;
pub mod error;
pub mod evaluator;
pub mod install;
pub mod kernel;
pub mod message;
pub mod session;
pub mod signer;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use comm::{CommCallbacks, CommSender};
pub use content::{Content, DisplayData, LanguageInfo};
pub use error::{KernelError, Result};
pub use evaluator::{Captured, Evaluator, EvaluatorFactory, ProcessEvaluator, ProcessFactory};
pub use kernel::{Kernel, KernelBuilder};
pub use message::{Codec, ConnectionInfo, Header, KernelMessage};
pub use signer::Signer;
pub use transport::{Channel, Transport};
