//! Error types for the plugin bridge.

use std::path::PathBuf;
use thiserror::Error;

use crate::codec::CodecError;

#[derive(Error, Debug)]
pub enum BridgeError {
    /// The Wine host process never attached to our endpoint, or it died
    /// before all five channels were connected.
    #[error("Failed to start the plugin host: {reason}")]
    StartupFailed { reason: String },

    /// A response arrived in a state the request kind forbids, e.g. a
    /// get-parameter reply without a value.
    #[error("Protocol mismatch on the {channel} channel: {reason}")]
    ProtocolMismatch {
        channel: &'static str,
        reason: String,
    },

    /// The peer shut down a channel. Expected during `effClose`, fatal for
    /// the affected helper thread otherwise.
    #[error("The {channel} channel was closed by the peer")]
    ChannelClosed { channel: &'static str },

    #[error("Could not load the plugin library at {path}: {reason}")]
    PluginLoadFailed { path: PathBuf, reason: String },

    #[error("Wire codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Group host rendezvous error: {0}")]
    Group(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether this error means the peer hung up, as opposed to a corrupted
    /// or out-of-contract exchange.
    pub fn is_disconnect(&self) -> bool {
        match self {
            BridgeError::ChannelClosed { .. } => true,
            BridgeError::Codec(CodecError::Truncated) => true,
            BridgeError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formatting() {
        let err = BridgeError::StartupFailed {
            reason: "host exited".to_string(),
        };
        assert!(err.to_string().contains("host exited"));

        let err = BridgeError::ChannelClosed {
            channel: "parameters",
        };
        assert!(err.to_string().contains("parameters"));
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(BridgeError::ChannelClosed { channel: "audio" }.is_disconnect());
        assert!(BridgeError::Codec(CodecError::Truncated).is_disconnect());
        assert!(!BridgeError::ProtocolMismatch {
            channel: "parameters",
            reason: "set acknowledged with a value".to_string(),
        }
        .is_disconnect());
    }
}
