use std::io;
use thiserror::Error;

use crate::protocol::ChannelId;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("failed to open {port}: {reason}")]
    Connection { port: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("channel {0} is not connected")]
    NotConnected(ChannelId),
    #[error("channel {0} is already connected")]
    AlreadyConnected(ChannelId),
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("another transition is in progress")]
    TransitionBusy,
    #[error("channels not ready for parallel command: {0:?}")]
    ChannelsNotReady(Vec<ChannelId>),
    #[error("command failed on channels {}", format_failures(.0))]
    PartialSend(Vec<(ChannelId, String)>),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn format_failures(failures: &[(ChannelId, String)]) -> String {
    failures
        .iter()
        .map(|(ch, reason)| format!("{ch} ({reason})"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, LinkError>;
