//! The crate-wide error type.
//!
//! Errors are split along the fault line drawn in the design: tracker and
//! disk failures are fatal to the whole download, while peer-level failures
//! only ever take down the one peer session that triggered them (see the
//! `PeerSession` event loop in [`crate::peer`]).

use std::{io, net::SocketAddr, path::PathBuf};

use crate::PieceIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read metainfo file {path:?}: {source}")]
    MetainfoIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse metainfo: {0}")]
    InvalidMetainfo(#[from] serde_bencode::Error),
    #[error("metainfo is missing a well-formed `info` dictionary")]
    MissingInfoDict,
    #[error("tracker rejected the request: {0}")]
    TrackerRejected(String),
    #[error("tracker request failed: {0}")]
    TrackerUnreachable(#[from] reqwest::Error),
    #[error("tracker returned a malformed response: {0}")]
    InvalidTrackerResponse(serde_bencode::Error),

    #[error("failed to connect to peer {addr}: {source}")]
    PeerConnectFailed { addr: SocketAddr, source: io::Error },
    #[error("peer {addr} timed out")]
    PeerTimeout { addr: SocketAddr },
    #[error("peer {addr} closed the connection")]
    PeerEof { addr: SocketAddr },
    #[error("peer {addr} sent a handshake with a mismatched info hash")]
    HandshakeMismatch { addr: SocketAddr },
    #[error("peer {addr} violated the wire protocol: {reason}")]
    ProtocolViolation { addr: SocketAddr, reason: String },
    #[error("peer {addr} delivered an unrequested or malformed block for piece {piece_index}")]
    InvalidDelivery { addr: SocketAddr, piece_index: PieceIndex },

    #[error("download ended with {missing} piece(s) still missing: no usable peer remained")]
    DownloadIncomplete { missing: usize },

    #[error("failed to create output file {path:?}: {source}")]
    OutputCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write to output file {path:?} at offset {offset}: {source}")]
    WriteFailed {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
}
