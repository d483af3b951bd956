//! This module defines types used to configure the engine.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default leechtorrent client id.
pub const LEECHTORRENT_CLIENT_ID: &PeerId = b"-LT0001-000000000000";

/// The configuration for a single download.
#[derive(Clone, Debug)]
pub struct Config {
    /// The ID of the client to announce to the tracker and other peers.
    pub client_id: PeerId,

    /// The directory in which the output file is placed.
    pub download_dir: PathBuf,

    /// How long to wait for a TCP connection to a peer before giving up.
    pub connect_timeout: Duration,

    /// How long to wait for any activity (including keep-alives) on an
    /// established peer connection before disconnecting it as stalled.
    pub peer_idle_timeout: Duration,

    /// The number of times a peer worker retries connecting to its peer
    /// before giving up on that peer for good.
    pub connect_retry_limit: usize,

    /// The number of block requests a peer session keeps outstanding at
    /// once. Kept to a conservative single request in flight; a named
    /// constant rather than a scattered literal so a more ambitious
    /// pipelining depth can be plugged in later.
    pub max_in_flight_per_peer: usize,
}

impl Config {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// Uses the default client id, [`LEECHTORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id: *LEECHTORRENT_CLIENT_ID,
            download_dir: download_dir.into(),
            connect_timeout: Duration::from_secs(10),
            peer_idle_timeout: Duration::from_secs(30),
            connect_retry_limit: 5,
            max_in_flight_per_peer: 1,
        }
    }
}
