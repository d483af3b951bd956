//! The HTTP tracker client: announces our progress and gets back a list of
//! peers to connect to.

use std::{fmt, net::SocketAddr};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::{de, Deserialize, Deserializer};

use crate::{error::Error, metainfo::Metainfo, PeerId, Sha1Hash};

/// A tracker GET announce request.
///
/// `info_hash` and `peer_id` are raw 20-byte strings; reqwest's
/// `application/x-www-form-urlencoded` serializer percent-encodes every byte
/// that isn't alphanumeric, which is exactly what BEP 3 requires for these
/// two fields (unlike a regular percent-encoder, it must not leave any of
/// the 20 bytes un-escaped, since they are arbitrary binary, not text).
#[derive(Debug)]
struct TrackerRequest<'a> {
    info_hash: &'a Sha1Hash,
    peer_id: &'a PeerId,
    port: u16,
    uploaded: u64,
    downloaded: u64,
    left: u64,
    compact: u8,
    event: &'static str,
}

impl<'a> TrackerRequest<'a> {
    fn to_query_string(&self) -> String {
        format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact={}&event={}",
            percent_encode_bytes(self.info_hash),
            percent_encode_bytes(self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
            self.compact,
            self.event,
        )
    }
}

fn percent_encode_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: Option<Peers>,
}

/// A tracker's peer list, in either of the two formats BEP 3 allows: the
/// compact binary encoding (most trackers), or a bencoded list of
/// dictionaries (older trackers).
#[derive(Debug)]
struct Peers(Vec<SocketAddr>);

impl<'de> Deserialize<'de> for Peers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PeersVisitor;

        impl<'de> de::Visitor<'de> for PeersVisitor {
            type Value = Peers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a compact peer string or a list of peer dictionaries")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Peers, E>
            where
                E: de::Error,
            {
                if !v.len().is_multiple_of(6) {
                    return Err(de::Error::custom(format!(
                        "compact peers string length {} is not a multiple of 6",
                        v.len()
                    )));
                }
                Ok(Peers(
                    v.chunks_exact(6)
                        .map(|chunk| {
                            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                            SocketAddr::from((ip, port))
                        })
                        .collect(),
                ))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Peers, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                #[derive(Deserialize)]
                struct DictPeer {
                    ip: String,
                    port: u16,
                }
                let mut addrs = Vec::new();
                while let Some(peer) = seq.next_element::<DictPeer>()? {
                    let ip: std::net::IpAddr = peer
                        .ip
                        .parse()
                        .map_err(|_| de::Error::custom(format!("invalid peer ip {:?}", peer.ip)))?;
                    addrs.push(SocketAddr::from((ip, peer.port)));
                }
                Ok(Peers(addrs))
            }
        }

        deserializer.deserialize_any(PeersVisitor)
    }
}

/// Guesses the local host's own address by opening a UDP socket toward a
/// public address and reading back the address the kernel picked for it; no
/// packet is actually sent since UDP "connect" only fixes the route.
fn local_host_ip() -> Option<std::net::IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Announces to the torrent's tracker and returns the peers it offers.
pub(crate) async fn get_peers(
    metainfo: &Metainfo,
    client_id: &PeerId,
    port: u16,
) -> Result<Vec<SocketAddr>, Error> {
    let request = TrackerRequest {
        info_hash: &metainfo.info_hash,
        peer_id: client_id,
        port,
        uploaded: 0,
        downloaded: 0,
        left: metainfo.total_size,
        compact: 1,
        event: "started",
    };

    let url = format!("{}?{}", metainfo.announce, request.to_query_string());
    log::info!("announcing to tracker {}", metainfo.announce);

    let client = reqwest::Client::new();
    let response_bytes = client.get(&url).send().await?.bytes().await?;

    let response: TrackerResponse =
        serde_bencode::from_bytes(&response_bytes).map_err(Error::InvalidTrackerResponse)?;

    if let Some(reason) = response.failure_reason {
        return Err(Error::TrackerRejected(reason));
    }

    let peers = response.peers.map(|p| p.0).unwrap_or_default();
    let local_ip = local_host_ip();
    Ok(skip_local_host(peers, local_ip))
}

/// Drops any peer address that matches the local host's own address, so we
/// never try to download from ourselves.
fn skip_local_host(peers: Vec<SocketAddr>, local_ip: Option<std::net::IpAddr>) -> Vec<SocketAddr> {
    match local_ip {
        Some(local_ip) => peers.into_iter().filter(|addr| addr.ip() != local_ip).collect(),
        None => peers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encodes_non_alphanumeric_bytes() {
        let bytes = [0x00u8, b'A', b'-', 0xFFu8];
        assert_eq!(percent_encode_bytes(&bytes), "%00A%2D%FF");
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut peer_bytes = Vec::new();
        peer_bytes.extend([127, 0, 0, 1, 0x1A, 0xE1]); // 127.0.0.1:6881
        let mut body = Vec::new();
        body.extend(b"d8:intervali1800e5:peers");
        body.extend(peer_bytes.len().to_string().as_bytes());
        body.push(b':');
        body.extend(&peer_bytes);
        body.extend(b"e");

        let response: TrackerResponse = serde_bencode::from_bytes(&body).unwrap();
        assert!(response.failure_reason.is_none());
        let peers = response.peers.unwrap().0;
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn parses_failure_reason() {
        let body = b"d14:failure reason22:torrent not registerede";
        let response: TrackerResponse = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("torrent not registered"));
    }

    #[test]
    fn skip_local_host_drops_only_matching_address() {
        let peers = vec!["127.0.0.1:6881".parse().unwrap(), "10.0.0.5:6882".parse().unwrap()];
        let local_ip = Some("127.0.0.1".parse().unwrap());
        let filtered = skip_local_host(peers, local_ip);
        assert_eq!(filtered, vec!["10.0.0.5:6882".parse().unwrap()]);
    }

    #[test]
    fn parses_dictionary_style_peer_list() {
        let body = b"d5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let response: TrackerResponse = serde_bencode::from_bytes(body).unwrap();
        let peers = response.peers.unwrap().0;
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }
}
