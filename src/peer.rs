mod codec;

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::Mutex, time};
use tokio_util::codec::{Framed, FramedParts};

use crate::{conf::Config, error::Error, session::Session, Bitfield, PeerId, Sha1Hash};

use codec::{Handshake, HandshakeCodec, Message, PeerCodec};

/// Drives a single outbound connection to one peer for the lifetime of the
/// download, or until that peer proves unusable.
///
/// A `PeerSession` only ever talks to its own socket and to the shared
/// [`Session`]; peer failures are confined to the one task running this
/// session (see [`crate::error::Error`]'s peer-vs-fatal split).
pub(crate) struct PeerSession {
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    config: Config,
    session: Arc<Mutex<Session>>,
}

/// At any given time, a connection with a peer is in one of these states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Handshaking,
    AwaitingBitfield,
    Ready,
    Active,
    Paused,
}

impl PeerSession {
    pub(crate) fn new(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        config: Config,
        session: Arc<Mutex<Session>>,
    ) -> Self {
        let client_id = config.client_id;
        Self { addr, info_hash, client_id, config, session }
    }

    /// Runs the session to completion: connects (retrying up to
    /// `connect_retry_limit` times), performs the handshake, exchanges the
    /// bitfield, and then requests and receives blocks until either the
    /// torrent is complete or this peer becomes unusable.
    pub(crate) async fn run(self) -> Result<(), Error> {
        log::debug!("peer {} state: {:?}", self.addr, State::Connecting);

        let stream = self.connect_with_retries().await?;
        log::debug!("peer {} state: {:?}", self.addr, State::Handshaking);

        let handshake_socket = Framed::new(stream, HandshakeCodec);
        let peer_codec_socket = self.handshake(handshake_socket).await?;

        log::debug!("peer {} state: {:?}", self.addr, State::AwaitingBitfield);

        let piece_count = self.session.lock().await.piece_count();
        let (mut sink, mut stream) = peer_codec_socket.split();
        let mut have = Bitfield::repeat(false, piece_count);
        let mut is_choked = true;
        let mut in_flight = 0usize;

        let first_msg = self.recv(&mut stream).await?;
        match first_msg {
            Some(Message::Bitfield(mut bitfield)) => {
                bitfield.resize(piece_count, false);
                have = bitfield;
            }
            Some(msg) => {
                // peer has no pieces yet; treat the message as the first one
                // of the normal, post-bitfield exchange
                self.handle_message(msg, &mut have, &mut is_choked, &mut in_flight)
                    .await?;
            }
            None => return Err(Error::PeerEof { addr: self.addr }),
        }

        log::debug!("peer {} state: {:?}", self.addr, State::Ready);

        if !have.any() {
            log::info!("peer {} has no pieces we need yet", self.addr);
        }
        sink.send(Message::Interested)
            .await
            .map_err(|source| Error::PeerConnectFailed { addr: self.addr, source })?;

        let mut state = if is_choked { State::Paused } else { State::Active };
        log::debug!("peer {} state: {:?}", self.addr, state);

        loop {
            if self.session.lock().await.is_complete() {
                return Ok(());
            }

            if !is_choked {
                in_flight += self.fill_request_pipeline(&have, in_flight, &mut sink).await?;
            }

            let msg = match time::timeout(self.config.peer_idle_timeout, stream.next()).await {
                Ok(Some(msg)) => {
                    msg.map_err(|source| Error::PeerConnectFailed { addr: self.addr, source })?
                }
                Ok(None) => return Err(Error::PeerEof { addr: self.addr }),
                Err(_) => return Err(Error::PeerTimeout { addr: self.addr }),
            };

            let was_choked = is_choked;
            self.handle_message(msg, &mut have, &mut is_choked, &mut in_flight)
                .await?;
            let new_state = match (was_choked, is_choked) {
                (true, false) => State::Active,
                (false, true) => State::Paused,
                _ => state,
            };
            if new_state != state {
                state = new_state;
                log::debug!("peer {} state: {:?}", self.addr, state);
            }
        }
    }

    async fn connect_with_retries(&self) -> Result<TcpStream, Error> {
        let mut last_err = None;
        for attempt in 1..=self.config.connect_retry_limit {
            match time::timeout(self.config.connect_timeout, TcpStream::connect(self.addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(source)) => {
                    log::warn!("peer {} connect attempt {attempt} failed: {source}", self.addr);
                    last_err = Some(Error::PeerConnectFailed { addr: self.addr, source });
                }
                Err(_) => {
                    log::warn!("peer {} connect attempt {attempt} timed out", self.addr);
                    last_err = Some(Error::PeerTimeout { addr: self.addr });
                }
            }
        }
        Err(last_err.unwrap_or(Error::PeerTimeout { addr: self.addr }))
    }

    async fn handshake(
        &self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
    ) -> Result<Framed<TcpStream, PeerCodec>, Error> {
        let handshake = Handshake::new(self.info_hash, self.client_id);
        socket
            .send(handshake)
            .await
            .map_err(|source| Error::PeerConnectFailed { addr: self.addr, source })?;

        let peer_handshake = socket
            .next()
            .await
            .ok_or(Error::PeerEof { addr: self.addr })?
            .map_err(|source| Error::PeerConnectFailed { addr: self.addr, source })?;

        if peer_handshake.info_hash != self.info_hash {
            return Err(Error::HandshakeMismatch { addr: self.addr });
        }

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        Ok(Framed::from_parts(new_parts))
    }

    async fn recv(
        &self,
        stream: &mut (impl StreamExt<Item = Result<Message, std::io::Error>> + Unpin),
    ) -> Result<Option<Message>, Error> {
        match time::timeout(self.config.peer_idle_timeout, stream.next()).await {
            Ok(Some(Ok(msg))) => Ok(Some(msg)),
            Ok(Some(Err(source))) => Err(Error::PeerConnectFailed { addr: self.addr, source }),
            Ok(None) => Ok(None),
            Err(_) => Err(Error::PeerTimeout { addr: self.addr }),
        }
    }

    /// Requests as many blocks as `max_in_flight_per_peer` allows, returning
    /// the number of new requests sent.
    async fn fill_request_pipeline(
        &self,
        have: &Bitfield,
        in_flight: usize,
        sink: &mut (impl futures::Sink<Message, Error = std::io::Error> + Unpin),
    ) -> Result<usize, Error> {
        let mut sent = 0;
        loop {
            if in_flight + sent >= self.config.max_in_flight_per_peer {
                break;
            }
            let block = {
                let mut session = self.session.lock().await;
                session.next_request(have)
            };
            let Some(block) = block else { break };
            sink.send(Message::Request(block))
                .await
                .map_err(|source| Error::PeerConnectFailed { addr: self.addr, source })?;
            sent += 1;
        }
        Ok(sent)
    }

    async fn handle_message(
        &self,
        msg: Message,
        have: &mut Bitfield,
        is_choked: &mut bool,
        in_flight: &mut usize,
    ) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                *is_choked = true;
                *in_flight = 0;
            }
            Message::Unchoke => {
                *is_choked = false;
            }
            Message::Interested | Message::NotInterested => {
                // we never seed, so peer's interest in us is a no-op
            }
            Message::Have { piece_index } => {
                if piece_index < have.len() {
                    have.set(piece_index, true);
                }
            }
            Message::Bitfield(_) => {
                return Err(Error::ProtocolViolation {
                    addr: self.addr,
                    reason: "bitfield sent outside of the availability exchange".into(),
                });
            }
            Message::Block { piece_index, begin, data } => {
                if *in_flight > 0 {
                    *in_flight -= 1;
                }
                let mut session = self.session.lock().await;
                session
                    .deliver_block(piece_index, begin, data)
                    .map_err(|_| Error::InvalidDelivery { addr: self.addr, piece_index })?;
            }
            Message::Request(_) | Message::Cancel(_) => {
                // we never seed, so peers requesting blocks from us is a no-op
            }
        }
        Ok(())
    }
}
