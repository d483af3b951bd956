//! Orchestrates a single download: resolves peers via the tracker, opens the
//! output file, and runs one [`PeerSession`] per peer concurrently until the
//! torrent is complete.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::{conf::Config, error::Error, metainfo::Metainfo, peer::PeerSession, session::Session, tracker, writer};

/// Downloads the torrent described by `metainfo` to `config.download_dir`,
/// returning once every piece has been verified and written, or once no
/// usable peer remains.
pub async fn run(metainfo: Metainfo, config: Config) -> Result<(), Error> {
    log::info!(
        "starting download of {} (info hash {})",
        metainfo.output_name(),
        hex::encode(metainfo.info_hash)
    );

    let (file, path) = writer::create_output_file(&config.download_dir, metainfo.output_name())?;
    log::info!("writing to {:?}", path);

    let peers = tracker::get_peers(&metainfo, &config.client_id, LISTEN_PORT).await?;
    log::info!("tracker returned {} peers", peers.len());

    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let metainfo = Arc::new(metainfo);
    let session = Arc::new(Mutex::new(Session::new(Arc::clone(&metainfo), write_tx)));

    let writer_task = tokio::spawn(writer::run(file, path, write_rx));

    // every peer session runs as its own task so that one peer stalling or
    // erroring out doesn't block progress on the others
    let mut peer_tasks = Vec::with_capacity(peers.len());
    for addr in peers {
        let info_hash = metainfo.info_hash;
        let config = config.clone();
        let session = Arc::clone(&session);
        peer_tasks.push(tokio::spawn(async move {
            let result = PeerSession::new(addr, info_hash, config, session).run().await;
            if let Err(ref err) = result {
                log::warn!("peer {addr} session ended: {err}");
            }
            result
        }));
    }

    for task in peer_tasks {
        // a peer's own failure never aborts the download; only a panic inside
        // the task (a bug, not a network condition) is propagated
        let _ = task.await.expect("peer session task panicked");
    }

    let piece_count = session.lock().await.piece_count();
    let received_count = session.lock().await.received_count();
    drop(session); // drops the session's WriteJob sender once all peers are done

    writer_task.await.expect("writer task panicked")?;

    if received_count < piece_count {
        return Err(Error::DownloadIncomplete { missing: piece_count - received_count });
    }

    Ok(())
}

/// The port we advertise to the tracker as listening on.
///
/// This client never accepts inbound connections (it only leeches, never
/// seeds), so the value is nominal; it exists purely because the tracker
/// protocol requires one.
const LISTEN_PORT: u16 = 6881;
