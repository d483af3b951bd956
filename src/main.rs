use std::{path::PathBuf, process::ExitCode};

use leechtorrent::{conf::Config, engine, metainfo::Metainfo};
use rand::Rng;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let torrent_path = match args.next() {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("usage: leechtorrent <torrent-file> [output-dir]");
            return ExitCode::FAILURE;
        }
    };
    let download_dir = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    let metainfo = match Metainfo::from_path(&torrent_path) {
        Ok(metainfo) => metainfo,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = Config::new(download_dir);
    config.client_id = random_peer_id();

    match engine::run(metainfo, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Generates a fresh peer id with our client's prefix, so that multiple
/// concurrent runs (or runs against the same tracker) don't collide.
fn random_peer_id() -> leechtorrent::PeerId {
    let mut id = *leechtorrent::conf::LEECHTORRENT_CLIENT_ID;
    rand::thread_rng().fill(&mut id[8..]);
    id
}
