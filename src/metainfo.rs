//! Parsing of the `.torrent` metainfo file.
//!
//! The metainfo file is a bencoded dictionary. The only tricky part of
//! parsing it is computing the info-hash: it must be the SHA-1 digest of the
//! `info` value's bencoded bytes exactly as they appear on disk. Decoding the
//! dictionary into a struct and re-encoding it is fragile (field order,
//! optional-field omission, and integer width can all cause the re-encoded
//! bytes to differ from the original), so instead we locate the `info`
//! value's byte range in the raw file and hash that slice directly.

use std::path::Path;

use serde::Deserialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{error::Error, piece_count, Sha1Hash};

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: ByteBuf,
    info: RawInfo,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u32,
    pieces: ByteBuf,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    length: u64,
    #[allow(dead_code)]
    path: Vec<ByteBuf>,
}

/// A parsed, immutable metainfo file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub name: String,
    pub piece_length: u32,
    pub total_size: u64,
    pub info_hash: Sha1Hash,
    piece_hashes: Vec<u8>,
}

impl Metainfo {
    /// Reads and parses the metainfo file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let buf = std::fs::read(path).map_err(|source| Error::MetainfoIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&buf)
    }

    /// Parses the metainfo file contents in `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;

        let info_bytes = info_dict_bytes(buf)?;
        let info_hash: Sha1Hash = Sha1::digest(info_bytes).into();

        // Non-goal: file-splitting on disk. Multi-file torrents are treated
        // as one concatenated payload, so we only need the sum of the file
        // lengths, not their individual paths/offsets.
        let total_size = match (raw.info.length, &raw.info.files) {
            (Some(len), _) => len,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            (None, None) => return Err(Error::MissingInfoDict),
        };

        let announce = String::from_utf8_lossy(&raw.announce).into_owned();
        let name = String::from_utf8_lossy(&raw.info.name).into_owned();

        Ok(Self {
            announce,
            name,
            piece_length: raw.info.piece_length,
            total_size,
            info_hash,
            piece_hashes: raw.info.pieces.into_vec(),
        })
    }

    /// Returns the number of pieces in the torrent, `⌈total_size / piece_length⌉`.
    pub fn piece_count(&self) -> usize {
        piece_count(self.total_size, self.piece_length)
    }

    /// Returns the length, in bytes, of the piece at `index`.
    pub fn piece_len(&self, index: usize) -> u32 {
        let piece_count = self.piece_count();
        if index + 1 == piece_count {
            let full_pieces_len = self.piece_length as u64 * (piece_count - 1) as u64;
            (self.total_size - full_pieces_len) as u32
        } else {
            self.piece_length
        }
    }

    /// Returns the expected SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: usize) -> Sha1Hash {
        let start = index * 20;
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[start..start + 20]);
        hash
    }

    /// Returns the output file's suggested name, as declared in the
    /// `info` dictionary.
    pub fn output_name(&self) -> &str {
        &self.name
    }
}

/// Locates the byte range of the `info` dictionary's *value* within the raw,
/// still-bencoded file contents, by walking the outer dictionary's keys
/// without fully decoding the values.
fn info_dict_bytes(buf: &[u8]) -> Result<&[u8], Error> {
    if buf.first() != Some(&b'd') {
        return Err(Error::MissingInfoDict);
    }
    let mut pos = 1;
    while buf.get(pos) != Some(&b'e') {
        let (key, key_end) = parse_bencode_string(buf, pos).ok_or(Error::MissingInfoDict)?;
        let value_start = key_end;
        let value_end = skip_bencode_value(buf, value_start).ok_or(Error::MissingInfoDict)?;
        if key == b"info" {
            return Ok(&buf[value_start..value_end]);
        }
        pos = value_end;
    }
    Err(Error::MissingInfoDict)
}

/// Parses a bencoded byte string (`<len>:<bytes>`) starting at `pos`, and
/// returns the string's content together with the offset one past its end.
fn parse_bencode_string(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let colon = buf[pos..].iter().position(|&b| b == b':')? + pos;
    let len: usize = std::str::from_utf8(&buf[pos..colon]).ok()?.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    Some((&buf[start..end], end))
}

/// Returns the offset one past the end of the bencoded value (string,
/// integer, list, or dictionary) starting at `pos`, without interpreting its
/// contents beyond what's needed to find its extent.
fn skip_bencode_value(buf: &[u8], pos: usize) -> Option<usize> {
    match *buf.get(pos)? {
        b'i' => {
            let e = buf[pos..].iter().position(|&b| b == b'e')? + pos;
            Some(e + 1)
        }
        b'l' => {
            let mut cursor = pos + 1;
            while buf.get(cursor) != Some(&b'e') {
                cursor = skip_bencode_value(buf, cursor)?;
            }
            Some(cursor + 1)
        }
        b'd' => {
            let mut cursor = pos + 1;
            while buf.get(cursor) != Some(&b'e') {
                let (_, key_end) = parse_bencode_string(buf, cursor)?;
                cursor = skip_bencode_value(buf, key_end)?;
            }
            Some(cursor + 1)
        }
        _ => parse_bencode_string(buf, pos).map(|(_, end)| end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file_torrent(piece_length: u32, pieces: &[u8], length: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(b"d8:announce15:http://tracker/4:infod6:lengthi");
        out.extend(length.to_string().as_bytes());
        out.extend(b"e4:name4:test12:piece lengthi");
        out.extend(piece_length.to_string().as_bytes());
        out.extend(b"e6:pieces");
        out.extend(pieces.len().to_string().as_bytes());
        out.push(b':');
        out.extend(pieces);
        out.extend(b"ee");
        out
    }

    #[test]
    fn parses_single_file_torrent() {
        let pieces = [0u8; 20];
        let buf = bencode_single_file_torrent(16384, &pieces, 16384);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.announce, "http://tracker/");
        assert_eq!(metainfo.output_name(), "test");
        assert_eq!(metainfo.piece_length, 16384);
        assert_eq!(metainfo.total_size, 16384);
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.piece_len(0), 16384);
        assert_eq!(metainfo.piece_hash(0), pieces);
    }

    #[test]
    fn info_hash_is_byte_exact_regardless_of_surrounding_keys() {
        // Two files whose `info` dictionaries are byte-identical but which
        // differ outside of `info` (a different announce URL) must produce
        // the same info-hash, and the hash must be the SHA-1 of exactly the
        // bytes between `4:infod` and its matching `e`.
        let pieces = [7u8; 20];
        let a = bencode_single_file_torrent(1024, &pieces, 1024);
        let mut b = Vec::new();
        b.extend(b"d8:announce21:http://other-tracker/4:infod6:lengthi1024e4:name4:test12:piece lengthi1024e6:pieces20:");
        b.extend(&pieces);
        b.extend(b"ee");

        let info_a = Metainfo::from_bytes(&a).unwrap();
        let info_b = Metainfo::from_bytes(&b).unwrap();
        assert_eq!(info_a.info_hash, info_b.info_hash);

        let expected: Sha1Hash = {
            let raw_info: Vec<u8> = b"d6:lengthi1024e4:name4:test12:piece lengthi1024e6:pieces20:"
                .iter()
                .copied()
                .chain(pieces.iter().copied())
                .chain(b"e".iter().copied())
                .collect();
            Sha1::digest(&raw_info).into()
        };
        assert_eq!(info_a.info_hash, expected);
    }

    #[test]
    fn multi_file_torrent_total_size_is_sum_of_file_lengths() {
        let mut buf = Vec::new();
        buf.extend(b"d8:announce4:http4:infod5:filesld6:lengthi10e4:pathl1:aee");
        buf.extend(b"d6:lengthi20e4:pathl1:bee");
        buf.extend(b"e4:name5:multi12:piece lengthi30e6:pieces20:");
        buf.extend(&[1u8; 20]);
        buf.extend(b"ee");
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.total_size, 30);
        assert_eq!(metainfo.piece_count(), 1);
    }

    #[test]
    fn last_piece_length_is_the_remainder() {
        let pieces = vec![0u8; 40];
        let buf = bencode_single_file_torrent(100, &pieces, 150);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_len(0), 100);
        assert_eq!(metainfo.piece_len(1), 50);
    }
}
