//! Control-connection frame tags and their wire encoding, built on top of
//! [`crate::codec`]'s varint and length-prefixed primitives.
use crate::codec::{read_bytes, read_packed_u64, write_bytes, write_packed_u64};
use crate::error::ProtocolError;
use std::io;
use std::io::{Read, Write};

const TAG_ALLOCATE: u64 = 1;
const TAG_CID: u64 = 2;
const TAG_CONNECT: u64 = 3;
const TAG_CLOSE: u64 = 4;
const TAG_DATA: u64 = 5;
const TAG_KEEP_ALIVE: u64 = 6;

/// A single control-connection message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
  /// Client asks the server to mint a fresh CID.
  Allocate,
  /// Server hands a freshly minted CID to the client.
  Cid(u64),
  /// A side asks its peer to dial `port` on its forward target, identified by `cid`.
  Connect { cid: u64, port: u64 },
  /// Either side tears down the stream identified by `cid`.
  Close(u64),
  /// A chunk of tunnelled bytes for `cid`.
  Data(u64, Vec<u8>),
  /// Liveness ping; carries no payload.
  KeepAlive,
}

impl Frame {
  /// Writes this frame's tag and payload to `w`.
  pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
    match self {
      Frame::Allocate => write_packed_u64(w, TAG_ALLOCATE),
      Frame::Cid(cid) => {
        write_packed_u64(w, TAG_CID)?;
        write_packed_u64(w, *cid)
      }
      Frame::Connect { cid, port } => {
        write_packed_u64(w, TAG_CONNECT)?;
        write_packed_u64(w, *cid)?;
        write_packed_u64(w, *port)
      }
      Frame::Close(cid) => {
        write_packed_u64(w, TAG_CLOSE)?;
        write_packed_u64(w, *cid)
      }
      Frame::Data(cid, bytes) => {
        write_packed_u64(w, TAG_DATA)?;
        write_packed_u64(w, *cid)?;
        write_bytes(w, bytes)
      }
      Frame::KeepAlive => write_packed_u64(w, TAG_KEEP_ALIVE),
    }
  }

  /// Reads one tag and its payload from `r`. Returns `ProtocolError::UnknownTag`
  /// (wrapped as `io::Error`) for an unrecognized tag, letting the dispatch
  /// loop surface it through its existing `io::Error` propagation path.
  pub fn decode<R: Read>(r: &mut R) -> io::Result<Frame> {
    let tag = read_packed_u64(r)?;
    match tag {
      TAG_ALLOCATE => Ok(Frame::Allocate),
      TAG_CID => Ok(Frame::Cid(read_packed_u64(r)?)),
      TAG_CONNECT => {
        let cid = read_packed_u64(r)?;
        let port = read_packed_u64(r)?;
        Ok(Frame::Connect { cid, port })
      }
      TAG_CLOSE => Ok(Frame::Close(read_packed_u64(r)?)),
      TAG_DATA => {
        let cid = read_packed_u64(r)?;
        let bytes = read_bytes(r)?;
        Ok(Frame::Data(cid, bytes))
      }
      TAG_KEEP_ALIVE => Ok(Frame::KeepAlive),
      other => Err(ProtocolError::UnknownTag(other).into_io_error()),
    }
  }
}
