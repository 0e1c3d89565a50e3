//! Message records as they sit in an inbox.
//!
//! A record is a 16-byte header (`fn_handle: u64`, `sender: u32`,
//! `payload_size: u32`, little-endian) followed by the payload. In the
//! one-sided inboxes every record occupies a fixed slot of
//! `MSG_HEADER_SIZE + align_up(msg_size_max, MSG_ALIGN)` bytes.

use crate::constants::{MSG_ALIGN, MSG_HEADER_SIZE, MSG_POS_FN, MSG_POS_SENDER, MSG_POS_SIZE};
use crate::errors::Error;
use crate::helpers::align_up;

/// Callback run on the receiving peer for every delivered message.
pub type Handler = fn(&Delivery<'_>);

/// What a handler is given: the payload plus where it came from and where
/// it is being run.
#[derive(Debug)]
pub struct Delivery<'a> {
    pub(crate) rank: usize,
    pub(crate) sender: usize,
    pub(crate) payload: &'a [u8],
}

impl<'a> Delivery<'a> {
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Rank of the peer processing the message.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Rank of the peer that sent it.
    pub fn sender(&self) -> usize {
        self.sender
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub fn_handle: u64,
    pub sender: u32,
    pub payload_size: u32,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

impl MsgHeader {
    pub fn encode(&self) -> [u8; MSG_HEADER_SIZE] {
        let mut out = [0u8; MSG_HEADER_SIZE];
        out[MSG_POS_FN..MSG_POS_FN + 8].copy_from_slice(&self.fn_handle.to_le_bytes());
        out[MSG_POS_SENDER..MSG_POS_SENDER + 4].copy_from_slice(&self.sender.to_le_bytes());
        out[MSG_POS_SIZE..MSG_POS_SIZE + 4].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < MSG_HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "{} bytes cannot hold a message header",
                bytes.len()
            )));
        }
        let mut f = [0u8; 8];
        f.copy_from_slice(&bytes[MSG_POS_FN..MSG_POS_FN + 8]);
        Ok(Self {
            fn_handle: u64::from_le_bytes(f),
            sender: read_u32(bytes, MSG_POS_SENDER),
            payload_size: read_u32(bytes, MSG_POS_SIZE),
        })
    }
}

/// Bytes one record reserves in a one-sided inbox.
#[inline]
pub const fn slot_size(msg_size_max: usize) -> usize {
    MSG_HEADER_SIZE + align_up(msg_size_max, MSG_ALIGN)
}

#[derive(Debug)]
pub struct Record<'a> {
    pub header: MsgHeader,
    pub payload: &'a [u8],
}

/// Header and payload as one contiguous buffer, for the two-sided channel.
pub fn encode_record(fn_handle: u64, sender: u32, payload: &[u8]) -> Vec<u8> {
    let header = MsgHeader {
        fn_handle,
        sender,
        payload_size: payload.len() as u32,
    };
    let mut buf = Vec::with_capacity(MSG_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

fn check(header: &MsgHeader, at: usize, msg_size_max: usize) -> Result<(), Error> {
    if header.fn_handle == 0 {
        return Err(Error::Corruption(format!("record at {at} has no handler")));
    }
    if header.payload_size as usize > msg_size_max {
        return Err(Error::Corruption(format!(
            "record at {at} claims {} bytes, limit is {msg_size_max}",
            header.payload_size
        )));
    }
    Ok(())
}

/// Decode one contiguous record produced by [`encode_record`].
pub fn decode_record(buf: &[u8], msg_size_max: usize) -> Result<Record<'_>, Error> {
    let header = MsgHeader::decode(buf)?;
    check(&header, 0, msg_size_max)?;
    let end = MSG_HEADER_SIZE + header.payload_size as usize;
    if end > buf.len() {
        return Err(Error::Corruption(format!(
            "record of {end} bytes truncated to {}",
            buf.len()
        )));
    }
    Ok(Record {
        header,
        payload: &buf[MSG_HEADER_SIZE..end],
    })
}

/// Walks the slots of a drained half. Stops after the first error.
pub struct RecordCursor<'a> {
    buf: &'a [u8],
    cursor: usize,
    slot: usize,
    msg_size_max: usize,
}

impl<'a> RecordCursor<'a> {
    pub fn new(buf: &'a [u8], msg_size_max: usize) -> Self {
        Self {
            buf,
            cursor: 0,
            slot: slot_size(msg_size_max),
            msg_size_max,
        }
    }
}

impl<'a> Iterator for RecordCursor<'a> {
    type Item = Result<Record<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.buf.len() {
            return None;
        }
        let at = self.cursor;
        let end = at + self.slot;
        // poison the cursor so an error is reported only once
        self.cursor = self.buf.len();
        if end > self.buf.len() {
            return Some(Err(Error::Corruption(format!(
                "record at {at} runs past tail {}",
                self.buf.len()
            ))));
        }
        let header = match MsgHeader::decode(&self.buf[at..end]) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };
        if let Err(e) = check(&header, at, self.msg_size_max) {
            return Some(Err(e));
        }
        let start = at + MSG_HEADER_SIZE;
        self.cursor = end;
        Some(Ok(Record {
            header,
            payload: &self.buf[start..start + header.payload_size as usize],
        }))
    }
}
