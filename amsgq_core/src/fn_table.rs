//! Translation of handler addresses between peers.
//!
//! A handler travels as the sender's view of its code address. If every peer
//! loaded the image at the same base the address is used as is; otherwise
//! each peer keeps the distance from its own base to every other peer's, and
//! the sender rebases the address into the receiver's address space.

use crate::amsgq::Handler;
use crate::errors::Error;
use crate::transport::Group;
use log::{debug, info};

#[derive(Debug)]
pub struct FnOffsetTable {
    // None while all bases agree
    offsets: Option<Vec<u64>>,
    // simulated displacement of this peer's image, zero in production
    slide: u64,
}

/// Address of a function every peer links in; it moves with the image.
fn reference_address() -> u64 {
    let f: fn(&Group, u64) -> Result<FnOffsetTable, Error> = FnOffsetTable::establish;
    f as usize as u64
}

impl FnOffsetTable {
    /// Collective over `group`.
    pub fn establish(group: &Group, slide: u64) -> Result<Self, Error> {
        let local = reference_address().wrapping_add(slide);
        let bases = group.allgather_u64(local);
        if bases.len() != group.size() {
            return Err(Error::Transport(format!(
                "allgather returned {} bases for {} ranks",
                bases.len(),
                group.size()
            )));
        }
        if bases.iter().all(|&b| b == local) {
            debug!("rank {}: all image bases agree, handler addresses pass through", group.rank());
            return Ok(Self { offsets: None, slide });
        }
        info!(
            "rank {}: image bases differ across {} peers, translating handler addresses",
            group.rank(),
            bases.len()
        );
        let offsets = bases.iter().map(|&b| b.wrapping_sub(local)).collect();
        Ok(Self {
            offsets: Some(offsets),
            slide,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.offsets.is_none()
    }

    /// Address of `handler` as `target` sees it.
    pub fn encode(&self, handler: Handler, target: usize) -> u64 {
        let local = (handler as usize as u64).wrapping_add(self.slide);
        match &self.offsets {
            Some(offsets) => local.wrapping_add(offsets.get(target).copied().unwrap_or(0)),
            None => local,
        }
    }

    /// Handler behind an address produced by some peer's [`encode`](Self::encode)
    /// for this peer.
    pub fn decode(&self, fn_handle: u64) -> Result<Handler, Error> {
        let addr = fn_handle.wrapping_sub(self.slide);
        if addr == 0 {
            return Err(Error::Corruption("message names a null handler".into()));
        }
        // SAFETY: senders only ship addresses of `Handler`s, rebased for us.
        Ok(unsafe { std::mem::transmute::<usize, Handler>(addr as usize) })
    }
}
