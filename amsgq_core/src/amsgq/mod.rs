//! Queue front-end and the back-end dispatch table.

pub mod message;

mod inbox;
mod lockfree;
mod sendrecv;
mod sopnop;

pub use message::{Delivery, Handler, MsgHeader};

use crate::config::Backend;
use crate::errors::Error;
use crate::helpers::Backoff;
use crate::telemetry;
use crate::transport::Group;
use crate::Runtime;
use log::{debug, warn};
use metrics::{counter, gauge};
use std::sync::Arc;

/// Operations every inbox protocol provides. A queue holds one of these
/// behind a pointer chosen when it is opened.
pub(crate) trait InboxBackend: Send + Sync {
    fn kind(&self) -> Backend;

    /// Non-blocking attempt; `Error::Again` if the target cannot take it now.
    fn try_send(&self, target: usize, fn_handle: u64, payload: &[u8]) -> Result<(), Error>;

    /// Retry `try_send`, servicing the own inbox in between.
    fn bsend(&self, target: usize, fn_handle: u64, payload: &[u8]) -> Result<(), Error> {
        let mut backoff = Backoff::new();
        loop {
            match self.try_send(target, fn_handle, payload) {
                Err(Error::Again) => {}
                other => return other,
            }
            match self.process(false) {
                Ok(_) | Err(Error::Again) => {}
                Err(e) => return Err(e),
            }
            backoff.snooze();
        }
    }

    /// Complete all outstanding local sends.
    fn flush(&self) -> Result<(), Error>;

    /// Run handlers of pending messages. With `blocking == false` a
    /// concurrent reaper makes this return `Error::Again`.
    fn process(&self, blocking: bool) -> Result<usize, Error>;

    /// Collective: returns once every message sent before anyone entered
    /// has been handled.
    fn process_blocking(&self) -> Result<usize, Error>;

    /// Collective teardown.
    fn close(self: Box<Self>) -> Result<(), Error>;
}

fn open_backend(
    rt: Arc<Runtime>,
    backend: Backend,
    msg_size_max: usize,
    msg_count: usize,
) -> Result<Box<dyn InboxBackend>, Error> {
    Ok(match backend {
        Backend::LockFree => Box::new(lockfree::LockFreeQueue::open(rt, msg_size_max, msg_count)?),
        Backend::SopNop => Box::new(sopnop::SopnopQueue::open(rt, msg_size_max, msg_count)?),
        Backend::SendRecv => Box::new(sendrecv::SendRecvQueue::open(rt, msg_size_max, msg_count)?),
    })
}

/// A collectively opened message queue.
pub struct AmsgQueue {
    runtime: Arc<Runtime>,
    backend: Option<Box<dyn InboxBackend>>,
    msg_size_max: usize,
    msg_count: usize,
}

impl AmsgQueue {
    pub(crate) fn open(
        runtime: Arc<Runtime>,
        backend: Backend,
        msg_size_max: usize,
        msg_count: usize,
    ) -> Result<Self, Error> {
        if msg_size_max == 0 || msg_count == 0 {
            return Err(Error::Invalid(format!(
                "queue needs a positive message size and count, got {msg_size_max} x {msg_count}"
            )));
        }
        if msg_size_max > u32::MAX as usize {
            return Err(Error::Invalid(format!("message size {msg_size_max} too large")));
        }
        let inner = open_backend(runtime.clone(), backend, msg_size_max, msg_count)?;
        gauge!(telemetry::OPEN_QUEUES).increment(1.0);
        debug!(
            "rank {}: {backend} queue open, {msg_count} messages of up to {msg_size_max} bytes",
            runtime.rank()
        );
        Ok(Self {
            runtime,
            backend: Some(inner),
            msg_size_max,
            msg_count,
        })
    }

    fn backend(&self) -> Result<&dyn InboxBackend, Error> {
        if !self.runtime.is_live() {
            return Err(Error::NotInitialised);
        }
        self.backend.as_deref().ok_or(Error::NotInitialised)
    }

    pub fn backend_kind(&self) -> Option<Backend> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn msg_size_max(&self) -> usize {
        self.msg_size_max
    }

    pub fn msg_count(&self) -> usize {
        self.msg_count
    }

    pub fn group(&self) -> &Group {
        self.runtime.group()
    }

    fn check(&self, target: usize, payload: &[u8]) -> Result<(), Error> {
        let size = self.runtime.group().size();
        if target >= size {
            return Err(Error::Invalid(format!("target {target} outside group of {size}")));
        }
        if payload.len() > self.msg_size_max {
            return Err(Error::Invalid(format!(
                "payload of {} bytes exceeds the queue's {}",
                payload.len(),
                self.msg_size_max
            )));
        }
        Ok(())
    }

    /// Enqueue one message into `target`'s inbox without waiting.
    /// `Error::Again` means the inbox is full or being drained right now.
    pub fn try_send(&self, target: usize, handler: Handler, payload: &[u8]) -> Result<(), Error> {
        let backend = self.backend()?;
        self.check(target, payload)?;
        let fn_handle = self.runtime.encode(handler, target)?;
        let res = backend.try_send(target, fn_handle, payload);
        match &res {
            Ok(()) => counter!(telemetry::MESSAGES_SENT).increment(1),
            Err(Error::Again) => counter!(telemetry::SEND_AGAIN).increment(1),
            Err(_) => {}
        }
        res
    }

    /// Like [`try_send`](Self::try_send), but keeps retrying (and processing
    /// the own inbox) until the message is accepted.
    pub fn bsend(&self, target: usize, handler: Handler, payload: &[u8]) -> Result<(), Error> {
        let backend = self.backend()?;
        self.check(target, payload)?;
        let fn_handle = self.runtime.encode(handler, target)?;
        backend.bsend(target, fn_handle, payload)?;
        counter!(telemetry::MESSAGES_SENT).increment(1);
        Ok(())
    }

    /// Deliver to every other peer of the group; the caller is skipped.
    pub fn bcast(&self, handler: Handler, payload: &[u8]) -> Result<(), Error> {
        let me = self.runtime.rank();
        for target in (0..self.runtime.group().size()).filter(|&t| t != me) {
            self.bsend(target, handler, payload)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), Error> {
        self.backend()?.flush()
    }

    /// Handle what is pending in the own inbox. Returns the number of
    /// handlers run; `Error::Again` if another thread is processing.
    pub fn process(&self) -> Result<usize, Error> {
        let n = self.backend()?.process(false)?;
        if n > 0 {
            counter!(telemetry::MESSAGES_PROCESSED).increment(n as u64);
        }
        Ok(n)
    }

    /// Collective: all messages sent by anyone before entering are handled
    /// when this returns.
    pub fn process_blocking(&self) -> Result<usize, Error> {
        let n = self.backend()?.process_blocking()?;
        if n > 0 {
            counter!(telemetry::MESSAGES_PROCESSED).increment(n as u64);
        }
        Ok(n)
    }

    /// Collective: barrier, then one round of processing.
    pub fn sync(&self) -> Result<usize, Error> {
        let backend = self.backend()?;
        self.runtime.group().barrier();
        let n = match backend.process(true) {
            Ok(n) => n,
            Err(Error::Again) => 0,
            Err(e) => return Err(e),
        };
        if n > 0 {
            counter!(telemetry::MESSAGES_PROCESSED).increment(n as u64);
        }
        Ok(n)
    }

    /// Collective teardown. Messages still in the inbox are discarded.
    pub fn close(mut self) -> Result<(), Error> {
        match self.backend.take() {
            Some(b) => b.close(),
            None => Ok(()),
        }
    }
}

impl Drop for AmsgQueue {
    fn drop(&mut self) {
        gauge!(telemetry::OPEN_QUEUES).decrement(1.0);
        if let Some(b) = self.backend.take() {
            warn!(
                "rank {}: {} queue dropped without close, releasing locally",
                self.runtime.rank(),
                b.kind()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Amsgq, AmsgqConfig};

    fn noop(_: &Delivery<'_>) {}

    fn solo(backend: Backend) -> (Amsgq, AmsgQueue) {
        let name = format!("unit_q_{}_{}", std::process::id(), rand::random::<u64>());
        let g = Group::join(&name, 0, 1).unwrap();
        let rt = Amsgq::init_with_config(&g, AmsgqConfig::default().with_backend(backend)).unwrap();
        let q = rt.open(8, 4, &g).unwrap();
        (rt, q)
    }

    #[test]
    fn arguments_are_validated_for_every_backend() {
        for b in Backend::ALL {
            let (_rt, q) = solo(b);
            assert_eq!(q.backend_kind(), Some(b));
            assert!(matches!(q.try_send(1, noop, b""), Err(Error::Invalid(_))));
            assert!(matches!(q.try_send(0, noop, &[0; 9]), Err(Error::Invalid(_))));
            q.close().unwrap();
        }
    }

    #[test]
    fn finalized_runtime_rejects_queue_use() {
        let (rt, q) = solo(Backend::SopNop);
        rt.finalize();
        assert!(matches!(q.try_send(0, noop, b"x"), Err(Error::NotInitialised)));
        assert!(matches!(q.process(), Err(Error::NotInitialised)));
        let g = rt.group().clone();
        assert!(matches!(rt.open(8, 4, &g), Err(Error::NotInitialised)));
        drop(q);
    }

    #[test]
    fn zero_sized_queues_are_invalid() {
        let name = format!("unit_q0_{}_{}", std::process::id(), rand::random::<u64>());
        let g = Group::join(&name, 0, 1).unwrap();
        let rt = Amsgq::init_with_config(&g, AmsgqConfig::default()).unwrap();
        assert!(matches!(rt.open(0, 4, &g), Err(Error::Invalid(_))));
        assert!(matches!(rt.open(8, 0, &g), Err(Error::Invalid(_))));
    }
}
