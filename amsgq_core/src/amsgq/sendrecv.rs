//! SENDRECV: two-sided messages moved by a background progress thread.
//!
//! `try_send` only enqueues. The progress thread (and any caller of
//! `process`) drains the outbox into channel sends, completes sends in
//! per-destination FIFO order and runs handlers for whatever has arrived.

use super::message::{decode_record, encode_record};
use super::InboxBackend;
use crate::config::Backend;
use crate::constants::{MSG_HEADER_SIZE, PROGRESS_IDLE};
use crate::errors::Error;
use crate::helpers::Backoff;
use crate::transport::{Channel, SendRequest};
use crate::Runtime;
use crossbeam_queue::SegQueue;
use log::{debug, error, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};

const CHANNEL_TAG: u32 = 0x414d;

struct Outgoing {
    dst: usize,
    bytes: Vec<u8>,
}

struct Progress {
    // sends in flight, per destination, oldest first
    in_flight: Vec<VecDeque<SendRequest>>,
}

struct Shared {
    rt: Arc<Runtime>,
    channel: Channel,
    msg_size_max: usize,
    outbox: SegQueue<Outgoing>,
    send_mutex: Mutex<()>,
    process_mutex: Mutex<Progress>,
    shutdown: AtomicBool,
    flushing: AtomicBool,
    failure: Mutex<Option<Error>>,
}

struct Round {
    handled: usize,
    outstanding: bool,
}

impl Shared {
    fn lock_progress(&self, blocking: bool) -> Result<MutexGuard<'_, Progress>, Error> {
        if blocking {
            return self
                .process_mutex
                .lock()
                .map_err(|_| Error::Other("progress lock poisoned".into()));
        }
        match self.process_mutex.try_lock() {
            Ok(g) => Ok(g),
            Err(TryLockError::WouldBlock) => Err(Error::Again),
            Err(TryLockError::Poisoned(_)) => Err(Error::Other("progress lock poisoned".into())),
        }
    }

    /// One pass of sending and receiving.
    fn progress_once(&self, blocking: bool) -> Result<Round, Error> {
        let mut state = self.lock_progress(blocking)?;

        while let Some(out) = self.outbox.pop() {
            let req = self.channel.isend(out.dst, out.bytes)?;
            state.in_flight[out.dst].push_back(req);
        }
        for queue in state.in_flight.iter_mut() {
            while let Some(front) = queue.front_mut() {
                if !self.channel.test_send(front)? {
                    break;
                }
                queue.pop_front();
            }
        }

        let mut handled = 0;
        let budget = self.rt.group().size().max(1) * 64;
        for src in 0..self.rt.group().size() {
            for _ in 0..budget {
                let got = self.channel.try_recv(src, |bytes| {
                    let record = decode_record(bytes, self.msg_size_max)?;
                    self.rt
                        .dispatch(record.header.fn_handle, record.header.sender, record.payload)
                })?;
                if !got {
                    break;
                }
                handled += 1;
            }
        }

        let outstanding = !self.outbox.is_empty() || state.in_flight.iter().any(|q| !q.is_empty());
        Ok(Round { handled, outstanding })
    }

    fn take_failure(&self) -> Result<(), Error> {
        match self.failure.lock() {
            Ok(mut f) => f.take().map_or(Ok(()), Err),
            Err(_) => Err(Error::Other("failure slot poisoned".into())),
        }
    }
}

fn progress_loop(shared: Arc<Shared>) {
    let me = shared.rt.rank();
    while !shared.shutdown.load(Ordering::Acquire) {
        match shared.progress_once(false) {
            Ok(round) => {
                if round.handled == 0 && !round.outstanding && !shared.flushing.load(Ordering::Acquire) {
                    thread::sleep(PROGRESS_IDLE);
                }
            }
            Err(Error::Again) => thread::yield_now(),
            Err(e) => {
                error!("rank {me}: progress thread stopped: {e}");
                if let Ok(mut slot) = shared.failure.lock() {
                    *slot = Some(e);
                }
                return;
            }
        }
    }
    debug!("rank {me}: progress thread exiting");
}

pub(crate) struct SendRecvQueue {
    shared: Arc<Shared>,
    progress: Option<JoinHandle<()>>,
}

impl SendRecvQueue {
    pub fn open(rt: Arc<Runtime>, msg_size_max: usize, msg_count: usize) -> Result<Self, Error> {
        let size = rt.group().size();
        let channel = Channel::open(rt.group(), CHANNEL_TAG, msg_count, MSG_HEADER_SIZE + msg_size_max)?;
        let shared = Arc::new(Shared {
            rt,
            channel,
            msg_size_max,
            outbox: SegQueue::new(),
            send_mutex: Mutex::new(()),
            process_mutex: Mutex::new(Progress {
                in_flight: (0..size).map(|_| VecDeque::new()).collect(),
            }),
            shutdown: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            failure: Mutex::new(None),
        });
        let worker = shared.clone();
        let progress = thread::Builder::new()
            .name(format!("amsgq-progress-{}", shared.rt.rank()))
            .spawn(move || progress_loop(worker))
            .map_err(|e| Error::Other(format!("cannot start progress thread: {e}")))?;
        Ok(Self {
            shared,
            progress: Some(progress),
        })
    }

    fn stop_progress(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.progress.take() {
            if handle.join().is_err() {
                error!("rank {}: progress thread panicked", self.shared.rt.rank());
            }
        }
    }

    fn blocking_round(&self) -> Result<Round, Error> {
        self.shared.take_failure()?;
        self.shared.progress_once(true)
    }
}

impl InboxBackend for SendRecvQueue {
    fn kind(&self) -> Backend {
        Backend::SendRecv
    }

    fn try_send(&self, target: usize, fn_handle: u64, payload: &[u8]) -> Result<(), Error> {
        let _guard = self
            .shared
            .send_mutex
            .lock()
            .map_err(|_| Error::Other("send lock poisoned".into()))?;
        let bytes = encode_record(fn_handle, self.shared.rt.rank() as u32, payload);
        self.shared.outbox.push(Outgoing { dst: target, bytes });
        Ok(())
    }

    fn flush(&self) -> Result<(), Error> {
        let mut backoff = Backoff::new();
        while self.blocking_round()?.outstanding {
            backoff.snooze();
        }
        Ok(())
    }

    fn process(&self, blocking: bool) -> Result<usize, Error> {
        self.shared.take_failure()?;
        Ok(self.shared.progress_once(blocking)?.handled)
    }

    fn process_blocking(&self) -> Result<usize, Error> {
        let shared = &self.shared;
        shared.flushing.store(true, Ordering::Release);
        let result = (|| -> Result<usize, Error> {
            let mut handled = 0;
            // our sends sit in their receivers' slots before we enter
            let mut backoff = Backoff::new();
            loop {
                let round = self.blocking_round()?;
                handled += round.handled;
                if !round.outstanding {
                    break;
                }
                backoff.snooze();
            }
            let req = shared.rt.group().ibarrier();
            while !req.test() {
                match self.process(false) {
                    Ok(n) => handled += n,
                    Err(Error::Again) => {}
                    Err(e) => return Err(e),
                }
                backoff.snooze();
            }
            loop {
                let n = self.blocking_round()?.handled;
                if n == 0 {
                    break;
                }
                handled += n;
            }
            shared.rt.group().barrier();
            Ok(handled)
        })();
        shared.flushing.store(false, Ordering::Release);
        result
    }

    fn close(mut self: Box<Self>) -> Result<(), Error> {
        let group = self.shared.rt.group().clone();
        group.barrier();
        self.stop_progress();
        let me = group.rank();
        let pending = self.shared.channel.pending_receives();
        if pending > 0 {
            warn!("rank {me}: closing SENDRECV queue with {pending} unprocessed message(s)");
        }
        let unsent = self.shared.outbox.len();
        if unsent > 0 {
            warn!("rank {me}: closing SENDRECV queue with {unsent} message(s) never sent");
        }
        let failure = self.shared.take_failure();
        drop(self);
        group.barrier();
        failure
    }
}

impl Drop for SendRecvQueue {
    fn drop(&mut self) {
        self.stop_progress();
    }
}
