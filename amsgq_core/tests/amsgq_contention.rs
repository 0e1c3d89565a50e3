//! Delivery guarantees under load and at the capacity boundary.

mod common;

use amsgq_core::{telemetry, Backend, Delivery, Error};
use common::{run_peers, runtime};
use std::sync::atomic::{AtomicU64, Ordering};

const PEERS: usize = 4;
const MSG_SIZE: usize = 48;

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU64 = AtomicU64::new(0);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ len as u8).collect()
}

static ADDRESSED: [AtomicU64; PEERS] = [ZERO; PEERS];
static REAPED: [AtomicU64; PEERS] = [ZERO; PEERS];
static MANGLED: AtomicU64 = AtomicU64::new(0);

fn record(d: &Delivery<'_>) {
    if d.payload() != pattern(d.payload().len()).as_slice() {
        MANGLED.fetch_add(1, Ordering::SeqCst);
    }
    REAPED[d.rank()].fetch_add(1, Ordering::SeqCst);
}

#[test]
fn random_targets_lose_and_duplicate_nothing() {
    let threads = num_cpus::get().clamp(2, 4);
    const PER_THREAD: usize = 300;
    for backend in Backend::ALL {
        for c in ADDRESSED.iter().chain(REAPED.iter()) {
            c.store(0, Ordering::SeqCst);
        }
        MANGLED.store(0, Ordering::SeqCst);

        run_peers(PEERS, "random_targets", move |g| {
            let rt = runtime(&g, backend);
            let q = rt.open(MSG_SIZE, 8, &g).unwrap();
            std::thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        for _ in 0..PER_THREAD {
                            let target = (rand::random::<u64>() % PEERS as u64) as usize;
                            let len = (rand::random::<u64>() % (MSG_SIZE as u64 + 1)) as usize;
                            q.bsend(target, record, &pattern(len)).unwrap();
                            ADDRESSED[target].fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });
            q.process_blocking().unwrap();
            q.close().unwrap();
        });

        let addressed: Vec<_> = ADDRESSED.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        let reaped: Vec<_> = REAPED.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(reaped, addressed, "{backend}");
        assert_eq!(
            reaped.iter().sum::<u64>(),
            (PEERS * threads * PER_THREAD) as u64,
            "{backend}"
        );
        assert_eq!(MANGLED.load(Ordering::SeqCst), 0, "{backend}");
    }
    assert!(telemetry::total(telemetry::MESSAGES_SENT) > 0);
}

static OK_SENDS: AtomicU64 = AtomicU64::new(0);
static INVOKED: AtomicU64 = AtomicU64::new(0);

fn count(_: &Delivery<'_>) {
    INVOKED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn invocations_match_successful_try_sends() {
    for backend in Backend::ALL {
        OK_SENDS.store(0, Ordering::SeqCst);
        INVOKED.store(0, Ordering::SeqCst);
        run_peers(PEERS, "ok_count", move |g| {
            let rt = runtime(&g, backend);
            let q = rt.open(16, 2, &g).unwrap();
            for round in 0..200usize {
                let target = (g.rank() + 1 + round % (PEERS - 1)) % PEERS;
                match q.try_send(target, count, &round.to_le_bytes()) {
                    Ok(()) => {
                        OK_SENDS.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(Error::Again) => {}
                    Err(e) => panic!("{backend}: {e}"),
                }
                match q.process() {
                    Ok(_) | Err(Error::Again) => {}
                    Err(e) => panic!("{backend}: {e}"),
                }
            }
            q.process_blocking().unwrap();
            q.close().unwrap();
        });
        assert_eq!(
            INVOKED.load(Ordering::SeqCst),
            OK_SENDS.load(Ordering::SeqCst),
            "{backend}"
        );
    }
}

fn ignore(_: &Delivery<'_>) {}

#[test]
fn single_slot_inbox_refuses_until_drained() {
    for backend in [Backend::LockFree, Backend::SopNop] {
        run_peers(2, "one_slot", move |g| {
            let rt = runtime(&g, backend);
            let q = rt.open(8, 1, &g).unwrap();
            if g.rank() == 0 {
                q.try_send(1, ignore, b"a").unwrap();
                for _ in 0..10 {
                    assert!(matches!(q.try_send(1, ignore, b"b"), Err(Error::Again)), "{backend}");
                }
                g.barrier();
                g.barrier();
                q.try_send(1, ignore, b"b").unwrap();
            } else {
                g.barrier();
                assert_eq!(q.process().unwrap(), 1, "{backend}");
                g.barrier();
            }
            q.process_blocking().unwrap();
            q.close().unwrap();
        });
    }
}

#[test]
fn drain_reopens_at_least_half_the_inbox() {
    const COUNT: usize = 8;
    for backend in [Backend::LockFree, Backend::SopNop] {
        let accepted = run_peers(2, "full_drain", move |g| {
            let rt = runtime(&g, backend);
            let q = rt.open(8, COUNT, &g).unwrap();
            let fill = || {
                let mut n = 0;
                while q.try_send(1, ignore, b"x").is_ok() {
                    n += 1;
                }
                n
            };
            let result = if g.rank() == 0 {
                let first = fill();
                g.barrier();
                g.barrier();
                (first, fill())
            } else {
                g.barrier();
                q.process().unwrap();
                g.barrier();
                (0, 0)
            };
            q.process_blocking().unwrap();
            q.close().unwrap();
            result
        });
        let (first, second) = accepted[0];
        assert_eq!(first, COUNT, "{backend}");
        assert!(second >= COUNT / 2, "{backend}: only {second} after drain");
    }
}
