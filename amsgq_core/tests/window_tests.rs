mod common;

use amsgq_core::{ReplaceMode, Window};
use common::run_peers;

#[test]
fn peers_put_into_each_other() {
    const PEERS: usize = 4;
    let views = run_peers(PEERS, "win_put", |g| {
        let w = Window::allocate(&g, PEERS * 8).unwrap();
        let me = g.rank();
        for target in 0..PEERS {
            w.put(target, me * 8, &(me as u64 * 10).to_le_bytes()).unwrap();
            w.flush(target).unwrap();
        }
        g.barrier();
        let mut out = vec![0u8; PEERS * 8];
        w.get(me, 0, &mut out).unwrap();
        w.free();
        out.chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect::<Vec<_>>()
    });
    for view in views {
        assert_eq!(view, vec![0, 10, 20, 30]);
    }
}

#[test]
fn remote_fetch_add_sums_contributions() {
    const PEERS: usize = 4;
    const ADDS: u32 = 500;
    let totals = run_peers(PEERS, "win_fadd", |g| {
        let w = Window::allocate(&g, 64).unwrap();
        for _ in 0..ADDS {
            w.fetch_add_u32(0, 0, 1).unwrap();
            w.fetch_add_i32(0, 4, -1).unwrap();
        }
        w.flush_all();
        g.barrier();
        let result = (w.load_u32(0, 0).unwrap(), w.fetch_add_i32(0, 4, 0).unwrap());
        g.barrier();
        result
    });
    for (sum, neg) in totals {
        assert_eq!(sum, ADDS * PEERS as u32);
        assert_eq!(neg, -((ADDS as i32) * PEERS as i32));
    }
}

#[test]
fn only_one_compare_and_swap_wins() {
    const PEERS: usize = 5;
    let wins = run_peers(PEERS, "win_cas", |g| {
        let w = Window::allocate(&g, 64).unwrap();
        let mine = g.rank() as u64 + 1;
        let won = w.compare_and_swap_u64(0, 8, 0, mine).unwrap() == 0;
        g.barrier();
        let stored = w.load_u64(0, 8).unwrap();
        let flag = w.replace_u8(0, 0, 1, ReplaceMode::FetchOp).unwrap();
        g.barrier();
        (won, stored == mine, flag)
    });
    assert_eq!(wins.iter().filter(|(won, _, _)| *won).count(), 1);
    assert!(wins.iter().all(|(won, is_mine, _)| won == is_mine));
    // exactly one swap found the flag clear
    assert_eq!(wins.iter().filter(|(_, _, flag)| *flag == 0).count(), 1);
}
