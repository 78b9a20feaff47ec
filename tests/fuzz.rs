use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use stakeledger_prog::engine::{LedgerParams, StakeEngine, MAX_SLOTS};

const CTRL: [u8; 32] = [7; 32];

fn default_params() -> LedgerParams {
    LedgerParams {
        supply_cap: 1 << 40,
        max_lock_window: 1_000,
        max_wallets: 64,
    }
}

fn adds(pids: &[u64]) -> [u64; MAX_SLOTS] {
    let mut list = [0u64; MAX_SLOTS];
    list[..pids.len()].copy_from_slice(pids);
    list
}

#[test]
fn deterministic_fuzz_simulation() {
    let seed = [0xabu8; 16];
    let mut rng = XorShiftRng::from_seed(seed);
    let mut engine = StakeEngine::new(default_params());

    let mut wallets: Vec<u16> = Vec::new();
    let mut protocols: Vec<u64> = Vec::new();

    for i in 0..500 {
        let op: u8 = rng.gen_range(0..11);
        let now = (i / 10) as u64; // Advance time slowly

        match op {
            0 => {
                // Add wallet
                if let Ok(idx) = engine.add_wallet([rng.gen::<u8>(); 32]) {
                    wallets.push(idx);
                }
            }
            1 => {
                // Create protocol
                let lock = rng.gen_range(0..20);
                let min = rng.gen_range(0..100);
                if let Ok(pid) = engine.create_protocol(CTRL, lock, min) {
                    protocols.push(pid);
                }
            }
            2 => {
                // Mint
                if !wallets.is_empty() {
                    let w = wallets[rng.gen_range(0..wallets.len())];
                    let _ = engine.mint(w, rng.gen_range(1_000..1_000_000));
                }
            }
            3 => {
                // Burn
                if !wallets.is_empty() {
                    let w = wallets[rng.gen_range(0..wallets.len())];
                    let _ = engine.burn(w, rng.gen_range(1..10_000), now);
                }
            }
            4 => {
                // Transfer
                if wallets.len() >= 2 {
                    let from = wallets[rng.gen_range(0..wallets.len())];
                    let to = wallets[rng.gen_range(0..wallets.len())];
                    let _ = engine.transfer(from, to, rng.gen_range(1..10_000), now);
                }
            }
            5 => {
                // Join a random protocol
                if !wallets.is_empty() && !protocols.is_empty() {
                    let w = wallets[rng.gen_range(0..wallets.len())];
                    let p = protocols[rng.gen_range(0..protocols.len())];
                    let _ = engine.set_membership(w, &adds(&[p]), 0xFF, now);
                }
            }
            6 => {
                // Leave everything
                if !wallets.is_empty() {
                    let w = wallets[rng.gen_range(0..wallets.len())];
                    let _ = engine.set_membership(w, &adds(&[]), 0, now);
                }
            }
            7 => {
                // Add yield
                if !wallets.is_empty() && !protocols.is_empty() {
                    let w = wallets[rng.gen_range(0..wallets.len())];
                    let p = protocols[rng.gen_range(0..protocols.len())];
                    let _ = engine.add_yield(p, w, rng.gen_range(1..5_000), now);
                }
            }
            8 => {
                // Signal haircut
                if !protocols.is_empty() {
                    let p = protocols[rng.gen_range(0..protocols.len())];
                    let _ = engine.signal_haircut(p, &CTRL, rng.gen_range(1..5_000));
                }
            }
            9 => {
                // Harvest
                if !wallets.is_empty() {
                    let w = wallets[rng.gen_range(0..wallets.len())];
                    let _ = engine.harvest(w);
                }
            }
            10 => {
                // Flash loan round trip
                if !wallets.is_empty() {
                    let w = wallets[rng.gen_range(0..wallets.len())];
                    let amount = rng.gen_range(1..100_000);
                    if let Ok(guard) = engine.flash_begin(w, amount) {
                        engine.approve_repayment(w, amount).unwrap();
                        engine.flash_settle(w, amount, guard).unwrap();
                    }
                }
            }
            _ => {}
        }

        assert!(
            engine.check_conservation(),
            "Conservation violated at step {}",
            i
        );
    }
}
