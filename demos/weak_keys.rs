//! Weak-key lifecycle walkthrough.
//!
//! Simulates a set of "sessions" that each own a key.  The cache memoizes an
//! expensive derivation per session and forgets it as soon as the session
//! ends, without any explicit invalidation.
//!
//! Run with:
//!     cargo run --example weak_keys --release

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weakcache::listener::RemovalCause;
use weakcache::WeakCacheBuilder;

const SESSIONS: usize = 64;
const LOOKUPS_PER_SESSION: usize = 50;

fn main() {
    env_logger::init();

    let computed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&computed);
    let cache = WeakCacheBuilder::new()
        .removal_listener(|session: &String, _val, cause| {
            if cause == RemovalCause::Explicit {
                println!("  invalidated {session}");
            }
        })
        .build_infallible(move |session: &String| {
            counter.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(1));
            session.bytes().map(u64::from).sum::<u64>()
        });

    let sessions: Vec<Arc<String>> = (0..SESSIONS)
        .map(|i| Arc::new(format!("session-{i:03}")))
        .collect();

    let start = Instant::now();
    for _ in 0..LOOKUPS_PER_SESSION {
        for s in &sessions {
            if let Err(e) = cache.get(s) {
                eprintln!("lookup failed: {e}");
            }
        }
    }
    println!(
        "{} lookups in {:?}, {} computations",
        SESSIONS * LOOKUPS_PER_SESSION,
        start.elapsed(),
        computed.load(Ordering::Relaxed)
    );

    // End half of the sessions: their entries die with their keys.
    let (live, ended): (Vec<_>, Vec<_>) = sessions
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % 2 == 0);
    drop(ended);
    println!("live entries after ending half: {}", cache.entry_count());
    println!("reclaimed slots: {}", cache.purge_collected());

    // Explicit invalidation still works for live sessions.
    if let Some((_, first)) = live.first() {
        cache.remove(first);
    }

    let stats = cache.stats();
    println!(
        "hits={} misses={} hit_rate={:.3}",
        stats.hits, stats.misses, stats.hit_rate
    );
}
