//! Runs `hot()` on several threads at once, so a breakpoint there is hit concurrently.
//!
//! Usage: `thread-trap [threads]`. Exits 0 after every thread returns.

use std::env;
use std::sync::{Arc, Barrier};
use std::thread;

#[no_mangle]
#[inline(never)]
pub extern "C" fn hot(n: u64) -> u64 {
    n.wrapping_mul(31).wrapping_add(7)
}

fn main() {
    let threads: usize = env::args().nth(1).and_then(|arg| arg.parse().ok()).unwrap_or(8);
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads as u64)
        .map(|i| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                hot(i)
            })
        })
        .collect();

    let sum: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    println!("{}", sum);
}
