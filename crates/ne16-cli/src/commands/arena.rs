//! `ne16 arena`: Drive the arena allocator with random traffic.

use ne16_loader::{Arena, ArenaError, ArenaInfo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::output::StyledOutput;

/// Arguments of `ne16 arena`.
pub struct ArenaOptions {
    pub capacity: usize,
    pub split_threshold: u32,
    pub ops: usize,
    pub max_size: usize,
    pub seed: u64,
    pub json: bool,
}

#[derive(Serialize)]
struct ArenaReport {
    capacity: usize,
    allocations: usize,
    frees: usize,
    exhausted: usize,
    live_blocks: usize,
    final_info: ArenaInfo,
    largest_free: usize,
}

pub fn execute(out: &mut StyledOutput, options: ArenaOptions) -> anyhow::Result<()> {
    anyhow::ensure!(options.max_size > 1, "--max-size must be at least 2");
    let mut arena = Arena::with_split_threshold(options.capacity, options.split_threshold)?;
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut live = Vec::new();
    let (mut allocations, mut frees, mut exhausted) = (0, 0, 0);

    for _ in 0..options.ops {
        if live.is_empty() || rng.gen_bool(0.55) {
            match arena.allocate(rng.gen_range(1..options.max_size)) {
                Ok(ptr) => {
                    allocations += 1;
                    live.push(ptr);
                }
                Err(ArenaError::Exhausted { .. }) => exhausted += 1,
                Err(e) => return Err(e.into()),
            }
        } else {
            let ptr = live.swap_remove(rng.gen_range(0..live.len()));
            arena.free(ptr)?;
            frees += 1;
        }
    }

    let largest_free = arena.largest_free();
    let report = ArenaReport {
        capacity: arena.capacity(),
        allocations,
        frees,
        exhausted,
        live_blocks: live.len(),
        final_info: arena.info(),
        largest_free,
    };
    if options.json {
        return out.json(&report);
    }

    out.heading(&format!("Arena ({} bytes, seed {})", report.capacity, options.seed));
    out.field("allocations", report.allocations);
    out.field("frees", report.frees);
    out.field("exhausted", report.exhausted);
    out.field("blocks in use", report.final_info.blocks_in_use);
    out.field("free bytes", report.final_info.free_bytes);
    out.field("largest free run", report.largest_free);
    Ok(())
}
