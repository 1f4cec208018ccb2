//! Allocation churn
//!
//! Simulates a mutator that keeps a sliding window of live objects while
//! allocating garbage, stepping the collector at every safepoint, and prints
//! the resulting statistics for both collection modes.

#![allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]

use std::time::Instant;

use moon_gc::{GcConfig, GcError, Heap, LimitedAllocator, Value};

const ROUNDS: usize = 200_000;
const WINDOW: usize = 256;

fn run(name: &str, config: GcConfig) -> Result<(), GcError> {
    let allocator = LimitedAllocator::new(usize::MAX);
    let budget = allocator.budget();
    let mut heap = Heap::with_allocator(config, allocator)?;
    let window = heap.new_table()?;
    heap.pin(window.into())?;

    let start = Instant::now();
    for i in 0..ROUNDS {
        let node = heap.new_table()?;
        let payload = heap.new_userdata(64, 1)?;
        heap.table_set(node, Value::Integer(1), payload.into())?;
        heap.set_user_value(payload, 0, Value::Integer(i as i64))?;
        let slot = Value::Integer((i % WINDOW) as i64 + 1);
        heap.table_set(window, slot, node.into())?;
        heap.step();
    }
    let elapsed = start.elapsed();

    let stats = heap.stats();
    println!("== {name} ==");
    println!("  elapsed:            {elapsed:?}");
    println!("  cycles:             {}", stats.cycles);
    println!("  minor collections:  {}", stats.minor_collections);
    println!("  major collections:  {}", stats.major_collections);
    println!("  objects freed:      {}", stats.objects_freed);
    println!("  max atomic pause:   {:?}", stats.max_atomic_pause);
    println!("  backing peak:       {:.1} KiB", budget.peak() as f64 / 1024.0);
    println!("  heap now:           {:.1} KiB", heap.total_bytes() as f64 / 1024.0);
    Ok(())
}

fn main() -> Result<(), GcError> {
    run("incremental", GcConfig::incremental())?;
    run("generational", GcConfig::generational())?;
    Ok(())
}
