use pairsched_core::shm::ShmReader;

pub fn run(reset: bool) -> i32 {
    let shm = match ShmReader::open() {
        Ok(shm) => shm,
        Err(err) => {
            eprintln!("Error: {err} (is IPC_monitor.ko loaded?)");
            return 1;
        }
    };

    let slots = shm.active_slots();
    println!("{} registered group(s), {} active slot(s)", shm.registered_count(), slots.len());
    if !slots.is_empty() {
        println!();
        println!(
            "{:<6} {:<8} {:<6} {:<8} {:>14} {:>14} {:>8}",
            "slot", "pgid", "job", "workers", "cycles", "instructions", "ipc"
        );
        for (idx, slot) in &slots {
            println!(
                "{:<6} {:<8} {:<6} {:<8} {:>14} {:>14} {:>8.3}",
                idx,
                slot.pgid,
                slot.global_jobid,
                slot.worker_num,
                slot.cycles,
                slot.instructions,
                slot.ipc()
            );
        }
    }

    if reset {
        if let Err(err) = shm.reset_counters() {
            eprintln!("Error: {err}");
            return 1;
        }
        println!("slot counters reset");
    }
    0
}
