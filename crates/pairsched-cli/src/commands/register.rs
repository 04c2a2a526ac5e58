use pairsched_core::kctl::RuntimeMonitor;

pub fn run(pgid: i32, job: i32, workers: i32, remove: bool) -> i32 {
    let monitor = match RuntimeMonitor::open() {
        Ok(monitor) => monitor,
        Err(err) => {
            eprintln!("Error: {err} (is runtime_monitor.ko loaded?)");
            return 1;
        }
    };

    let result = if remove {
        monitor.remove_pgid(pgid)
    } else {
        monitor.register_pgid(pgid, job, workers)
    };
    match result {
        Ok(()) => {
            if remove {
                println!("pgid {pgid} removed");
            } else {
                println!("pgid {pgid} registered as job {job} ({workers} worker(s))");
            }
            0
        }
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}

pub fn threshold(seconds: i32) -> i32 {
    let monitor = match RuntimeMonitor::open() {
        Ok(monitor) => monitor,
        Err(err) => {
            eprintln!("Error: {err} (is runtime_monitor.ko loaded?)");
            return 1;
        }
    };
    match monitor.set_long_running_threshold(seconds) {
        Ok(()) => {
            println!("long-running threshold set to {seconds}s");
            0
        }
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}
