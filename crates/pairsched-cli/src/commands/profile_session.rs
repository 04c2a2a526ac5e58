use pairsched_core::counters::CounterSet;
use pairsched_core::injector::ProfileSession;
use pairsched_core::topology::Topology;

pub fn run(job: i32) -> i32 {
    let Some(cfg) = super::load_config() else {
        return 2;
    };

    let outcome = (|| {
        let topo = Topology::detect()?;
        let cpus = topo.first_pair()?;
        let counters = CounterSet::open(&cpus)?;
        let store = super::connect_store(&cfg)?;
        println!("profiling job {job} on cpus {},{}", cpus[0], cpus[1]);
        ProfileSession::new(&cfg, &store, &counters, cpus).run(job)
    })();

    match outcome {
        Ok(()) => {
            println!("profiling session for job {job} complete");
            0
        }
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}
