use std::path::Path;

use pairsched_core::counters::CounterSet;
use pairsched_core::injector::{
    COMBINATION_RESULT_FILE, COMBINATION_TEMP_FILE, combination_to_json, measure_combinations,
    push_combination_file,
};
use pairsched_core::topology::Topology;

pub fn run(dir: &str, push: bool) -> i32 {
    let Some(cfg) = super::load_config() else {
        return 2;
    };
    let dir = Path::new(dir);

    if push {
        let outcome = (|| {
            let store = super::connect_store(&cfg)?;
            push_combination_file(dir, &store)
        })();
        return match outcome {
            Ok(()) => {
                println!("combination data pushed for node {}", cfg.node_name);
                0
            }
            Err(err) => {
                eprintln!("Error: {err}");
                1
            }
        };
    }

    if cfg.training_jobs.is_empty() {
        eprintln!("Error: PAIRSCHED_TRAINING_JOBS is empty; nothing to measure");
        return 2;
    }

    let outcome = (|| {
        let topo = Topology::detect()?;
        let cpus = topo.first_pair()?;
        let counters = CounterSet::open(&cpus)?;
        println!(
            "measuring {} training job(s) on cpus {},{}",
            cfg.training_jobs.len(),
            cpus[0],
            cpus[1]
        );
        let table = measure_combinations(&cfg, &counters, cpus)?;
        let out = dir.join(COMBINATION_RESULT_FILE);
        std::fs::write(&out, serde_json::to_string_pretty(&combination_to_json(&table))?)?;
        Ok::<_, pairsched_core::ControlError>(out)
    })();

    match outcome {
        Ok(out) => {
            println!("wrote {}", out.display());
            println!("review it, rename to {COMBINATION_TEMP_FILE}, then rerun with --push");
            0
        }
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}
