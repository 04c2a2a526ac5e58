use pairsched_core::characterize::{Baselines, MeasurementIndex, characterize_job};
use pairsched_core::store::ProfileStore;

pub fn run(job: i32, json: bool) -> i32 {
    let Some(cfg) = super::load_config() else {
        return 2;
    };
    let store = match super::connect_store(&cfg) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("Error: {err}");
            return 1;
        }
    };

    let chars = (|| {
        let docs = store.fetch_profile_data(job)?;
        let index = MeasurementIndex::build(job, &docs);
        let baselines = Baselines::load(&store)?;
        characterize_job(&cfg.target, &index, &baselines)
    })();

    let chars = match chars {
        Ok(chars) => chars,
        Err(err) => {
            eprintln!("Error: {err}");
            return 1;
        }
    };

    if json {
        match serde_json::to_string_pretty(&chars) {
            Ok(out) => println!("{out}"),
            Err(err) => {
                eprintln!("Error: {err}");
                return 1;
            }
        }
        return 0;
    }

    println!("job {job} on {}", cfg.node_name);
    println!("  single IPC:   {:.4}", chars.single_ipc);
    println!("  scale factor: {:.4}", chars.scale_factor);
    println!();
    println!(
        "{:<12} {:>12} {:>8} {:>10} {:>14}",
        "feature", "sensitivity", "usage", "intensity", "base slowdown"
    );
    for (spec, profile) in cfg.target.iter().zip(&chars.profiles) {
        println!(
            "{:<12} {:>12.4} {:>8.4} {:>10.4} {:>14.4}",
            spec.name, profile.sensitivity, profile.usage, profile.intensity, profile.base_slowdown
        );
    }
    0
}
