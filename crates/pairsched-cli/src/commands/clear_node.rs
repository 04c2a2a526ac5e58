use pairsched_core::store::ProfileStore;

pub fn run(yes: bool) -> i32 {
    let Some(cfg) = super::load_config() else {
        return 2;
    };
    if !yes {
        eprintln!(
            "This deletes all measurement and combination data for node {}.",
            cfg.node_name
        );
        eprintln!("Rerun with --yes to confirm.");
        return 2;
    }

    let outcome = (|| {
        let store = super::connect_store(&cfg)?;
        store.clear_node()
    })();
    match outcome {
        Ok(()) => {
            println!("cleared node {}", cfg.node_name);
            0
        }
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}
