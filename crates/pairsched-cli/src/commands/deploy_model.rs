use std::path::Path;

use pairsched_core::model::deploy_model;
use pairsched_core::store::unix_now;

pub fn run(source: &str) -> i32 {
    let Some(cfg) = super::load_config() else {
        return 2;
    };
    match deploy_model(Path::new(source), &cfg.model_dir, unix_now()) {
        Ok(Some(dest)) => {
            println!("installed {}", dest.display());
            0
        }
        Ok(None) => {
            println!("model is identical to the newest installed one; nothing to do");
            0
        }
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}
