use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pairsched_core::{Controller, ControlError};

pub fn run() -> i32 {
    let Some(cfg) = super::load_config() else {
        return 2;
    };

    let controller = match Controller::new(cfg) {
        Ok(controller) => controller,
        Err(err @ ControlError::ModelNotFound(_)) => {
            eprintln!("Error: {err}");
            eprintln!("Train a model and install it with `pairsched deploy-model <file>`.");
            return 2;
        }
        Err(err) => {
            eprintln!("Error: controller start-up failed: {err}");
            return 1;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        let _ = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    match controller.run(shutdown) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}
