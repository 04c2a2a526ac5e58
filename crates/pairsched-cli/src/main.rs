//! CLI for pairsched: the SMT co-scheduling daemon and its operational
//! helpers.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pairsched")]
#[command(about = "pairsched — SMT-aware co-scheduling control plane")]
#[command(version = pairsched_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the co-scheduling controller daemon
    Run,

    /// Show physical cores, SMT siblings, and socket placement
    Topology,

    /// Dump the kernel's live per-PGID IPC slots
    Slots {
        /// Zero all slot counters after reading
        #[arg(long)]
        reset: bool,
    },

    /// Fetch a job's profile from the store and print its characteristics
    Characterize {
        /// Global job id
        job: i32,

        /// Emit machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Register (or unregister) a process group with the runtime monitor
    Register {
        /// Process group id
        pgid: i32,

        /// Global job id to attribute the group to
        #[arg(long, default_value_t = 0)]
        job: i32,

        /// Worker process count of the group
        #[arg(long, default_value_t = 1)]
        workers: i32,

        /// Remove the group instead of adding it
        #[arg(long)]
        remove: bool,
    },

    /// Set the kernel's long-running detection threshold
    Threshold {
        /// Seconds of runtime before a group is flagged
        seconds: i32,
    },

    /// Run one out-of-band profiling session for a workload already running
    /// on the profiling core (profiling host only)
    ProfileSession {
        /// Global job id being profiled
        job: i32,
    },

    /// Measure solo/pair co-run IPC over the training jobs and write the
    /// combination result file (profiling host only)
    Combine {
        /// Directory for the result file (and the reviewed `_temp` file)
        #[arg(long, default_value = ".")]
        dir: String,

        /// Push the reviewed `_temp` file to the store instead of measuring
        #[arg(long)]
        push: bool,
    },

    /// Install a trained model file as the newest versioned model
    DeployModel {
        /// Path to the trained `prediction_model.json`
        source: String,
    },

    /// Wipe this node's measurement and combination data from the store
    ClearNode {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run => commands::run::run(),
        Commands::Topology => commands::topology::run(),
        Commands::Slots { reset } => commands::slots::run(reset),
        Commands::Characterize { job, json } => commands::characterize::run(job, json),
        Commands::Register { pgid, job, workers, remove } => {
            commands::register::run(pgid, job, workers, remove)
        }
        Commands::Threshold { seconds } => commands::register::threshold(seconds),
        Commands::ProfileSession { job } => commands::profile_session::run(job),
        Commands::Combine { dir, push } => commands::combine::run(&dir, push),
        Commands::DeployModel { source } => commands::deploy_model::run(&source),
        Commands::ClearNode { yes } => commands::clear_node::run(yes),
    };
    std::process::exit(code);
}
