use pairsched_core::topology::Topology;

pub fn run() -> i32 {
    let topo = match Topology::detect() {
        Ok(topo) => topo,
        Err(err) => {
            eprintln!("Error: {err}");
            return 1;
        }
    };

    println!("{} logical CPUs, {} SMT pairs", topo.cpus().len(), topo.smt_pairs().len());
    println!();
    println!("{:<10} {:<8} {}", "socket", "core", "siblings");
    for ((socket, core), cpus) in topo.sibling_map() {
        let siblings: Vec<String> = cpus.iter().map(|c| c.to_string()).collect();
        println!("{socket:<10} {core:<8} {}", siblings.join(","));
    }
    0
}
