// Prints the algorithm catalog of this build and how each entry is routed.
// `cv_tester` is the runner that actually processes images.

use classical_cv::{Dispatcher, DispatcherConfig};

fn main() {
    let dispatcher = match Dispatcher::new(DispatcherConfig::from_env()) {
        Ok(dispatcher) => dispatcher,
        Err(error) => {
            eprintln!("failed to build the catalog: {error}");
            std::process::exit(1);
        }
    };
    println!("classical_cv catalog ({} library)", dispatcher.library_name());
    let registry = dispatcher.registry();
    for category in registry.categories() {
        println!("{category}");
        for descriptor in registry.descriptors(category) {
            let executed = dispatcher.route(descriptor.algorithm);
            if executed == descriptor.algorithm {
                println!("  {:<24} {}", descriptor.name(), descriptor.summary);
            } else {
                println!("  {:<24} {} (runs {})", descriptor.name(), descriptor.summary, executed);
            }
        }
    }
}
