mod utils {
    pub mod errors;
    pub mod logger;
    pub mod psutils;
}

mod aggregate;
mod barrier;
mod cancel;
pub mod collectors;
mod config;
pub mod energy_group;
mod record;
mod role;
mod runner;
mod task;

use cancel::{Scancel, abort_job};
use log::info;
use role::JobEnvironment;
use runner::Outcome;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    utils::logger::setup_logger();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let env = JobEnvironment::from_process();
    let mut stdout = tokio::io::stdout();

    match runner::run(&args, &env, &mut stdout).await {
        Ok(Outcome::Aggregated(aggregate)) => {
            info!("Step complete: {} {} over {} nodes", aggregate.total, aggregate.units, aggregate.nodes.len());
        }
        Ok(_) => {}
        Err(err) => {
            let fatal = abort_job(&env, &Scancel, err).await;
            eprintln!("{}", fatal);
            std::process::exit(1);
        }
    }
}
