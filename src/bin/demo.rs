//! Samples a 2D Gaussian with the ensemble sampler, storing the chain in a CSV catalog,
//! then prints summary statistics.
//!
//! Run with `RUST_LOG=info cargo run --release --bin demo [catalog.csv]`.

use esmcmc::config::SamplerConfig;
use esmcmc::controller::{RunController, StopCondition};
use esmcmc::core::{GaussianBall, SeededStream};
use esmcmc::distributions::{Quadratic, WithRadius};
use esmcmc::io::csv::CsvCatalogSink;
use std::error::Error;
use std::time::Duration;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    const N_WALKERS: usize = 8;
    const N_PARAMS: usize = 2;
    const GENERATIONS: u64 = 5_000;
    const BURNIN: u64 = 500;
    const SEED: u64 = 42;

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "esmcmc_demo.csv".to_string());

    // cost = ½|θ|², so every coordinate is N(0, 2).
    let objective = WithRadius::new(Quadratic::new(0.5));
    let names = vec!["radius".to_string()];
    let sink = CsvCatalogSink::open(&path, N_PARAMS, &names)?;

    let config = SamplerConfig::default()
        .set_show_progress(true)
        .set_sync_interval(Duration::from_secs(1))
        .set_lre_burn_in(BURNIN);
    let mut sampler = RunController::with_config(
        N_WALKERS,
        N_PARAMS,
        objective,
        GaussianBall::isotropic(vec![5.0, -5.0], 0.1).set_seed(SEED),
        SeededStream::new(SEED),
        sink,
        config,
    )?;
    if sampler.generations() > 0 {
        println!("Continuing {path} from generation {}", sampler.generations());
    }

    let outcome = sampler.start_run(StopCondition::MaxGenerations(GENERATIONS))?;
    sampler.end_run()?;
    println!("{outcome:?}");

    let stats = sampler.stats();
    println!(
        "Proposed {}, accepted {} ({:.3}), offboard {} ({:.3})",
        stats.total_proposed,
        stats.total_accepted,
        stats.accept_ratio(),
        stats.total_offboard,
        stats.offboard_ratio()
    );
    println!("LRE after burn-in: {:.4}", sampler.lre());

    if let Some(summary) = sampler.mean_covar(BURNIN) {
        println!("Mean after burn-in ({} samples): {:.3}", summary.n, summary.mean);
        println!("Covariance:\n{:.3}", summary.covar);
    }
    println!("Catalog written to {path}");
    Ok(())
}
