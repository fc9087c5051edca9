#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

use cohesim::{config, sim};
use color_eyre::eyre;
use criterion::{black_box, Criterion};

fn bench_config(protocol: &str, cores: usize) -> config::Cache {
    config::Cache {
        array: "STD:size=16384:assoc=4:repl=lru".to_string(),
        protocol: protocol.to_string(),
        cores,
        banks: 4,
        ports: 2,
        ..config::Cache::default()
    }
}

pub fn run_host(config: &config::Cache, cycles: u64) -> eyre::Result<sim::Summary> {
    let mut host = sim::Host::new(config, sim::Traffic::default(), 0)?;
    host.run(cycles)?;
    host.drain()?;
    Ok(host.summary())
}

pub fn controller_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("controller");
    group.sample_size(10);
    group.sampling_mode(criterion::SamplingMode::Flat);

    for protocol in ["InclusiveMESI", "InclusiveMOESI"] {
        let config = bench_config(protocol, 4);
        group.bench_function(format!("{protocol}/4cores/10000"), |b| {
            b.iter(|| run_host(black_box(&config), 10_000).unwrap());
        });
    }
}

criterion::criterion_group!(benches, controller_benchmark);
// criterion::criterion_main!(benches);

#[allow(dead_code)]
fn main() -> eyre::Result<()> {
    use std::time::Instant;

    let start = Instant::now();
    let summary = run_host(&bench_config("InclusiveMESI", 4), 100_000)?;
    println!("{summary}");
    println!("mesi took:\t\t{:?}", start.elapsed());
    Ok(())
}
