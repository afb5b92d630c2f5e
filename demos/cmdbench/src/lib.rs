pub mod cli;
use cli::get_args;

use std::sync::Arc;
use std::time::Duration;

use hcacore::sim::SimHca;
use hcacore::{Hca, HcaConfig};

pub fn load_config() -> anyhow::Result<HcaConfig> {
    match &get_args().config {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(HcaConfig::from_toml(&content)?)
        }
        None => Ok(HcaConfig::default()),
    }
}

pub fn attach_sim(config: HcaConfig) -> anyhow::Result<(Arc<SimHca>, Hca)> {
    let sim = Arc::new(SimHca::new(&config));
    let hca = Hca::attach(sim.clone(), sim.dma(), config)?;
    Ok((sim, hca))
}

/// Latency summary of one run, in microseconds.
#[derive(Debug)]
pub struct Stats {
    pub min: f64,
    pub median: f64,
    pub p99: f64,
    pub max: f64,
}

impl Stats {
    pub fn from_samples(samples: &mut [Duration]) -> Option<Stats> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let us = |d: Duration| d.as_secs_f64() * 1e6;
        let at = |q: f64| samples[((samples.len() - 1) as f64 * q) as usize];
        Some(Stats {
            min: us(samples[0]),
            median: us(at(0.5)),
            p99: us(at(0.99)),
            max: us(samples[samples.len() - 1]),
        })
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "min {:.2} us, median {:.2} us, p99 {:.2} us, max {:.2} us",
            self.min, self.median, self.p99, self.max
        )
    }
}
