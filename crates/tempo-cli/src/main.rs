#![forbid(unsafe_code)]

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tempo_kernel::{Kernel, KernelConfig};
use tempo_time::cycles_in;

/// Native runner for the tempo scheduling kernel (topology/bring-up debugging).
#[derive(Debug, Parser)]
#[command(about = "Run a clock-domain topology for a bounded amount of simulated time")]
struct Args {
    /// JSON topology file ({"domains": [{"name": ..., "freq_hz": ...}]}).
    #[arg(long)]
    topology: PathBuf,

    /// Total simulated picoseconds to run.
    #[arg(long)]
    run_ps: u64,

    /// Split the run into bounded steps of this many picoseconds, printing
    /// per-domain cycle counts after each boundary.
    #[arg(long)]
    step_ps: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let args = Args::parse();

    let raw = fs::read_to_string(&args.topology)
        .with_context(|| format!("reading topology {}", args.topology.display()))?;
    let config: KernelConfig = serde_json::from_str(&raw)
        .with_context(|| format!("decoding topology {}", args.topology.display()))?;
    if config.domains.is_empty() {
        bail!("topology has no clock domains");
    }
    let domains = config.domains.clone();

    let kernel = Kernel::open(config).context("opening kernel")?;
    // Each domain ticks once per cycle so the run covers the whole window.
    {
        let mut guard = kernel.lock();
        for domain in &domains {
            let id = guard.domain_id(&domain.name).expect("domain just configured");
            let tick = guard.new_event(id, format!("{}-tick", domain.name), Box::new(|_| {}));
            guard.event_enable(id, tick);
        }
    }

    kernel.start().context("starting engine thread")?;

    match args.step_ps {
        Some(step_ps) if step_ps > 0 => {
            let mut now = 0u64;
            while now < args.run_ps {
                let delta = step_ps.min(args.run_ps - now);
                now = kernel.step(delta).context("stepping")?;
                report(&kernel, &domains, now);
            }
        }
        _ => {
            let end = kernel.step_until(args.run_ps).context("running")?;
            report(&kernel, &domains, end);
        }
    }

    kernel.close();
    Ok(())
}

fn report(kernel: &Kernel, domains: &[tempo_kernel::DomainConfig], now_ps: u64) {
    println!("t={now_ps} ps");
    let guard = kernel.lock();
    for domain in domains {
        let id = guard.domain_id(&domain.name).expect("domain just configured");
        let cycles = guard.domain_cycles(id);
        let expected = cycles_in(now_ps, domain.freq_hz);
        println!(
            "  {:<16} {:>12} cycles ({} Hz, expected ~{})",
            domain.name, cycles, domain.freq_hz, expected
        );
    }
}
