use clap::{Args as ClapArgs, Parser, Subcommand};
use eyre::{bail, Result};
use shmsync_harness::{scenarios, Report};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "shmsync-harness")]
#[command(about = "Run multi-process checks against the shmsync primitives", long_about = None)]
struct Args {
    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(ClapArgs, Debug, Clone)]
struct CounterArgs {
    #[arg(short, long, default_value_t = 8, help = "Number of worker processes")]
    processes: u64,

    #[arg(
        short,
        long,
        default_value_t = 100_000,
        help = "Increments per worker process"
    )]
    iterations: u64,
}

#[derive(Subcommand, Debug)]
enum Scenario {
    /// Shared counter guarded by the spinlock.
    Spin {
        #[command(flatten)]
        counter: CounterArgs,

        #[arg(long, help = "Also run without the lock to show lost updates")]
        no_lock: bool,
    },
    /// Shared counter guarded by a 1-count semaphore.
    Sem {
        #[command(flatten)]
        counter: CounterArgs,
    },
    /// A waiter blocked on a 0-count semaphore resumes only after the release.
    Block {
        #[arg(short, long, default_value_t = 1000, help = "Delay before release in ms")]
        delay_ms: u64,
    },
    /// One producer and one consumer; values must arrive in order.
    Fifo {
        #[arg(short = 'n', long, default_value_t = 100_000)]
        items: u64,
    },
    /// Many producers and one consumer; every producer's run must stay in order.
    Acid {
        #[arg(short = 'w', long, default_value_t = 8)]
        producers: u32,

        #[arg(short = 'n', long, default_value_t = 64_000)]
        items: u32,
    },
    /// Every scenario with its default parameters.
    All,
}

fn run(scenario: Scenario) -> Result<Vec<Report>> {
    let reports = match scenario {
        Scenario::Spin { counter, no_lock } => {
            let mut reports = Vec::new();
            if no_lock {
                reports.push(scenarios::spin_counter(
                    counter.processes,
                    counter.iterations,
                    false,
                )?);
            }
            reports.push(scenarios::spin_counter(
                counter.processes,
                counter.iterations,
                true,
            )?);
            reports
        }
        Scenario::Sem { counter } => vec![scenarios::semaphore_mutex(
            counter.processes,
            counter.iterations,
        )?],
        Scenario::Block { delay_ms } => {
            vec![scenarios::blocking_wakeup(Duration::from_millis(delay_ms))?]
        }
        Scenario::Fifo { items } => vec![scenarios::fifo_order(items)?],
        Scenario::Acid { producers, items } => vec![scenarios::acid(producers, items)?],
        Scenario::All => vec![
            scenarios::spin_counter(8, 100_000, true)?,
            scenarios::semaphore_mutex(8, 100_000)?,
            scenarios::blocking_wakeup(Duration::from_secs(1))?,
            scenarios::fifo_order(100_000)?,
            scenarios::acid(8, 64_000)?,
        ],
    };
    Ok(reports)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    debug!(?args, "harness configuration");

    shmsync::install_handler()?;
    let reports = run(args.scenario)?;

    let mut failed = 0;
    for report in &reports {
        if report.passed() {
            info!(%report, "scenario passed");
        } else if !report.strict {
            warn!(
                %report,
                lost = report.expected - report.observed,
                "updates lost without the lock"
            );
        } else {
            error!(%report, "scenario failed");
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} scenarios failed", failed, reports.len());
    }
    Ok(())
}
