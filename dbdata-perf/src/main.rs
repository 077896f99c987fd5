use std::{
    hint::black_box,
    path::PathBuf,
    sync::PoisonError,
    time::{Duration, Instant},
};

use dbdata::DoublyBufferedData;
use tracing::{debug, info};

#[derive(clap::Parser)]
struct Args {
    config: PathBuf,
    /// Number of `u32` slots in the shared value
    #[clap(long, short, default_value_t = 1024)]
    slots: usize,
    /// Warn when a modify waits this long for a single reader
    #[clap(long)]
    slow_drain_ms: Option<u64>,
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

#[derive(serde::Deserialize, Clone)]
pub struct ConfigEntry {
    name: String,
    #[serde(rename = "num-threads")]
    num_threads: u32,
    ops: u32,
    odds: ConfigEntryOdds,
}

#[derive(serde::Deserialize, Clone, Copy)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ConfigEntryOdds {
    #[serde(default)]
    reads: u32,
    #[serde(default)]
    writes: u32,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Read { index: usize },
    Write { index: usize, value: u32 },
}

/// A shared `[u32]` behind one of the compared synchronization schemes
trait Shared: Sync {
    const NAME: &'static str;

    fn read(&self, index: usize) -> u32;

    fn write(&self, index: usize, value: u32);
}

impl Shared for DoublyBufferedData<Vec<u32>> {
    const NAME: &'static str = "dbdata";

    fn read(&self, index: usize) -> u32 {
        DoublyBufferedData::read(self)[index]
    }

    fn write(&self, index: usize, value: u32) {
        self.modify(|slots| usize::from(std::mem::replace(&mut slots[index], value) != value));
    }
}

impl Shared for parking_lot::RwLock<Vec<u32>> {
    const NAME: &'static str = "parking_lot::RwLock";

    fn read(&self, index: usize) -> u32 {
        self.read()[index]
    }

    fn write(&self, index: usize, value: u32) {
        self.write()[index] = value;
    }
}

impl Shared for std::sync::RwLock<Vec<u32>> {
    const NAME: &'static str = "std::sync::RwLock";

    fn read(&self, index: usize) -> u32 {
        self.read().unwrap_or_else(PoisonError::into_inner)[index]
    }

    fn write(&self, index: usize, value: u32) {
        self.write().unwrap_or_else(PoisonError::into_inner)[index] = value;
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let args: Args = clap::Parser::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.verbose.tracing_level_filter())
        .init();

    if args.slots == 0 {
        eyre::bail!("Tried to create a perf test with no slots")
    }

    let config = std::fs::read(&args.config)?;
    let config: Vec<ConfigEntry> = serde_json::from_slice(&config)?;

    let thread_ops = generate_ops(&config, args.slots)?;

    if thread_ops.is_empty() {
        tracing::error!("Tried to create a perf test with no operations");
        return Ok(());
    }

    let mut builder = dbdata::Builder::new().lease_capacity(thread_ops.len());

    if let Some(millis) = args.slow_drain_ms {
        builder = builder.slow_drain_warning(Duration::from_millis(millis));
    }

    let thread_ops = thread_ops.as_slice();

    let data: DoublyBufferedData<Vec<u32>> = builder.build(vec![0; args.slots]);
    run(&data, thread_ops);
    run(&parking_lot::RwLock::new(vec![0; args.slots]), thread_ops);
    run(&std::sync::RwLock::new(vec![0; args.slots]), thread_ops);

    Ok(())
}

fn generate_ops(config: &[ConfigEntry], slots: usize) -> eyre::Result<Vec<(&str, Vec<Op>)>> {
    let mut thread_ops = Vec::new();

    for entry in config {
        if entry.ops == 0 || entry.num_threads == 0 {
            continue;
        }

        let ConfigEntryOdds { reads, writes } = entry.odds;

        let Some(total) = reads.checked_add(writes) else {
            eyre::bail!("Odds on entry {} overflowed u32", entry.name)
        };

        if total == 0 {
            eyre::bail!("Entry {} has no odds for any operation", entry.name)
        }

        let read_odds = (f64::from(reads) / f64::from(total)) as f32;

        let ops = (0..entry.ops)
            .map(|_| {
                let r: f32 = rand::random();
                let index = rand::random_range(0..slots);

                if r < read_odds {
                    Op::Read { index }
                } else {
                    Op::Write {
                        index,
                        value: rand::random(),
                    }
                }
            })
            .collect::<Vec<_>>();

        debug!(name = %entry.name, threads = entry.num_threads, "generated operations");

        thread_ops.extend(std::iter::repeat_n(
            (entry.name.as_str(), ops),
            entry.num_threads as usize,
        ));
    }

    Ok(thread_ops)
}

fn run<S: Shared>(shared: &S, thread_ops: &[(&str, Vec<Op>)]) {
    let start = Instant::now();
    if tracing::enabled!(tracing::Level::DEBUG) {
        println!("{:=>160}", "");
    }
    debug!("{}", S::NAME);

    std::thread::scope(|s| {
        for (name, thread) in thread_ops {
            s.spawn(move || {
                for op in thread {
                    match *op {
                        Op::Read { index } => {
                            black_box(shared.read(index));
                        }
                        Op::Write { index, value } => shared.write(index, value),
                    }
                }
                debug!("THREAD COMPLETE {name}")
            });
        }
    });

    info!(time = ?start.elapsed(), "{}", S::NAME);
}
