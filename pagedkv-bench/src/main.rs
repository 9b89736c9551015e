use std::{fmt::Display, path::PathBuf, time::Instant};

use candle_core::{Device, Tensor};
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use pagedkv_attn::{
    initialize_logging, metrics::record_tensor_size, paged_attention_v1, paged_attention_v2,
    AttentionConfig, BlockTable, PagedKVCache,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::{info, warn};

#[derive(Parser)]
#[command(version, about = "Benchmark paged attention V1 against partitioned V2")]
struct Args {
    /// Number of sequences in the decode batch.
    #[arg(long, default_value_t = 4)]
    num_seqs: usize,

    /// Cached tokens per sequence. Sequence `i` gets `seq_len - i` tokens so lengths differ.
    #[arg(long, default_value_t = 2048)]
    seq_len: usize,

    #[arg(long, default_value_t = 32)]
    num_heads: usize,

    #[arg(long, default_value_t = 8)]
    num_kv_heads: usize,

    #[arg(long, default_value_t = 128)]
    head_size: usize,

    #[arg(long, default_value_t = 16)]
    block_size: usize,

    #[arg(long)]
    sliding_window: Option<usize>,

    /// Partition sizes to run V2 with.
    #[arg(long, value_delimiter = ',', default_value = "64,512")]
    partition_sizes: Vec<usize>,

    /// Number of times to repeat each test.
    #[arg(long, short, default_value_t = 5)]
    repetitions: usize,

    /// Integer seed for the block assignment shuffle.
    #[arg(long, short, default_value_t = 0)]
    seed: u64,

    /// JSON attention config; overrides the head, block and window arguments.
    #[arg(long)]
    config: Option<PathBuf>,
}

enum TestName {
    V1,
    V2(usize),
}

impl Display for TestName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestName::V1 => write!(f, "v1"),
            TestName::V2(p) => write!(f, "v2 p={p}"),
        }
    }
}

struct BenchResult {
    test_name: TestName,
    durations_ms: Vec<f32>,
    max_abs_diff: f32,
}

struct UncertainMs {
    mean: f32,
    std_dev: f32,
}

impl Display for UncertainMs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}±{:.3}", self.mean, self.std_dev)
    }
}

fn get_ms(result: &BenchResult) -> UncertainMs {
    let n = result.durations_ms.len().max(1) as f32;
    let mean = result.durations_ms.iter().sum::<f32>() / n;
    let variance = result
        .durations_ms
        .iter()
        .map(|e| (mean - e).powf(2.))
        .sum::<f32>()
        / n;
    UncertainMs {
        mean,
        std_dev: variance.sqrt(),
    }
}

fn print_usage(cfg: &AttentionConfig, results: Vec<BenchResult>) -> anyhow::Result<()> {
    let shape = format!(
        "h={} kv={} d={} bs={}",
        cfg.num_heads(),
        cfg.num_kv_heads(),
        cfg.head_size(),
        cfg.block_size()
    );
    let results: Vec<Vec<CellStruct>> = results
        .into_iter()
        .map(|r| {
            vec![
                shape.clone().cell(),
                r.test_name.to_string().cell(),
                get_ms(&r).cell().justify(Justify::Right),
                format!("{:.2e}", r.max_abs_diff)
                    .cell()
                    .justify(Justify::Right),
            ]
        })
        .collect();

    let table = results
        .table()
        .title(vec![
            "config".cell().bold(true),
            "test".cell().bold(true),
            "ms".cell().bold(true),
            "max |v - v1|".cell().bold(true),
        ])
        .bold(true);
    print_stdout(table)?;
    Ok(())
}

/// Hand out shuffled physical blocks to each sequence, padding every table with
/// sentinels to the widest one.
fn assign_blocks(
    seq_lens: &[usize],
    block_size: usize,
    rng: &mut StdRng,
) -> pagedkv_attn::Result<(Vec<BlockTable>, usize)> {
    let needed: Vec<usize> = seq_lens.iter().map(|l| l.div_ceil(block_size)).collect();
    let num_blocks: usize = needed.iter().sum::<usize>().max(1);
    let mut ids: Vec<i64> = (0..num_blocks as i64).collect();
    ids.shuffle(rng);

    let max_blocks = needed.iter().copied().max().unwrap_or(0);
    let mut next = 0;
    let tables = needed
        .iter()
        .map(|&n| {
            let table = BlockTable::new(ids[next..next + n].to_vec());
            next += n;
            table.padded(max_blocks)
        })
        .collect::<pagedkv_attn::Result<Vec<_>>>()?;
    Ok((tables, num_blocks))
}

fn time_ms<T>(f: impl FnOnce() -> T) -> (T, f32) {
    let start = Instant::now();
    let out = f();
    (out, start.elapsed().as_secs_f32() * 1000.)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    let cfg = match &args.config {
        Some(path) => AttentionConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => AttentionConfig::new(
            args.num_heads,
            args.num_kv_heads,
            args.head_size,
            args.block_size,
            None,
            args.sliding_window,
        )?,
    };
    if args.repetitions == 0 {
        anyhow::bail!("repetitions must be at least 1");
    }

    let seq_lens: Vec<usize> = (0..args.num_seqs)
        .map(|i| args.seq_len.saturating_sub(i))
        .collect();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let (tables, num_blocks) = assign_blocks(&seq_lens, cfg.block_size(), &mut rng)?;

    let device = Device::Cpu;
    let shape = (
        num_blocks,
        cfg.block_size(),
        cfg.num_kv_heads(),
        cfg.head_size(),
    );
    let cache = PagedKVCache::new(
        Tensor::randn(0f32, 1.0, shape, &device)?,
        Tensor::randn(0f32, 1.0, shape, &device)?,
    )?;
    record_tensor_size("kv_cache", cache.size_in_bytes() as u64);
    let query = Tensor::randn(
        0f32,
        1.0,
        (args.num_seqs, cfg.num_heads(), cfg.head_size()),
        &device,
    )?;
    info!(
        num_seqs = args.num_seqs,
        num_blocks,
        cache_mb = cache.size_in_bytes() / (1024 * 1024),
        "built random paged cache"
    );

    let reference = paged_attention_v1(&query, &cache, &tables, &seq_lens, &cfg)?;
    let mut results = Vec::new();

    let mut durations_ms = Vec::with_capacity(args.repetitions);
    for _ in 0..args.repetitions {
        let (out, ms) = time_ms(|| paged_attention_v1(&query, &cache, &tables, &seq_lens, &cfg));
        out?;
        durations_ms.push(ms);
    }
    results.push(BenchResult {
        test_name: TestName::V1,
        durations_ms,
        max_abs_diff: 0.0,
    });

    for &partition_size in &args.partition_sizes {
        if partition_size == 0 {
            warn!("skipping partition size 0");
            continue;
        }
        let mut durations_ms = Vec::with_capacity(args.repetitions);
        let mut max_abs_diff = 0f32;
        for _ in 0..args.repetitions {
            let (out, ms) = time_ms(|| {
                paged_attention_v2(&query, &cache, &tables, &seq_lens, &cfg, partition_size)
            });
            let out = out?;
            durations_ms.push(ms);
            max_abs_diff = (out - &reference)?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_scalar::<f32>()?;
        }
        if max_abs_diff > 1e-3 {
            warn!(partition_size, max_abs_diff, "v2 diverges from v1");
        }
        results.push(BenchResult {
            test_name: TestName::V2(partition_size),
            durations_ms,
            max_abs_diff,
        });
    }

    print_usage(&cfg, results)
}
