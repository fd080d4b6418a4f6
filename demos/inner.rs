//! Partitioned inner product.
//!
//! Both vectors are split into `parts` regions laid out over the devices. An
//! outer task opens a join scope, spawns one partial product per part placed
//! next to its data, then sums the partial results.

use clap::Parser;
use shikumi::{
    ArrayId, BufferRegion, Config, Movement, Placement, Runtime, TaskContext, partition,
};

#[derive(Parser, Debug)]
#[command(name = "inner", about)]
struct Cli {
    /// Length of the vectors.
    #[arg(long, default_value_t = 3000)]
    len: usize,

    /// Number of partitions.
    #[arg(long, default_value_t = 10)]
    parts: usize,

    /// Number of CPU slots, defaults to the available parallelism.
    #[arg(long)]
    cpus: Option<usize>,

    /// Number of simulated GPU slots.
    #[arg(long, default_value_t = 0)]
    gpus: usize,

    /// Upper bound on the devices used, overrides `N_DEVICES`.
    #[arg(long)]
    devices: Option<usize>,

    /// Let task bodies move their data themselves.
    #[arg(long)]
    manual: bool,
}

/// Splits `len` doubles into `parts` regions of whole elements.
fn split(array: ArrayId, len: usize, parts: usize) -> Vec<BufferRegion> {
    partition(array, len, parts)
        .into_iter()
        .map(|region| BufferRegion::new(array, region.start * 8..region.end * 8))
        .collect()
}

fn doubles(ctx: &TaskContext<'_>, region: &BufferRegion) -> anyhow::Result<Vec<f64>> {
    // a no-op when the runtime already staged the region
    ctx.ensure_resident(region)?;

    Ok(ctx
        .read(region)?
        .chunks_exact(8)
        .map(|chunk| f64::from_le_bytes(chunk.try_into().unwrap_or_default()))
        .collect())
}

fn vector(len: usize, seed: u64) -> Vec<f64> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        })
        .collect()
}

fn bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let movement = if cli.manual {
        Movement::Manual
    } else {
        Movement::Automatic
    };

    let mut config = Config::default().gpus(cli.gpus).movement(movement).with_env();
    if let Some(cpus) = cli.cpus {
        config = config.cpus(cpus);
    }
    if let Some(devices) = cli.devices {
        config = config.max_devices(devices);
    }

    let runtime = Runtime::new(config)?;
    let devices: Vec<_> = runtime.devices().iter().map(|device| device.id).collect();

    let a = vector(cli.len, 1);
    let b = vector(cli.len, 2);
    let expected: f64 = a.iter().zip(&b).map(|(x, y)| x * y).sum();

    let a_parts = split(ArrayId(1), cli.len, cli.parts);
    let b_parts = split(ArrayId(2), cli.len, cli.parts);
    let partials = split(ArrayId(3), cli.parts, cli.parts);
    let result = BufferRegion::new(ArrayId(4), 0..8);

    for (i, (ra, rb)) in a_parts.iter().zip(&b_parts).enumerate() {
        let device = devices[i % devices.len()];
        runtime.place(ra, device, &bytes(&a[ra.start / 8..ra.end / 8]))?;
        runtime.place(rb, device, &bytes(&b[rb.start / 8..rb.end / 8]))?;
    }

    runtime.join(|scope| -> anyhow::Result<()> {
        let inner = scope
            .task()
            .name("inner_part")
            .writes(result)
            .run(move |ctx| {
                ctx.join(|scope| -> anyhow::Result<()> {
                    for i in 0..a_parts.len() {
                        let (ra, rb, out) = (a_parts[i], b_parts[i], partials[i]);

                        scope
                            .task()
                            .name(format!("inner_local[{i}]"))
                            .placement(Placement::Near(vec![ra, rb]))
                            .reads(ra)
                            .reads(rb)
                            .writes(out)
                            .run(move |ctx| {
                                let x = doubles(ctx, &ra)?;
                                let y = doubles(ctx, &rb)?;
                                let dot: f64 = x.iter().zip(&y).map(|(x, y)| x * y).sum();
                                ctx.write(&out, &dot.to_le_bytes())?;
                                Ok(())
                            })?;
                    }
                    Ok(())
                })??;

                // reduce sequentially
                let mut sum = 0.0;
                for region in &partials {
                    sum += doubles(ctx, region)?.iter().sum::<f64>();
                }

                ctx.write(&result, &sum.to_le_bytes())?;
                Ok(())
            })?;

        scope
            .task()
            .name("check")
            .depends_on(&inner)
            .reads(result)
            .run(move |ctx| {
                let got = doubles(ctx, &result)?[0];
                anyhow::ensure!(
                    (got - expected).abs() <= 1e-9 * expected.abs(),
                    "inner product mismatch: {got} != {expected}"
                );
                Ok(())
            })?;

        Ok(())
    })??;

    let stats = runtime.diagnostics().movement;
    eprintln!(
        "{:?} movement: {} copies, {} bytes",
        movement, stats.copies, stats.bytes
    );

    Ok(())
}
