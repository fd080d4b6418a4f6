//! Blocked Cholesky factorization over task spaces.
//!
//! The matrix is stored as `blocks x blocks` square tiles, each tile one
//! buffer region. Four task spaces drive the factorization, the diagonal
//! updates (`gemm1`), the tile factorizations (`subcholesky`), the
//! off-diagonal updates (`gemm2`) and the triangular solves (`solve`).

use clap::Parser;
use shikumi::{ArrayId, BufferRegion, Config, Runtime, TaskContext, TaskSpace};

#[derive(Parser, Debug)]
#[command(name = "cholesky", about)]
struct Cli {
    /// Number of tiles along each axis.
    #[arg(long, default_value_t = 4)]
    blocks: usize,

    /// Edge length of a tile.
    #[arg(long, default_value_t = 32)]
    block_size: usize,

    /// Number of CPU slots, defaults to the available parallelism.
    #[arg(long)]
    cpus: Option<usize>,

    /// Number of simulated GPU slots.
    #[arg(long, default_value_t = 0)]
    gpus: usize,

    /// Upper bound on the devices used, overrides `N_DEVICES`.
    #[arg(long)]
    devices: Option<usize>,
}

struct Tiles {
    nb: usize,
    bs: usize,
}

impl Tiles {
    fn region(&self, i: usize, j: usize) -> BufferRegion {
        let bytes = self.bs * self.bs * 8;
        let start = (i * self.nb + j) * bytes;
        BufferRegion::new(ArrayId(0), start..start + bytes)
    }
}

fn decode(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| f64::from_le_bytes(chunk.try_into().unwrap_or_default()))
        .collect()
}

fn encode(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn load(ctx: &TaskContext<'_>, region: &BufferRegion) -> anyhow::Result<Vec<f64>> {
    Ok(decode(&ctx.read(region)?))
}

/// Factorizes a tile in place, leaving `L` in the lower triangle.
fn potrf(a: &mut [f64], b: usize) -> anyhow::Result<()> {
    for j in 0..b {
        let d = a[j * b + j] - (0..j).map(|k| a[j * b + k].powi(2)).sum::<f64>();
        anyhow::ensure!(d > 0.0, "tile is not positive definite");
        a[j * b + j] = d.sqrt();

        for i in j + 1..b {
            let s: f64 = (0..j).map(|k| a[i * b + k] * a[j * b + k]).sum();
            a[i * b + j] = (a[i * b + j] - s) / a[j * b + j];
        }

        for k in j + 1..b {
            a[j * b + k] = 0.0;
        }
    }

    Ok(())
}

/// Solves `X * L^T = B` in place of `B`.
fn trsm(l: &[f64], x: &mut [f64], b: usize) {
    for r in 0..b {
        for c in 0..b {
            let s: f64 = (0..c).map(|k| x[r * b + k] * l[c * b + k]).sum();
            x[r * b + c] = (x[r * b + c] - s) / l[c * b + c];
        }
    }
}

/// `out -= lhs * rhs^T`
fn gemm(out: &mut [f64], lhs: &[f64], rhs: &[f64], b: usize) {
    for r in 0..b {
        for c in 0..b {
            let s: f64 = (0..b).map(|k| lhs[r * b + k] * rhs[c * b + k]).sum();
            out[r * b + c] -= s;
        }
    }
}

/// Symmetric positive definite test matrix, `M * M^T + n * I`.
fn matrix(n: usize) -> Vec<f64> {
    let mut state = 0x9E37_79B9_7F4A_7C15_u64;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 11) as f64 / (1u64 << 53) as f64
    };

    let m: Vec<f64> = (0..n * n).map(|_| next()).collect();
    let mut a = vec![0.0; n * n];

    for i in 0..n {
        for j in 0..n {
            a[i * n + j] = (0..n).map(|k| m[i * n + k] * m[j * n + k]).sum();
        }
        a[i * n + i] += n as f64;
    }

    a
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::default().gpus(cli.gpus).with_env();
    if let Some(cpus) = cli.cpus {
        config = config.cpus(cpus);
    }
    if let Some(devices) = cli.devices {
        config = config.max_devices(devices);
    }

    let runtime = Runtime::new(config)?;
    let tiles = Tiles {
        nb: cli.blocks,
        bs: cli.block_size,
    };
    let (nb, bs) = (tiles.nb, tiles.bs);
    let n = nb * bs;
    let a = matrix(n);

    // lay the tiles out round-robin over the devices
    for i in 0..nb {
        for j in 0..=i {
            let tile: Vec<f64> = (0..bs * bs)
                .map(|e| a[(i * bs + e / bs) * n + j * bs + e % bs])
                .collect();
            let device = runtime.devices()[(i * nb + j) % runtime.devices().len()].id;
            runtime.place(&tiles.region(i, j), device, &encode(&tile))?;
        }
    }

    let gemm1 = TaskSpace::new("gemm1");
    let subcholesky = TaskSpace::new("subcholesky");
    let gemm2 = TaskSpace::new("gemm2");
    let solve = TaskSpace::new("solve");

    runtime.join(|scope| -> anyhow::Result<()> {
        for j in 0..nb {
            let diag = tiles.region(j, j);

            for k in 0..j {
                let rhs = tiles.region(j, k);

                // updates of the same tile are chained to avoid lost writes
                scope
                    .task()
                    .id(&gemm1.get((j, k))?)
                    .depends_on((solve.get((j, k))?, gemm1.resolve((j, 0..k))))
                    .reads(rhs)
                    .updates(diag)
                    .run(move |ctx| {
                        let mut out = load(ctx, &diag)?;
                        let rhs = load(ctx, &rhs)?;
                        gemm(&mut out, &rhs, &rhs, bs);
                        ctx.write(&diag, &encode(&out))?;
                        Ok(())
                    })?;
            }

            scope
                .task()
                .id(&subcholesky.get(j)?)
                .depends_on(gemm1.resolve((j, 0..j)))
                .updates(diag)
                .run(move |ctx| {
                    let mut tile = load(ctx, &diag)?;
                    potrf(&mut tile, bs)?;
                    ctx.write(&diag, &encode(&tile))?;
                    Ok(())
                })?;

            for i in j + 1..nb {
                let out = tiles.region(i, j);

                for k in 0..j {
                    let lhs = tiles.region(i, k);
                    let rhs = tiles.region(j, k);

                    scope
                        .task()
                        .id(&gemm2.get((i, j, k))?)
                        .depends_on((
                            solve.get((j, k))?,
                            solve.get((i, k))?,
                            gemm2.resolve((i, j, 0..k)),
                        ))
                        .reads(lhs)
                        .reads(rhs)
                        .updates(out)
                        .run(move |ctx| {
                            let mut tile = load(ctx, &out)?;
                            gemm(&mut tile, &load(ctx, &lhs)?, &load(ctx, &rhs)?, bs);
                            ctx.write(&out, &encode(&tile))?;
                            Ok(())
                        })?;
                }

                scope
                    .task()
                    .id(&solve.get((i, j))?)
                    .depends_on((gemm2.resolve((i, j, 0..j)), subcholesky.get(j)?))
                    .reads(diag)
                    .updates(out)
                    .run(move |ctx| {
                        let l = load(ctx, &diag)?;
                        let mut tile = load(ctx, &out)?;
                        trsm(&l, &mut tile, bs);
                        ctx.write(&out, &encode(&tile))?;
                        Ok(())
                    })?;
            }
        }

        Ok(())
    })??;

    // L * L^T must reproduce the lower triangle of A
    let mut l = vec![0.0; n * n];
    for i in 0..nb {
        for j in 0..=i {
            let tile = decode(&runtime.read(&tiles.region(i, j))?);
            for e in 0..bs * bs {
                l[(i * bs + e / bs) * n + j * bs + e % bs] = tile[e];
            }
        }
    }

    let mut error = 0.0_f64;
    for i in 0..n {
        for j in 0..=i {
            let v: f64 = (0..=j).map(|k| l[i * n + k] * l[j * n + k]).sum();
            error = error.max((a[i * n + j] - v).abs());
        }
    }

    let diagnostics = runtime.diagnostics();
    eprintln!(
        "{} tasks, {} copies ({} bytes), max error {error:e}",
        diagnostics.records.len(),
        diagnostics.movement.copies,
        diagnostics.movement.bytes,
    );

    anyhow::ensure!(error < 1e-8 * n as f64, "factorization is inaccurate: {error}");
    Ok(())
}
