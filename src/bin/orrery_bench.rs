//! orrery-bench: load generator for an in-process gateway.
//!
//! Measures cold vs warm latency for one subject, then runs a concurrent
//! load test with simulated users and reports latency percentiles and the
//! gateway's own counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Serialize;
use tracing::info;

use orrery::config::{Config, LogFormat};
use orrery::{
    BirthData, CalculationError, Calculator, ChartGateway, ComputeRequest, MeanEphemeris,
    OrreryBuilder, StatsSnapshot,
};

/// Load generator for the orrery serving layer.
#[derive(Parser)]
#[command(name = "orrery-bench")]
#[command(version = orrery::PKG_VERSION)]
#[command(about = "Benchmark the orrery cache, single-flight and admission layers")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Concurrent simulated users.
    #[arg(short, long, default_value_t = 10)]
    users: usize,

    /// Requests sent by each user.
    #[arg(short, long, default_value_t = 20)]
    requests: usize,

    /// Distinct subjects the users draw from (lower = more cache hits).
    #[arg(short, long, default_value_t = 5)]
    distinct: usize,

    /// Extra time each computation takes, in milliseconds.
    #[arg(long, default_value_t = 50)]
    delay_ms: u64,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

/// Wraps a calculator with a fixed delay to mimic a real ephemeris engine.
struct Delayed<C> {
    inner: C,
    delay: Duration,
}

impl<C: Calculator> Calculator for Delayed<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn compute(&self, request: &ComputeRequest) -> Result<serde_json::Value, CalculationError> {
        std::thread::sleep(self.delay);
        self.inner.compute(request)
    }
}

#[derive(Debug, Serialize)]
struct LatencySummary {
    requests: usize,
    errors: usize,
    avg_ms: f64,
    min_ms: f64,
    max_ms: f64,
    median_ms: f64,
    p95_ms: f64,
    requests_per_second: f64,
}

impl LatencySummary {
    fn from_samples(mut samples: Vec<Duration>, errors: usize, wall: Duration) -> Self {
        samples.sort();
        let ms = |d: &Duration| d.as_secs_f64() * 1000.0;
        let n = samples.len();
        let pick = |q: f64| {
            samples
                .get(((n as f64 * q) as usize).min(n.saturating_sub(1)))
                .map_or(0.0, ms)
        };
        Self {
            requests: n,
            errors,
            avg_ms: if n == 0 {
                0.0
            } else {
                samples.iter().map(ms).sum::<f64>() / n as f64
            },
            min_ms: samples.first().map_or(0.0, ms),
            max_ms: samples.last().map_or(0.0, ms),
            median_ms: pick(0.5),
            p95_ms: pick(0.95),
            requests_per_second: if wall.is_zero() {
                0.0
            } else {
                n as f64 / wall.as_secs_f64()
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct CacheSummary {
    cold_ms: f64,
    avg_warm_ms: f64,
    speedup: f64,
}

#[derive(Debug, Serialize)]
struct Report {
    cache: CacheSummary,
    load: LatencySummary,
    stats: StatsSnapshot,
    hit_ratio: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    init_tracing(&config);

    let calculator = Delayed {
        inner: MeanEphemeris::new(),
        delay: Duration::from_millis(args.delay_ms),
    };
    let gateway = Arc::new(
        OrreryBuilder::from_config(&config)
            .calculator(calculator)
            .build()?,
    );

    info!(
        version = orrery::PKG_VERSION,
        users = args.users,
        requests = args.requests,
        "benchmark starting"
    );

    let cache = cache_test(&gateway).await?;
    let load = load_test(&gateway, args.users, args.requests, args.distinct.max(1)).await;
    let stats = gateway.stats();
    let report = Report {
        cache,
        load,
        hit_ratio: stats.hit_ratio(),
        stats,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    gateway.shutdown().await;
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn subject(i: usize) -> BirthData {
    BirthData::new(format!("Bench {i}"), 1990, 6, 15, 12, (i % 60) as u32)
        .place("London", "GB")
        .coordinates(51.5074, -0.1278)
}

async fn cache_test(gateway: &ChartGateway) -> orrery::Result<CacheSummary> {
    let request = ComputeRequest::subject(
        BirthData::new("Cache Test", 1990, 6, 15, 12, 0).place("London", "GB"),
    );

    let start = Instant::now();
    gateway.serve(&request, "bench-cache").await?;
    let cold = start.elapsed();

    let mut warm = Duration::ZERO;
    for _ in 0..5 {
        let start = Instant::now();
        gateway.serve(&request, "bench-cache").await?;
        warm += start.elapsed();
    }
    let avg_warm = warm / 5;

    Ok(CacheSummary {
        cold_ms: cold.as_secs_f64() * 1000.0,
        avg_warm_ms: avg_warm.as_secs_f64() * 1000.0,
        speedup: if avg_warm.is_zero() {
            0.0
        } else {
            cold.as_secs_f64() / avg_warm.as_secs_f64()
        },
    })
}

async fn load_test(
    gateway: &Arc<ChartGateway>,
    users: usize,
    requests: usize,
    distinct: usize,
) -> LatencySummary {
    let start = Instant::now();
    let tasks: Vec<_> = (0..users)
        .map(|user| {
            let gateway = Arc::clone(gateway);
            tokio::spawn(async move {
                let client = format!("user-{user}");
                let mut samples = Vec::with_capacity(requests);
                let mut errors = 0;
                for i in 0..requests {
                    let request = ComputeRequest::subject(subject((user + i) % distinct));
                    let started = Instant::now();
                    if gateway.serve(&request, &client).await.is_err() {
                        errors += 1;
                    }
                    samples.push(started.elapsed());
                }
                (samples, errors)
            })
        })
        .collect();

    let mut samples = Vec::with_capacity(users * requests);
    let mut errors = 0;
    for task in tasks {
        if let Ok((s, e)) = task.await {
            samples.extend(s);
            errors += e;
        }
    }
    LatencySummary::from_samples(samples, errors, start.elapsed())
}

fn print_report(report: &Report) {
    let c = &report.cache;
    println!("cache");
    println!("  cold:     {:>9.3} ms", c.cold_ms);
    println!("  warm avg: {:>9.3} ms", c.avg_warm_ms);
    println!("  speedup:  {:>9.1}x", c.speedup);

    let l = &report.load;
    println!("load");
    println!("  requests: {:>9} ({} errors)", l.requests, l.errors);
    println!("  avg:      {:>9.3} ms", l.avg_ms);
    println!("  min:      {:>9.3} ms", l.min_ms);
    println!("  median:   {:>9.3} ms", l.median_ms);
    println!("  p95:      {:>9.3} ms", l.p95_ms);
    println!("  max:      {:>9.3} ms", l.max_ms);
    println!("  rps:      {:>9.1}", l.requests_per_second);

    let s = &report.stats;
    println!("gateway");
    println!("  l1 hits {} / l2 hits {} / computed {}", s.l1_hits, s.l2_hits, s.computed);
    println!("  calculator runs {}, coalesced {}", s.computations, s.coalesced);
    println!("  rate limited {}, saturated {}", s.rate_limited, s.executor_saturated);
    println!("  hit ratio {:.1}%", report.hit_ratio * 100.0);
}
