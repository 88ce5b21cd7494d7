//! Open-loop load generator
//!
//! Drives a Redis-protocol (or memcache-text) server with a scheduled
//! request rate per connection. Keys are drawn from a uniform, normal
//! or zipfian distribution; the command template may reference the
//! generated key through the `__key__` placeholder.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{error, info};

#[derive(Parser, Debug, Clone)]
#[command(name = "shoal-bench", about = "Open-loop load generator")]
struct Args {
    /// server hostname/ip
    #[arg(long, default_value = "localhost")]
    h: String,

    /// Server port
    #[arg(long, default_value_t = 6379)]
    p: u16,

    /// Number of connections per thread
    #[arg(long, default_value_t = 20)]
    c: u32,

    /// Number of requests to send per connection
    #[arg(long, default_value_t = 1000)]
    n: u32,

    /// Value size in bytes
    #[arg(long, default_value_t = 16)]
    d: u32,

    /// QPS schedule at which the generator sends requests to the server
    #[arg(long, default_value_t = 20)]
    qps: u32,

    /// Min value for keys used
    #[arg(long, default_value_t = 0)]
    key_minimum: u64,

    /// Max value for keys used
    #[arg(long, default_value_t = 50_000_000)]
    key_maximum: u64,

    /// keys prefix
    #[arg(long, default_value = "key:")]
    key_prefix: String,

    /// U for uniform, N for normal, Z for zipfian
    #[arg(long, default_value = "U")]
    key_dist: String,

    /// zipfian alpha parameter
    #[arg(long, default_value_t = 0.99)]
    zipf_alpha: f64,

    /// Standard deviation of the normal key distribution (0 derives one
    /// from the key range)
    #[arg(long, default_value_t = 0)]
    key_stddev: u64,

    /// A seed for random data generation
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Set:Get ratio
    #[arg(long, default_value = "1:10")]
    ratio: String,

    /// custom command with __key__ placeholder for keys
    #[arg(long, default_value = "")]
    command: String,

    /// protocol can be empty (for RESP) or memcache_text
    #[arg(long = "P", default_value = "")]
    protocol: String,
}

/// Key index generator over `[min, max]`
enum KeyDist {
    Uniform,
    Normal { mean: f64, stddev: f64 },
    Zipf { alpha: f64 },
}

impl KeyDist {
    fn parse(args: &Args) -> Result<Self> {
        match args.key_dist.as_str() {
            "U" => Ok(KeyDist::Uniform),
            "N" => {
                let span = (args.key_maximum - args.key_minimum) as f64;
                let stddev = if args.key_stddev > 0 {
                    args.key_stddev as f64
                } else {
                    span / 6.0
                };
                Ok(KeyDist::Normal { mean: args.key_minimum as f64 + span / 2.0, stddev })
            }
            "Z" => Ok(KeyDist::Zipf { alpha: args.zipf_alpha }),
            other => bail!("unknown key distribution {other}, use U, N or Z"),
        }
    }

    fn sample(&self, rng: &mut SmallRng, min: u64, max: u64) -> u64 {
        let span = max.saturating_sub(min).max(1);
        match self {
            KeyDist::Uniform => rng.gen_range(min..=max),
            KeyDist::Normal { mean, stddev } => {
                // Box-Muller transform
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                let value = mean + z * stddev;
                (value.round() as i64).clamp(min as i64, max as i64) as u64
            }
            KeyDist::Zipf { alpha } => {
                // Inverse transform over the continuous x^-alpha density
                // on [1, n]; a close, loop-free zipf approximation
                let n = span as f64 + 1.0;
                let exp = 1.0 - alpha;
                let u: f64 = rng.gen_range(0.0..1.0);
                let x = (1.0 + u * (n.powf(exp) - 1.0)).powf(1.0 / exp);
                min + ((x as u64).saturating_sub(1)).min(span)
            }
        }
    }
}

/// SET:GET weights of the default workload
fn parse_ratio(text: &str) -> Result<(u32, u32)> {
    let (set, get) = text
        .split_once(':')
        .context("ratio must look like SET:GET, e.g. 1:10")?;
    Ok((set.parse()?, get.parse()?))
}

fn resp_command(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        out.extend_from_slice(part);
        out.extend_from_slice(b"\r\n");
    }
    out
}

struct Workload {
    args: Args,
    dist: KeyDist,
    set_weight: u32,
    get_weight: u32,
    value: Vec<u8>,
}

impl Workload {
    fn new(args: Args) -> Result<Self> {
        let dist = KeyDist::parse(&args)?;
        let (set_weight, get_weight) = parse_ratio(&args.ratio)?;
        let value = vec![b'x'; args.d as usize];
        Ok(Self { args, dist, set_weight, get_weight, value })
    }

    fn next_key(&self, rng: &mut SmallRng) -> String {
        let index = self
            .dist
            .sample(rng, self.args.key_minimum, self.args.key_maximum);
        format!("{}{}", self.args.key_prefix, index)
    }

    /// Build the next request payload
    fn next_request(&self, rng: &mut SmallRng) -> Vec<u8> {
        let key = self.next_key(rng);
        if !self.args.command.is_empty() {
            let rendered = self.args.command.replace("__key__", &key);
            let parts: Vec<&[u8]> = rendered
                .split_whitespace()
                .map(|p| p.as_bytes())
                .collect();
            return resp_command(&parts);
        }
        let is_set = rng.gen_ratio(self.set_weight, self.set_weight + self.get_weight);
        if self.args.protocol == "memcache_text" {
            if is_set {
                let mut out =
                    format!("set {} 0 0 {}\r\n", key, self.value.len()).into_bytes();
                out.extend_from_slice(&self.value);
                out.extend_from_slice(b"\r\n");
                out
            } else {
                format!("get {}\r\n", key).into_bytes()
            }
        } else if is_set {
            resp_command(&[b"SET", key.as_bytes(), &self.value])
        } else {
            resp_command(&[b"GET", key.as_bytes()])
        }
    }
}

#[derive(Default)]
struct ConnStats {
    sent: u64,
    errors: u64,
    latencies_us: Vec<u64>,
}

async fn drive_connection(workload: &Workload, conn_id: u32) -> Result<ConnStats> {
    let address = format!("{}:{}", workload.args.h, workload.args.p);
    let mut stream = TcpStream::connect(&address)
        .await
        .with_context(|| format!("connecting to {address}"))?;
    let mut rng = SmallRng::seed_from_u64(workload.args.seed.wrapping_add(conn_id as u64));
    let mut stats = ConnStats::default();
    let mut reply = vec![0u8; 16 * 1024];

    // Open-loop pacing: one request per tick regardless of reply time
    let period = Duration::from_secs_f64(1.0 / workload.args.qps.max(1) as f64);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    for _ in 0..workload.args.n {
        ticker.tick().await;
        let request = workload.next_request(&mut rng);
        let started = Instant::now();
        stream.write_all(&request).await?;
        match stream.read(&mut reply).await {
            Ok(0) => bail!("server closed the connection"),
            Ok(_) => {
                stats
                    .latencies_us
                    .push(started.elapsed().as_micros() as u64);
            }
            Err(e) => {
                stats.errors += 1;
                error!(conn_id, "read failed: {e}");
            }
        }
        stats.sent += 1;
    }
    Ok(stats)
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[rank]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    if !args.protocol.is_empty() && args.protocol != "memcache_text" {
        bail!("protocol can be empty (for RESP) or memcache_text");
    }
    let workload = std::sync::Arc::new(Workload::new(args.clone())?);
    info!(
        connections = args.c,
        qps = args.qps,
        requests = args.n,
        "starting load"
    );

    let started = Instant::now();
    let mut tasks = Vec::new();
    for conn_id in 0..args.c {
        let workload = workload.clone();
        tasks.push(tokio::spawn(async move {
            drive_connection(&workload, conn_id).await
        }));
    }

    let mut sent = 0u64;
    let mut errors = 0u64;
    let mut latencies = Vec::new();
    for task in tasks {
        match task.await? {
            Ok(stats) => {
                sent += stats.sent;
                errors += stats.errors;
                latencies.extend(stats.latencies_us);
            }
            Err(e) => {
                errors += 1;
                error!("connection failed: {e:#}");
            }
        }
    }
    let elapsed = started.elapsed();

    latencies.sort_unstable();
    let total_us: u64 = latencies.iter().sum();
    let avg_us = if latencies.is_empty() { 0 } else { total_us / latencies.len() as u64 };
    info!(
        sent,
        errors,
        secs = elapsed.as_secs_f64(),
        rps = sent as f64 / elapsed.as_secs_f64(),
        avg_us,
        p50_us = percentile(&latencies, 0.50),
        p99_us = percentile(&latencies, 0.99),
        "load complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_args() -> Args {
        Args::parse_from(["shoal-bench"])
    }

    #[test]
    fn test_flag_defaults() {
        let args = default_args();
        assert_eq!(args.h, "localhost");
        assert_eq!(args.p, 6379);
        assert_eq!(args.c, 20);
        assert_eq!(args.n, 1000);
        assert_eq!(args.d, 16);
        assert_eq!(args.qps, 20);
        assert_eq!(args.key_minimum, 0);
        assert_eq!(args.key_maximum, 50_000_000);
        assert_eq!(args.key_prefix, "key:");
        assert_eq!(args.key_dist, "U");
        assert_eq!(args.zipf_alpha, 0.99);
        assert_eq!(args.key_stddev, 0);
        assert_eq!(args.seed, 42);
        assert_eq!(args.ratio, "1:10");
        assert_eq!(args.command, "");
        assert_eq!(args.protocol, "");
    }

    #[test]
    fn test_resp_encoding() {
        let cmd = resp_command(&[b"GET", b"key:1"]);
        assert_eq!(cmd, b"*2\r\n$3\r\nGET\r\n$5\r\nkey:1\r\n");
    }

    #[test]
    fn test_command_template() {
        let mut args = default_args();
        args.command = "HSET __key__ field value".to_string();
        args.key_dist = "U".to_string();
        let workload = Workload::new(args).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let request = workload.next_request(&mut rng);
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("*4\r\n$4\r\nHSET\r\n"));
        assert!(text.contains("key:"));
        assert!(!text.contains("__key__"));
    }

    #[test]
    fn test_key_distributions_stay_in_range() {
        let mut args = default_args();
        args.key_minimum = 100;
        args.key_maximum = 200;
        let mut rng = SmallRng::seed_from_u64(7);
        for dist_name in ["U", "N", "Z"] {
            args.key_dist = dist_name.to_string();
            let dist = KeyDist::parse(&args).unwrap();
            for _ in 0..1000 {
                let k = dist.sample(&mut rng, args.key_minimum, args.key_maximum);
                assert!(
                    (args.key_minimum..=args.key_maximum).contains(&k),
                    "{dist_name} produced {k}"
                );
            }
        }
    }

    #[test]
    fn test_zipf_skews_low() {
        let args = default_args();
        let dist = KeyDist::Zipf { alpha: args.zipf_alpha };
        let mut rng = SmallRng::seed_from_u64(3);
        let low_hits = (0..10_000)
            .filter(|_| dist.sample(&mut rng, 0, 9999) < 1000)
            .count();
        // The head of the distribution dominates
        assert!(low_hits > 5000, "low hits {low_hits}");
    }

    #[test]
    fn test_memcache_text_shapes() {
        let mut args = default_args();
        args.protocol = "memcache_text".to_string();
        args.ratio = "1:0".to_string(); // sets only
        let workload = Workload::new(args).unwrap();
        let mut rng = SmallRng::seed_from_u64(5);
        let request = workload.next_request(&mut rng);
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("set key:"));
        assert!(text.ends_with("\r\n"));
        assert!(text.contains(" 0 0 16\r\n"));
    }

    #[test]
    fn test_ratio_parsing() {
        assert_eq!(parse_ratio("1:10").unwrap(), (1, 10));
        assert_eq!(parse_ratio("3:7").unwrap(), (3, 7));
        assert!(parse_ratio("bogus").is_err());
    }
}
