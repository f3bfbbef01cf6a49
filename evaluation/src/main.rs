use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str;

use anyhow::{bail, Context, Result};
use clap::{Arg, ArgMatches, Command};
use rand::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use f2maxload::{
    word_count, BitKey, Distribution, KeySet, KeySource, TrialConfig, TrialReport, TrialRunner,
};

// Largest fixed key set materialized in memory, in 64-bit words (8 GiB)
const MAX_FIXED_WORDS: usize = 1 << 30;

struct Row<'a> {
    report: &'a TrialReport,
    index: usize,
}

impl fmt::Display for Row<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.report.tail[self.index];
        write!(
            f,
            "{} {} {} {} {} {} {:.6}",
            self.report.u,
            self.report.l,
            t.r,
            t.threshold,
            t.exceed_count,
            self.report.completed,
            t.probability
        )
    }
}

// Writes keys drawn from a distribution as hex literals, one per line
fn generate(args: &ArgMatches) -> Result<()> {
    let bits = parse::<usize>(args, "bits")?;
    let count = parse::<usize>(args, "count")?;
    let seed = parse::<u64>(args, "seed")?;
    let distribution: Distribution = parse(args, "distribution")?;
    let output = value(args, "output")?;

    distribution.validate(bits)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut writer = BufWriter::new(
        File::create(output).with_context(|| format!("cannot create {output}"))?,
    );
    for _ in 0..count {
        let key = distribution.sample(bits, &mut rng)?;
        writeln!(writer, "{}", key)?;
    }
    writer.flush()?;

    info!(bits, count, %distribution, output, "keys written");
    Ok(())
}

// Runs the u × l grid and prints one tail estimate per r
fn run(args: &ArgMatches) -> Result<()> {
    let us = parse_list::<usize>(args, "bits")?;
    let ls = parse_list::<usize>(args, "buckets")?;
    let rs = parse_list::<f64>(args, "ratios")?;
    let trials = parse::<usize>(args, "trials")?;
    let capacity = parse::<usize>(args, "capacity")?;
    let chunk_size = parse::<usize>(args, "chunk-size")?;
    let seed = parse::<u64>(args, "seed")?;
    let m_factor = parse::<f64>(args, "m-factor")?;
    let distribution: Distribution = parse(args, "distribution")?;
    let regenerate = args.is_present("regenerate");
    let input = args.value_of("input");
    let output = args.value_of("output");

    if input.is_some() && regenerate {
        bail!("--input and --regenerate are mutually exclusive");
    }
    if !(m_factor.is_finite() && m_factor > 0.0) {
        bail!("m-factor must be positive, got {m_factor}");
    }

    println!("u l r threshold exceed completed p_hat");
    for &u in &us {
        let file_keys = match input {
            Some(path) => Some(load_keys(path, u)?),
            None => None,
        };

        for &l in &ls {
            let config = TrialConfig::new(u, l, trials, capacity)
                .with_chunk_size(chunk_size)
                .with_seed(seed);
            let runner = TrialRunner::new(config)?;

            let source = match &file_keys {
                Some(keys) => KeySource::Fixed(keys.clone()),
                None => {
                    let count = key_count(m_factor, u, l, regenerate)?;
                    if regenerate {
                        KeySource::Generated {
                            distribution,
                            count,
                        }
                    } else {
                        let set_seed = seed ^ (((u as u64) << 32) | l as u64);
                        let mut rng = StdRng::seed_from_u64(set_seed);
                        KeySource::Fixed(KeySet::generate(&distribution, u, count, &mut rng)?)
                    }
                }
            };

            let report = runner.run(&source, &rs)?;
            for index in 0..report.tail.len() {
                println!("{}", Row { report: &report, index });
            }

            if let Some(dir) = output {
                save_report(&report, dir)?;
            }
        }
    }
    Ok(())
}

// Keys per trial for a (u, l) cell: m_factor · 2^l
fn key_count(m_factor: f64, u: usize, l: usize, regenerate: bool) -> Result<usize> {
    let count = (m_factor * 2f64.powi(l as i32)).round();
    if !(count < usize::MAX as f64) {
        bail!("m-factor {m_factor} with l={l} gives more keys than fit in memory");
    }
    let count = count as usize;
    if !regenerate {
        let words = count.checked_mul(word_count(u).max(1));
        if words.map_or(true, |w| w > MAX_FIXED_WORDS) {
            bail!(
                "a fixed set of {count} keys of {u} bits is too large for u={u}, l={l}; \
                 use --regenerate to stream keys per trial"
            );
        }
    }
    Ok(count)
}

// Loads one hex key per line; blank lines and lines starting with '#' are skipped
fn load_keys(filepath: &str, bits: usize) -> Result<KeySet> {
    let reader = BufReader::new(
        File::open(filepath).with_context(|| format!("cannot open {filepath}"))?,
    );
    let mut keys = KeySet::new(bits);

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let key = BitKey::parse_hex(line, bits)
            .with_context(|| format!("{filepath}:{}", n + 1))?;
        keys.push_key(&key)?;
    }

    info!(path = filepath, bits, keys = keys.len(), "keys loaded");
    Ok(keys)
}

// Saves per-trial max-loads as text and the whole report as bincode
fn save_report(report: &TrialReport, output: &str) -> Result<()> {
    let dir = Path::new(output);
    std::fs::create_dir_all(dir)?;

    let name = format!("maxload-u{}-l{}", report.u, report.l);
    let mut writer = BufWriter::new(File::create(dir.join(format!("{name}.dat")))?);
    for (trial, max_load) in report.max_loads.iter().enumerate() {
        match max_load {
            Some(m) => writeln!(writer, "{} {}", trial, m)?,
            None => writeln!(writer, "{} -", trial)?,
        }
    }
    writer.flush()?;

    report.save(BufWriter::new(File::create(dir.join(format!("{name}.bin")))?))?;
    Ok(())
}

fn value<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.value_of(name)
        .with_context(|| format!("missing --{name}"))
}

fn parse<T>(args: &ArgMatches, name: &str) -> Result<T>
where
    T: str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = value(args, name)?;
    raw.parse::<T>()
        .with_context(|| format!("invalid --{name} '{raw}'"))
}

fn parse_list<T>(args: &ArgMatches, name: &str) -> Result<Vec<T>>
where
    T: str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = value(args, name)?;
    raw.split(',')
        .map(|item| {
            item.trim()
                .parse::<T>()
                .with_context(|| format!("invalid --{name} entry '{item}'"))
        })
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let gen_cmd = Command::new("gen")
        .about("generate random keys as hex literals")
        .arg(
            Arg::new("bits")
                .short('u')
                .long("bits")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("count")
                .short('c')
                .long("count")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::new("distribution")
                .short('d')
                .long("distribution")
                .takes_value(true)
                .default_value("uniform"),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .required(true)
                .takes_value(true),
        );

    let run_cmd = Command::new("run")
        .about("estimate max-load tail probabilities over a u × l × r grid")
        .arg(
            Arg::new("bits")
                .short('u')
                .long("bits")
                .required(true)
                .takes_value(true)
                .help("comma separated key widths"),
        )
        .arg(
            Arg::new("buckets")
                .short('l')
                .long("buckets")
                .required(true)
                .takes_value(true)
                .help("comma separated bucket id widths"),
        )
        .arg(
            Arg::new("ratios")
                .short('r')
                .long("ratios")
                .takes_value(true)
                .default_value("1,2,4"),
        )
        .arg(
            Arg::new("trials")
                .short('t')
                .long("trials")
                .takes_value(true)
                .default_value("100"),
        )
        .arg(
            Arg::new("capacity")
                .short('k')
                .long("capacity")
                .takes_value(true)
                .default_value("50000"),
        )
        .arg(
            Arg::new("chunk-size")
                .long("chunk-size")
                .takes_value(true)
                .default_value("16384"),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .takes_value(true)
                .default_value("0"),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .takes_value(true)
                .help("hex key file used for every trial"),
        )
        .arg(
            Arg::new("distribution")
                .short('d')
                .long("distribution")
                .takes_value(true)
                .default_value("uniform"),
        )
        .arg(
            Arg::new("m-factor")
                .short('m')
                .long("m-factor")
                .takes_value(true)
                .default_value("1")
                .help("keys per trial as a multiple of 2^l"),
        )
        .arg(
            Arg::new("regenerate")
                .long("regenerate")
                .help("draw fresh keys in every trial"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .takes_value(true)
                .help("directory for per-trial max-loads and reports"),
        );

    let matches = Command::new("evl")
        .about("run max-load experiments for linear F2 hashing")
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .takes_value(true),
        )
        .subcommand(gen_cmd)
        .subcommand(run_cmd)
        .get_matches();

    if let Some(jobs) = matches.value_of("jobs") {
        let jobs = jobs
            .parse::<usize>()
            .with_context(|| format!("invalid --jobs '{jobs}'"))?;
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()?;
    }

    match matches.subcommand() {
        Some(("gen", sub_matches)) => generate(sub_matches),
        Some(("run", sub_matches)) => run(sub_matches),
        _ => bail!("expected a subcommand: gen or run"),
    }
}
