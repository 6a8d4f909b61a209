use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use alea::cli::RunToymcArgs;
use alea::io::config::{load_yaml, save_threshold};
use alea::io::results::read_output;
use alea::sensitivity::{neyman_threshold, summarize, write_summary_json, write_summary_tsv};
use alea::submitter::SubmitterConfig;
use alea::{LocalSubmitter, Runner, Submit, Submitter};

#[derive(Parser, Debug)]
#[command(name = "alea")]
#[command(about = "Likelihood fits, confidence intervals and toy Monte-Carlo studies", long_about = None)]
struct Cli {
    #[arg(long, global = true, help = "Log filter, e.g. info or alea=debug (default: RUST_LOG or info)")]
    loglevel: Option<String>,
    #[arg(long, global = true)]
    threads: Option<usize>,
    #[arg(long, global = true)]
    no_progress: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate toys, fit every hypothesis and write the results
    RunToymc(RunToymcArgs),
    /// Expand a submitter config into jobs and run them
    Submit(SubmitArgs),
    /// Limit bands, discovery power and Neyman thresholds from runner outputs
    Summarize(SummarizeArgs),
}

#[derive(Args, Debug)]
struct SubmitArgs {
    config: PathBuf,
    #[arg(long)]
    computation: Option<String>,
    #[arg(long)]
    outputfolder: Option<PathBuf>,
    #[arg(long)]
    debug: bool,
}

#[derive(Args, Debug)]
struct SummarizeArgs {
    #[arg(required = true)]
    outputs: Vec<PathBuf>,
    #[arg(long, default_value = "mu")]
    poi: String,
    #[arg(long, default_value_t = 0.9)]
    confidence_level: f64,
    #[arg(long, help = "Write toy-based critical values usable as limit_threshold")]
    threshold_out: Option<PathBuf>,
    #[arg(long)]
    tsv_out: Option<PathBuf>,
    #[arg(long)]
    json_out: Option<PathBuf>,
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(l) => EnvFilter::try_new(l).map_err(|e| anyhow!("invalid --loglevel {l:?}: {e}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(n_threads) = cli.threads {
        if n_threads == 0 {
            bail!("--threads must be >= 1");
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
            .map_err(|e| anyhow!("failed to configure Rayon global thread pool: {e}"))?;
    }

    match &cli.command {
        Command::RunToymc(args) => {
            init_logging(cli.loglevel.as_deref())?;
            let config = args.to_config()?;
            let output_filename = config.output_filename.clone();
            let toydata_filename = config.toydata_filename.clone();
            let runner = Runner::new(config)?.with_progress(!cli.no_progress);
            match runner.run()? {
                Some(_) => {
                    if let Some(out) = output_filename {
                        println!("Output: {}", out.display());
                    }
                }
                None => {
                    if let Some(toy) = toydata_filename {
                        println!("Toydata: {}", toy.display());
                    }
                }
            }
        }
        Command::Submit(args) => {
            let mut config: SubmitterConfig = load_yaml(&args.config)
                .with_context(|| format!("failed to load submitter config {:?}", args.config))?;
            if let Some(c) = &args.computation {
                config.computation = c.clone();
            }
            if let Some(o) = &args.outputfolder {
                config.outputfolder = Some(o.clone());
            }
            config.debug |= args.debug;
            init_logging(Some(cli.loglevel.as_deref().unwrap_or(&config.loglevel)))?;
            let submitter = Submitter::new(config, Some(&args.config))?;
            let local = LocalSubmitter {
                progress: !cli.no_progress,
            };
            local.submit(&submitter)?;
            println!("Outputs in: {}", submitter.outputfolder.display());
        }
        Command::Summarize(args) => {
            init_logging(cli.loglevel.as_deref())?;
            let outputs = args
                .outputs
                .iter()
                .map(|p| read_output(p).with_context(|| format!("failed to read runner output {p:?}")))
                .collect::<Result<Vec<_>>>()?;
            let rows = summarize(&outputs, &args.poi)?;
            println!("{}\tn_toys\tul_median\tul_-1sigma\tul_+1sigma\tdiscovery_power_3sigma", args.poi);
            for r in &rows {
                let (m, lo, hi) = r
                    .upper_limit
                    .map(|b| (b.median, b.minus_1sigma, b.plus_1sigma))
                    .unwrap_or((f64::NAN, f64::NAN, f64::NAN));
                println!(
                    "{}\t{}\t{:.4}\t{:.4}\t{:.4}\t{:.4}",
                    r.generate_value,
                    r.n_toys,
                    m,
                    lo,
                    hi,
                    r.discovery_power_3sigma.unwrap_or(f64::NAN)
                );
            }
            if let Some(path) = &args.tsv_out {
                write_summary_tsv(path, &args.poi, &rows)?;
                println!("Summary TSV: {}", path.display());
            }
            if let Some(path) = &args.json_out {
                write_summary_json(path, &rows)?;
                println!("Summary JSON: {}", path.display());
            }
            if let Some(path) = &args.threshold_out {
                let table = neyman_threshold(&outputs, &args.poi, args.confidence_level)?;
                save_threshold(path, &table)?;
                println!("Threshold: {}", path.display());
            }
        }
    }
    Ok(())
}
