use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use ap_verify::bdd::BddConfig;
use ap_verify::config::{CheckerMode, VerifierConfig};
use ap_verify::loader::{read_updates, NetworkSpec};
use ap_verify::network::Network;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Checker {
    Direct,
    Graph,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Directory with `topology` and optional `devices`, `vlans`, `acls`, `nats`.
    #[arg(value_name = "DIR")]
    network: PathBuf,

    /// Update stream to apply.
    #[arg(short, long, value_name = "FILE")]
    updates: Option<PathBuf>,

    /// Keep ACL predicates in a partition of their own.
    #[arg(long)]
    division: bool,

    /// Disable merging of equivalent predicates.
    #[arg(long)]
    no_merge: bool,

    /// Loop detection strategy.
    #[arg(long, value_enum, default_value = "direct")]
    checker: Checker,

    /// Check every single link failure after the updates.
    #[arg(long)]
    link_failures: bool,

    /// Print the loops found.
    #[arg(long)]
    dump_loops: bool,

    /// Do not report black holes.
    #[arg(long)]
    no_blackholes: bool,

    /// BDD size (in bits, so the initial size is `2^size` nodes).
    #[arg(long, value_name = "INT", default_value = "20")]
    size: usize,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Cli::parse();

    simplelog::TermLogger::init(
        if args.verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let time_total = std::time::Instant::now();

    let config = VerifierConfig::default()
        .with_division(args.division)
        .with_merge_aps(!args.no_merge)
        .with_checker(match args.checker {
            Checker::Direct => CheckerMode::Direct,
            Checker::Graph => CheckerMode::Graph,
        })
        .with_check_blackholes(!args.no_blackholes)
        .with_bdd(BddConfig::default().with_storage_bits(args.size));

    let spec = NetworkSpec::from_dir(&args.network)?;
    let name = args
        .network
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "network".to_string());
    let mut network = Network::new(name, config, &spec)?;

    if let Some(path) = &args.updates {
        let lines = read_updates(path)?;
        println!("Applying {} updates from {}", lines.len(), path.display());
        let summary = network.run(&lines)?;
        println!("{}", summary);
    }

    if args.link_failures {
        let reports = network.check_all_link_failures()?;
        let loops: usize = reports.iter().map(|r| r.loops).sum();
        for report in &reports {
            println!("{}", report);
        }
        println!("{} link failures checked, {} loops", reports.len(), loops);
    }

    if args.dump_loops {
        for line in network.dump_loops() {
            println!("{}", line);
        }
    }

    let time_total = time_total.elapsed();
    println!("\nAll done in {:.3} s", time_total.as_secs_f64());

    Ok(())
}
