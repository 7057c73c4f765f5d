use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, Command};
use forge_core::config::ForgeConfig;
use forge_core::simulator::{run_simulator, SimulatorConfig};
use forge_kernel::{classify, Phase};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("forge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Forge build orchestration engine")
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run one build over simulated collaborators")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("components")
                        .long("components")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Components in the planned application"),
                )
                .arg(
                    Arg::new("placeholder-rate")
                        .long("placeholder-rate")
                        .default_value("0.25")
                        .value_parser(value_parser!(f64))
                        .help("Chance a first build leaves a placeholder marker"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.1")
                        .value_parser(value_parser!(f64))
                        .help("Chance a first build call fails"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_name("PATH")
                        .help("Engine configuration (TOML)"),
                ),
        )
        .subcommand(Command::new("phases").about("Print the phase transition table"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_phases() {
    for from in Phase::ALL {
        let edges: Vec<String> = Phase::ALL
            .iter()
            .filter_map(|to| classify(from, *to).map(|kind| format!("{to} ({kind:?})")))
            .collect();
        println!("{:<20} -> {}", from.as_str(), edges.join(", "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let engine = match args.get_one::<String>("config") {
                Some(path) => ForgeConfig::load(path).with_context(|| format!("loading {path}"))?,
                None => ForgeConfig::default(),
            };
            let config = SimulatorConfig {
                seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
                components: args.get_one::<usize>("components").copied().unwrap_or(4),
                placeholder_rate: args.get_one::<f64>("placeholder-rate").copied().unwrap_or(0.25),
                failure_rate: args.get_one::<f64>("failure-rate").copied().unwrap_or(0.1),
                engine,
            };

            let report = run_simulator(config).await.context("simulated session failed to start")?;
            println!("{}", report.generate_text());
            if !report.passed() {
                std::process::exit(1);
            }
        }
        Some(("phases", _)) => print_phases(),
        _ => {
            cli().print_help()?;
        }
    }
    Ok(())
}
