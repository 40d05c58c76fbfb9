//! formeval command line
//!
//! `simulate` runs a seeded synthetic workload through the coalescer;
//! `config` prints the effective configuration.

pub mod simulate;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use formeval_core::FormEvalConfig;
use formeval_http::HttpDynamicValueFetcher;
use simulate::{run_simulator, SimulatorConfig};
use std::path::PathBuf;

/// Build the command definition
#[must_use]
pub fn build_cli() -> Command {
    Command::new("formeval")
        .version(formeval_core::VERSION)
        .about("Single-flight form evaluation coalescer")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run a synthetic evaluation workload")
                .arg(
                    Arg::new("requests")
                        .long("requests")
                        .default_value("100")
                        .value_parser(value_parser!(u64))
                        .help("Number of evaluation requests to send"),
                )
                .arg(
                    Arg::new("forms")
                        .long("forms")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Number of distinct forms"),
                )
                .arg(
                    Arg::new("fields")
                        .long("fields")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Fields per evaluated form"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("latency-ms")
                        .long("latency-ms")
                        .default_value("1")
                        .value_parser(value_parser!(u64))
                        .help("Evaluator latency in milliseconds"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.05")
                        .value_parser(value_parser!(f64))
                        .help("Probability that an evaluation fails"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(
                    Arg::new("check")
                        .long("check")
                        .action(ArgAction::SetTrue)
                        .help("Also build the HTTP fetcher from the fetch settings"),
                ),
        )
}

/// Load configuration from `--config`, or defaults
///
/// # Errors
/// If the file cannot be read or is invalid.
pub fn load_config(matches: &ArgMatches) -> anyhow::Result<FormEvalConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => FormEvalConfig::load(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(FormEvalConfig::default()),
    }
}

/// Simulator parameters from `simulate` arguments
#[must_use]
pub fn simulator_config(args: &ArgMatches) -> SimulatorConfig {
    let defaults = SimulatorConfig::default();
    SimulatorConfig {
        seed: args.get_one::<u64>("seed").copied().unwrap_or(defaults.seed),
        requests: args
            .get_one::<u64>("requests")
            .copied()
            .unwrap_or(defaults.requests),
        forms: args.get_one::<usize>("forms").copied().unwrap_or(defaults.forms),
        fields: args.get_one::<usize>("fields").copied().unwrap_or(defaults.fields),
        latency_ms: args
            .get_one::<u64>("latency-ms")
            .copied()
            .unwrap_or(defaults.latency_ms),
        failure_rate: args
            .get_one::<f64>("failure-rate")
            .copied()
            .unwrap_or(defaults.failure_rate),
    }
}

/// Run the selected subcommand
///
/// # Returns
/// Process exit code.
///
/// # Errors
/// On invalid configuration or a failed run.
pub async fn run(matches: &ArgMatches, config: &FormEvalConfig) -> anyhow::Result<i32> {
    match matches.subcommand() {
        Some(("simulate", args)) => {
            let report = run_simulator(simulator_config(args), config).await?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }
            Ok(if report.passed() { 0 } else { 1 })
        }
        Some(("config", args)) => {
            print!("{}", config.to_toml_string()?);
            if args.get_flag("check") {
                let fetcher = HttpDynamicValueFetcher::new(&config.fetch)?;
                match fetcher.base_url() {
                    Some(base) => println!("# fetch base url resolves to {base}"),
                    None => println!("# no fetch base url; only absolute urls can be fetched"),
                }
            }
            Ok(0)
        }
        _ => Ok(2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulate_args_parse() {
        let matches = build_cli()
            .try_get_matches_from([
                "formeval",
                "simulate",
                "--requests",
                "10",
                "--seed",
                "9",
                "--failure-rate",
                "0.5",
            ])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "simulate");

        let config = simulator_config(args);
        assert_eq!(config.requests, 10);
        assert_eq!(config.seed, 9);
        assert_eq!(config.forms, 4);
        assert!((config.failure_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn subcommand_is_required() {
        assert!(build_cli().try_get_matches_from(["formeval"]).is_err());
    }

    #[test]
    fn global_config_flag_loads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("formeval.toml");
        std::fs::write(&path, "log_filter = \"warn\"\n").unwrap();

        let matches = build_cli()
            .try_get_matches_from(["formeval", "config", "--config", path.to_str().unwrap()])
            .unwrap();
        let config = load_config(&matches).unwrap();
        assert_eq!(config.log_filter, "warn");
    }

    #[tokio::test]
    async fn config_check_succeeds_with_base_url() {
        let matches = build_cli()
            .try_get_matches_from(["formeval", "config", "--check"])
            .unwrap();
        let config = FormEvalConfig::new().with_fetch_base_url("http://localhost:8080/api");
        assert_eq!(run(&matches, &config).await.unwrap(), 0);
    }
}
