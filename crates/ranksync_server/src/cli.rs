//! Command-line interface handling for the RankSync server.

use clap::{Arg, Command};
use std::path::PathBuf;

/// Command line arguments. Everything but the config path overrides the file.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the data directory
    pub data_dir: Option<PathBuf>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Read operator commands from stdin
    pub console: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(Self::command().get_matches())
    }

    fn command() -> Command {
        Command::new("RankSync")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Keeps game ranks and community platform roles in sync")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("config.toml"),
            )
            .arg(
                Arg::new("data")
                    .short('d')
                    .long("data")
                    .value_name("DIR")
                    .help("Data directory (link state, permission file)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .arg(
                Arg::new("no-console")
                    .long("no-console")
                    .help("Do not read operator commands from stdin")
                    .action(clap::ArgAction::SetTrue),
            )
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            data_dir: matches.get_one::<String>("data").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            console: !matches.get_flag("no-console"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let argv = std::iter::once("ranksync").chain(args.iter().copied());
        CliArgs::from_matches(CliArgs::command().get_matches_from(argv))
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert_eq!(args.config_path, PathBuf::from("config.toml"));
        assert!(args.data_dir.is_none());
        assert!(args.log_level.is_none());
        assert!(!args.json_logs);
        assert!(args.console);
    }

    #[test]
    fn overrides() {
        let args = parse(&["-c", "sync.toml", "--data", "/srv/ranksync", "-l", "debug", "--json-logs", "--no-console"]);
        assert_eq!(args.config_path, PathBuf::from("sync.toml"));
        assert_eq!(args.data_dir, Some(PathBuf::from("/srv/ranksync")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        assert!(!args.console);
    }
}
