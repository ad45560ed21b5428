//! CLI argument parsing and validation module
//!
//! Handles command-line interface using clap, including:
//! - Output view selection (paths, events, split access, sandbox snippet)
//! - Process and path filters, merged over the optional config file
//! - Attribution and privilege switches
//! - The trailing command to trace

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::error::ErrorKind;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

use crate::config::FileConfig;
use crate::constants::APP_NAME;
use crate::models::{Filters, OutputMode, TraceOptions};

const VERSION: &str = concat!(env!("FS_TRACER_VERSION"), " (", env!("GIT_HASH"), ")");

/// Command definition, shared by the parser and the help tests
pub fn build_command() -> Command {
    Command::new(APP_NAME)
        .version(VERSION)
        .about("Trace filesystem accesses of a command via fs_usage")
        .long_about(
            "Runs a command under fs_usage and reports the files it touched. \
             With --follow-children, every process is traced and events are attributed \
             to the command's process tree.",
        )
        .override_usage("fs-tracer [OPTIONS] -- <yourcmd> [ARG]...")
        .arg(
            Arg::new("events")
                .short('v')
                .long("events")
                .help("Emit detailed event log")
                .action(ArgAction::SetTrue)
                .conflicts_with("sandbox-snippet"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Output JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("split-access")
                .long("split-access")
                .help("Separate read/write sets")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("sandbox-snippet")
                .long("sandbox-snippet")
                .help("Emit sandbox-exec s-expressions (exclusive with --events)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dirs")
                .long("dirs")
                .help("Emit parent directories only")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("allow-process")
                .long("allow-process")
                .value_name("NAME")
                .help("Only include events from this process name (repeatable)")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("ignore-process")
                .long("ignore-process")
                .value_name("NAME")
                .help("Process name to ignore (repeatable)")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("ignore-prefix")
                .long("ignore-prefix")
                .value_name("PATH")
                .help("Path prefix to ignore (repeatable)")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("no-sudo")
                .long("no-sudo")
                .help("Run fs_usage without sudo")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("raw")
                .long("raw")
                .help("Disable ignore filters")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-pid-filter")
                .long("no-pid-filter")
                .help("Do not restrict events to the traced process tree")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("follow-children")
                .long("follow-children")
                .help("Trace all processes and keep events from the command's descendants")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ignore-cwd")
                .long("ignore-cwd")
                .help("Ignore events under the current working directory")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("max-depth")
                .long("max-depth")
                .value_name("N")
                .help("Truncate paths to at most N components (0 or less = unlimited)")
                .value_parser(value_parser!(i64))
                .allow_negative_numbers(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("TOML file with default filters")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("command")
                .value_name("yourcmd")
                .help("Command to trace, followed by its arguments")
                .num_args(1..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .action(ArgAction::Append),
        )
}

/// Parse the process arguments
pub fn parse_args() -> Result<TraceOptions> {
    parse_from(std::env::args_os())
}

/// Parse an explicit argument list
///
/// `--help` and `--version` print and exit the process as usual; every other
/// clap failure is returned so the caller can pick the exit code.
pub fn parse_from<I, T>(args: I) -> Result<TraceOptions>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = match build_command().try_get_matches_from(args) {
        Ok(matches) => matches,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => return Err(err.into()),
    };

    let config_path = matches.get_one::<PathBuf>("config").cloned();
    let file_config = FileConfig::discover(config_path.as_deref())?;
    options_from_matches(&matches, &file_config)
}

/// Resolve matches and file defaults into run options
pub fn options_from_matches(matches: &ArgMatches, file_config: &FileConfig) -> Result<TraceOptions> {
    let command: Vec<String> = strings(matches, "command");
    if command.is_empty() {
        bail!("yourcmd is required after --");
    }

    let output = if matches.get_flag("events") {
        OutputMode::Events
    } else if matches.get_flag("sandbox-snippet") {
        OutputMode::SandboxSnippet
    } else if matches.get_flag("split-access") {
        OutputMode::SplitAccess
    } else {
        OutputMode::Paths
    };

    let cli_filters = Filters {
        allow_processes: strings(matches, "allow-process"),
        ignore_processes: strings(matches, "ignore-process"),
        ignore_prefixes: strings(matches, "ignore-prefix"),
        max_depth: 0,
        raw: matches.get_flag("raw"),
    };
    let cli_max_depth = matches.get_one::<i64>("max-depth").copied();

    Ok(TraceOptions {
        output,
        json: matches.get_flag("json"),
        dirs_only: matches.get_flag("dirs"),
        filters: file_config.merge_filters(cli_filters, cli_max_depth),
        no_sudo: matches.get_flag("no-sudo"),
        no_pid_filter: matches.get_flag("no-pid-filter"),
        follow_children: matches.get_flag("follow-children"),
        ignore_cwd: matches.get_flag("ignore-cwd"),
        config_path: matches.get_one::<PathBuf>("config").cloned(),
        command,
    })
}

fn strings(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}
