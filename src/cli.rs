//! CLI argument parsing for the processor.
//!
//! Everything that shapes a run lives in the config document; the CLI only
//! says where that document and the secrets are.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "processor",
    version,
    about = "Accession lifecycle engine for DICOM de-identification batches",
    after_help = "Commands:\n  run --config <file> --secrets-dir <dir>            Boot, check the gate, and run configured modules\n  gate --config <file> --secrets-dir <dir> --read    Print the configured system-status flag\n  gate --config <file> --secrets-dir <dir> --write   Append a system-status row from the config\n\nExamples:\n  processor run --config batch.json --secrets-dir /etc/processor/secrets\n  system_status_active=false processor gate --config batch.json --secrets-dir secrets --write",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: SubCommand,
}

#[derive(Subcommand, Debug)]
pub enum SubCommand {
    Run(RunArgs),
    Gate(GateArgs),
}

/// Inputs shared by every subcommand.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// JSON config document of flat keys
    #[arg(long, value_name = "FILE")]
    pub config: PathBuf,

    /// Directory holding `<vault path>.json` secret files
    #[arg(long, value_name = "DIR")]
    pub secrets_dir: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Run the configured modules and commands")]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Gate access without running any module.
#[derive(Parser, Debug)]
#[command(about = "Read or write the system-status gate")]
pub struct GateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Print the flag for system_status_type / system_status_node
    #[arg(long, conflicts_with = "write", required_unless_present = "write")]
    pub read: bool,

    /// Append system_status_active for that scope
    #[arg(long)]
    pub write: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_needs_exactly_one_direction() {
        let base = ["processor", "gate", "--config", "c.json", "--secrets-dir", "s"];
        assert!(RootArgs::try_parse_from(base).is_err());
        assert!(RootArgs::try_parse_from(base.iter().chain(&["--read", "--write"])).is_err());

        let parsed = RootArgs::try_parse_from(base.iter().chain(&["--write"])).expect("write");
        match parsed.command {
            SubCommand::Gate(args) => assert!(args.write && !args.read),
            SubCommand::Run(_) => panic!("expected gate"),
        }
    }

    #[test]
    fn run_takes_config_and_secrets() {
        let parsed = RootArgs::try_parse_from([
            "processor",
            "run",
            "--config",
            "batch.json",
            "--secrets-dir",
            "/etc/secrets",
            "--verbose",
        ])
        .expect("parse");
        let SubCommand::Run(args) = parsed.command else {
            panic!("expected run");
        };
        assert_eq!(args.common.config, PathBuf::from("batch.json"));
        assert!(args.common.verbose);
    }
}
