/// 命令行定义
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "paqet", version, about = "Userspace L4 tunnel over raw TCP-shaped frames")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Runs the client or server based on the config file
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Prints live status from the local debug endpoints
    Status {
        /// Path to the configuration file (used to detect debug endpoints)
        #[arg(short, long, default_value = "/etc/paqet/config.yaml")]
        config: String,
        /// Debug HTTP bind address (host:port); overrides the config
        #[arg(long)]
        pprof: Option<String>,
        /// Print JSON from /debug/paqet/status instead of text
        #[arg(long)]
        json: bool,
        /// HTTP timeout in seconds
        #[arg(long, default_value_t = 2)]
        timeout: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["paqet", "run"]).unwrap();
        match cli.command {
            Commands::Run { config } => assert_eq!(config, "config.yaml"),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_status_flags() {
        let cli = Cli::try_parse_from([
            "paqet", "status", "--json", "--pprof", "127.0.0.1:7070", "--timeout", "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Status {
                pprof,
                json,
                timeout,
                ..
            } => {
                assert!(json);
                assert_eq!(pprof.as_deref(), Some("127.0.0.1:7070"));
                assert_eq!(timeout, 5);
            }
            _ => panic!("expected status"),
        }
    }
}
