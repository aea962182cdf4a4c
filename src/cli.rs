//! Command-line argument parsing for toolrelay

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// toolrelay - Tool-call plugin dispatcher for language-model conversations
#[derive(Parser, Debug)]
#[command(name = "toolrelay")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Plugin root directory (overrides configuration)
    #[arg(short, long, value_name = "DIR", global = true)]
    pub plugins: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// List loaded tools and plugins that failed to load
    Tools,

    /// Execute the tool calls found in text and print the results block
    Run {
        /// Read text from this file instead of stdin
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
    },

    /// Run one conversational turn through the completion service
    Chat {
        /// User message
        message: String,

        /// Extra system prompt text placed before the tool descriptions
        #[arg(short, long, value_name = "TEXT")]
        system: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_tools() {
        let args = Args::parse_from(["toolrelay", "tools"]);
        assert_eq!(args.command, Command::Tools);
        assert!(args.config.is_none());
        assert!(!args.debug);
    }

    #[test]
    fn test_args_run_with_input() {
        let args = Args::parse_from(["toolrelay", "run", "--input", "reply.txt"]);
        assert_eq!(
            args.command,
            Command::Run {
                input: Some(PathBuf::from("reply.txt"))
            }
        );
    }

    #[test]
    fn test_args_with_flags() {
        let args = Args::parse_from([
            "toolrelay",
            "--debug",
            "--config",
            "/tmp/config.toml",
            "chat",
            "hello",
            "--plugins",
            "/srv/plugins",
        ]);
        assert!(args.debug);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/config.toml")));
        assert_eq!(args.plugins, Some(PathBuf::from("/srv/plugins")));
        assert_eq!(
            args.command,
            Command::Chat {
                message: "hello".to_string(),
                system: None
            }
        );
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Args::try_parse_from(["toolrelay"]).is_err());
    }
}
