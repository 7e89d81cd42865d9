use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Command {
    /// Fetch FILE from the server
    Read,
    /// Send FILE to the server
    Write,
}

#[derive(Parser, Debug)]
#[command(name = "tftp-client")]
#[command(about = "A simple TFTP client", long_about = None)]
#[command(after_help = "Example:\n  tftp-client localhost read 1.txt")]
#[command(styles = STYLES)]
pub struct Cli {
    /// Server host name or ip
    pub host: String,

    /// Transfer direction
    #[arg(value_enum)]
    pub command: Command,

    /// Local file; its base name is used on the server
    pub file: PathBuf,

    /// Server port
    #[arg(default_value_t = crate::DEF_PORT)]
    pub port: u16,

    /// Timeout (ms)
    #[arg(short, long, default_value_t = crate::DEF_TIMEOUT_MS)]
    pub timeout: u64,

    /// Max retransmissions
    #[arg(short, long, default_value_t = crate::MAX_RETRANSMITS)]
    pub retry: u8,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn port_defaults_to_69() {
        let cli = Cli::try_parse_from(["tftp-client", "localhost", "read", "dir/1.txt"]).unwrap();
        assert_eq!(cli.command, Command::Read);
        assert_eq!(cli.port, 69);
        assert_eq!(cli.timeout, 5000);
        assert_eq!(cli.retry, 3);
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(Cli::try_parse_from(["tftp-client", "h", "delete", "f"]).is_err());
    }
}
