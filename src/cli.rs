//! Command-line surface.
//!
//! Anything that is not a tollgit namespace (`auth`, `config`) is forwarded
//! to git with its native arguments unchanged.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tollgit",
    version,
    about = "Payment-gated git command wrapper",
    long_about = "Wraps git and charges a micropayment for gated operations.\n\
                  Any command that is not `auth` or `config` is forwarded to git unchanged."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the authenticated provider session
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },

    /// Read or change tollgit settings
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Forwarded git command line (everything else)
    #[command(external_subcommand)]
    Git(Vec<String>),
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Authorize tollgit with the payment provider
    Login,
    /// Delete the stored session
    Logout,
    /// Show session, profile, and balance information
    Status,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Get or set the payment-gating mode (minimal | universal)
    PaymentMode {
        /// New mode; prints the current mode when omitted
        value: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_passthrough_collects_everything() {
        let cli = Cli::parse_from(["tollgit", "push", "origin", "main", "--force"]);
        match cli.command {
            Some(Command::Git(args)) => {
                assert_eq!(args, vec!["push", "origin", "main", "--force"]);
            }
            other => panic!("expected git passthrough, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_subcommands_parse() {
        let cli = Cli::parse_from(["tollgit", "auth", "login"]);
        assert!(matches!(
            cli.command,
            Some(Command::Auth {
                command: AuthCommand::Login
            })
        ));

        let cli = Cli::parse_from(["tollgit", "auth", "status"]);
        assert!(matches!(
            cli.command,
            Some(Command::Auth {
                command: AuthCommand::Status
            })
        ));
    }

    #[test]
    fn test_unknown_auth_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["tollgit", "auth", "refresh"]).is_err());
    }

    #[test]
    fn test_config_payment_mode_with_and_without_value() {
        let cli = Cli::parse_from(["tollgit", "config", "payment-mode"]);
        match cli.command {
            Some(Command::Config {
                command: ConfigCommand::PaymentMode { value },
            }) => assert!(value.is_none()),
            other => panic!("unexpected parse: {:?}", other),
        }

        let cli = Cli::parse_from(["tollgit", "config", "payment-mode", "universal"]);
        match cli.command {
            Some(Command::Config {
                command: ConfigCommand::PaymentMode { value },
            }) => assert_eq!(value.as_deref(), Some("universal")),
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
