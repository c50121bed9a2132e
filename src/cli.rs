//! # Command-Line Interface Module
//!
//! Clap definitions for the `tonearm` binary.
//!
//! ## Commands
//!
//! - `run`: Start the engine, reading JSON requests on stdin and writing responses
//!   and notifications to stdout, one JSON document per line
//! - `last-played`: Print the last played log from the working directory
//! - `completion`: Generate shell completions
//!
//! ## Examples
//!
//! ```bash
//! tonearm run --host /run/mpd/socket
//! TONEARM_WORKDIR=/var/lib/tonearm tonearm run --port 6601
//! tonearm last-played --limit 20
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::SettingsPatch;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "tonearm")]
#[command(about = "Tonearm: connection, jukebox and smart playlist engine for MPD")]
#[command(version)]
pub struct Args {
    /// Working directory for settings, smart playlists and the last played log
    ///
    /// Defaults to the platform data directory, e.g. ~/.local/share/tonearm
    #[arg(long, global = true, env = "TONEARM_WORKDIR", value_hint = clap::ValueHint::DirPath)]
    pub workdir: Option<PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the engine
    ///
    /// Requests are read from stdin as JSON lines of the form
    /// {"connection": 1, "id": 7, "method": "player_state", "params": {}}.
    /// Responses and notifications are written to stdout. The engine stops on
    /// end of input, SIGINT or SIGTERM.
    Run {
        /// MPD host name or absolute socket path
        #[arg(long, env = "MPD_HOST")]
        host: Option<String>,

        /// MPD port, ignored for socket connections
        #[arg(long, env = "MPD_PORT")]
        port: Option<u16>,

        /// MPD password
        #[arg(long, env = "MPD_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Print the last played log
    LastPlayed {
        /// Number of entries to skip
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Maximum number of entries to print
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// Generate shell completions
    ///
    /// Usage: tonearm completion bash > ~/.local/share/bash-completion/completions/tonearm
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Connection overrides given on the command line, as a settings update
pub fn connection_patch(
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
) -> Option<SettingsPatch> {
    if host.is_none() && port.is_none() && password.is_none() {
        return None;
    }
    Some(SettingsPatch {
        mpd_host: host,
        mpd_port: port,
        mpd_pass: password,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_run_with_overrides() {
        let args = Args::try_parse_from([
            "tonearm",
            "--workdir",
            "/tmp/tonearm",
            "run",
            "--host",
            "music.local",
            "--port",
            "6601",
        ])
        .unwrap();
        assert_eq!(args.workdir, Some(PathBuf::from("/tmp/tonearm")));
        match args.command {
            Command::Run { host, port, .. } => {
                assert_eq!(host.as_deref(), Some("music.local"));
                assert_eq!(port, Some(6601));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_connection_patch_only_when_given() {
        assert!(connection_patch(None, None, None).is_none());
        let patch = connection_patch(None, Some(6601), None).unwrap();
        assert_eq!(patch.mpd_port, Some(6601));
        assert!(patch.mpd_host.is_none());
    }
}
