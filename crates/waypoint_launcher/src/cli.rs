//! Command-line interface for the launcher.
//!
//! Flags override the matching values of the configuration file.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Browse, join and host waypoint sessions", long_about = None)]
pub struct Args {
    /// Configuration file path
    ///
    /// A default configuration is written here if the file doesn't exist.
    #[arg(short, long, default_value = "waypoint.toml")]
    pub config: PathBuf,

    /// Instance identifier
    ///
    /// Namespaces list files and the hosted session name so several
    /// launchers can run side by side on one machine.
    #[arg(short, long, default_value = "default")]
    pub instance: String,

    /// Join the session advertising this join code
    #[arg(short, long)]
    pub join_code: Option<String>,

    /// Join a dedicated server by `host:port`
    #[arg(long, value_name = "ADDRESS")]
    pub connect: Option<String>,

    /// Password for joining, or for protecting a hosted session
    #[arg(short, long)]
    pub password: Option<String>,

    /// Hosted session name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Host a session instead of only browsing
    #[arg(long)]
    pub host: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from("waypoint.toml"),
            instance: "default".to_string(),
            join_code: None,
            connect: None,
            password: None,
            name: None,
            host: false,
            log_level: None,
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default() {
        let args = Args::default();
        assert_eq!(args.config, PathBuf::from("waypoint.toml"));
        assert_eq!(args.instance, "default");
        assert!(!args.host);
        assert!(args.join_code.is_none());
        assert!(args.password.is_none());
    }

    #[test]
    fn test_parse_host_flags() {
        let args = Args::parse_from([
            "waypoint_launcher",
            "--host",
            "--name",
            "Valhalla",
            "--password",
            "secret",
            "-i",
            "second",
        ]);
        assert!(args.host);
        assert_eq!(args.name.as_deref(), Some("Valhalla"));
        assert_eq!(args.password.as_deref(), Some("secret"));
        assert_eq!(args.instance, "second");
        assert_eq!(args.config, PathBuf::from("waypoint.toml"));
    }
}
