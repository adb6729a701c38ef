use std::path::PathBuf;

use clap::Parser;

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "vigil-backend", version, about = "Vulnerability search job queue server")]
pub struct CliArgs {
    /// Path to configuration file (TOML, YAML or JSON).
    #[arg(short = 'c', long = "config-path", env = "VIGIL_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_short_and_long_flags() {
        let args = CliArgs::try_parse_from(["vigil-backend", "-c", "vigil.toml"]).unwrap();
        assert_eq!(args.config_path, Some(PathBuf::from("vigil.toml")));

        let args =
            CliArgs::try_parse_from(["vigil-backend", "--config-path=/etc/vigil.yaml"]).unwrap();
        assert_eq!(args.config_path, Some(PathBuf::from("/etc/vigil.yaml")));
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(CliArgs::try_parse_from(["vigil-backend", "--frobnicate"]).is_err());
    }
}
