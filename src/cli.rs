use clap::Parser;
use std::path::PathBuf;

use crate::config::{CacheConfig, DEFAULT_KEY_PREFIX, RecorderConfig};

#[derive(Parser, Debug)]
#[command(name = "homearc")]
#[command(version)]
#[command(about = "Inspect home archives and re-save them with deduplicated resources", long_about = None)]
#[command(after_help = "Examples:\n  \
  homearc house.sh3d -l                  list resources with their digests\n  \
  homearc house.sh3d -o small.sh3d -c 9  re-save with duplicates merged\n  \
  homearc 'jar:https://example.com/demo.zip!/Home.xml'   load a home stored in another archive")]
pub struct Cli {
    /// Home archive path, HTTP URL or jar: URL
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Print the digest of each resource
    #[arg(short = 'l')]
    pub digests: bool,

    /// Save a deduplicated copy to OUT
    #[arg(short = 'o', value_name = "OUT")]
    pub output: Option<PathBuf>,

    /// Compression level of the saved copy, 0 stores entries
    #[arg(short = 'c', value_name = "LEVEL", value_parser = clap::value_parser!(u32).range(0..=9))]
    pub level: Option<u32>,

    /// Embed remote resources in the saved copy
    #[arg(short = 'a')]
    pub include_all: bool,

    /// Save on a background worker
    #[arg(short = 'w')]
    pub worker: bool,

    /// Manifest entry name
    #[arg(long, value_name = "NAME")]
    pub entry: Option<String>,

    /// Cache resources in a local directory
    #[arg(long, value_name = "DIR", conflicts_with = "cache_url")]
    pub cache_dir: Option<PathBuf>,

    /// Use the digest listing served at URL
    #[arg(long, value_name = "URL")]
    pub cache_url: Option<String>,

    /// Load settings from a TOML file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// More log output (-vv => even more)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    /// Default log filter when `RUST_LOG` is unset
    pub fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (q, _) if q > 1 => "off",
            (1, _) => "error",
            (_, 0) => "warn",
            (_, 1) => "info",
            (_, 2) => "debug",
            _ => "trace",
        }
    }

    /// Override `config` with the flags given on the command line
    pub fn apply(&self, config: &mut RecorderConfig) {
        if let Some(level) = self.level {
            config.compression_level = level;
        }
        if self.include_all {
            config.include_all_content = true;
        }
        if self.worker {
            config.use_worker = true;
        }
        if let Some(entry) = &self.entry {
            config.manifest_entry = entry.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache = Some(CacheConfig::Directory {
                path: dir.clone(),
                key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            });
            config.extract_to_cache = true;
        }
        if let Some(url) = &self.cache_url {
            let resource_base = url
                .rsplit_once('/')
                .map(|(base, _)| base.to_string())
                .unwrap_or_else(|| url.clone());
            config.cache = Some(CacheConfig::Remote {
                listing_url: url.clone(),
                resource_base,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "homearc",
            "house.sh3d",
            "-c",
            "0",
            "-w",
            "--entry",
            "Other.xml",
            "--cache-url",
            "https://cache.invalid/res/index.json",
        ]);
        let mut config = RecorderConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.compression_level, 0);
        assert!(config.use_worker);
        assert!(!config.include_all_content);
        assert_eq!(config.manifest_entry, "Other.xml");
        assert_eq!(
            config.cache,
            Some(CacheConfig::Remote {
                listing_url: "https://cache.invalid/res/index.json".to_string(),
                resource_base: "https://cache.invalid/res".to_string(),
            })
        );
    }

    #[test]
    fn verbosity_maps_to_filters() {
        let cli = Cli::parse_from(["homearc", "a.sh3d", "-vv"]);
        assert_eq!(cli.log_filter(), "debug");
        let cli = Cli::parse_from(["homearc", "a.sh3d", "-qq"]);
        assert_eq!(cli.log_filter(), "off");
        assert!(Cli::try_parse_from(["homearc", "a.sh3d", "-c", "12"]).is_err());
    }
}
