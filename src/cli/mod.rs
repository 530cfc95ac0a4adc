//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::retrieval::SearchMode;

#[derive(Parser, Debug)]
#[command(
    name = "ragline",
    version,
    about = "Hybrid code search: AST-aware chunking, HNSW vectors, BM25 and rank fusion",
    long_about = "Ragline chunks source files along their syntax, embeds the chunks, and answers \
                  queries by fusing nearest-neighbour and BM25 rankings."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/ragline/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Profile to apply on top of the configuration
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Address to bind (defaults to server.bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Ingest files or directories
    Ingest {
        /// Files or directories; directories are walked recursively
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Search the indexed chunks
    Search {
        /// Search query text
        query: String,

        /// Maximum number of results to return
        #[arg(short, long)]
        k: Option<usize>,

        /// hybrid, semantic or keyword
        #[arg(short, long, default_value = "hybrid")]
        mode: SearchMode,

        /// Semantic weight in [0, 1]
        #[arg(short, long)]
        weight: Option<f32>,

        /// Only return chunks in this language (repeatable)
        #[arg(short, long)]
        language: Vec<String>,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Compare embedding models on a labeled evaluation set
    Evaluate {
        /// JSON file with `documents` and `queries`
        file: PathBuf,

        /// Models to evaluate (defaults to every configured model)
        #[arg(short, long)]
        model: Vec<String>,

        /// Write the markdown report here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also benchmark the search modes on the default model
        #[arg(long)]
        benchmark: bool,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Rebuild the vector and keyword indexes from the store
    Rebuild,

    /// Show collection statistics
    Stats,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_search() {
        let cli = Cli::try_parse_from([
            "ragline", "search", "parse header", "-k", "5", "--mode", "keyword", "-l", "python",
        ])
        .unwrap();
        match cli.command {
            Commands::Search {
                query,
                k,
                mode,
                language,
                ..
            } => {
                assert_eq!(query, "parse header");
                assert_eq!(k, Some(5));
                assert_eq!(mode, SearchMode::Keyword);
                assert_eq!(language, vec!["python"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["ragline", "search", "q", "--mode", "fuzzy"]).is_err());
    }
}
