//! CLI argument parsing.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "lassist",
    version,
    about = "AI-assisted product listing: descriptions, categories, and policy review",
    after_help = "Examples:\n  lassist init-config\n  lassist --lm 'llm -m gpt-4o-mini' describe --product mug.json\n  lassist run --product mug.json --id mug-17 --store listings/\n  lassist show --store listings/ --id mug-17",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Config file (default: $LISTING_ASSIST_CONFIG, then the user config dir)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// LM command that reads a prompt on stdin (overrides config and $LISTING_ASSIST_LM_COMMAND)
    #[arg(long, value_name = "CMD", global = true)]
    pub lm: Option<String>,

    /// Append one JSON line per model invocation to this file
    #[arg(long, value_name = "PATH", global = true)]
    pub records: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a config stub
    InitConfig(InitConfigArgs),
    /// Generate a buyer-facing description
    Describe(ProductArgs),
    /// Classify a product into the taxonomy
    Categorize(ProductArgs),
    /// Review a listing against the policy set
    Review(ReviewArgs),
    /// Run every flow and derive the listing status
    Run(RunArgs),
    /// Print a stored assessment
    Show(ShowArgs),
    /// Summarize an invocation records file
    Records(RecordsArgs),
}

#[derive(Parser, Debug)]
pub struct InitConfigArgs {
    /// Where to write the stub (default: the user config dir)
    #[arg(long, value_name = "PATH")]
    pub path: Option<PathBuf>,

    /// Overwrite an existing config
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct ProductArgs {
    /// Product draft JSON (camelCase keys)
    #[arg(long, value_name = "PATH")]
    pub product: PathBuf,
}

#[derive(Parser, Debug)]
pub struct ReviewArgs {
    /// Product draft JSON (camelCase keys)
    #[arg(long, value_name = "PATH")]
    pub product: PathBuf,

    /// Generated description JSON from `describe`
    #[arg(long, value_name = "PATH")]
    pub description: Option<PathBuf>,

    /// Classification JSON from `categorize`
    #[arg(long, value_name = "PATH")]
    pub classification: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Product draft JSON (camelCase keys)
    #[arg(long, value_name = "PATH")]
    pub product: PathBuf,

    /// Product id used as the store key
    #[arg(long, value_name = "ID")]
    pub id: String,

    /// Directory store for the finished assessment
    #[arg(long, value_name = "DIR")]
    pub store: Option<PathBuf>,

    /// Stop retrying once the assessment has run this long
    #[arg(long, value_name = "MS")]
    pub deadline_ms: Option<u64>,
}

#[derive(Parser, Debug)]
pub struct ShowArgs {
    #[arg(long, value_name = "DIR")]
    pub store: PathBuf,

    #[arg(long, value_name = "ID")]
    pub id: String,
}

#[derive(Parser, Debug)]
pub struct RecordsArgs {
    /// JSONL file written with --records
    #[arg(value_name = "PATH")]
    pub path: PathBuf,
}
