use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

pub const VX_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const VX_BEFORE_HELP: &str = concat!(
    "vx ",
    env!("CARGO_PKG_VERSION"),
    " – Engine Version Manager\n\n",
    "\x1b[1;36mCore workflow\x1b[0m\n",
    "  create           Write versions/<id>.json from an engine URL, extensions, and models.\n",
    "  validate         Resolve refs to commits and persist the lock.\n",
    "  realize          Materialize a version: sources, models, venv, marker.\n",
    "  run-ui           Realize, then launch the engine's interactive server.\n",
    "  run-handler      Realize, then execute one graph job headlessly.\n\n",
    "\x1b[1;36mHousekeeping\x1b[0m\n",
    "  clone            Copy a spec under a new version id.\n",
    "  delete           Remove a workspace and its lock (optionally the spec).\n",
);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    disable_help_subcommand = true,
    before_help = VX_BEFORE_HELP,
    help_template = VX_HELP_TEMPLATE
)]
pub struct VxCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(long, help = "Emit the command outcome as JSON", global = true)]
    pub json: bool,
    #[arg(
        long,
        help = "Run offline for this invocation (sets OFFLINE=1)",
        global = true
    )]
    pub offline: bool,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Build and write a version spec file.",
        override_usage = "vx create <VERSION_ID> --engine URL[@REF] [--extension ...] [--model ...]"
    )]
    Create(CreateArgs),
    #[command(
        about = "Resolve a spec's refs to commits, persist the lock, print the plan.",
        override_usage = "vx validate <VERSION_ID>"
    )]
    Validate(ValidateArgs),
    #[command(
        about = "Realize a version into its workspace (idempotent on a warm workspace).",
        override_usage = "vx realize <VERSION_ID> [--target DIR] [--offline] [--dry-run]"
    )]
    Realize(RealizeArgs),
    #[command(
        name = "run-ui",
        about = "Realize, then launch the engine's interactive server.",
        override_usage = "vx run-ui <VERSION_ID> [--host HOST] [--port PORT] [-- ENGINE_ARGS...]"
    )]
    RunUi(RunUiArgs),
    #[command(
        name = "run-handler",
        about = "Realize, then execute one graph job headlessly and emit the result.",
        override_usage = "vx run-handler <VERSION_ID> --workflow FILE [--output base64|object]"
    )]
    RunHandler(RunHandlerArgs),
    #[command(
        about = "Copy a spec under a new version id (locks and workspaces are not copied).",
        override_usage = "vx clone <SRC_ID> <DST_ID>"
    )]
    Clone(CloneArgs),
    #[command(
        about = "Remove a version's workspace and lock; optionally its spec.",
        override_usage = "vx delete <VERSION_ID> [--remove-spec]"
    )]
    Delete(DeleteArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    #[arg(value_name = "VERSION_ID", help = "Identifier; becomes versions/<id>.json")]
    pub version_id: String,
    #[arg(long, value_name = "URL[@REF]", help = "Engine repo URL with optional @ref")]
    pub engine: String,
    #[arg(
        long = "extension",
        value_name = "REPO[@REF]|JSON",
        help = "Extension: repo URL with optional @ref, or an inline JSON object (repeatable)"
    )]
    pub extensions: Vec<String>,
    #[arg(
        long = "model",
        value_name = "JSON",
        help = "Model declaration as an inline JSON object (repeatable)"
    )]
    pub models: Vec<String>,
    #[arg(long, value_name = "FILE", help = "JSON file with a list of extension objects")]
    pub extensions_file: Option<PathBuf>,
    #[arg(long, value_name = "FILE", help = "JSON file with a list of model objects")]
    pub models_file: Option<PathBuf>,
    #[arg(
        long,
        value_name = "DIR",
        help = "Base directory with local model files for --auto-checksum"
    )]
    pub models_root: Option<PathBuf>,
    #[arg(long, help = "Compute sha256 for models that exist locally")]
    pub auto_checksum: bool,
    #[arg(long, value_name = "FILE", help = "Explicit output path")]
    pub output: Option<PathBuf>,
    #[arg(long, help = "Overwrite an existing spec file")]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[arg(value_name = "VERSION_ID")]
    pub version_id: String,
}

#[derive(Args, Debug)]
pub struct RealizeArgs {
    #[arg(value_name = "VERSION_ID")]
    pub version_id: String,
    #[arg(long, value_name = "DIR", help = "Explicit workspace path")]
    pub target: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Override the models directory")]
    pub models_dir: Option<PathBuf>,
    #[arg(
        long,
        value_name = "DIR",
        help = "Directory of pre-built wheels for offline installs"
    )]
    pub wheels_dir: Option<PathBuf>,
    #[arg(long, help = "Print the plan without changing anything")]
    pub dry_run: bool,
    #[arg(long, help = "Replace non-symlink files at projection targets")]
    pub overwrite: bool,
}

#[derive(Args, Debug)]
pub struct RunUiArgs {
    #[arg(value_name = "VERSION_ID")]
    pub version_id: String,
    #[arg(long, default_value = "0.0.0.0", help = "Engine server bind host")]
    pub host: String,
    #[arg(long, default_value_t = 8188, help = "Engine server port")]
    pub port: u16,
    #[arg(long, value_name = "DIR", help = "Explicit workspace path")]
    pub target: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Override the models directory")]
    pub models_dir: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Wheels directory for offline installs")]
    pub wheels_dir: Option<PathBuf>,
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "ENGINE_ARGS",
        help = "Extra arguments forwarded to the engine (prefix with --)"
    )]
    pub extra_args: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputModeCli {
    Base64,
    Object,
}

impl OutputModeCli {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base64 => "base64",
            Self::Object => "object",
        }
    }
}

#[derive(Args, Debug)]
pub struct RunHandlerArgs {
    #[arg(value_name = "VERSION_ID")]
    pub version_id: String,
    #[arg(long, value_name = "FILE", help = "Path to the graph JSON to execute")]
    pub workflow: PathBuf,
    #[arg(long, value_enum, help = "How to deliver the result (default from OUTPUT_MODE)")]
    pub output: Option<OutputModeCli>,
    #[arg(long, value_name = "FILE", help = "Write base64 output to a file")]
    pub out_file: Option<PathBuf>,
    #[arg(long, value_name = "BUCKET", help = "Object-storage bucket for uploads")]
    pub object_bucket: Option<String>,
    #[arg(long, value_name = "PREFIX", help = "Key prefix inside the bucket")]
    pub object_prefix: Option<String>,
    #[arg(long, value_name = "DIR", help = "Override the models directory")]
    pub models_dir: Option<PathBuf>,
    #[arg(
        long = "input",
        value_name = "NAME=URL",
        help = "Stage an input file for the graph (repeatable)"
    )]
    pub inputs: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CloneArgs {
    #[arg(value_name = "SRC_ID")]
    pub source_version: String,
    #[arg(value_name = "DST_ID")]
    pub new_version: String,
    #[arg(long, value_name = "FILE", help = "Explicit output path")]
    pub output: Option<PathBuf>,
    #[arg(long, help = "Overwrite an existing spec file")]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[arg(value_name = "VERSION_ID")]
    pub version_id: String,
    #[arg(long, value_name = "DIR", help = "Explicit workspace path to remove")]
    pub target: Option<PathBuf>,
    #[arg(long, help = "Delete versions/<id>.json as well")]
    pub remove_spec: bool,
    #[arg(
        long = "remove-models-symlinks",
        help = "Also remove model symlinks projected outside the workspace"
    )]
    pub remove_model_symlinks: bool,
    #[arg(long, help = "Delete even when the directory has no workspace marker")]
    pub force: bool,
}
