// Intended public API surface for `vx-core`.
//
// This module keeps the crate root small and makes explicit which types and
// functions the CLI and serverless adapter are expected to use.

pub use crate::commands::{
    clone_version, create_version, delete_version, realize_version, run_handler, run_ui,
    validate_version, CloneRequest, CreateRequest, DeleteRequest, RealizeRequest,
    RunHandlerRequest, RunUiRequest, ValidateRequest,
};
pub use crate::config::{expand_env_refs, Config, ObjectStoreConfig};
pub use crate::envbuild::{select_python, venv_python, MODEL_PATHS_CONFIG};
pub use crate::errors::{classify, core_error, CoreError, ErrorKind};
pub use crate::fetch::{FetchSource, Fetcher, Transfer};
pub use crate::fsx::{file_checksum, replace_link};
pub use crate::git::{repo_short_name, repo_slug, GitResolver};
pub use crate::handler::{
    error_response, local_request_id, rewrite_workflow, run_job, Artifact, EngineRunner,
    JobPayload, JobResponse, JobState, OutputMode, RequestContext, UploadResult, Uploader,
    WorkflowInput,
};
pub use crate::process::{run_command, run_command_passthrough, RunOutput};
pub use crate::realize::{
    lock_digest, plan_lines, read_marker, realize, Marker, RealizeOptions, Realized, MARKER_FILE,
};
pub use crate::resolver::{resolve_or_reuse, resolve_spec, save_lock};
pub use crate::store::{BlobKey, Store};
