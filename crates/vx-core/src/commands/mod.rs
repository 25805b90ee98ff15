//! Command implementations behind the CLI: request structs in, an
//! [`ExecutionOutcome`](crate::ExecutionOutcome) out, classified errors
//! through `anyhow`.

mod create;
mod lifecycle;
mod run;

pub use create::{clone_version, create_version, CloneRequest, CreateRequest};
pub use lifecycle::{
    delete_version, realize_version, validate_version, DeleteRequest, RealizeRequest,
    ValidateRequest,
};
pub use run::{run_handler, run_ui, RunHandlerRequest, RunUiRequest};
