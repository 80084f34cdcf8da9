//! Encoder-side plumbing: launching processes, checking executables and
//! expanding argument templates.

pub mod process;
pub mod sanity;
pub mod variables;

pub use process::{ManagedProcess, ProcessError, ProcessLauncher, ProcessSpec, SystemLauncher};
pub use sanity::{resolve_executable, SanityError};
pub use variables::{split_arguments, TemplateError, VariableTable};
