pub mod path_validator;
pub mod process;
pub mod walk;

pub use path_validator::PathValidator;
pub use process::CancellationToken;
pub use walk::ProjectWalker;
