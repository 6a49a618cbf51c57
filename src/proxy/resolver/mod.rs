pub mod project;
pub mod token;

pub use project::project_for_account;
pub use token::{format_refresh, parse_refresh, token_for_account, ResolveError};
