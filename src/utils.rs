mod format_to;
mod log_error;

pub(crate) use format_to::format_to;
pub use log_error::ResultExt;
