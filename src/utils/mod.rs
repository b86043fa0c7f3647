pub mod collection_ext;
pub mod scheduled_executor;
pub mod string_ext;

pub use collection_ext::{unique_ordered_by, vec_to_map};
pub use scheduled_executor::{ScheduledExecutor, ScheduledTask, ShutdownHandle};
pub use string_ext::{clean_optional_string, trim_string, StringExt};
