mod api;
mod retry;

pub use self::api::*;
pub use self::retry::*;
