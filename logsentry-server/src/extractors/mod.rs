mod ingested_at;

pub use self::ingested_at::*;
