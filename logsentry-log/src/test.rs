/// Initializes the logger for testing.
///
/// This logs to the writer registered by the Rust test runner and only
/// captures logs from workspace crates.
///
/// # Example
///
/// ```
/// logsentry_log::init_test!();
/// ```
#[macro_export]
macro_rules! init_test {
    () => {
        $crate::__init_test();
    };
}
