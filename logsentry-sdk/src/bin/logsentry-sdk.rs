use std::process;

fn main() {
    if let Err(error) = logsentry_sdk::cli::execute() {
        eprintln!("error: {error:#}");
        process::exit(1);
    }
}
