#![forbid(unsafe_code)]

use fs_tracer::constants::{EXIT_CMD_START, EXIT_INVALID_ARGS};
use fs_tracer::{app, cli, logging};

fn main() {
    logging::init_logger();

    let options = match cli::parse_args() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(EXIT_INVALID_ARGS);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start async runtime: {}", err);
            std::process::exit(EXIT_CMD_START);
        }
    };

    let code = runtime.block_on(app::run_with_system(&options));
    std::process::exit(code);
}
