fn main() {
    if let Err(e) = turf::cli::run() {
        eprintln!("turf: {:#}", e);
        std::process::exit(turf::cli::exit_code(&e));
    }
}
