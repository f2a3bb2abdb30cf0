//! mcphub server binary
//!
//! Run with: cargo run --bin mcphub -- serve
//! Or after build: ./target/release/mcphub serve

#[tokio::main]
async fn main() {
    // Initialize logging
    mcphub::init_logging();

    // Run CLI (serve is the default subcommand)
    if let Err(e) = mcphub::cli::run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
