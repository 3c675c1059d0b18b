#[tokio::main]
async fn main() {
    if let Err(e) = skinovation::run().await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
