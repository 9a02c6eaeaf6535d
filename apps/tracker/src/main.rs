#[tokio::main]
async fn main() {
    if let Err(err) = tracker::console::run().await {
        tracing::error!(?err, "tracker exited with error");
        std::process::exit(1);
    }
}
