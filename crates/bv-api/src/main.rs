#[tokio::main]
async fn main() {
    if let Err(err) = bv_api::run().await {
        tracing::error!(error = %err, "bv-api failed to start");
        eprintln!("bv-api: {err}");
        std::process::exit(1);
    }
}
