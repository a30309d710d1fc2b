#[tokio::main]
async fn main() {
    if let Err(err) = storefront_assistant::app::run().await {
        eprintln!("storefront assistant failed to start: {err}");
        std::process::exit(1);
    }
}
