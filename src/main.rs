#[tokio::main]
async fn main() {
    guard::start_server().await;
}
