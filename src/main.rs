#[tokio::main]
async fn main() {
    atelier::start_server().await;
}
