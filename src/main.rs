#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ff_like_bot::run_bot().await
}
