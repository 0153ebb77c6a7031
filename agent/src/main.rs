#[tokio::main]
async fn main() -> anyhow::Result<()> {
    growbot_agent::orchestrator::run().await
}
