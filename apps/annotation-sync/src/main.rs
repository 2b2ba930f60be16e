#[tokio::main]
async fn main() -> anyhow::Result<()> {
    annotation_sync::run().await
}
