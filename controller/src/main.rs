#[tokio::main]
async fn main() -> anyhow::Result<()> {
    heating_controller::host::run().await
}
