//! Calc Worker Service - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    calc_worker::run().await
}
