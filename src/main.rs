use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    chatline::cli::run_cli().await
}
