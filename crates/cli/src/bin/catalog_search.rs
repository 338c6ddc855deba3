use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    catalog_cli::main_entry().await
}
