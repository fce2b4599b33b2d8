use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    sshkey_provider::main_entry().await
}
