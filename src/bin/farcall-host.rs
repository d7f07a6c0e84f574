use clap::Parser;
use farcall::host::HostArgs;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    HostArgs::parse().run().await
}
