use callctl::{Config, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).with_env_filter("info").init();

    let config = Config::from_env()?;
    let server = Server::new(config).await?;
    server.run().await
}
