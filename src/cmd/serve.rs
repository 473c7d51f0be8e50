use std::sync::Arc;

use anyhow::Result;
use gitdeploy::config::DeployConfig;
use gitdeploy::deploy::server::start_server;

pub async fn cmd_serve(
    mut config: DeployConfig,
    port: Option<u16>,
    host: Option<String>,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    start_server(Arc::new(config)).await
}
