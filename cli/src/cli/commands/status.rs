use std::path::Path;

use nutrik_core::config::{default_config_path, Config};
use nutrik_core::proxy::upstream::dispatcher::CandidateModelList;

pub async fn run(config: &Config, source: Option<&Path>) -> anyhow::Result<()> {
    let candidates = CandidateModelList::from_config(&config.upstream);

    println!("Nutrik Status");
    println!("=============");
    println!();
    println!("Configuration:");
    match source {
        Some(path) => println!("  Config file: {:?}", path),
        None => println!("  Config file: none (defaults; searched ./config.toml and {:?})", default_config_path()),
    }
    println!();
    println!("Server settings:");
    println!("  Host: {}", config.server.get_bind_address());
    println!("  Port: {}", config.server.port);
    println!("  Body limit: {} MB", config.server.body_limit_mb);
    println!();
    println!("Upstream:");
    println!("  Base URL: {}", config.upstream.base_url);
    println!("  API version: {}", config.upstream.api_version.path_segment());
    println!("  API key: {}", if config.upstream.api_key.is_empty() { "missing" } else { "set" });
    println!("  Candidate models: {}", candidates.models().join(", "));
    println!("  Persona placement: {:?}", config.chat.system_placement.resolve(config.upstream.api_version));

    // Check if server is reachable
    println!();
    match reqwest::get(health_url(config)).await {
        Ok(resp) if resp.status().is_success() => {
            println!("Server: RUNNING ✓");
        }
        _ => {
            println!("Server: NOT RUNNING");
        }
    }

    Ok(())
}

fn health_url(config: &Config) -> String {
    let host = config.server.get_connect_address();
    if host.contains(':') {
        format!("http://[{}]:{}/api/health", host, config.server.port)
    } else {
        format!("http://{}:{}/api/health", host, config.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_url_uses_configured_host() {
        let mut config = Config::default();
        config.server.host = "10.0.0.5".to_string();
        config.server.port = 8080;
        assert_eq!(health_url(&config), "http://10.0.0.5:8080/api/health");

        config.server.allow_lan_access = true;
        assert_eq!(health_url(&config), "http://127.0.0.1:8080/api/health");

        config.server.allow_lan_access = false;
        config.server.host = "::1".to_string();
        assert_eq!(health_url(&config), "http://[::1]:8080/api/health");
    }
}
