use anyhow::{Context, Result};
use std::sync::Arc;
use crossplay::config::ProxyConfig;
use crossplay::lang::parse_lang_file;
use crossplay::server::{run_console, ProxyContext};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/proxy.yaml".to_string();
    let mut lang_file: Option<String> = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: crossplay_proxy [--conf FILE] [--lang FILE]");
                println!("Console commands: reloadpacks, list, stop");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            "--lang" => {
                if i + 1 < args.len() {
                    i += 1;
                    lang_file = Some(args[i].clone());
                } else {
                    eprintln!("Error: --lang requires a FILE argument");
                    return Ok(());
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = ProxyConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {}", conf_file))?;

    // --lang wins over the config entry; a missing file keeps the built-in texts
    let lang_file = lang_file.or_else(|| config.lang_file.clone());
    let lang_content = lang_file
        .as_deref()
        .map(|path| std::fs::read_to_string(path).unwrap_or_default())
        .unwrap_or_default();
    let messages = parse_lang_file(&lang_content)?;

    let bind = format!("{}:{}", config.bedrock.address, config.bedrock.port);
    let ctx = Arc::new(ProxyContext::new(config, messages)?);

    tracing::info!("[proxy] [started] Crossplay proxy started");
    tokio::spawn(run_console(
        Arc::clone(&ctx),
        tokio::io::BufReader::new(tokio::io::stdin()),
    ));
    ProxyContext::run(ctx, &bind).await?;
    Ok(())
}
