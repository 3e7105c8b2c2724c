//! Example: follow a live news feed and print every snapshot change.
//!
//! Usage: cargo run -p feedsync --example follow_feed -- [--api-base URL] [--push-url WS_URL] [--config FILE] [--auto-merge]

use feedsync::{FeedConfig, FeedController, HttpSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = FeedConfig::default();
    let mut api_base = None;
    let mut push_url = None;
    let mut auto_merge = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path = args.get(i).cloned().unwrap_or_default();
                config = FeedConfig::from_json_file(&path)?;
            }
            "--api-base" => {
                i += 1;
                api_base = args.get(i).cloned();
            }
            "--push-url" => {
                i += 1;
                push_url = args.get(i).cloned();
            }
            "--auto-merge" => auto_merge = true,
            other => {
                eprintln!("unknown argument {other}");
                eprintln!("Usage: follow_feed [--api-base URL] [--push-url WS_URL] [--config FILE] [--auto-merge]");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    if let Some(base) = api_base {
        config.endpoints.api_base = base;
    }
    if push_url.is_some() {
        config.endpoints.push_url = push_url;
    }

    let source = HttpSource::from_config(&config)?;
    let feed = FeedController::new(config).source(source).spawn()?;
    let mut snapshots = feed.subscribe();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = snapshots.borrow_and_update().clone();
                println!(
                    "{} visible={} new={}{} cursor={} interval={:?}",
                    serde_json::to_string(&snap.connection)?,
                    snap.visible.len(),
                    snap.new_count,
                    if snap.banner_visible { " [banner]" } else { "" },
                    snap.cursor,
                    snap.interval,
                );
                if auto_merge && snap.banner_visible {
                    let merged = feed.merge_now().await?;
                    println!("merged {merged} items");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                feed.shutdown().await?;
                break;
            }
        }
    }
    Ok(())
}
