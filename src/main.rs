use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

pub mod config;
pub mod dialchain;
pub mod event;
pub mod http_probe;
pub mod stats;
pub mod tls;

use config::app_config::{load_config, setup_resolver};
use event::Fields;
use http_probe::job::HttpMonitor;
use stats::ProbeStats;

fn to_fixed_width(input: &str, width: usize) -> String {
    use unicode_truncate::UnicodeTruncateStr;

    let (truncated, _) = input.unicode_truncate(width);
    format!("{:<width$}", truncated, width = width)
}

fn exit_with(context: &str, err: &(dyn std::error::Error + 'static)) -> ! {
    log::error!("{context}: {}", http_probe::report(err));
    std::process::exit(1);
}

fn emit(monitor_id: &str, width: usize, event: Fields) {
    let status = event
        .get("monitor.status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let url = event
        .get("http.url")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let marker = if status == "up" { "✅" } else { "❌" };
    log::info!("[{}] {marker} {url} {status}", to_fixed_width(monitor_id, width));

    match serde_json::to_string(&event) {
        Ok(line) => println!("{line}"),
        Err(e) => log::error!("[{monitor_id}] unable to serialize event: {e}"),
    }
}

async fn run_monitor(monitor: HttpMonitor, width: usize) {
    let jobs = monitor.jobs();
    loop {
        let handles: Vec<_> = jobs
            .iter()
            .cloned()
            .map(|job| tokio::spawn(async move { job.run().await }))
            .collect();

        for handle in handles {
            match handle.await {
                Ok(events) => {
                    for event in events {
                        emit(monitor.id(), width, event);
                    }
                }
                Err(e) => log::error!("[{}] probe task failed: {e}", monitor.id()),
            }
        }

        sleep(monitor.schedule()).await;
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app = load_config().unwrap_or_else(|e| exit_with("unable to load configuration", &e));
    let resolver =
        setup_resolver(&app.dns_hosts).unwrap_or_else(|e| exit_with("unable to set up DNS", &e));
    let stats = Arc::new(ProbeStats::new());

    // All monitors must build before any starts.
    let mut monitors = Vec::with_capacity(app.config.len());
    for (id, monitor_config) in &app.config {
        let monitor = HttpMonitor::new(id, monitor_config, resolver.clone(), stats.clone())
            .unwrap_or_else(|e| exit_with(&format!("monitor {id}"), &e));
        log::info!(
            "Starting monitor {id}: {} url(s) every {:?}",
            monitor_config.urls.len(),
            monitor.schedule()
        );
        monitors.push(monitor);
    }

    for monitor in monitors {
        tokio::spawn(run_monitor(monitor, app.max_monitor_width));
    }

    loop {
        sleep(Duration::from_secs(60)).await;
        log::info!("probe counters: {:?}", stats.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_pads_and_truncates() {
        assert_eq!(to_fixed_width("abc", 5), "abc  ");
        assert_eq!(to_fixed_width("abcdefgh", 4), "abcd");
    }
}
