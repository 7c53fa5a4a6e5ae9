use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "V6SCOPE_LOG";

/// `RUST_LOG`, else `V6SCOPE_LOG`, else `info`. Logs go to stderr; stdout carries results.
pub fn init_logging() {
    let directives = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var(LOG_ENV))
        .unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
