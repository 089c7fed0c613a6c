use tracing_subscriber::EnvFilter;

/// Initialize the process-wide JSON subscriber. Safe to call more than once;
/// later calls keep the first subscriber.
pub fn init(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(false)
        .try_init();

    tracing::info!(service = service_name, "logging initialized");
}
