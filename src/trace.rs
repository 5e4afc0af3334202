use tracing_subscriber::layer::SubscriberExt;

/// Installs a global subscriber that streams scheduling spans to Tracy.
pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let subscriber = tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default());
    tracing::subscriber::set_global_default(subscriber)
}
