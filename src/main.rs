use enclii_controlplane::settings::Settings;
use enclii_controlplane::telemetry;

#[tokio::main]
async fn main() {
    telemetry::init();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = enclii_controlplane::run(settings).await {
        tracing::error!("enclii control plane exited with error: {:#}", e);
        std::process::exit(1);
    }
}
