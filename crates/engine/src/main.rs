//! `phi-keys`: master key provisioning and canary check.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry (JSON logs, optional OTLP export).
//! 3. Build the [`PhiEngine`] for the configured KMS backend.
//! 4. Resolve, or provision once, the environment's master key.
//! 5. Run an encrypt/decrypt canary bound to the `system` clinic.
//!
//! Exits non-zero if any step fails.

use anyhow::{Context, Result};
use tracing::info;

use phi_engine::{telemetry, Config, PhiEngine};

const CANARY_CLINIC: &str = "system";
const CANARY_FIELD_TYPE: &str = "canary";
const CANARY_VALUE: &str = "phi-keys canary";

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otlp_endpoint(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %cfg.environment,
        "phi-keys starting"
    );

    let result = run(&cfg).await;
    telemetry::shutdown_telemetry();
    result
}

async fn run(cfg: &Config) -> Result<()> {
    // -----------------------------------------------------------------------
    // 3. Engine
    // -----------------------------------------------------------------------
    let engine = PhiEngine::from_config(cfg).await?;

    // -----------------------------------------------------------------------
    // 4. Master key
    // -----------------------------------------------------------------------
    let handle = engine
        .resolve_master_key()
        .await
        .context("master key unavailable")?;
    info!(key_id = %handle.key_id, alias = %handle.alias, "master key ready");

    // -----------------------------------------------------------------------
    // 5. Canary
    // -----------------------------------------------------------------------
    let ctx = engine.context(CANARY_CLINIC, CANARY_FIELD_TYPE);
    let field = engine
        .encrypt_field(CANARY_VALUE, &ctx)
        .await
        .context("canary encryption failed")?;
    let roundtrip = engine
        .decrypt_field(&field)
        .await
        .context("canary decryption failed")?;
    if roundtrip != CANARY_VALUE {
        anyhow::bail!("canary round-trip returned a different value");
    }
    info!(key_id = %field.key_id, "canary round-trip succeeded");

    Ok(())
}
