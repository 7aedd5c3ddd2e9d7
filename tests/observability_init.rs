//! Runs in its own test binary because `init_tracing` installs the
//! process-global tracing subscriber.

use sortie_core::observability::init_tracing;
use sortie_core::types::ObservabilityConfig;

#[test]
fn test_init_tracing_is_idempotent() {
    let config = ObservabilityConfig::default();
    init_tracing(&config);
    init_tracing(&config);
}
