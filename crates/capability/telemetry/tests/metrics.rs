use bridge_telemetry::{metrics, record_envelope_received, record_values_applied};

#[test]
fn counters_accumulate_into_snapshot() {
    let before = metrics().snapshot();
    record_envelope_received();
    record_values_applied(3);
    let after = metrics().snapshot();
    assert_eq!(after.envelopes_received, before.envelopes_received + 1);
    assert_eq!(after.values_applied, before.values_applied + 3);
}
