use manifold_core::Envelope;

/// djb2 over the serialized payload.
fn djb2(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

/// Default fingerprint for an envelope: `<prefix>:<procedure>:<djb2 of
/// JSON payload>`. Identical payloads fingerprint identically regardless
/// of caller.
pub fn payload_fingerprint(prefix: &str, envelope: &Envelope) -> String {
    let bytes = serde_json::to_vec(&envelope.payload).unwrap_or_default();
    format!("{prefix}:{}:{:08x}", envelope.procedure, djb2(&bytes))
}
