// =============================================================================
// Shared-Token Authentication
// =============================================================================
//
// The relay's first frame from any connection must carry a shared token.
// Comparison happens in constant time so a mismatch does not leak how many
// leading bytes matched.

use tracing::warn;

/// Compare two byte slices in constant time.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

pub fn validate_token(presented: &str, expected: &str) -> bool {
    if expected.is_empty() {
        warn!("relay auth token not configured — rejecting all connections");
        return false;
    }
    constant_time_eq(presented.as_bytes(), expected.as_bytes())
}
