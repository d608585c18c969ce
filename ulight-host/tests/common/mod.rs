//! Common test utilities for integration tests.

#![allow(dead_code)]

use ulight_host::BoundInstance;
pub use ulight_host::testing::{
    bound_instance as guest, bound_instance_with as guest_with, guest_wasm, outstanding,
    outstanding_bytes, patched_guest_wasm,
};

/// Assert that host and guest agree nothing is left allocated.
pub fn assert_balanced(instance: &mut BoundInstance) {
    assert_eq!(instance.live_allocations(), 0, "host-side live allocations");
    assert_eq!(instance.live_bytes(), 0, "host-side live bytes");
    assert_eq!(outstanding(instance), 0, "guest-side outstanding allocations");
    assert_eq!(outstanding_bytes(instance), 0, "guest-side outstanding bytes");
}

/// Source text with multi-byte characters and markup.
pub fn mixed_source() -> String {
    "int caf\u{e9} = 1; // <\u{20ac}> & \u{1f600}\n".repeat(16)
}
