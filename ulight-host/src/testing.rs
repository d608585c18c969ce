//! Test support: a WAT double of the ulight guest.
//!
//! The double implements the guest ABI with a counting bump allocator so
//! tests can verify that every allocation is returned. See
//! `testdata/guest.wat` for its behavior.

use crate::abi::LanguageId;
use crate::config::BindingConfig;
use crate::loader::{BoundInstance, load};

/// Text of the guest double.
pub const GUEST_WAT: &str = include_str!("../testdata/guest.wat");

/// Id of `cpp` and `c++` in the double.
pub const CPP: LanguageId = LanguageId::new(2);
/// Id of `html` in the double.
pub const HTML: LanguageId = LanguageId::new(4);
/// Id of `javascript` and `js` in the double.
pub const JAVASCRIPT: LanguageId = LanguageId::new(7);
/// A language id that makes the double call an unprovided import.
pub const TRAPPING: LanguageId = LanguageId::new(99);

/// Assemble the guest double.
pub fn guest_wasm() -> Vec<u8> {
    wat::parse_str(GUEST_WAT).expect("Failed to parse guest WAT")
}

/// Assemble a variant of the guest double with `from` replaced by `to`.
///
/// Replacing an `(export "...")` clause with `""` removes that export.
pub fn patched_guest_wasm(from: &str, to: &str) -> Vec<u8> {
    assert!(GUEST_WAT.contains(from), "pattern {from:?} not in guest");
    wat::parse_str(GUEST_WAT.replace(from, to)).expect("Failed to parse patched guest WAT")
}

/// Load the guest double with the default configuration.
pub fn bound_instance() -> BoundInstance {
    bound_instance_with(BindingConfig::default())
}

/// Load the guest double with `config`.
pub fn bound_instance_with(config: BindingConfig) -> BoundInstance {
    load(&guest_wasm(), config).expect("Failed to load guest double")
}

/// Number of guest allocations the double still considers live.
pub fn outstanding(instance: &mut BoundInstance) -> u32 {
    instance
        .guest_global("outstanding")
        .expect("outstanding global")
}

/// Number of guest bytes the double still considers live.
pub fn outstanding_bytes(instance: &mut BoundInstance) -> u32 {
    instance
        .guest_global("outstanding_bytes")
        .expect("outstanding_bytes global")
}
