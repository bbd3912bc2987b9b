//! The VST2 plugin API surface the bridge speaks on both sides.

pub mod abi;
