//! Data models for Remora

pub mod fetch;
pub mod push;
pub mod reference;
pub mod remote;

pub use fetch::*;
pub use push::*;
pub use reference::*;
pub use remote::*;
