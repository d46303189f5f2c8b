//! Method and publication registration and invocation.

pub mod invoker;
pub mod registry;
