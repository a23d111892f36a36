//! Machine drivers shipped with the CLI

mod static_host;

pub use static_host::StaticHostDriver;
