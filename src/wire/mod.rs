pub mod obfuscate;
pub mod rpc;
pub mod ser;
pub mod stream;
