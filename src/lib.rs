pub mod client;
pub mod clock;
pub mod config;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod spatial;
pub mod util;
pub mod wire;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
