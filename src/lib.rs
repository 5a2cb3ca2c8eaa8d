pub mod blit;
pub mod bootstrap;
pub mod plug;
pub mod test_util;
pub mod transport;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
