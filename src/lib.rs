pub mod gossip;
pub mod mapping;
pub mod membership;
pub mod messaging;
pub mod router;
pub mod router_config;
pub mod shim;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
