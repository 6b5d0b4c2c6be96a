/// Configuration for a proactor instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Set TCP_NODELAY on every connection socket (accepted and outbound).
    pub tcp_nodelay: bool,
    /// How many times a connection batch may be topped up for one thread
    /// before the worker must return to the reactor and give other
    /// contexts a chance.
    pub hog_max: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tcp_nodelay: true,
            hog_max: 3,
        }
    }
}
