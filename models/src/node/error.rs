use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error raised by whatever is carrying out a cordon or drain.
pub type CapabilityError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to cordon node '{}': '{}'", node_name, source))]
    Cordon {
        source: CapabilityError,
        node_name: String,
    },

    #[snafu(display("Unable to drain node '{}': '{}'", node_name, source))]
    Drain {
        source: CapabilityError,
        node_name: String,
    },
}
