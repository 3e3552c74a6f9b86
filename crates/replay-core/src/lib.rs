pub mod config;
pub mod endpoint;
pub mod fanout;
pub mod request;
pub mod stats;
pub mod transport;

pub use config::*;
pub use endpoint::*;
pub use fanout::*;
pub use request::*;
pub use stats::*;
pub use transport::*;
