pub mod background;
pub mod bus;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod log_buffer;
pub mod logging;
pub mod runtime;
pub mod services;
pub mod session;

pub use bus::{EventBus, Subscription};
pub use config::{RetryPolicy, RuntimeSettings};
pub use events::{BusEvent, ErrorKind, ErrorReport, LogLine, MetricPoint, StatusChange, Topic};
pub use runtime::Runtime;
pub use services::{FetchError, SetCallbacks};
pub use session::{BrokerChannel, ChannelError, ConnectionStatus, Session, SessionError, Transport};

// Always expose testing module (integration tests need it)
pub mod testing;
