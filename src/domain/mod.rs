mod container;
mod log;
pub mod options;
mod role;
pub mod traits;

pub use container::{
    Addr, ContainerSpec, Credentials, ExecOutput, NetworkSpec, PortBinding,
};
pub use log::{LogRecord, LogSource};
pub use options::{
    BrokerOptions, BrokerOptionsBuilder, ServiceKind, ServiceOptions, ServiceOptionsBuilder,
};
pub use role::Role;
pub use traits::{ContainerRuntime, Interrupter, LogStream};
