//! Everything that talks to the RabbitMq broker: connecting, queue topology and the
//! shared connection supervisor.

pub mod configuration;
pub mod convenience;
mod factory;
mod supervisor;
pub mod topology;
pub mod transport;

pub use factory::ConnectionFactory;
pub use supervisor::{ChannelOf, ConnectionError, ConnectionSupervisor};
pub use topology::QueueTopology;

pub use lapin::{options, publisher_confirm::Confirmation, types, BasicProperties};
