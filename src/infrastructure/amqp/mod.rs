//! AMQP broker connection for the AMQP queue backend

mod connection;

pub use connection::AmqpConnection;
