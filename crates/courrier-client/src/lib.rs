// Client side of the real-time core: the transport connection state
// machine and optimistic-copy reconciliation.

pub mod backoff;
pub mod connection;
pub mod reconcile;

pub use backoff::Backoff;
pub use connection::{
    connect, connect_with_backoff, ConnectionHandle, ConnectionState, Transport, TransportLink,
};
pub use reconcile::{OptimisticMessage, Reconciler, Reconciliation};
