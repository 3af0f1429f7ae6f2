//! Connection trait for out-of-process engine backends.

/// Establishes the connection a backend needs before it can serve the bus.
pub trait Client {
    type Error;

    /// Connects and returns the connected client.
    fn connect(self) -> impl std::future::Future<Output = Result<Self, Self::Error>> + Send
    where
        Self: Sized;
}
