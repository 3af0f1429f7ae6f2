//! Base trait for long-running services such as the application runtime.

/// Runs a service until it completes or fails.
pub trait Runner {
    type Error;

    fn run(self) -> impl std::future::Future<Output = Result<(), Self::Error>> + Send
    where
        Self: Sized;
}
